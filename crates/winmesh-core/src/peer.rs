//! Peer domain entities and value objects.

use crate::ScreenId;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Alphabet used for generated peer identities.
const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of generated peer identities.
pub const PEER_ID_LEN: usize = 8;

/// Opaque identity of one peer.
///
/// Generated locally when a peer starts. Used as the registry key and as the
/// reference carried by every wire message.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Creates a PeerId from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random identity (lowercase base36).
    ///
    /// Unique enough for one logical session; not a UUID.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..PEER_ID_LEN)
            .map(|_| {
                let idx = rng.gen_range(0..ID_ALPHABET.len());
                ID_ALPHABET.get(idx).copied().unwrap_or(b'0') as char
            })
            .collect();
        Self(id)
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Replicated Payloads
// ============================================================================

/// Write-once description of a peer, fixed when the peer starts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Opened by another peer, which may close it.
    pub controlled: bool,

    /// Opened as a secondary/popup surface.
    pub popup: bool,

    /// Caller payload, opaque to the protocol.
    #[serde(default)]
    pub user: serde_json::Value,
}

impl PeerInfo {
    /// Creates info with an empty caller payload.
    pub fn new(controlled: bool, popup: bool) -> Self {
        Self {
            controlled,
            popup,
            user: serde_json::Value::Null,
        }
    }

    /// Attaches a caller payload.
    #[must_use]
    pub fn with_user(mut self, user: serde_json::Value) -> Self {
        self.user = user;
        self
    }
}

/// Mutable state of a peer.
///
/// Remote copies are always replaced wholesale, never merged field by field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerState {
    /// Identity of the peer that opened this one, if any.
    pub parent_id: Option<PeerId>,

    /// Screen the peer is currently on, if screen tracking is available.
    pub screen_id: Option<ScreenId>,

    pub focused: bool,

    pub visible: bool,

    #[serde(default)]
    pub fullscreen: bool,

    /// Caller payload, opaque to the protocol.
    #[serde(default)]
    pub user: serde_json::Value,
}

impl PeerState {
    /// Shallow-merges `patch` into the caller payload.
    ///
    /// Object patches assign their keys onto an object payload; anything
    /// else replaces the payload outright.
    pub fn merge_user(&mut self, patch: serde_json::Value) {
        match (&mut self.user, patch) {
            (serde_json::Value::Object(current), serde_json::Value::Object(patch)) => {
                for (key, value) in patch {
                    current.insert(key, value);
                }
            }
            (current, patch) => *current = patch,
        }
    }
}

/// Wire form of a whole peer, as carried by `declare` and `info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedPeer {
    pub id: PeerId,
    pub data: PeerState,
    pub info: PeerInfo,
}

// ============================================================================
// Peer Record
// ============================================================================

/// Local bookkeeping for a record. Never replicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfrastructure {
    /// When this process first learned about the peer.
    pub first_seen: DateTime<Utc>,

    /// When the peer's state last changed here.
    pub last_update: DateTime<Utc>,

    /// Number of state replacements applied.
    pub update_count: u64,
}

impl PeerInfrastructure {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            first_seen: now,
            last_update: now,
            update_count: 0,
        }
    }

    /// Records that the peer's state changed.
    pub fn record_update(&mut self) {
        self.last_update = Utc::now();
        self.update_count = self.update_count.saturating_add(1);
    }
}

impl Default for PeerInfrastructure {
    fn default() -> Self {
        Self::new()
    }
}

/// One known peer: identity, write-once info and mutable state.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    id: PeerId,
    info: PeerInfo,
    state: PeerState,
    is_local: bool,
    infra: PeerInfrastructure,
}

impl PeerRecord {
    /// Creates the record representing the running process itself.
    pub fn local(id: PeerId, info: PeerInfo, state: PeerState) -> Self {
        Self {
            id,
            info,
            state,
            is_local: true,
            infra: PeerInfrastructure::new(),
        }
    }

    /// Creates a mirror record from a `declare` or `info` payload.
    pub fn remote(peer: SerializedPeer) -> Self {
        Self {
            id: peer.id,
            info: peer.info,
            state: peer.data,
            is_local: false,
            infra: PeerInfrastructure::new(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn infra(&self) -> &PeerInfrastructure {
        &self.infra
    }

    /// Overwrites the entire state (last writer wins).
    pub fn replace_state(&mut self, state: PeerState) {
        self.state = state;
        self.infra.record_update();
    }

    /// Applies an in-place edit to the state.
    ///
    /// Only meaningful for the local record; mirrors are replaced, not edited.
    pub fn edit_state(&mut self, edit: impl FnOnce(&mut PeerState)) {
        edit(&mut self.state);
        self.infra.record_update();
    }

    /// Returns the wire form of this record.
    pub fn serialize(&self) -> SerializedPeer {
        SerializedPeer {
            id: self.id.clone(),
            data: self.state.clone(),
            info: self.info.clone(),
        }
    }
}

// ============================================================================
// Application Layer DTO
// ============================================================================

/// Read-only snapshot of a peer, with relationships already resolved.
///
/// `parent` is `None` both when the peer has no parent and when the
/// referenced parent is not (or no longer) in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerView {
    pub id: PeerId,
    pub info: PeerInfo,
    pub state: PeerState,
    pub is_local: bool,

    /// Resolved parent, if it is a live registry entry.
    pub parent: Option<PeerId>,

    /// Peers whose state names this peer as parent.
    pub children: Vec<PeerId>,

    pub first_seen: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub update_count: u64,
}

impl PeerView {
    /// Returns true if this peer has no resolvable parent.
    pub fn is_orphan(&self) -> bool {
        self.parent.is_none()
    }

    /// Returns a one-line summary (`abc123 [self] [child]`).
    pub fn label(&self, viewer: Option<&PeerView>) -> String {
        let mut out = self.id.to_string();
        if self.info.controlled {
            out.push_str(" [controlled]");
        }
        if self.is_local {
            out.push_str(" [self]");
        }
        if let Some(viewer) = viewer {
            if viewer.parent.as_ref() == Some(&self.id) {
                out.push_str(" [parent]");
            }
            if viewer.children.contains(&self.id) {
                out.push_str(" [child]");
            }
        }
        if self.info.popup {
            out.push_str(" [popup]");
        }
        out.push_str(if self.state.visible { " [visible]" } else { " [hidden]" });
        if self.state.focused {
            out.push_str(" [focused]");
        }
        if let Some(screen) = &self.state.screen_id {
            out.push_str(&format!(" [screen: {}]", screen.short()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_ids_are_short_base36() {
        let id = PeerId::generate();
        assert_eq!(id.as_str().len(), PEER_ID_LEN);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_generated_ids_differ() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_wire_names_are_camel_case() {
        let state = PeerState {
            parent_id: Some(PeerId::new("parent")),
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["parentId"], "parent");
        assert!(json["screenId"].is_null());
        assert_eq!(json["focused"], false);
    }

    #[test]
    fn test_state_fullscreen_is_optional_on_the_wire() {
        let state: PeerState = serde_json::from_value(json!({
            "parentId": null,
            "screenId": null,
            "focused": true,
            "visible": true,
            "user": {"n": 1}
        }))
        .unwrap();
        assert!(!state.fullscreen);
        assert!(state.focused);
        assert_eq!(state.user, json!({"n": 1}));
    }

    #[test]
    fn test_merge_user_assigns_object_keys() {
        let mut state = PeerState {
            user: json!({"a": 1, "b": 2}),
            ..Default::default()
        };
        state.merge_user(json!({"b": 3, "c": 4}));
        assert_eq!(state.user, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_merge_user_replaces_non_objects() {
        let mut state = PeerState::default();
        state.merge_user(json!({"a": 1}));
        assert_eq!(state.user, json!({"a": 1}));

        state.merge_user(json!(42));
        assert_eq!(state.user, json!(42));
    }

    #[test]
    fn test_replace_state_is_wholesale() {
        let mut record = PeerRecord::remote(SerializedPeer {
            id: PeerId::new("b"),
            data: PeerState {
                focused: true,
                user: json!({"keep": "me?"}),
                ..Default::default()
            },
            info: PeerInfo::new(true, false),
        });

        record.replace_state(PeerState {
            visible: true,
            ..Default::default()
        });

        assert!(!record.state().focused);
        assert!(record.state().visible);
        assert!(record.state().user.is_null());
        assert_eq!(record.infra().update_count, 1);
    }

    #[test]
    fn test_serialize_round_trips_identity_and_info() {
        let record = PeerRecord::local(
            PeerId::new("self"),
            PeerInfo::new(false, true).with_user(json!("payload")),
            PeerState::default(),
        );
        let wire = record.serialize();
        assert_eq!(wire.id.as_str(), "self");
        assert!(wire.info.popup);
        assert_eq!(wire.info.user, json!("payload"));
        assert!(record.is_local());
    }
}
