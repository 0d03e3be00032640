//! Screen descriptors and content-derived screen identifiers.
//!
//! The host's screen enumeration hands out fresh objects on every call, so
//! replicated state refers to screens by a hash of their stable properties
//! instead. Two physically distinct screens with identical width, height,
//! internal flag, colour depth and pixel ratio share an id; this is a known
//! limitation of content-derived ids.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of hash bytes kept in a [`ScreenId`].
const SCREEN_ID_BYTES: usize = 8;

/// Stable identifier of a physical screen within one session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScreenId(String);

impl ScreenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for compact display.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for ScreenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One screen as reported by the host's enumeration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenDescriptor {
    pub width: u32,
    pub height: u32,
    pub is_internal: bool,
    pub color_depth: u32,
    pub device_pixel_ratio: f64,

    /// Position of the screen in the virtual desktop.
    pub left: i32,
    pub top: i32,

    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub is_primary: bool,
}

impl ScreenDescriptor {
    /// Computes the content-derived id of this screen.
    ///
    /// Only width, height, internal flag, colour depth and pixel ratio take
    /// part; position and label may change without changing the id.
    pub fn compute_id(&self) -> ScreenId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.width.to_le_bytes());
        hasher.update(&self.height.to_le_bytes());
        hasher.update(&[u8::from(self.is_internal)]);
        hasher.update(&self.color_depth.to_le_bytes());
        hasher.update(&self.device_pixel_ratio.to_bits().to_le_bytes());
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();
        ScreenId(hex::encode(bytes.get(..SCREEN_ID_BYTES).unwrap_or(bytes)))
    }
}

/// A reconciled screen: id plus the descriptor it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenEntry {
    pub id: ScreenId,
    pub descriptor: ScreenDescriptor,
}

/// Full screen table built from one enumeration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScreenTable {
    pub screens: Vec<ScreenEntry>,
    pub current: Option<ScreenId>,
}

impl ScreenTable {
    /// Rebuilds the table from an enumeration result.
    ///
    /// `current` indexes into `screens`; an out-of-range index yields no
    /// current screen.
    pub fn reconcile(screens: &[ScreenDescriptor], current: Option<usize>) -> Self {
        let screens: Vec<ScreenEntry> = screens
            .iter()
            .map(|descriptor| ScreenEntry {
                id: descriptor.compute_id(),
                descriptor: descriptor.clone(),
            })
            .collect();
        let current = current
            .and_then(|idx| screens.get(idx))
            .map(|entry| entry.id.clone());
        Self { screens, current }
    }

    /// Looks up a screen by id.
    pub fn get(&self, id: &ScreenId) -> Option<&ScreenDescriptor> {
        self.screens
            .iter()
            .find(|entry| &entry.id == id)
            .map(|entry| &entry.descriptor)
    }

    pub fn is_empty(&self) -> bool {
        self.screens.is_empty()
    }

    pub fn len(&self) -> usize {
        self.screens.len()
    }
}
