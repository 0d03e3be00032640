//! Change-notification coalescer.
//!
//! Collapses any number of triggers between two scheduling ticks into at
//! most one call per listener. The coalescer has no clock of its own: the
//! owner calls [`Coalescer::flush`] at its tick boundary (for the registry
//! actor, once per turn of its event loop).
//!
//! Listeners receive the value passed to the first trigger of the tick and
//! should treat it as a hint; the current state is whatever the registry
//! holds when they look.
//!
//! The recipients of a notification are the listeners subscribed when it
//! was triggered. A listener subscribed later waits for the next trigger;
//! a listener unsubscribed before the flush is never called again.

use std::fmt;

/// Callback invoked on flush. `None` marks an initial (fire-immediately) call.
pub type Listener<T> = Box<dyn FnMut(Option<&T>) + Send>;

/// Token returned by [`Coalescer::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

pub struct Coalescer<T> {
    listeners: Vec<(ListenerId, Listener<T>)>,
    next_id: u64,
    pending: Option<Pending<T>>,
    initial: Vec<ListenerId>,
}

struct Pending<T> {
    value: T,
    recipients: Vec<ListenerId>,
}

impl<T> Coalescer<T> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
            next_id: 0,
            pending: None,
            initial: Vec::new(),
        }
    }

    /// Registers a listener.
    ///
    /// With `fire_immediately`, the listener gets one call with `None` at the
    /// next flush, unless a trigger is already pending.
    pub fn subscribe(
        &mut self,
        listener: impl FnMut(Option<&T>) + Send + 'static,
        fire_immediately: bool,
    ) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.listeners.push((id, Box::new(listener)));

        if fire_immediately && self.pending.is_none() {
            self.initial.push(id);
        }
        id
    }

    /// Removes a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.initial.retain(|queued| *queued != id);
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    /// Schedules a notification for the next flush, addressed to every
    /// listener subscribed right now.
    ///
    /// Returns false if one was already pending; the value is then dropped.
    pub fn trigger(&mut self, value: T) -> bool {
        if self.pending.is_some() {
            return false;
        }
        let recipients = self.listeners.iter().map(|(id, _)| *id).collect();
        self.pending = Some(Pending { value, recipients });
        true
    }

    /// True if the next flush will call at least one listener slot.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some() || !self.initial.is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Delivers the pending notification and clears the pending flag.
    ///
    /// Returns the number of listener calls made.
    pub fn flush(&mut self) -> usize {
        let pending = self.pending.take();
        let initial = std::mem::take(&mut self.initial);
        let mut calls = 0;

        for (id, listener) in &mut self.listeners {
            match pending.as_ref() {
                Some(pending) if pending.recipients.contains(id) => {
                    listener(Some(&pending.value));
                    calls += 1;
                }
                _ if initial.contains(id) => {
                    listener(None);
                    calls += 1;
                }
                _ => {}
            }
        }
        calls
    }
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Coalescer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coalescer")
            .field("listeners", &self.listeners.len())
            .field("pending", &self.pending.as_ref().map(|pending| &pending.value))
            .field("initial", &self.initial)
            .finish()
    }
}
