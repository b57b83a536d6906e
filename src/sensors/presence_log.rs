//! Append-only log of member identifiers seen by a turnstile.
//!
//! Entrance and exit turnstiles each keep their own log. An exit is
//! recorded in the exit log; it never shrinks the entrance log.

/// Ordered, append-only sequence of identifiers.
///
/// Readers only ever see the length. The identifiers themselves stay
/// private to the owning resource.
#[derive(Debug, Default, Clone)]
pub struct PresenceLog {
    entries: Vec<i32>,
}

impl PresenceLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an identifier and return the new number of entries.
    ///
    /// Repeated identifiers are recorded again; the log counts passages,
    /// not distinct members.
    pub fn add_entry(&mut self, id: i32) -> usize {
        self.entries.push(id);
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
