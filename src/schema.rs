//! Registry of notification channel names.
//!
//! Channels used for schema bookkeeping are reserved: application code cannot
//! listen on them. Once the set of application events is loaded, listening on
//! (or receiving) any other channel is an error.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Channels reserved for schema patch and migration notifications.
pub const RESERVED_CHANNELS: &[&str] = &["__schema_patch", "__schema_migration"];

/// Known channel names, shared by a pool and its connections.
#[derive(Debug)]
pub struct SchemaRegistry {
    reserved: HashSet<String>,
    events: RwLock<Option<HashSet<String>>>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    /// Registry with the default reserved channels and no events loaded.
    pub fn new() -> Self {
        Self::with_reserved(RESERVED_CHANNELS.iter().copied())
    }

    pub fn with_reserved<I, S>(reserved: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reserved: reserved.into_iter().map(Into::into).collect(),
            events: RwLock::new(None),
        }
    }

    /// Load the set of application events, replacing any previous set.
    pub fn load_events<I, S>(&self, events: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.events.write() = Some(events.into_iter().map(Into::into).collect());
    }

    pub fn events_loaded(&self) -> bool {
        self.events.read().is_some()
    }

    pub fn is_reserved(&self, channel: &str) -> bool {
        self.reserved.contains(channel)
    }

    /// Whether a notification on `channel` is expected.
    ///
    /// Everything is known until events are loaded; reserved channels always are.
    pub fn is_known(&self, channel: &str) -> bool {
        if self.is_reserved(channel) {
            return true;
        }
        match &*self.events.read() {
            Some(events) => events.contains(channel),
            None => true,
        }
    }

    /// Check that application code may listen on `channel`.
    pub fn check_listen(&self, channel: &str) -> Result<()> {
        if self.is_reserved(channel) {
            return Err(Error::ReservedChannel(channel.to_string()));
        }
        if !self.is_known(channel) {
            return Err(Error::UnknownChannel(channel.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_channels_rejected() {
        let registry = SchemaRegistry::new();
        assert!(matches!(
            registry.check_listen("__schema_patch"),
            Err(Error::ReservedChannel(_))
        ));
        assert!(registry.check_listen("anything").is_ok());
        assert!(registry.is_known("__schema_patch"));
    }

    #[test]
    fn test_loaded_events_gate_channels() {
        let registry = SchemaRegistry::new();
        registry.load_events(["user.created"]);

        assert!(registry.events_loaded());
        assert!(registry.check_listen("user.created").is_ok());
        assert!(matches!(
            registry.check_listen("user.deleted"),
            Err(Error::UnknownChannel(_))
        ));
        assert!(!registry.is_known("user.deleted"));
        assert!(registry.is_known("__schema_migration"));
    }
}
