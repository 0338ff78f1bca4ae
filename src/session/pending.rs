//! Deliveries awaiting acknowledgement on one session
//!
//! Delivery tags are only meaningful on the channel that issued them. Every
//! reconnect resets the registry and bumps its generation, so an entry taken
//! under an older generation can never be put back into a newer one.

use crate::transport::Delivery;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A delivery handed to a client and not yet acknowledged or rejected
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub delivery: Delivery,
    pub acquired_at: DateTime<Utc>,
}

impl PendingMessage {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            acquired_at: Utc::now(),
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }
}

#[derive(Debug, Default)]
pub struct PendingRegistry {
    generation: u64,
    entries: HashMap<u64, PendingMessage>,
}

impl PendingRegistry {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Track `message` if the registry is still at `generation`
    pub fn insert(&mut self, generation: u64, message: PendingMessage) -> bool {
        if generation != self.generation {
            return false;
        }
        self.entries.insert(message.delivery_tag(), message);
        true
    }

    /// Remove and return the entry for `delivery_tag`.
    ///
    /// Removal happens before any broker I/O so that concurrent acks of the
    /// same tag cannot both succeed.
    pub fn take(&mut self, delivery_tag: u64) -> Option<PendingMessage> {
        self.entries.remove(&delivery_tag)
    }

    /// Put back an entry whose ack failed, unless the channel was replaced
    pub fn restore(&mut self, generation: u64, message: PendingMessage) -> bool {
        self.insert(generation, message)
    }

    /// Drop all entries and start a new generation; returns how many were dropped
    pub fn reset(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.generation += 1;
        dropped
    }

    pub fn contains(&self, delivery_tag: u64) -> bool {
        self.entries.contains_key(&delivery_tag)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
