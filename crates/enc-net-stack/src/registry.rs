use thiserror::Error;

pub const MAX_SUBSCRIPTIONS: usize = 9;
pub const MAX_TOPIC_LEN: usize = 64;

pub type Topic = heapless::String<MAX_TOPIC_LEN>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEntry {
    pub topic: Topic,
    /// Packet id of the most recent SUBSCRIBE for this topic.
    pub packet_id: u16,
    /// Number of SUBSCRIBE packets sent for this topic.
    pub use_count: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("subscription table is full ({MAX_SUBSCRIPTIONS} topics)")]
pub struct RegistryFull;

/// Topics subscribed on the broker, in insertion order.
///
/// Packet ids are derived from the per-topic use count: the first SUBSCRIBE for a topic uses id 1,
/// each repeat bumps the count and uses the new count as its id.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionTable {
    entries: heapless::Vec<SubscriptionEntry, MAX_SUBSCRIPTIONS>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionEntry> {
        self.entries.iter()
    }

    pub fn get(&self, topic: &str) -> Option<&SubscriptionEntry> {
        self.entries.iter().find(|e| e.topic.as_str() == topic)
    }

    /// Whether `subscribe(topic)` would succeed.
    pub fn can_accept(&self, topic: &str) -> bool {
        self.get(topic).is_some() || !self.entries.is_full()
    }

    /// Packet id the next `subscribe(topic)` will return; the table is not modified.
    pub fn subscribe_packet_id(&self, topic: &str) -> Result<u16, RegistryFull> {
        match self.get(topic) {
            Some(entry) => Ok(entry.use_count.wrapping_add(1).max(1)),
            None if topic.len() <= MAX_TOPIC_LEN && !self.entries.is_full() => Ok(1),
            None => Err(RegistryFull),
        }
    }

    /// Records a SUBSCRIBE for `topic` and returns the packet id to send it with.
    ///
    /// Topics longer than [`MAX_TOPIC_LEN`] must be rejected by the caller; they are never stored.
    pub fn subscribe(&mut self, topic: &str) -> Result<u16, RegistryFull> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.topic.as_str() == topic) {
            entry.use_count = entry.use_count.wrapping_add(1).max(1);
            entry.packet_id = entry.use_count;
            return Ok(entry.packet_id);
        }
        let mut stored = Topic::new();
        stored.push_str(topic).map_err(|()| RegistryFull)?;
        let entry = SubscriptionEntry {
            topic: stored,
            packet_id: 1,
            use_count: 1,
        };
        self.entries.push(entry).map_err(|_| RegistryFull)?;
        Ok(1)
    }

    /// Packet id to use for an UNSUBSCRIBE of `topic`; the table is not modified.
    pub fn unsubscribe_packet_id(&self, topic: &str) -> u16 {
        self.get(topic)
            .map(|e| e.use_count.wrapping_add(1).max(1))
            .unwrap_or(1)
    }

    /// Drops `topic` once the broker has acknowledged the UNSUBSCRIBE.
    pub fn remove(&mut self, topic: &str) -> Option<SubscriptionEntry> {
        let idx = self.entries.iter().position(|e| e.topic.as_str() == topic)?;
        Some(self.entries.remove(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_subscribe_reuses_slot() {
        let mut table = SubscriptionTable::new();
        assert_eq!(table.subscribe_packet_id("led"), Ok(1));
        assert_eq!(table.subscribe("led"), Ok(1));
        assert_eq!(table.subscribe_packet_id("led"), Ok(2));
        assert_eq!(table.subscribe("led"), Ok(2));
        assert_eq!(table.len(), 1);
        let entry = table.get("led").unwrap();
        assert_eq!(entry.use_count, 2);
        assert_eq!(entry.packet_id, 2);
    }

    #[test]
    fn tenth_topic_is_rejected() {
        let mut table = SubscriptionTable::new();
        for i in 0..MAX_SUBSCRIPTIONS {
            table.subscribe(&format!("t{i}")).unwrap();
        }
        let before: Vec<_> = table.iter().cloned().collect();
        assert!(!table.can_accept("t9"));
        assert!(table.can_accept("t0"));
        assert_eq!(table.subscribe_packet_id("t9"), Err(RegistryFull));
        assert_eq!(table.subscribe("t9"), Err(RegistryFull));
        assert_eq!(table.iter().cloned().collect::<Vec<_>>(), before);
        assert_eq!(table.subscribe("t3"), Ok(2));
    }

    #[test]
    fn remove_preserves_order() {
        let mut table = SubscriptionTable::new();
        for topic in ["a", "b", "c"] {
            table.subscribe(topic).unwrap();
        }
        assert_eq!(table.unsubscribe_packet_id("b"), 2);
        assert_eq!(table.unsubscribe_packet_id("zzz"), 1);
        assert!(table.remove("b").is_some());
        assert!(table.remove("b").is_none());
        let topics: Vec<_> = table.iter().map(|e| e.topic.as_str()).collect();
        assert_eq!(topics, ["a", "c"]);
    }
}
