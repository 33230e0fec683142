//! Per-tick event buffers.
//!
//! Events are values emitted under a named emitter within one tick and
//! consumed by receivers in the same tick. Each event kind owns one
//! [`EventStorage`] per world, partitioned into per-emitter-name buckets.
//! Buckets are stamped with the tick of their last emission; stale
//! buckets are flushed when an emitter binds and readers only ever see
//! the current tick's emissions.

use downcast_rs::{impl_downcast, Downcast};
use fxhash::FxHashMap;

/// Marker for types that can be emitted as events.
pub trait Event: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Event for T {}

struct Bucket<E> {
    tick: u64,
    events: Vec<E>,
}

/// Append-only buffer of one event kind's emissions, keyed by emitter
/// name.
pub struct EventStorage<E: Event> {
    buckets: FxHashMap<String, Bucket<E>>,
}

impl<E: Event> Default for EventStorage<E> {
    fn default() -> Self {
        EventStorage {
            buckets: FxHashMap::default(),
        }
    }
}

impl<E: Event> EventStorage<E> {
    pub fn new() -> Self {
        EventStorage::default()
    }

    /// Appends an emission under the given emitter name. A bucket still
    /// holding an older tick's emissions is implicitly flushed first.
    pub fn emit(&mut self, emitter: &str, tick: u64, event: E) {
        let bucket = self
            .buckets
            .entry(emitter.to_string())
            .or_insert_with(|| Bucket {
                tick,
                events: Vec::new(),
            });
        if bucket.tick != tick {
            bucket.events.clear();
            bucket.tick = tick;
        }
        bucket.events.push(event);
    }

    /// The current tick's emissions under the given emitter name, in
    /// emission order. Empty when nothing was emitted this tick.
    pub fn read(&self, emitter: &str, tick: u64) -> &[E] {
        match self.buckets.get(emitter) {
            Some(bucket) if bucket.tick == tick => &bucket.events,
            _ => &[],
        }
    }

    /// Drops every bucket that was last written before the given tick.
    pub fn flush_stale(&mut self, tick: u64) {
        for bucket in self.buckets.values_mut() {
            if bucket.tick != tick {
                bucket.events.clear();
            }
        }
    }

    pub fn flush_all(&mut self) {
        for bucket in self.buckets.values_mut() {
            bucket.events.clear();
        }
    }
}

/// Type-erased face of an [`EventStorage`] for the world's id-keyed
/// table.
pub trait EventStore: Downcast + Send + Sync {
    fn flush_stale(&mut self, tick: u64);
    fn flush_all(&mut self);
}

impl_downcast!(EventStore);

impl<E: Event> EventStore for EventStorage<E> {
    fn flush_stale(&mut self, tick: u64) {
        EventStorage::flush_stale(self, tick);
    }

    fn flush_all(&mut self) {
        EventStorage::flush_all(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Ping(u32);

    #[test]
    fn readers_see_only_their_emitter_name() {
        let mut storage = EventStorage::new();
        storage.emit("physics", 1, Ping(1));
        storage.emit("input", 1, Ping(2));

        assert_eq!(storage.read("physics", 1), &[Ping(1)]);
        assert_eq!(storage.read("input", 1), &[Ping(2)]);
        assert_eq!(storage.read("render", 1), &[] as &[Ping]);
    }

    #[test]
    fn stale_ticks_are_invisible() {
        let mut storage = EventStorage::new();
        storage.emit("physics", 1, Ping(1));
        assert_eq!(storage.read("physics", 2), &[] as &[Ping]);

        // a new tick's emission replaces the stale bucket
        storage.emit("physics", 2, Ping(9));
        assert_eq!(storage.read("physics", 2), &[Ping(9)]);
    }

    #[test]
    fn emission_order_is_preserved_per_emitter() {
        let mut storage = EventStorage::new();
        for i in 0..4 {
            storage.emit("physics", 3, Ping(i));
        }
        let seen: Vec<u32> = storage.read("physics", 3).iter().map(|p| p.0).collect();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn flush_drops_old_buckets_only() {
        let mut storage = EventStorage::new();
        storage.emit("old", 1, Ping(1));
        storage.emit("new", 2, Ping(2));
        storage.flush_stale(2);
        assert_eq!(storage.read("old", 1), &[] as &[Ping]);
        assert_eq!(storage.read("new", 2), &[Ping(2)]);
    }
}
