//! Shared steady storage: many entities aliasing one value.

use crate::entity::{EntityId, SharedId};
use crate::error::StorageError;
use crate::storage::dense::DenseBuf;
use crate::storage::steady::PagedArena;

/// Values live in a paged arena keyed by [`SharedId`]; entities map to a
/// `SharedId` and any number of entities may alias the same value.
///
/// Removing an entity does not free the shared value. Freeing a
/// `SharedId` detaches every alias: the slot is marked dead and `has`
/// reports `false` for the former aliases from then on.
pub struct SharedSteadyBuf<T> {
    arena: PagedArena<T>,
    // SharedId -> arena key, None once freed
    slots: Vec<Option<u32>>,
    index: DenseBuf<SharedId>,
}

impl<T> SharedSteadyBuf<T> {
    pub fn new(page_size: usize) -> Self {
        SharedSteadyBuf {
            arena: PagedArena::new(page_size),
            slots: Vec::new(),
            index: DenseBuf::new(),
        }
    }

    pub fn create_shared(&mut self, value: T) -> SharedId {
        let key = self.arena.alloc(value);
        let id = SharedId::new(self.slots.len() as u32);
        self.slots.push(Some(key));
        id
    }

    pub fn free_shared(&mut self, id: SharedId) {
        if let Some(slot) = self.slots.get_mut(id.index() as usize) {
            if let Some(key) = slot.take() {
                self.arena.free(key);
            }
        }
    }

    pub fn has_shared(&self, id: SharedId) -> bool {
        self.key_of(id).is_some()
    }

    pub fn get_shared(&self, id: SharedId) -> Option<&T> {
        self.arena.get(self.key_of(id)?)
    }

    pub fn get_shared_mut(&mut self, id: SharedId) -> Option<&mut T> {
        let key = self.key_of(id)?;
        self.arena.get_mut(key)
    }

    /// Fails on a dead id without touching the storage.
    pub fn attach(&mut self, entity: EntityId, id: SharedId) -> Result<(), StorageError> {
        if self.key_of(id).is_none() {
            return Err(StorageError::DeadSharedId(id));
        }
        self.index.insert(entity, id);
        Ok(())
    }

    pub fn shared_id_of(&self, entity: EntityId) -> Option<SharedId> {
        let id = *self.index.get(entity)?;
        if self.key_of(id).is_some() {
            Some(id)
        } else {
            None
        }
    }

    pub fn has(&self, entity: EntityId) -> bool {
        self.shared_id_of(entity).is_some()
    }

    pub fn get(&self, entity: EntityId) -> Option<&T> {
        self.get_shared(self.shared_id_of(entity)?)
    }

    pub fn get_mut(&mut self, entity: EntityId) -> Option<&mut T> {
        let id = self.shared_id_of(entity)?;
        self.get_shared_mut(id)
    }

    /// Detaches the entity. The shared value stays live for its other
    /// aliases.
    pub fn remove(&mut self, entity: EntityId) -> bool {
        self.index.remove(entity).is_some()
    }

    pub fn clear(&mut self) {
        self.arena.reset();
        self.slots.clear();
        self.index.clear();
    }

    pub fn entities(&self) -> &[EntityId] {
        self.index.entities()
    }

    fn key_of(&self, id: SharedId) -> Option<u32> {
        *self.slots.get(id.index() as usize)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(index: u32) -> EntityId {
        EntityId::new(index)
    }

    #[test]
    fn aliases_observe_the_same_value() {
        let mut buf = SharedSteadyBuf::new(8);
        let id = buf.create_shared(1u32);
        buf.attach(e(0), id).unwrap();
        buf.attach(e(1), id).unwrap();
        buf.attach(e(2), id).unwrap();

        *buf.get_mut(e(0)).unwrap() = 5;
        assert_eq!(buf.get(e(2)), Some(&5));

        let via_e0 = buf.get(e(0)).unwrap() as *const u32;
        let via_e2 = buf.get(e(2)).unwrap() as *const u32;
        assert_eq!(via_e0, via_e2);
    }

    #[test]
    fn attach_to_a_dead_id_fails_without_mutating() {
        let mut buf = SharedSteadyBuf::new(8);
        let id = buf.create_shared(0u32);
        buf.free_shared(id);
        assert!(buf.attach(e(4), id).is_err());
        assert!(!buf.has(e(4)));
    }

    #[test]
    fn free_detaches_every_alias() {
        let mut buf = SharedSteadyBuf::new(8);
        let id = buf.create_shared('v');
        for i in 0..3 {
            buf.attach(e(i), id).unwrap();
        }
        buf.free_shared(id);
        for i in 0..3 {
            assert!(!buf.has(e(i)));
            assert!(buf.get(e(i)).is_none());
        }
        assert!(!buf.has_shared(id));
    }

    #[test]
    fn live_addresses_survive_other_creates_and_frees() {
        let mut buf = SharedSteadyBuf::new(2);
        let keep = buf.create_shared(7i64);
        let before = buf.get_shared(keep).unwrap() as *const i64;

        let churn: Vec<_> = (0..16).map(|i| buf.create_shared(i)).collect();
        for id in churn.iter().step_by(2) {
            buf.free_shared(*id);
        }

        let after = buf.get_shared(keep).unwrap() as *const i64;
        assert_eq!(before, after);
        assert_eq!(buf.get_shared(keep), Some(&7));
    }

    #[test]
    fn remove_keeps_the_value_for_other_aliases() {
        let mut buf = SharedSteadyBuf::new(4);
        let id = buf.create_shared(9u8);
        buf.attach(e(0), id).unwrap();
        buf.attach(e(1), id).unwrap();
        assert!(buf.remove(e(0)));
        assert!(!buf.has(e(0)));
        assert_eq!(buf.get(e(1)), Some(&9));
        assert!(buf.has_shared(id));
    }
}
