//! Columnar component storages.
//!
//! Each registered component kind gets one storage per world, a
//! [`Column`] holding that kind's values for every entity that has it.
//! The column wraps one of the built-in storage disciplines (or a custom
//! buffer implementing [`ComponentBuf`]) and tracks a [`ChangeList`] of
//! entities mutated since the last consumer flush.

pub mod change_list;
pub mod dense;
pub mod shared;
pub mod steady;

pub use change_list::{ChangeList, EntityList, ListOp};
pub use dense::DenseBuf;
pub use shared::SharedSteadyBuf;
pub use steady::{PagedArena, SteadyBuf};

use downcast_rs::{impl_downcast, Downcast};

use crate::entity::{EntityId, SharedId};
use crate::error::StorageError;
use crate::property::{Component, PropertyMap, PropertyValue};

/// How a component kind stores its values.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StorageDiscipline {
    /// Contiguous value array with swap-removal; fastest iteration,
    /// unstable order across removals.
    Dense,
    /// Paged allocator; every value keeps its address until removed.
    Steady,
    /// Paged allocator keyed by [`SharedId`]; many entities may alias one
    /// value.
    SharedSteady,
    /// User-provided buffer implementing [`ComponentBuf`].
    Custom,
}

/// Per-storage tuning knobs.
#[derive(Copy, Clone, Debug)]
pub struct StorageConfig {
    /// Page size of the steady allocators.
    pub page_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig { page_size: 200 }
    }
}

/// Typed capability set every storage discipline provides. Custom
/// disciplines plug in by implementing this trait.
pub trait ComponentBuf<C: Component>: Send + Sync {
    /// Inserts the value, overwriting anything already present.
    fn insert(&mut self, entity: EntityId, value: C);
    fn has(&self, entity: EntityId) -> bool;
    fn get(&self, entity: EntityId) -> Option<&C>;
    fn get_mut(&mut self, entity: EntityId) -> Option<&mut C>;

    /// All values held for the entity. The built-in disciplines store one
    /// value per entity; batch-capable buffers may return more.
    fn get_batch(&self, entity: EntityId) -> Option<&[C]> {
        self.get(entity).map(std::slice::from_ref)
    }

    /// Returns whether the entity was present.
    fn remove(&mut self, entity: EntityId) -> bool;
    fn clear(&mut self);
    fn entities(&self) -> &[EntityId];

    fn len(&self) -> usize {
        self.entities().len()
    }
}

impl<C: Component> ComponentBuf<C> for DenseBuf<C> {
    fn insert(&mut self, entity: EntityId, value: C) {
        DenseBuf::insert(self, entity, value);
    }

    fn has(&self, entity: EntityId) -> bool {
        DenseBuf::has(self, entity)
    }

    fn get(&self, entity: EntityId) -> Option<&C> {
        DenseBuf::get(self, entity)
    }

    fn get_mut(&mut self, entity: EntityId) -> Option<&mut C> {
        DenseBuf::get_mut(self, entity)
    }

    fn remove(&mut self, entity: EntityId) -> bool {
        DenseBuf::remove(self, entity).is_some()
    }

    fn clear(&mut self) {
        DenseBuf::clear(self);
    }

    fn entities(&self) -> &[EntityId] {
        DenseBuf::entities(self)
    }
}

impl<C: Component> ComponentBuf<C> for SteadyBuf<C> {
    fn insert(&mut self, entity: EntityId, value: C) {
        SteadyBuf::insert(self, entity, value);
    }

    fn has(&self, entity: EntityId) -> bool {
        SteadyBuf::has(self, entity)
    }

    fn get(&self, entity: EntityId) -> Option<&C> {
        SteadyBuf::get(self, entity)
    }

    fn get_mut(&mut self, entity: EntityId) -> Option<&mut C> {
        SteadyBuf::get_mut(self, entity)
    }

    fn remove(&mut self, entity: EntityId) -> bool {
        SteadyBuf::remove(self, entity).is_some()
    }

    fn clear(&mut self) {
        SteadyBuf::clear(self);
    }

    fn entities(&self) -> &[EntityId] {
        SteadyBuf::entities(self)
    }
}

impl<C: Component> ComponentBuf<C> for SharedSteadyBuf<C> {
    /// Creates a fresh shared value aliased only by this entity. Use
    /// [`Column::create_shared`] + [`Column::attach`] to share.
    fn insert(&mut self, entity: EntityId, value: C) {
        let id = SharedSteadyBuf::create_shared(self, value);
        // attaching a freshly created id cannot fail
        let _ = SharedSteadyBuf::attach(self, entity, id);
    }

    fn has(&self, entity: EntityId) -> bool {
        SharedSteadyBuf::has(self, entity)
    }

    fn get(&self, entity: EntityId) -> Option<&C> {
        SharedSteadyBuf::get(self, entity)
    }

    fn get_mut(&mut self, entity: EntityId) -> Option<&mut C> {
        SharedSteadyBuf::get_mut(self, entity)
    }

    fn remove(&mut self, entity: EntityId) -> bool {
        SharedSteadyBuf::remove(self, entity)
    }

    fn clear(&mut self) {
        SharedSteadyBuf::clear(self);
    }

    fn entities(&self) -> &[EntityId] {
        SharedSteadyBuf::entities(self)
    }
}

enum ColumnBuf<C: Component> {
    Dense(DenseBuf<C>),
    Steady(SteadyBuf<C>),
    Shared(SharedSteadyBuf<C>),
    Custom(Box<dyn ComponentBuf<C>>),
}

impl<C: Component> ColumnBuf<C> {
    fn as_buf(&self) -> &dyn ComponentBuf<C> {
        match self {
            ColumnBuf::Dense(buf) => buf,
            ColumnBuf::Steady(buf) => buf,
            ColumnBuf::Shared(buf) => buf,
            ColumnBuf::Custom(buf) => buf.as_ref(),
        }
    }

    fn as_buf_mut(&mut self) -> &mut dyn ComponentBuf<C> {
        match self {
            ColumnBuf::Dense(buf) => buf,
            ColumnBuf::Steady(buf) => buf,
            ColumnBuf::Shared(buf) => buf,
            ColumnBuf::Custom(buf) => buf.as_mut(),
        }
    }
}

/// The storage of one component kind in one world.
///
/// `insert`, `get_mut` and `set_property` raise update notifications on
/// the change list; `remove` withdraws them. Consumers drain the list
/// through [`Column::notify_updated`] or [`Column::clear_changed`].
pub struct Column<C: Component> {
    discipline: StorageDiscipline,
    buf: ColumnBuf<C>,
    changed: ChangeList,
    default_fn: Box<dyn Fn() -> C + Send + Sync>,
}

impl<C: Component> Column<C> {
    pub fn dense(default_fn: impl Fn() -> C + Send + Sync + 'static) -> Self {
        Column {
            discipline: StorageDiscipline::Dense,
            buf: ColumnBuf::Dense(DenseBuf::new()),
            changed: ChangeList::new(),
            default_fn: Box::new(default_fn),
        }
    }

    pub fn steady(
        config: StorageConfig,
        default_fn: impl Fn() -> C + Send + Sync + 'static,
    ) -> Self {
        Column {
            discipline: StorageDiscipline::Steady,
            buf: ColumnBuf::Steady(SteadyBuf::new(config.page_size)),
            changed: ChangeList::new(),
            default_fn: Box::new(default_fn),
        }
    }

    pub fn shared_steady(
        config: StorageConfig,
        default_fn: impl Fn() -> C + Send + Sync + 'static,
    ) -> Self {
        Column {
            discipline: StorageDiscipline::SharedSteady,
            buf: ColumnBuf::Shared(SharedSteadyBuf::new(config.page_size)),
            changed: ChangeList::new(),
            default_fn: Box::new(default_fn),
        }
    }

    pub fn custom(
        buf: Box<dyn ComponentBuf<C>>,
        default_fn: impl Fn() -> C + Send + Sync + 'static,
    ) -> Self {
        Column {
            discipline: StorageDiscipline::Custom,
            buf: ColumnBuf::Custom(buf),
            changed: ChangeList::new(),
            default_fn: Box::new(default_fn),
        }
    }

    pub fn discipline(&self) -> StorageDiscipline {
        self.discipline
    }

    pub fn insert(&mut self, entity: EntityId, value: C) {
        self.buf.as_buf_mut().insert(entity, value);
        self.changed.notify_changed(entity);
    }

    pub fn has(&self, entity: EntityId) -> bool {
        self.buf.as_buf().has(entity)
    }

    pub fn get(&self, entity: EntityId) -> Option<&C> {
        self.buf.as_buf().get(entity)
    }

    pub fn get_mut(&mut self, entity: EntityId) -> Option<&mut C> {
        if !self.buf.as_buf().has(entity) {
            return None;
        }
        self.changed.notify_changed(entity);
        self.buf.as_buf_mut().get_mut(entity)
    }

    pub fn get_batch(&self, entity: EntityId) -> Option<&[C]> {
        self.buf.as_buf().get_batch(entity)
    }

    pub fn remove(&mut self, entity: EntityId) -> bool {
        let removed = self.buf.as_buf_mut().remove(entity);
        if removed {
            self.changed.notify_updated(entity);
        }
        removed
    }

    pub fn entities(&self) -> &[EntityId] {
        self.buf.as_buf().entities()
    }

    pub fn len(&self) -> usize {
        self.buf.as_buf().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn changed(&self) -> &ChangeList {
        &self.changed
    }

    pub fn changed_mut(&mut self) -> &mut ChangeList {
        &mut self.changed
    }

    pub fn notify_changed(&mut self, entity: EntityId) {
        self.changed.notify_changed(entity);
    }

    pub fn notify_updated(&mut self, entity: EntityId) {
        self.changed.notify_updated(entity);
    }

    pub fn clear_changed(&mut self) {
        self.changed.clear();
    }

    // ~~ shared-steady operations ~~

    pub fn create_shared(&mut self, value: C) -> Result<SharedId, StorageError> {
        match &mut self.buf {
            ColumnBuf::Shared(buf) => Ok(buf.create_shared(value)),
            _ => Err(self.wrong_discipline()),
        }
    }

    pub fn free_shared(&mut self, id: SharedId) -> Result<(), StorageError> {
        match &mut self.buf {
            ColumnBuf::Shared(buf) => {
                buf.free_shared(id);
                Ok(())
            }
            _ => Err(self.wrong_discipline()),
        }
    }

    pub fn attach(&mut self, entity: EntityId, id: SharedId) -> Result<(), StorageError> {
        match &mut self.buf {
            ColumnBuf::Shared(buf) => {
                buf.attach(entity, id)?;
                self.changed.notify_changed(entity);
                Ok(())
            }
            _ => Err(self.wrong_discipline()),
        }
    }

    pub fn has_shared(&self, id: SharedId) -> bool {
        match &self.buf {
            ColumnBuf::Shared(buf) => buf.has_shared(id),
            _ => false,
        }
    }

    pub fn get_shared(&self, id: SharedId) -> Option<&C> {
        match &self.buf {
            ColumnBuf::Shared(buf) => buf.get_shared(id),
            _ => None,
        }
    }

    pub fn get_shared_mut(&mut self, id: SharedId) -> Option<&mut C> {
        match &mut self.buf {
            ColumnBuf::Shared(buf) => buf.get_shared_mut(id),
            _ => None,
        }
    }

    pub fn shared_id_of(&self, entity: EntityId) -> Option<SharedId> {
        match &self.buf {
            ColumnBuf::Shared(buf) => buf.shared_id_of(entity),
            _ => None,
        }
    }

    fn wrong_discipline(&self) -> StorageError {
        StorageError::WrongDiscipline {
            expected: StorageDiscipline::SharedSteady,
            found: self.discipline,
        }
    }
}

/// Type-erased face of a [`Column`], used by the world's id-keyed storage
/// table and by dynamic (script-origin) callers.
pub trait Storage: Downcast + Send + Sync {
    fn discipline(&self) -> StorageDiscipline;
    fn type_name(&self) -> &'static str;
    fn has(&self, entity: EntityId) -> bool;
    fn remove(&mut self, entity: EntityId) -> bool;
    fn clear(&mut self);
    fn len(&self) -> usize;

    /// Snapshot of the stored entities.
    fn entities(&self) -> Vec<EntityId>;

    /// Builds a fresh value from the kind's default, applies the given
    /// properties and inserts it. Unknown or mismatched properties are
    /// skipped.
    fn insert_dynamic(&mut self, entity: EntityId, data: &PropertyMap);

    fn property(&self, entity: EntityId, name: &str) -> Option<PropertyValue>;
    fn set_property(&mut self, entity: EntityId, name: &str, value: PropertyValue) -> bool;

    fn changed(&self) -> &ChangeList;
    fn notify_changed(&mut self, entity: EntityId);
    fn notify_updated(&mut self, entity: EntityId);
    fn clear_changed(&mut self);
}

impl_downcast!(Storage);

impl<C: Component> Storage for Column<C> {
    fn discipline(&self) -> StorageDiscipline {
        self.discipline
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<C>()
    }

    fn has(&self, entity: EntityId) -> bool {
        Column::has(self, entity)
    }

    fn remove(&mut self, entity: EntityId) -> bool {
        Column::remove(self, entity)
    }

    fn clear(&mut self) {
        self.buf.as_buf_mut().clear();
        self.changed.clear();
    }

    fn len(&self) -> usize {
        Column::len(self)
    }

    fn entities(&self) -> Vec<EntityId> {
        Column::entities(self).to_vec()
    }

    fn insert_dynamic(&mut self, entity: EntityId, data: &PropertyMap) {
        let mut value = (self.default_fn)();
        for (name, property) in data.iter() {
            value.set_property(name, property.clone());
        }
        self.insert(entity, value);
    }

    fn property(&self, entity: EntityId, name: &str) -> Option<PropertyValue> {
        self.get(entity)?.property(name)
    }

    fn set_property(&mut self, entity: EntityId, name: &str, value: PropertyValue) -> bool {
        match self.get_mut(entity) {
            Some(component) => component.set_property(name, value),
            None => false,
        }
    }

    fn changed(&self) -> &ChangeList {
        &self.changed
    }

    fn notify_changed(&mut self, entity: EntityId) {
        self.changed.notify_changed(entity);
    }

    fn notify_updated(&mut self, entity: EntityId) {
        self.changed.notify_updated(entity);
    }

    fn clear_changed(&mut self) {
        self.changed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component_schema;

    #[derive(Default, Debug, PartialEq)]
    struct Hp {
        value: i32,
    }

    component_schema!(Hp { value: Int });

    fn e(index: u32) -> EntityId {
        EntityId::new(index)
    }

    #[test]
    fn insert_and_get_mut_raise_update_notifications() {
        let mut column = Column::dense(Hp::default);
        column.insert(e(0), Hp { value: 1 });
        assert!(column.changed().is_changed(e(0)));

        column.notify_updated(e(0));
        assert!(column.changed().is_empty());

        column.get_mut(e(0)).unwrap().value = 2;
        assert!(column.changed().is_changed(e(0)));
    }

    #[test]
    fn remove_withdraws_the_notification() {
        let mut column = Column::dense(Hp::default);
        column.insert(e(3), Hp { value: 9 });
        assert!(column.remove(e(3)));
        assert!(column.changed().is_empty());
        assert!(!column.has(e(3)));
    }

    #[test]
    fn absent_entity_reads_are_optional() {
        let mut column = Column::steady(StorageConfig::default(), Hp::default);
        assert!(column.get(e(0)).is_none());
        assert!(column.get_mut(e(0)).is_none());
        assert!(column.changed().is_empty());
    }

    #[test]
    fn shared_ops_reject_other_disciplines() {
        let mut column = Column::dense(Hp::default);
        assert!(matches!(
            column.create_shared(Hp { value: 1 }),
            Err(StorageError::WrongDiscipline { .. })
        ));
    }

    #[test]
    fn erased_dynamic_insert_applies_properties() {
        let mut column = Column::dense(Hp::default);
        let storage: &mut dyn Storage = &mut column;

        let data = PropertyMap::new().with("value", PropertyValue::Int(42));
        storage.insert_dynamic(e(1), &data);

        assert_eq!(storage.property(e(1), "value"), Some(PropertyValue::Int(42)));
        assert!(storage.set_property(e(1), "value", PropertyValue::Int(7)));
        assert_eq!(
            storage.downcast_ref::<Column<Hp>>().unwrap().get(e(1)),
            Some(&Hp { value: 7 })
        );
    }

    #[test]
    fn batch_of_a_single_value_discipline_has_length_one() {
        let mut column = Column::dense(Hp::default);
        column.insert(e(0), Hp { value: 5 });
        assert_eq!(column.get_batch(e(0)).unwrap().len(), 1);
    }
}
