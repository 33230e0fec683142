//! The world: entity state plus per-world singletons.
//!
//! A world owns its component storages (one [`Column`] per kind, created
//! on first use or during pipeline preparation), its databags and its
//! event storages, all keyed by registry ids. Storage cells are wrapped
//! in `RwLock`s so a dispatching pipeline can hand disjoint columns to
//! systems running on parallel workers; the world itself is only mutated
//! between stages.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use tracing::{error, trace};

use crate::databag::Databag;
use crate::entity::{ComponentKindId, DatabagKindId, EntityId, EventKindId, WorldId};
use crate::error::{QueryError, RegistryError, WorldError};
use crate::event::{Event, EventStorage, EventStore};
use crate::property::{Component, PropertyMap, PropertyValue};
use crate::query::{Query, ViewTuple};
use crate::registry::Registry;
use crate::storage::{Column, Storage};

pub type StorageRef<'a> = RwLockReadGuard<'a, Box<dyn Storage>>;
pub type StorageMut<'a> = RwLockWriteGuard<'a, Box<dyn Storage>>;
pub type ComponentRef<'a, C> = MappedRwLockReadGuard<'a, C>;
pub type ComponentMut<'a, C> = MappedRwLockWriteGuard<'a, C>;
pub type ColumnRef<'a, C> = MappedRwLockReadGuard<'a, Column<C>>;
pub type ColumnMut<'a, C> = MappedRwLockWriteGuard<'a, Column<C>>;
pub type BagRef<'a, D> = MappedRwLockReadGuard<'a, D>;
pub type BagMutRef<'a, D> = MappedRwLockWriteGuard<'a, D>;
pub type EventRef<'a, E> = MappedRwLockReadGuard<'a, EventStorage<E>>;
pub type EventMutRef<'a, E> = MappedRwLockWriteGuard<'a, EventStorage<E>>;

/// Lifecycle notifications delivered to host subscribers, in order:
/// loaded → ready (on first dispatch) → pre-unload → unloaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorldNotification {
    Loaded(WorldId),
    Ready(WorldId),
    PreUnload(WorldId),
    Unloaded(WorldId),
    EntityCreated(WorldId, EntityId),
}

/// Chains component additions onto a freshly created entity.
///
/// ```ignore
/// let entity: EntityId = world
///     .create_entity()
///     .with(Position { x: 0 })
///     .with(Velocity { dx: 1 })
///     .into();
/// ```
pub struct EntityBuilder<'w> {
    world: &'w mut World,
    entity: EntityId,
}

impl<'w> EntityBuilder<'w> {
    pub fn with<C: Component>(self, value: C) -> Self {
        if let Err(err) = self.world.add_component(self.entity, value) {
            error!(entity = %self.entity, %err, "component add failed");
        }
        self
    }

    pub fn with_dynamic(self, component: ComponentKindId, data: &PropertyMap) -> Self {
        if let Err(err) = self.world.add_component_dynamic(self.entity, component, data) {
            error!(entity = %self.entity, %component, %err, "component add failed");
        }
        self
    }

    pub fn id(&self) -> EntityId {
        self.entity
    }
}

impl From<EntityBuilder<'_>> for EntityId {
    fn from(builder: EntityBuilder<'_>) -> EntityId {
        builder.entity
    }
}

type StorageCell = RwLock<Box<dyn Storage>>;
type DatabagCell = RwLock<Box<dyn Databag>>;
type EventCell = RwLock<Box<dyn EventStore>>;

/// Entity state for one world: storages, databags and event buffers.
pub struct World {
    id: WorldId,
    registry: Arc<Registry>,
    storages: Vec<Option<StorageCell>>,
    databags: Vec<Option<DatabagCell>>,
    events: Vec<Option<EventCell>>,
    entity_count: u32,
    tick: u64,
    subscribers: Vec<Sender<WorldNotification>>,
}

impl World {
    pub fn new(registry: Arc<Registry>) -> Self {
        let id = WorldId::next();
        trace!(world = %id, "world created");
        World {
            id,
            registry,
            storages: Vec::new(),
            databags: Vec::new(),
            events: Vec::new(),
            entity_count: 0,
            tick: 0,
            subscribers: Vec::new(),
        }
    }

    pub fn id(&self) -> WorldId {
        self.id
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_arc(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Completed dispatches of this world.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub(crate) fn advance_tick(&mut self) {
        self.tick += 1;
    }

    // ~~ notifications ~~

    pub fn subscribe(&mut self) -> Receiver<WorldNotification> {
        let (sender, receiver) = unbounded();
        self.subscribers.push(sender);
        receiver
    }

    pub(crate) fn attach_subscriber(&mut self, sender: Sender<WorldNotification>) {
        self.subscribers.push(sender);
    }

    pub(crate) fn notify(&self, notification: WorldNotification) {
        for subscriber in &self.subscribers {
            // disconnected receivers are simply skipped
            let _ = subscriber.send(notification.clone());
        }
    }

    // ~~ entities ~~

    /// Allocates an entity id. Ids are unique within the world for its
    /// lifetime; the sentinel is never handed out.
    pub fn create_entity_id(&mut self) -> EntityId {
        assert!(self.entity_count != u32::MAX, "entity ids exhausted");
        let entity = EntityId::new(self.entity_count);
        self.entity_count += 1;
        self.notify(WorldNotification::EntityCreated(self.id, entity));
        entity
    }

    /// Allocates an entity id and returns a builder for chained
    /// component additions.
    pub fn create_entity(&mut self) -> EntityBuilder<'_> {
        let entity = self.create_entity_id();
        EntityBuilder {
            world: self,
            entity,
        }
    }

    /// Removes the entity from every storage that has it.
    pub fn destroy_entity(&mut self, entity: EntityId) {
        for cell in self.storages.iter().flatten() {
            let mut storage = cell.write();
            if storage.has(entity) {
                storage.remove(entity);
            }
        }
    }

    pub fn entity_count(&self) -> u32 {
        self.entity_count
    }

    pub fn last_entity_id(&self) -> Option<EntityId> {
        if self.entity_count == 0 {
            None
        } else {
            Some(EntityId::new(self.entity_count - 1))
        }
    }

    // ~~ component routing ~~

    /// Creates the storage for the component kind if it does not exist
    /// yet. Idempotent.
    pub fn ensure_storage(&mut self, component: ComponentKindId) -> Result<(), WorldError> {
        let index = component.index() as usize;
        if index >= self.storages.len() {
            self.storages.resize_with(index + 1, || None);
        }
        if self.storages[index].is_none() {
            let descriptor =
                self.registry
                    .component(component)
                    .ok_or(RegistryError::UnknownId {
                        kind: "component",
                        id: component.index(),
                    })?;
            trace!(world = %self.id, component = descriptor.name(), "storage created");
            self.storages[index] = Some(RwLock::new(descriptor.create_storage()));
        }
        Ok(())
    }

    pub fn add_component<C: Component>(
        &mut self,
        entity: EntityId,
        value: C,
    ) -> Result<(), WorldError> {
        let id = self
            .registry
            .component_id::<C>()
            .ok_or(RegistryError::UnknownComponentType {
                type_name: std::any::type_name::<C>(),
            })?;
        self.ensure_storage(id)?;
        let mut column = self
            .write_column::<C>(id)
            .map_err(|_| WorldError::StorageMissing(id.index()))?
            .ok_or(WorldError::StorageMissing(id.index()))?;
        column.insert(entity, value);
        Ok(())
    }

    pub fn add_component_dynamic(
        &mut self,
        entity: EntityId,
        component: ComponentKindId,
        data: &PropertyMap,
    ) -> Result<(), WorldError> {
        self.ensure_storage(component)?;
        let cell = self
            .storage_cell(component)
            .ok_or(WorldError::StorageMissing(component.index()))?;
        cell.write().insert_dynamic(entity, data);
        Ok(())
    }

    /// A no-op when the entity lacks the component or the storage was
    /// never created.
    pub fn remove_component<C: Component>(&mut self, entity: EntityId) {
        if let Some(id) = self.registry.component_id::<C>() {
            self.remove_component_dynamic(entity, id);
        }
    }

    pub fn remove_component_dynamic(&mut self, entity: EntityId, component: ComponentKindId) {
        if let Some(cell) = self.storage_cell(component) {
            cell.write().remove(entity);
        }
    }

    pub fn has_component<C: Component>(&self, entity: EntityId) -> bool {
        match self.registry.component_id::<C>() {
            Some(id) => self.has_component_dynamic(entity, id),
            None => false,
        }
    }

    pub fn has_component_dynamic(&self, entity: EntityId, component: ComponentKindId) -> bool {
        match self.storage_cell(component) {
            Some(cell) => cell.read().has(entity),
            None => false,
        }
    }

    pub fn get_component<C: Component>(&self, entity: EntityId) -> Option<ComponentRef<'_, C>> {
        let id = self.registry.component_id::<C>()?;
        let cell = self.storage_cell(id)?;
        let guard = cell.read();
        if !guard.has(entity) {
            return None;
        }
        Some(RwLockReadGuard::map(guard, |storage| {
            column_of::<C>(storage.as_ref())
                .get(entity)
                .expect("presence checked under this guard")
        }))
    }

    /// Mutable component access; raises an update notification on the
    /// storage's change list.
    pub fn get_component_mut<C: Component>(
        &mut self,
        entity: EntityId,
    ) -> Option<ComponentMut<'_, C>> {
        let id = self.registry.component_id::<C>()?;
        let cell = self.storage_cell(id)?;
        let guard = cell.write();
        if !guard.has(entity) {
            return None;
        }
        Some(RwLockWriteGuard::map(guard, |storage| {
            column_of_mut::<C>(storage.as_mut())
                .get_mut(entity)
                .expect("presence checked under this guard")
        }))
    }

    /// Dynamic property read through the erased storage face.
    pub fn component_property(
        &self,
        entity: EntityId,
        component: ComponentKindId,
        name: &str,
    ) -> Option<PropertyValue> {
        self.storage_cell(component)?.read().property(entity, name)
    }

    pub fn set_component_property(
        &mut self,
        entity: EntityId,
        component: ComponentKindId,
        name: &str,
        value: PropertyValue,
    ) -> bool {
        match self.storage_cell(component) {
            Some(cell) => cell.write().set_property(entity, name, value),
            None => false,
        }
    }

    /// Shared view of the component's column, if its storage exists.
    pub fn storage<C: Component>(&self) -> Option<ColumnRef<'_, C>> {
        let id = self.registry.component_id::<C>()?;
        let cell = self.storage_cell(id)?;
        Some(RwLockReadGuard::map(cell.read(), |storage| {
            column_of::<C>(storage.as_ref())
        }))
    }

    /// Exclusive view of the component's column, if its storage exists.
    pub fn storage_mut<C: Component>(&mut self) -> Option<ColumnMut<'_, C>> {
        let id = self.registry.component_id::<C>()?;
        let cell = self.storage_cell(id)?;
        Some(RwLockWriteGuard::map(cell.write(), |storage| {
            column_of_mut::<C>(storage.as_mut())
        }))
    }

    /// Type-erased view of a storage, for id-driven callers.
    pub fn storage_base(&self, component: ComponentKindId) -> Option<StorageRef<'_>> {
        Some(self.storage_cell(component)?.read())
    }

    pub fn storage_base_mut(&mut self, component: ComponentKindId) -> Option<StorageMut<'_>> {
        Some(self.storage_cell(component)?.write())
    }

    pub(crate) fn storage_cell(&self, component: ComponentKindId) -> Option<&StorageCell> {
        self.storages.get(component.index() as usize)?.as_ref()
    }

    pub(crate) fn read_column<C: Component>(
        &self,
        component: ComponentKindId,
    ) -> Result<Option<ColumnRef<'_, C>>, QueryError> {
        let cell = match self.storage_cell(component) {
            Some(cell) => cell,
            None => return Ok(None),
        };
        let guard = cell
            .try_read()
            .ok_or(QueryError::AliasedAccess(std::any::type_name::<C>()))?;
        Ok(Some(RwLockReadGuard::map(guard, |storage| {
            column_of::<C>(storage.as_ref())
        })))
    }

    pub(crate) fn write_column<C: Component>(
        &self,
        component: ComponentKindId,
    ) -> Result<Option<ColumnMut<'_, C>>, QueryError> {
        let cell = match self.storage_cell(component) {
            Some(cell) => cell,
            None => return Ok(None),
        };
        let guard = cell
            .try_write()
            .ok_or(QueryError::AliasedAccess(std::any::type_name::<C>()))?;
        Ok(Some(RwLockWriteGuard::map(guard, |storage| {
            column_of_mut::<C>(storage.as_mut())
        })))
    }

    // ~~ databags ~~

    /// Creates the databag from its registered factory if missing.
    /// Idempotent.
    pub fn ensure_databag(&mut self, databag: DatabagKindId) -> Result<(), WorldError> {
        let index = databag.index() as usize;
        if index >= self.databags.len() {
            self.databags.resize_with(index + 1, || None);
        }
        if self.databags[index].is_none() {
            let descriptor = self
                .registry
                .databag(databag)
                .ok_or(RegistryError::UnknownId {
                    kind: "databag",
                    id: databag.index(),
                })?;
            trace!(world = %self.id, databag = descriptor.name(), "databag created");
            self.databags[index] = Some(RwLock::new(descriptor.create()));
        }
        Ok(())
    }

    /// Lazily constructs the databag on first access.
    pub fn get_databag<D: Databag>(&mut self) -> Option<BagRef<'_, D>> {
        let id = self.registry.databag_id::<D>()?;
        self.ensure_databag(id).ok()?;
        self.databag_guard::<D>(id)
    }

    pub fn get_databag_mut<D: Databag>(&mut self) -> Option<BagMutRef<'_, D>> {
        let id = self.registry.databag_id::<D>()?;
        self.ensure_databag(id).ok()?;
        self.databag_guard_mut::<D>(id)
    }

    pub(crate) fn databag_guard<D: Databag>(&self, databag: DatabagKindId) -> Option<BagRef<'_, D>> {
        let cell = self.databags.get(databag.index() as usize)?.as_ref()?;
        let guard = cell
            .try_read()
            .unwrap_or_else(|| panic!("databag `{}` is borrowed mutably", std::any::type_name::<D>()));
        Some(RwLockReadGuard::map(guard, |bag| bag_of::<D>(bag.as_ref())))
    }

    pub(crate) fn databag_guard_mut<D: Databag>(
        &self,
        databag: DatabagKindId,
    ) -> Option<BagMutRef<'_, D>> {
        let cell = self.databags.get(databag.index() as usize)?.as_ref()?;
        let guard = cell
            .try_write()
            .unwrap_or_else(|| panic!("databag `{}` is already borrowed", std::any::type_name::<D>()));
        Some(RwLockWriteGuard::map(guard, |bag| {
            bag_of_mut::<D>(bag.as_mut())
        }))
    }

    // ~~ events ~~

    pub fn ensure_event(&mut self, event: EventKindId) -> Result<(), WorldError> {
        let index = event.index() as usize;
        if index >= self.events.len() {
            self.events.resize_with(index + 1, || None);
        }
        if self.events[index].is_none() {
            let descriptor = self.registry.event(event).ok_or(RegistryError::UnknownId {
                kind: "event",
                id: event.index(),
            })?;
            trace!(world = %self.id, event = descriptor.name(), "event storage created");
            self.events[index] = Some(RwLock::new(descriptor.create_storage()));
        }
        Ok(())
    }

    /// Exclusive access to the event kind's storage, creating it if
    /// missing.
    pub fn events_storage<E: Event>(&mut self) -> Option<EventMutRef<'_, E>> {
        let id = self.registry.event_id::<E>()?;
        self.ensure_event(id).ok()?;
        self.event_guard_mut::<E>(id)
    }

    pub(crate) fn event_guard<E: Event>(&self, event: EventKindId) -> Option<EventRef<'_, E>> {
        let cell = self.events.get(event.index() as usize)?.as_ref()?;
        let guard = cell
            .try_read()
            .unwrap_or_else(|| panic!("event storage `{}` is borrowed mutably", std::any::type_name::<E>()));
        Some(RwLockReadGuard::map(guard, |store| {
            store_of::<E>(store.as_ref())
        }))
    }

    pub(crate) fn event_guard_mut<E: Event>(
        &self,
        event: EventKindId,
    ) -> Option<EventMutRef<'_, E>> {
        let cell = self.events.get(event.index() as usize)?.as_ref()?;
        let guard = cell
            .try_write()
            .unwrap_or_else(|| panic!("event storage `{}` is already borrowed", std::any::type_name::<E>()));
        Some(RwLockWriteGuard::map(guard, |store| {
            store_of_mut::<E>(store.as_mut())
        }))
    }

    // ~~ queries ~~

    /// Host-side query, unchecked against any access set. Inside systems
    /// use [`SystemContext::query`](crate::system::SystemContext::query).
    pub fn query<V: ViewTuple>(&self) -> Result<Query<'_, V>, QueryError> {
        Query::new(self, &self.registry)
    }

    /// Drops all entity state and event buffers. Databags survive; the
    /// entity counter keeps counting (ids are never reused).
    pub fn clear(&mut self) {
        for cell in self.storages.iter_mut().flatten() {
            cell.get_mut().clear();
        }
        for cell in self.events.iter_mut().flatten() {
            cell.get_mut().flush_all();
        }
    }
}

fn column_of<C: Component>(storage: &dyn Storage) -> &Column<C> {
    storage.downcast_ref::<Column<C>>().unwrap_or_else(|| {
        panic!(
            "component `{}` is registered with a different storage type",
            std::any::type_name::<C>()
        )
    })
}

fn column_of_mut<C: Component>(storage: &mut dyn Storage) -> &mut Column<C> {
    storage.downcast_mut::<Column<C>>().unwrap_or_else(|| {
        panic!(
            "component `{}` is registered with a different storage type",
            std::any::type_name::<C>()
        )
    })
}

fn bag_of<D: Databag>(bag: &dyn Databag) -> &D {
    bag.downcast_ref::<D>().unwrap_or_else(|| {
        panic!(
            "databag `{}` is registered with a different type",
            std::any::type_name::<D>()
        )
    })
}

fn bag_of_mut<D: Databag>(bag: &mut dyn Databag) -> &mut D {
    bag.downcast_mut::<D>().unwrap_or_else(|| {
        panic!(
            "databag `{}` is registered with a different type",
            std::any::type_name::<D>()
        )
    })
}

fn store_of<E: Event>(store: &dyn EventStore) -> &EventStorage<E> {
    store.downcast_ref::<EventStorage<E>>().unwrap_or_else(|| {
        panic!(
            "event `{}` is registered with a different type",
            std::any::type_name::<E>()
        )
    })
}

fn store_of_mut<E: Event>(store: &mut dyn EventStore) -> &mut EventStorage<E> {
    store.downcast_mut::<EventStorage<E>>().unwrap_or_else(|| {
        panic!(
            "event `{}` is registered with a different type",
            std::any::type_name::<E>()
        )
    })
}
