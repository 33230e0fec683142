//! Spawners: named families of components.
//!
//! A spawner groups component kinds so a system can declare "may insert
//! or remove any member of this family" with a single access entry.
//! Components join spawners at registration; the access expansion into
//! the member storages happens when a pipeline is built.

use tracing::warn;

use crate::entity::{ComponentKindId, EntityId, SpawnerKindId};
use crate::error::WorldError;
use crate::property::{Component, PropertyMap};
use crate::world::World;

/// Marker type identifying a spawner. Register it with
/// [`RegistryBuilder::register_spawner`](crate::registry::RegistryBuilder::register_spawner).
pub trait SpawnerTag: 'static {}

/// Validated insert/remove over a spawner's member components, bound to
/// a world for one system invocation.
pub struct SpawnerAccess<'w> {
    world: &'w World,
    id: SpawnerKindId,
}

impl<'w> SpawnerAccess<'w> {
    pub(crate) fn new(world: &'w World, id: SpawnerKindId) -> Self {
        SpawnerAccess { world, id }
    }

    pub fn spawner_id(&self) -> SpawnerKindId {
        self.id
    }

    pub fn has<C: Component>(&self, entity: EntityId) -> bool {
        match self.world.registry().component_id::<C>() {
            Some(component) => self.has_dynamic(component, entity),
            None => false,
        }
    }

    pub fn has_dynamic(&self, component: ComponentKindId, entity: EntityId) -> bool {
        if self.validate(component).is_err() {
            return false;
        }
        match self.world.storage_cell(component) {
            Some(cell) => cell.read().has(entity),
            None => false,
        }
    }

    pub fn insert<C: Component>(&self, entity: EntityId, value: C) -> Result<(), WorldError> {
        let component = self.component_id::<C>()?;
        self.validate(component)?;
        let mut column = self
            .world
            .write_column::<C>(component)
            .map_err(|_| WorldError::StorageMissing(component.index()))?
            .ok_or_else(|| WorldError::StorageMissing(component.index()))?;
        column.insert(entity, value);
        Ok(())
    }

    pub fn insert_dynamic(
        &self,
        component: ComponentKindId,
        entity: EntityId,
        data: &PropertyMap,
    ) -> Result<(), WorldError> {
        self.validate(component)?;
        let cell = self
            .world
            .storage_cell(component)
            .ok_or_else(|| WorldError::StorageMissing(component.index()))?;
        cell.write().insert_dynamic(entity, data);
        Ok(())
    }

    pub fn remove<C: Component>(&self, entity: EntityId) -> Result<(), WorldError> {
        let component = self.component_id::<C>()?;
        self.remove_dynamic(component, entity)
    }

    pub fn remove_dynamic(
        &self,
        component: ComponentKindId,
        entity: EntityId,
    ) -> Result<(), WorldError> {
        self.validate(component)?;
        if let Some(cell) = self.world.storage_cell(component) {
            cell.write().remove(entity);
        }
        Ok(())
    }

    fn component_id<C: Component>(&self) -> Result<ComponentKindId, WorldError> {
        self.world
            .registry()
            .component_id::<C>()
            .ok_or_else(|| {
                WorldError::Registry(crate::error::RegistryError::UnknownComponentType {
                    type_name: std::any::type_name::<C>(),
                })
            })
    }

    fn validate(&self, component: ComponentKindId) -> Result<(), WorldError> {
        let registry = self.world.registry();
        let member = registry
            .spawner_members(self.id)
            .map_or(false, |members| members.contains(component.index() as usize));
        if member {
            return Ok(());
        }
        let spawner = registry
            .spawner(self.id)
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| self.id.to_string());
        let component = registry
            .component(component)
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| component.to_string());
        warn!(spawner = %spawner, component = %component, "component is not part of the spawner");
        Err(WorldError::NotInSpawner { spawner, component })
    }
}
