//! The process-wide type registry.
//!
//! Every kind the runtime knows (components, databags, events, spawners,
//! systems and system bundles) is registered once at process start
//! through a [`RegistryBuilder`], which freezes into an immutable
//! [`Registry`] handed to each world and pipeline as an `Arc`. Ids are
//! dense per kind and stable for the process lifetime; the only mutation
//! after the freeze is the dynamic-system reset path.

use std::any::TypeId;
use std::sync::Arc;

use bit_set::BitSet;
use fxhash::FxHashMap;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::databag::Databag;
use crate::entity::{
    ComponentKindId, DatabagKindId, EventKindId, SpawnerKindId, SystemBundleId, SystemId,
};
use crate::error::RegistryError;
use crate::event::{Event, EventStorage, EventStore};
use crate::property::{Component, DynamicRecord, PropertyInfo};
use crate::spawner::SpawnerTag;
use crate::storage::{Column, ComponentBuf, Storage, StorageConfig, StorageDiscipline};
use crate::system::{AccessDecl, SystemAccess, SystemDef, SystemDescriptor, SystemKind};

/// Immutable description of one component kind.
pub struct ComponentDescriptor {
    name: String,
    discipline: StorageDiscipline,
    shareable: bool,
    schema: Arc<Vec<PropertyInfo>>,
    spawners: SmallVec<[SpawnerKindId; 2]>,
    type_id: Option<TypeId>,
    factory: Box<dyn Fn() -> Box<dyn Storage> + Send + Sync>,
}

impl ComponentDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn discipline(&self) -> StorageDiscipline {
        self.discipline
    }

    /// Whether many entities may alias one value (shared-steady only).
    pub fn shareable(&self) -> bool {
        self.shareable
    }

    pub fn schema(&self) -> &[PropertyInfo] {
        &self.schema
    }

    pub fn spawners(&self) -> &[SpawnerKindId] {
        &self.spawners
    }

    /// `None` for script-origin kinds, which have no Rust type of their
    /// own.
    pub fn type_id(&self) -> Option<TypeId> {
        self.type_id
    }

    pub fn create_storage(&self) -> Box<dyn Storage> {
        (self.factory)()
    }
}

/// Immutable description of one databag kind.
pub struct DatabagDescriptor {
    name: String,
    thread_safe: bool,
    type_id: TypeId,
    factory: Box<dyn Fn() -> Box<dyn Databag> + Send + Sync>,
}

impl DatabagDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `false` for well-known host singletons that must never be touched
    /// off the dispatcher thread; systems reading them schedule solo.
    pub fn thread_safe(&self) -> bool {
        self.thread_safe
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn create(&self) -> Box<dyn Databag> {
        (self.factory)()
    }
}

/// Immutable description of one event kind.
pub struct EventDescriptor {
    name: String,
    type_id: TypeId,
    factory: Box<dyn Fn() -> Box<dyn EventStore> + Send + Sync>,
}

impl EventDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn create_storage(&self) -> Box<dyn EventStore> {
        (self.factory)()
    }
}

/// A named family of components.
pub struct SpawnerDescriptor {
    name: String,
    type_id: TypeId,
    members: BitSet,
}

impl SpawnerDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn members(&self) -> &BitSet {
        &self.members
    }
}

/// A named group of systems composed as a reusable unit. Bundle-level
/// ordering is carried over to every member when a pipeline expands the
/// bundle.
pub struct SystemBundleDescriptor {
    name: String,
    description: String,
    systems: Vec<SystemId>,
    before: SmallVec<[String; 2]>,
    after: SmallVec<[String; 2]>,
}

impl SystemBundleDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn systems(&self) -> &[SystemId] {
        &self.systems
    }

    pub(crate) fn before(&self) -> &[String] {
        &self.before
    }

    pub(crate) fn after(&self) -> &[String] {
        &self.after
    }
}

struct SystemRecord {
    dynamic: bool,
    descriptor: RwLock<Arc<SystemDescriptor>>,
}

/// Mutable registration surface, alive only during process startup.
#[derive(Default)]
pub struct RegistryBuilder {
    components: Vec<ComponentDescriptor>,
    components_by_name: FxHashMap<String, ComponentKindId>,
    components_by_type: FxHashMap<TypeId, ComponentKindId>,

    databags: Vec<DatabagDescriptor>,
    databags_by_name: FxHashMap<String, DatabagKindId>,
    databags_by_type: FxHashMap<TypeId, DatabagKindId>,

    events: Vec<EventDescriptor>,
    events_by_name: FxHashMap<String, EventKindId>,
    events_by_type: FxHashMap<TypeId, EventKindId>,

    spawners: Vec<SpawnerDescriptor>,
    spawners_by_name: FxHashMap<String, SpawnerKindId>,
    spawners_by_type: FxHashMap<TypeId, SpawnerKindId>,

    systems: Vec<(bool, SystemDef)>,
    systems_by_name: FxHashMap<String, SystemId>,

    bundles: Vec<SystemBundleDescriptor>,
    bundles_by_name: FxHashMap<String, SystemBundleId>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        RegistryBuilder::default()
    }

    pub fn register_component<C: Component + Default>(
        &mut self,
        name: &str,
        discipline: StorageDiscipline,
    ) -> Result<ComponentKindId, RegistryError> {
        self.register_component_with_config::<C>(name, discipline, StorageConfig::default())
    }

    pub fn register_component_with_config<C: Component + Default>(
        &mut self,
        name: &str,
        discipline: StorageDiscipline,
        config: StorageConfig,
    ) -> Result<ComponentKindId, RegistryError> {
        let factory: Box<dyn Fn() -> Box<dyn Storage> + Send + Sync> = match discipline {
            StorageDiscipline::Dense => Box::new(|| Box::new(Column::<C>::dense(C::default))),
            StorageDiscipline::Steady => {
                Box::new(move || Box::new(Column::<C>::steady(config, C::default)))
            }
            StorageDiscipline::SharedSteady => {
                Box::new(move || Box::new(Column::<C>::shared_steady(config, C::default)))
            }
            StorageDiscipline::Custom => {
                return Err(RegistryError::CustomNeedsFactory {
                    name: name.to_string(),
                })
            }
        };
        self.push_component(
            name,
            discipline,
            Arc::new(C::properties()),
            Some(TypeId::of::<C>()),
            factory,
        )
    }

    /// Registers a component backed by a user-provided storage buffer.
    pub fn register_component_custom<C, F>(
        &mut self,
        name: &str,
        factory: F,
    ) -> Result<ComponentKindId, RegistryError>
    where
        C: Component + Default,
        F: Fn() -> Box<dyn ComponentBuf<C>> + Send + Sync + 'static,
    {
        self.push_component(
            name,
            StorageDiscipline::Custom,
            Arc::new(C::properties()),
            Some(TypeId::of::<C>()),
            Box::new(move || Box::new(Column::custom(factory(), C::default))),
        )
    }

    /// Registers a script-origin component kind described only by its
    /// schema. Values are [`DynamicRecord`]s.
    pub fn register_component_dynamic(
        &mut self,
        name: &str,
        schema: Vec<PropertyInfo>,
        discipline: StorageDiscipline,
        config: StorageConfig,
    ) -> Result<ComponentKindId, RegistryError> {
        let schema = Arc::new(schema);
        let defaults = schema.clone();
        let default_fn = move || DynamicRecord::new(defaults.clone());
        let factory: Box<dyn Fn() -> Box<dyn Storage> + Send + Sync> = match discipline {
            StorageDiscipline::Dense => {
                Box::new(move || Box::new(Column::dense(default_fn.clone())))
            }
            StorageDiscipline::Steady => {
                Box::new(move || Box::new(Column::steady(config, default_fn.clone())))
            }
            StorageDiscipline::SharedSteady => {
                Box::new(move || Box::new(Column::shared_steady(config, default_fn.clone())))
            }
            StorageDiscipline::Custom => {
                return Err(RegistryError::CustomNeedsFactory {
                    name: name.to_string(),
                })
            }
        };
        self.push_component(name, discipline, schema, None, factory)
    }

    fn push_component(
        &mut self,
        name: &str,
        discipline: StorageDiscipline,
        schema: Arc<Vec<PropertyInfo>>,
        type_id: Option<TypeId>,
        factory: Box<dyn Fn() -> Box<dyn Storage> + Send + Sync>,
    ) -> Result<ComponentKindId, RegistryError> {
        if self.components_by_name.contains_key(name) {
            return Err(RegistryError::NameConflict {
                kind: "component",
                name: name.to_string(),
            });
        }
        let id = ComponentKindId::new(self.components.len() as u32);
        self.components.push(ComponentDescriptor {
            name: name.to_string(),
            discipline,
            shareable: discipline == StorageDiscipline::SharedSteady,
            schema,
            spawners: SmallVec::new(),
            type_id,
            factory,
        });
        self.components_by_name.insert(name.to_string(), id);
        if let Some(type_id) = type_id {
            self.components_by_type.insert(type_id, id);
        }
        debug!(component = name, id = id.index(), ?discipline, "registered component");
        Ok(id)
    }

    pub fn register_databag<D: Databag + Default>(
        &mut self,
        name: &str,
    ) -> Result<DatabagKindId, RegistryError> {
        self.push_databag::<D>(name, true)
    }

    /// Registers a databag that must only be touched from the dispatcher
    /// thread (e.g. a handle into the host's scene tree). Any system
    /// accessing it is scheduled alone in its stage.
    pub fn register_databag_single_thread<D: Databag + Default>(
        &mut self,
        name: &str,
    ) -> Result<DatabagKindId, RegistryError> {
        self.push_databag::<D>(name, false)
    }

    fn push_databag<D: Databag + Default>(
        &mut self,
        name: &str,
        thread_safe: bool,
    ) -> Result<DatabagKindId, RegistryError> {
        if self.databags_by_name.contains_key(name) {
            return Err(RegistryError::NameConflict {
                kind: "databag",
                name: name.to_string(),
            });
        }
        let id = DatabagKindId::new(self.databags.len() as u32);
        self.databags.push(DatabagDescriptor {
            name: name.to_string(),
            thread_safe,
            type_id: TypeId::of::<D>(),
            factory: Box::new(|| Box::new(D::default())),
        });
        self.databags_by_name.insert(name.to_string(), id);
        self.databags_by_type.insert(TypeId::of::<D>(), id);
        debug!(databag = name, id = id.index(), thread_safe, "registered databag");
        Ok(id)
    }

    pub fn register_event<E: Event>(&mut self, name: &str) -> Result<EventKindId, RegistryError> {
        if self.events_by_name.contains_key(name) {
            return Err(RegistryError::NameConflict {
                kind: "event",
                name: name.to_string(),
            });
        }
        let id = EventKindId::new(self.events.len() as u32);
        self.events.push(EventDescriptor {
            name: name.to_string(),
            type_id: TypeId::of::<E>(),
            factory: Box::new(|| Box::new(EventStorage::<E>::new())),
        });
        self.events_by_name.insert(name.to_string(), id);
        self.events_by_type.insert(TypeId::of::<E>(), id);
        debug!(event = name, id = id.index(), "registered event");
        Ok(id)
    }

    pub fn register_spawner<S: SpawnerTag>(
        &mut self,
        name: &str,
    ) -> Result<SpawnerKindId, RegistryError> {
        if self.spawners_by_name.contains_key(name) {
            return Err(RegistryError::NameConflict {
                kind: "spawner",
                name: name.to_string(),
            });
        }
        let id = SpawnerKindId::new(self.spawners.len() as u32);
        self.spawners.push(SpawnerDescriptor {
            name: name.to_string(),
            type_id: TypeId::of::<S>(),
            members: BitSet::new(),
        });
        self.spawners_by_name.insert(name.to_string(), id);
        self.spawners_by_type.insert(TypeId::of::<S>(), id);
        debug!(spawner = name, id = id.index(), "registered spawner");
        Ok(id)
    }

    /// Adds the component to the spawner's member family.
    pub fn component_joins_spawner(
        &mut self,
        component: ComponentKindId,
        spawner: SpawnerKindId,
    ) -> Result<(), RegistryError> {
        let descriptor = self
            .components
            .get_mut(component.index() as usize)
            .ok_or(RegistryError::UnknownId {
                kind: "component",
                id: component.index(),
            })?;
        let family = self
            .spawners
            .get_mut(spawner.index() as usize)
            .ok_or(RegistryError::UnknownId {
                kind: "spawner",
                id: spawner.index(),
            })?;
        descriptor.spawners.push(spawner);
        family.members.insert(component.index() as usize);
        Ok(())
    }

    /// Registers a native system. Fails on a duplicate name.
    pub fn register_system(&mut self, def: SystemDef) -> Result<SystemId, RegistryError> {
        self.push_system(def, false)
    }

    /// Registers a dynamic (script-origin) system. Re-registering the
    /// same name resets the descriptor and keeps the id.
    pub fn register_dynamic_system(&mut self, def: SystemDef) -> Result<SystemId, RegistryError> {
        if let Some(&id) = self.systems_by_name.get(&def.name) {
            let (dynamic, slot) = &mut self.systems[id.index() as usize];
            if !*dynamic {
                return Err(RegistryError::NameConflict {
                    kind: "system",
                    name: def.name,
                });
            }
            debug!(system = %def.name, id = id.index(), "dynamic system reset");
            *slot = def;
            return Ok(id);
        }
        self.push_system(def, true)
    }

    fn push_system(&mut self, def: SystemDef, dynamic: bool) -> Result<SystemId, RegistryError> {
        if self.systems_by_name.contains_key(&def.name) {
            return Err(RegistryError::NameConflict {
                kind: "system",
                name: def.name,
            });
        }
        let id = SystemId::new(self.systems.len() as u32);
        self.systems_by_name.insert(def.name.clone(), id);
        debug!(system = %def.name, id = id.index(), "registered system");
        self.systems.push((dynamic, def));
        Ok(id)
    }

    pub fn register_system_bundle(&mut self, name: &str) -> Result<SystemBundleId, RegistryError> {
        if self.bundles_by_name.contains_key(name) {
            return Err(RegistryError::NameConflict {
                kind: "system bundle",
                name: name.to_string(),
            });
        }
        let id = SystemBundleId::new(self.bundles.len() as u32);
        self.bundles.push(SystemBundleDescriptor {
            name: name.to_string(),
            description: String::new(),
            systems: Vec::new(),
            before: SmallVec::new(),
            after: SmallVec::new(),
        });
        self.bundles_by_name.insert(name.to_string(), id);
        debug!(bundle = name, id = id.index(), "registered system bundle");
        Ok(id)
    }

    pub fn bundle_add_system(
        &mut self,
        bundle: SystemBundleId,
        system: SystemId,
    ) -> Result<(), RegistryError> {
        self.bundle_mut(bundle)?.systems.push(system);
        Ok(())
    }

    pub fn bundle_set_description(
        &mut self,
        bundle: SystemBundleId,
        description: &str,
    ) -> Result<(), RegistryError> {
        self.bundle_mut(bundle)?.description = description.to_string();
        Ok(())
    }

    /// Every member of the bundle completes before the named system.
    pub fn bundle_run_before(
        &mut self,
        bundle: SystemBundleId,
        system: &str,
    ) -> Result<(), RegistryError> {
        self.bundle_mut(bundle)?.before.push(system.to_string());
        Ok(())
    }

    pub fn bundle_run_after(
        &mut self,
        bundle: SystemBundleId,
        system: &str,
    ) -> Result<(), RegistryError> {
        self.bundle_mut(bundle)?.after.push(system.to_string());
        Ok(())
    }

    fn bundle_mut(
        &mut self,
        bundle: SystemBundleId,
    ) -> Result<&mut SystemBundleDescriptor, RegistryError> {
        self.bundles
            .get_mut(bundle.index() as usize)
            .ok_or(RegistryError::UnknownBundle(bundle))
    }

    /// Freezes the tables. System access declarations are resolved here,
    /// against the complete kind tables.
    pub fn freeze(self) -> Result<Arc<Registry>, RegistryError> {
        let mut registry = Registry {
            components: self.components,
            components_by_name: self.components_by_name,
            components_by_type: self.components_by_type,
            databags: self.databags,
            databags_by_name: self.databags_by_name,
            databags_by_type: self.databags_by_type,
            events: self.events,
            events_by_name: self.events_by_name,
            events_by_type: self.events_by_type,
            spawners: self.spawners,
            spawners_by_name: self.spawners_by_name,
            spawners_by_type: self.spawners_by_type,
            systems: Vec::new(),
            systems_by_name: self.systems_by_name,
            bundles: self.bundles,
            bundles_by_name: self.bundles_by_name,
        };

        let mut records = Vec::with_capacity(self.systems.len());
        for (dynamic, def) in self.systems {
            let descriptor = registry.resolve_system(def)?;
            records.push(SystemRecord {
                dynamic,
                descriptor: RwLock::new(Arc::new(descriptor)),
            });
        }
        registry.systems = records;

        info!(
            components = registry.components.len(),
            databags = registry.databags.len(),
            events = registry.events.len(),
            spawners = registry.spawners.len(),
            systems = registry.systems.len(),
            bundles = registry.bundles.len(),
            "registry frozen"
        );
        Ok(Arc::new(registry))
    }
}

/// The frozen process-wide catalog of registered kinds.
pub struct Registry {
    components: Vec<ComponentDescriptor>,
    components_by_name: FxHashMap<String, ComponentKindId>,
    components_by_type: FxHashMap<TypeId, ComponentKindId>,

    databags: Vec<DatabagDescriptor>,
    databags_by_name: FxHashMap<String, DatabagKindId>,
    databags_by_type: FxHashMap<TypeId, DatabagKindId>,

    events: Vec<EventDescriptor>,
    events_by_name: FxHashMap<String, EventKindId>,
    events_by_type: FxHashMap<TypeId, EventKindId>,

    spawners: Vec<SpawnerDescriptor>,
    spawners_by_name: FxHashMap<String, SpawnerKindId>,
    spawners_by_type: FxHashMap<TypeId, SpawnerKindId>,

    systems: Vec<SystemRecord>,
    systems_by_name: FxHashMap<String, SystemId>,

    bundles: Vec<SystemBundleDescriptor>,
    bundles_by_name: FxHashMap<String, SystemBundleId>,
}

impl Registry {
    // ~~ components ~~

    pub fn component(&self, id: ComponentKindId) -> Option<&ComponentDescriptor> {
        self.components.get(id.index() as usize)
    }

    pub fn component_id<C: Component>(&self) -> Option<ComponentKindId> {
        self.components_by_type.get(&TypeId::of::<C>()).copied()
    }

    pub fn component_id_by_name(&self, name: &str) -> Option<ComponentKindId> {
        self.components_by_name.get(name).copied()
    }

    pub fn components_count(&self) -> u32 {
        self.components.len() as u32
    }

    // ~~ databags ~~

    pub fn databag(&self, id: DatabagKindId) -> Option<&DatabagDescriptor> {
        self.databags.get(id.index() as usize)
    }

    pub fn databag_id<D: Databag>(&self) -> Option<DatabagKindId> {
        self.databags_by_type.get(&TypeId::of::<D>()).copied()
    }

    pub fn databag_id_by_name(&self, name: &str) -> Option<DatabagKindId> {
        self.databags_by_name.get(name).copied()
    }

    pub fn databags_count(&self) -> u32 {
        self.databags.len() as u32
    }

    // ~~ events ~~

    pub fn event(&self, id: EventKindId) -> Option<&EventDescriptor> {
        self.events.get(id.index() as usize)
    }

    pub fn event_id<E: Event>(&self) -> Option<EventKindId> {
        self.events_by_type.get(&TypeId::of::<E>()).copied()
    }

    pub fn event_id_by_name(&self, name: &str) -> Option<EventKindId> {
        self.events_by_name.get(name).copied()
    }

    pub fn events_count(&self) -> u32 {
        self.events.len() as u32
    }

    // ~~ spawners ~~

    pub fn spawner(&self, id: SpawnerKindId) -> Option<&SpawnerDescriptor> {
        self.spawners.get(id.index() as usize)
    }

    pub fn spawner_id<S: SpawnerTag>(&self) -> Option<SpawnerKindId> {
        self.spawners_by_type.get(&TypeId::of::<S>()).copied()
    }

    pub fn spawner_id_by_name(&self, name: &str) -> Option<SpawnerKindId> {
        self.spawners_by_name.get(name).copied()
    }

    pub fn spawner_members(&self, id: SpawnerKindId) -> Option<&BitSet> {
        self.spawner(id).map(|s| s.members())
    }

    // ~~ systems ~~

    pub fn system(&self, id: SystemId) -> Option<Arc<SystemDescriptor>> {
        self.systems
            .get(id.index() as usize)
            .map(|record| record.descriptor.read().clone())
    }

    pub fn system_id(&self, name: &str) -> Option<SystemId> {
        self.systems_by_name.get(name).copied()
    }

    pub fn systems_count(&self) -> u32 {
        self.systems.len() as u32
    }

    pub fn is_dynamic_system(&self, id: SystemId) -> bool {
        self.systems
            .get(id.index() as usize)
            .map_or(false, |record| record.dynamic)
    }

    /// Resets a dynamic system's descriptor, keeping its id. Pipelines
    /// built before the reset keep their snapshot; rebuilding picks up
    /// the new descriptor (and recomputes the emitter caches).
    pub fn reregister_dynamic_system(&self, def: SystemDef) -> Result<SystemId, RegistryError> {
        let id = self
            .system_id(&def.name)
            .ok_or_else(|| RegistryError::UnknownName {
                kind: "system",
                name: def.name.clone(),
            })?;
        let record = &self.systems[id.index() as usize];
        if !record.dynamic {
            return Err(RegistryError::NotDynamic { name: def.name });
        }
        debug!(system = %def.name, id = id.index(), "dynamic system reset");
        let descriptor = self.resolve_system(def)?;
        *record.descriptor.write() = Arc::new(descriptor);
        Ok(id)
    }

    // ~~ bundles ~~

    pub fn bundle(&self, id: SystemBundleId) -> Option<&SystemBundleDescriptor> {
        self.bundles.get(id.index() as usize)
    }

    pub fn bundle_id(&self, name: &str) -> Option<SystemBundleId> {
        self.bundles_by_name.get(name).copied()
    }

    /// Resolves a system definition's access declarations into a frozen
    /// descriptor.
    fn resolve_system(&self, def: SystemDef) -> Result<SystemDescriptor, RegistryError> {
        let mut access = SystemAccess::default();
        for decl in &def.decls {
            match decl {
                AccessDecl::ReadComponent(type_id, type_name) => {
                    access
                        .components
                        .read(self.component_by_type(*type_id, type_name)?.index());
                }
                AccessDecl::WriteComponent(type_id, type_name) => {
                    access
                        .components
                        .write(self.component_by_type(*type_id, type_name)?.index());
                }
                AccessDecl::StorageWrite(type_id, type_name) => {
                    let id = self.component_by_type(*type_id, type_name)?;
                    access.storages.insert(id.index() as usize);
                }
                AccessDecl::StorageWriteId(id) => {
                    if self.component(*id).is_none() {
                        return Err(RegistryError::UnknownId {
                            kind: "component",
                            id: id.index(),
                        });
                    }
                    access.storages.insert(id.index() as usize);
                }
                AccessDecl::ReadDatabag(type_id, type_name) => {
                    let id = self.databag_by_type(*type_id, type_name)?;
                    access.databags.read(id.index());
                    if !self.databags[id.index() as usize].thread_safe {
                        access.exclusive = true;
                    }
                }
                AccessDecl::WriteDatabag(type_id, type_name) => {
                    let id = self.databag_by_type(*type_id, type_name)?;
                    access.databags.write(id.index());
                    if !self.databags[id.index() as usize].thread_safe {
                        access.exclusive = true;
                    }
                }
                AccessDecl::Emitter(type_id, type_name, emitter) => {
                    let id = self.event_by_type(*type_id, type_name)?;
                    access.emitters.push((id, emitter.clone()));
                }
                AccessDecl::Receiver(type_id, type_name, emitter) => {
                    let id = self.event_by_type(*type_id, type_name)?;
                    access.receivers.push((id, emitter.clone()));
                }
                AccessDecl::Spawner(type_id, type_name) => {
                    let id = self
                        .spawners_by_type
                        .get(type_id)
                        .copied()
                        .ok_or(RegistryError::UnknownSpawnerType { type_name })?;
                    access.spawners.insert(id.index() as usize);
                }
                AccessDecl::Query(declare) => declare(self, &mut access)?,
            }
        }

        // dispatchers own their stage
        if matches!(def.kind, SystemKind::Dispatcher { .. }) {
            access.exclusive = true;
        }

        Ok(SystemDescriptor {
            name: def.name,
            description: def.description,
            phase: def.phase,
            kind: def.kind,
            before: def.before,
            after: def.after,
            parent_dispatcher: def.parent_dispatcher,
            access,
            invoke: def.invoke,
        })
    }

    fn component_by_type(
        &self,
        type_id: TypeId,
        type_name: &'static str,
    ) -> Result<ComponentKindId, RegistryError> {
        self.components_by_type
            .get(&type_id)
            .copied()
            .ok_or(RegistryError::UnknownComponentType { type_name })
    }

    fn databag_by_type(
        &self,
        type_id: TypeId,
        type_name: &'static str,
    ) -> Result<DatabagKindId, RegistryError> {
        self.databags_by_type
            .get(&type_id)
            .copied()
            .ok_or(RegistryError::UnknownDatabagType { type_name })
    }

    fn event_by_type(
        &self,
        type_id: TypeId,
        type_name: &'static str,
    ) -> Result<EventKindId, RegistryError> {
        self.events_by_type
            .get(&type_id)
            .copied()
            .ok_or(RegistryError::UnknownEventType { type_name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::SystemBuilder;

    #[derive(Default)]
    struct Position {
        _x: i32,
    }

    impl Component for Position {}

    #[derive(Default)]
    struct FrameTime;

    #[test]
    fn ids_are_dense_and_stable() {
        let mut builder = RegistryBuilder::new();
        let a = builder
            .register_component::<Position>("Position", StorageDiscipline::Dense)
            .unwrap();
        let bag = builder.register_databag::<FrameTime>("FrameTime").unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(bag.index(), 0);

        let registry = builder.freeze().unwrap();
        assert_eq!(registry.component_id::<Position>(), Some(a));
        assert_eq!(registry.component_id_by_name("Position"), Some(a));
        assert_eq!(registry.databag_id::<FrameTime>(), Some(bag));
        assert_eq!(registry.component_id_by_name("Missing"), None);
    }

    #[test]
    fn duplicate_component_name_is_rejected() {
        let mut builder = RegistryBuilder::new();
        builder
            .register_component::<Position>("Position", StorageDiscipline::Dense)
            .unwrap();
        let err = builder
            .register_component::<Position>("Position", StorageDiscipline::Dense)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NameConflict { .. }));
    }

    #[test]
    fn duplicate_system_name_is_fatal_unless_dynamic() {
        let mut builder = RegistryBuilder::new();
        builder
            .register_system(SystemBuilder::new("tick").build(|_| {}))
            .unwrap();
        let err = builder
            .register_system(SystemBuilder::new("tick").build(|_| {}))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NameConflict { .. }));

        let first = builder
            .register_dynamic_system(SystemBuilder::new("scripted").build(|_| {}))
            .unwrap();
        let again = builder
            .register_dynamic_system(SystemBuilder::new("scripted").build(|_| {}))
            .unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn dynamic_reset_after_freeze_keeps_the_id() {
        let mut builder = RegistryBuilder::new();
        builder
            .register_dynamic_system(SystemBuilder::new("scripted").build(|_| {}))
            .unwrap();
        builder
            .register_system(SystemBuilder::new("native").build(|_| {}))
            .unwrap();
        let registry = builder.freeze().unwrap();

        let id = registry.system_id("scripted").unwrap();
        let reset = registry
            .reregister_dynamic_system(
                SystemBuilder::new("scripted")
                    .description("updated")
                    .build(|_| {}),
            )
            .unwrap();
        assert_eq!(id, reset);
        assert_eq!(registry.system(id).unwrap().description(), "updated");

        let err = registry
            .reregister_dynamic_system(SystemBuilder::new("native").build(|_| {}))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotDynamic { .. }));
    }

    #[test]
    fn unresolved_access_fails_the_freeze() {
        #[derive(Default)]
        struct Ghost;
        impl Component for Ghost {}

        let mut builder = RegistryBuilder::new();
        builder
            .register_system(SystemBuilder::new("reader").read_component::<Ghost>().build(|_| {}))
            .unwrap();
        assert!(matches!(
            builder.freeze(),
            Err(RegistryError::UnknownComponentType { .. })
        ));
    }

    #[test]
    fn custom_storage_buffers_plug_in() {
        use crate::entity::EntityId;
        use crate::storage::{ComponentBuf, DenseBuf};

        #[derive(Default, Debug, PartialEq)]
        struct Mass {
            kg: u32,
        }
        impl Component for Mass {}

        // a dense buffer that refuses zero-mass values
        struct NonZeroBuf {
            inner: DenseBuf<Mass>,
        }

        impl ComponentBuf<Mass> for NonZeroBuf {
            fn insert(&mut self, entity: EntityId, value: Mass) {
                if value.kg > 0 {
                    self.inner.insert(entity, value);
                }
            }

            fn has(&self, entity: EntityId) -> bool {
                self.inner.has(entity)
            }

            fn get(&self, entity: EntityId) -> Option<&Mass> {
                self.inner.get(entity)
            }

            fn get_mut(&mut self, entity: EntityId) -> Option<&mut Mass> {
                self.inner.get_mut(entity)
            }

            fn remove(&mut self, entity: EntityId) -> bool {
                self.inner.remove(entity).is_some()
            }

            fn clear(&mut self) {
                self.inner.clear();
            }

            fn entities(&self) -> &[EntityId] {
                self.inner.entities()
            }
        }

        let mut builder = RegistryBuilder::new();
        let kind = builder
            .register_component_custom::<Mass, _>("Mass", || -> Box<dyn ComponentBuf<Mass>> {
                Box::new(NonZeroBuf {
                    inner: DenseBuf::new(),
                })
            })
            .unwrap();
        let registry = builder.freeze().unwrap();

        let descriptor = registry.component(kind).unwrap();
        assert_eq!(descriptor.discipline(), StorageDiscipline::Custom);

        let mut storage = descriptor.create_storage();
        let column = storage
            .downcast_mut::<crate::storage::Column<Mass>>()
            .unwrap();
        column.insert(EntityId::new(0), Mass { kg: 0 });
        column.insert(EntityId::new(1), Mass { kg: 80 });
        assert!(!column.has(EntityId::new(0)));
        assert_eq!(column.get(EntityId::new(1)), Some(&Mass { kg: 80 }));
    }

    #[test]
    fn spawner_membership_is_recorded_both_ways() {
        struct Physics;
        impl SpawnerTag for Physics {}

        let mut builder = RegistryBuilder::new();
        let spawner = builder.register_spawner::<Physics>("Physics").unwrap();
        let component = builder
            .register_component::<Position>("Position", StorageDiscipline::Dense)
            .unwrap();
        builder.component_joins_spawner(component, spawner).unwrap();

        let registry = builder.freeze().unwrap();
        assert!(registry
            .spawner_members(spawner)
            .unwrap()
            .contains(component.index() as usize));
        assert_eq!(registry.component(component).unwrap().spawners(), &[spawner]);
    }
}
