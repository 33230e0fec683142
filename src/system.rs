//! System descriptors, access sets and the per-invocation fetch context.
//!
//! A system is a closure plus a frozen [`SystemDescriptor`]: its phase,
//! explicit ordering constraints and the exact set of data it touches.
//! Descriptors are assembled through [`SystemBuilder`]: every
//! declaration made on the builder feeds the access set, and the
//! [`SystemContext`] checks each bind against that set at dispatch.

use std::cell::{RefCell, RefMut};
use std::marker::PhantomData;
use std::sync::Arc;

use bit_set::BitSet;
use derivative::Derivative;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::command::CommandBuffer;
use crate::databag::Databag;
use crate::entity::{ComponentKindId, DatabagKindId, EventKindId, SpawnerKindId};
use crate::error::{RegistryError, SystemError};
use crate::event::Event;
use crate::property::Component;
use crate::query::{Query, ViewTuple};
use crate::registry::Registry;
use crate::spawner::{SpawnerAccess, SpawnerTag};
use crate::world::{ColumnMut, ColumnRef, World};

/// The fixed outer buckets that partition a pipeline. Phases execute in
/// declaration order of this enum.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Config,
    Input,
    PreProcess,
    Process,
    PostProcess,
    PreRender,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Config,
        Phase::Input,
        Phase::PreProcess,
        Phase::Process,
        Phase::PostProcess,
        Phase::PreRender,
    ];

    pub fn index(self) -> usize {
        match self {
            Phase::Config => 0,
            Phase::Input => 1,
            Phase::PreProcess => 2,
            Phase::Process => 3,
            Phase::PostProcess => 4,
            Phase::PreRender => 5,
        }
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Process
    }
}

/// What kind of scheduling a system gets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SystemKind {
    Normal,
    /// Runs at tick start until its body returns `true` ("done").
    Startup,
    /// Runs at the start of its phase until its body returns `true`.
    Temporary,
    /// Drives the named sub-pipeline `repeat` times per tick.
    Dispatcher { pipeline: String, repeat: u32 },
}

/// Read/write id sets over one id space.
#[derive(Derivative)]
#[derivative(Default(bound = ""), Debug(bound = ""), Clone(bound = ""))]
pub struct Access<T> {
    reads: BitSet,
    writes: BitSet,
    #[derivative(Debug = "ignore")]
    marker: PhantomData<T>,
}

impl<T> Access<T> {
    pub fn read(&mut self, id: u32) {
        self.reads.insert(id as usize);
    }

    pub fn write(&mut self, id: u32) {
        self.writes.insert(id as usize);
    }

    pub fn reads(&self) -> &BitSet {
        &self.reads
    }

    pub fn writes(&self) -> &BitSet {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    // write ∩ (read ∪ write) on either side
    fn conflicts_with(&self, other: &Self) -> bool {
        !self.writes.is_disjoint(&other.writes)
            || !self.writes.is_disjoint(&other.reads)
            || !self.reads.is_disjoint(&other.writes)
    }
}

/// The full data-access descriptor of one system: what it reads and
/// writes over components, whole storages, databags, events and
/// spawners. An all-empty set is valid and means "no data access".
#[derive(Clone, Debug, Default)]
pub struct SystemAccess {
    pub(crate) components: Access<ComponentKindId>,
    /// Whole-storage writes (structural access to a component's column).
    pub(crate) storages: BitSet,
    pub(crate) databags: Access<DatabagKindId>,
    /// (event kind, emitter name) pairs this system emits under.
    pub(crate) emitters: Vec<(EventKindId, String)>,
    /// (event kind, emitter name) pairs this system receives from.
    pub(crate) receivers: Vec<(EventKindId, String)>,
    pub(crate) spawners: BitSet,
    /// Set when the system touches a single-thread-only databag; forces
    /// the system into a solo stage.
    pub(crate) exclusive: bool,
}

impl SystemAccess {
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
            && self.storages.is_empty()
            && self.databags.is_empty()
            && self.emitters.is_empty()
            && self.receivers.is_empty()
            && self.spawners.is_empty()
            && !self.exclusive
    }

    /// Two systems may share a stage iff this returns `false`.
    pub(crate) fn conflicts_with(&self, other: &SystemAccess) -> bool {
        if self.exclusive || other.exclusive {
            return true;
        }
        // whole-storage access counts as a write over the component kind
        let mine = self.effective_components();
        let theirs = other.effective_components();
        if mine.conflicts_with(&theirs) {
            return true;
        }
        if self.databags.conflicts_with(&other.databags) {
            return true;
        }
        // an emitter on E conflicts with any receiver on E and any other
        // emitter on E
        let receives = |access: &SystemAccess, event: EventKindId| {
            access.receivers.iter().any(|(id, _)| *id == event)
        };
        for (event, _) in &self.emitters {
            let clashes = other.emitters.iter().any(|(id, _)| id == event)
                || receives(other, *event);
            if clashes {
                return true;
            }
        }
        for (event, _) in &other.emitters {
            if receives(self, *event) {
                return true;
            }
        }
        false
    }

    fn effective_components(&self) -> Access<ComponentKindId> {
        let mut out = self.components.clone();
        out.writes.union_with(&self.storages);
        out
    }

    /// Whether every component access in `probe` is covered by this set.
    /// Used to validate query binds inside a running system.
    pub(crate) fn permits(&self, probe: &SystemAccess) -> bool {
        let mut readable = self.components.reads.clone();
        readable.union_with(&self.components.writes);
        readable.union_with(&self.storages);
        let mut writable = self.components.writes.clone();
        writable.union_with(&self.storages);

        probe.components.reads.is_subset(&readable)
            && probe.components.writes.is_subset(&writable)
            && probe.storages.is_subset(&self.storages)
    }

    /// Folds spawner membership into the whole-storage write set.
    pub(crate) fn expand_spawners(&mut self, registry: &Registry) {
        let spawners: Vec<usize> = self.spawners.iter().collect();
        for spawner in spawners {
            if let Some(members) = registry.spawner_members(SpawnerKindId::new(spawner as u32)) {
                self.storages.union_with(members);
            }
        }
    }
}

type NormalFn = dyn Fn(&SystemContext) -> Result<(), SystemError> + Send + Sync;
type RetiringFn = dyn FnMut(&SystemContext) -> Result<bool, SystemError> + Send;

/// The callable body of a registered system.
#[derive(Clone)]
pub enum SystemInvoke {
    Normal(Arc<NormalFn>),
    /// Startup and temporary systems: the body reports whether it is done
    /// and should leave the active set.
    Retiring(Arc<Mutex<Box<RetiringFn>>>),
    /// Dispatchers have no body of their own; the executor drives their
    /// sub-plan.
    Dispatcher,
}

/// Frozen description of one system.
pub struct SystemDescriptor {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) phase: Phase,
    pub(crate) kind: SystemKind,
    pub(crate) before: SmallVec<[String; 2]>,
    pub(crate) after: SmallVec<[String; 2]>,
    pub(crate) parent_dispatcher: Option<String>,
    pub(crate) access: SystemAccess,
    pub(crate) invoke: SystemInvoke,
}

impl SystemDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn kind(&self) -> &SystemKind {
        &self.kind
    }

    pub fn access(&self) -> &SystemAccess {
        &self.access
    }
}

/// One unresolved access declaration recorded by the builder. Ids are
/// resolved against the registry when the system is registered.
pub(crate) enum AccessDecl {
    ReadComponent(std::any::TypeId, &'static str),
    WriteComponent(std::any::TypeId, &'static str),
    StorageWrite(std::any::TypeId, &'static str),
    StorageWriteId(ComponentKindId),
    ReadDatabag(std::any::TypeId, &'static str),
    WriteDatabag(std::any::TypeId, &'static str),
    Emitter(std::any::TypeId, &'static str, String),
    Receiver(std::any::TypeId, &'static str, String),
    Spawner(std::any::TypeId, &'static str),
    Query(fn(&Registry, &mut SystemAccess) -> Result<(), RegistryError>),
}

/// A fully described but not yet registered system: the output of
/// [`SystemBuilder`], consumed by the registry.
pub struct SystemDef {
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) phase: Phase,
    pub(crate) kind: SystemKind,
    pub(crate) before: SmallVec<[String; 2]>,
    pub(crate) after: SmallVec<[String; 2]>,
    pub(crate) parent_dispatcher: Option<String>,
    pub(crate) decls: Vec<AccessDecl>,
    pub(crate) invoke: SystemInvoke,
}

/// Builder for system registrations.
///
/// ```ignore
/// let inc = SystemBuilder::new("Inc")
///     .phase(Phase::Process)
///     .with_query::<(Write<Position>,)>()
///     .build(|ctx| {
///         ctx.query::<(Write<Position>,)>()
///             .unwrap()
///             .for_each(|_, (pos,)| pos.x += 1);
///     });
/// ```
pub struct SystemBuilder {
    name: String,
    description: String,
    phase: Phase,
    before: SmallVec<[String; 2]>,
    after: SmallVec<[String; 2]>,
    parent_dispatcher: Option<String>,
    decls: Vec<AccessDecl>,
}

impl SystemBuilder {
    pub fn new(name: &str) -> Self {
        SystemBuilder {
            name: name.to_string(),
            description: String::new(),
            phase: Phase::default(),
            before: SmallVec::new(),
            after: SmallVec::new(),
            parent_dispatcher: None,
            decls: Vec::new(),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    /// Declares that this system completes before the named one within
    /// the same phase.
    pub fn before(mut self, system: &str) -> Self {
        self.before.push(system.to_string());
        self
    }

    pub fn after(mut self, system: &str) -> Self {
        self.after.push(system.to_string());
        self
    }

    /// Targets this system into the named dispatcher's sub-pipeline.
    pub fn in_dispatcher(mut self, dispatcher: &str) -> Self {
        self.parent_dispatcher = Some(dispatcher.to_string());
        self
    }

    pub fn read_component<C: Component>(mut self) -> Self {
        self.decls.push(AccessDecl::ReadComponent(
            std::any::TypeId::of::<C>(),
            std::any::type_name::<C>(),
        ));
        self
    }

    pub fn write_component<C: Component>(mut self) -> Self {
        self.decls.push(AccessDecl::WriteComponent(
            std::any::TypeId::of::<C>(),
            std::any::type_name::<C>(),
        ));
        self
    }

    /// Full access to the component's storage, including insert and
    /// remove. Schedules as a write over the whole storage.
    pub fn storage<C: Component>(mut self) -> Self {
        self.decls.push(AccessDecl::StorageWrite(
            std::any::TypeId::of::<C>(),
            std::any::type_name::<C>(),
        ));
        self
    }

    /// Id-based variant of [`SystemBuilder::storage`] for dynamic
    /// component kinds.
    pub fn storage_by_id(mut self, component: ComponentKindId) -> Self {
        self.decls.push(AccessDecl::StorageWriteId(component));
        self
    }

    pub fn read_databag<D: Databag>(mut self) -> Self {
        self.decls.push(AccessDecl::ReadDatabag(
            std::any::TypeId::of::<D>(),
            std::any::type_name::<D>(),
        ));
        self
    }

    pub fn write_databag<D: Databag>(mut self) -> Self {
        self.decls.push(AccessDecl::WriteDatabag(
            std::any::TypeId::of::<D>(),
            std::any::type_name::<D>(),
        ));
        self
    }

    /// Declares this system emits `E` under the given emitter name.
    pub fn emitter<E: Event>(mut self, name: &str) -> Self {
        self.decls.push(AccessDecl::Emitter(
            std::any::TypeId::of::<E>(),
            std::any::type_name::<E>(),
            name.to_string(),
        ));
        self
    }

    /// Declares this system receives `E` emitted under the given name.
    pub fn receiver<E: Event>(mut self, name: &str) -> Self {
        self.decls.push(AccessDecl::Receiver(
            std::any::TypeId::of::<E>(),
            std::any::type_name::<E>(),
            name.to_string(),
        ));
        self
    }

    pub fn spawner<S: SpawnerTag>(mut self) -> Self {
        self.decls.push(AccessDecl::Spawner(
            std::any::TypeId::of::<S>(),
            std::any::type_name::<S>(),
        ));
        self
    }

    /// Declares the access of a query shape the system will bind through
    /// [`SystemContext::query`].
    pub fn with_query<V: ViewTuple>(mut self) -> Self {
        self.decls.push(AccessDecl::Query(V::declare_access));
        self
    }

    pub fn build<F>(self, body: F) -> SystemDef
    where
        F: Fn(&SystemContext) + Send + Sync + 'static,
    {
        self.build_fallible(move |ctx| {
            body(ctx);
            Ok(())
        })
    }

    pub fn build_fallible<F>(self, body: F) -> SystemDef
    where
        F: Fn(&SystemContext) -> Result<(), SystemError> + Send + Sync + 'static,
    {
        self.into_def(SystemKind::Normal, SystemInvoke::Normal(Arc::new(body)))
    }

    /// Builds a startup system: runs at tick start every tick until the
    /// body returns `true`.
    pub fn build_startup<F>(self, body: F) -> SystemDef
    where
        F: FnMut(&SystemContext) -> bool + Send + 'static,
    {
        self.retiring(SystemKind::Startup, body)
    }

    /// Builds a temporary system: runs at the start of its phase every
    /// tick until the body returns `true`.
    pub fn build_temporary<F>(self, body: F) -> SystemDef
    where
        F: FnMut(&SystemContext) -> bool + Send + 'static,
    {
        self.retiring(SystemKind::Temporary, body)
    }

    pub fn build_temporary_fallible<F>(self, body: F) -> SystemDef
    where
        F: FnMut(&SystemContext) -> Result<bool, SystemError> + Send + 'static,
    {
        self.into_def(
            SystemKind::Temporary,
            SystemInvoke::Retiring(Arc::new(Mutex::new(Box::new(body)))),
        )
    }

    /// Builds a dispatcher driving the named sub-pipeline `repeat` times
    /// per tick.
    pub fn dispatcher(self, pipeline: &str, repeat: u32) -> SystemDef {
        self.into_def(
            SystemKind::Dispatcher {
                pipeline: pipeline.to_string(),
                repeat,
            },
            SystemInvoke::Dispatcher,
        )
    }

    fn retiring<F>(self, kind: SystemKind, mut body: F) -> SystemDef
    where
        F: FnMut(&SystemContext) -> bool + Send + 'static,
    {
        self.into_def(
            kind,
            SystemInvoke::Retiring(Arc::new(Mutex::new(Box::new(
                move |ctx: &SystemContext| Ok(body(ctx)),
            )))),
        )
    }

    fn into_def(self, kind: SystemKind, invoke: SystemInvoke) -> SystemDef {
        SystemDef {
            name: self.name,
            description: self.description,
            phase: self.phase,
            kind,
            before: self.before,
            after: self.after,
            parent_dispatcher: self.parent_dispatcher,
            decls: self.decls,
            invoke,
        }
    }
}

/// Binds a system's declared inputs against a world for the duration of
/// one invocation. Every accessor checks the bind against the system's
/// declared access set.
pub struct SystemContext<'w> {
    world: &'w World,
    descriptor: &'w SystemDescriptor,
    commands: RefCell<CommandBuffer>,
}

impl<'w> SystemContext<'w> {
    pub(crate) fn new(world: &'w World, descriptor: &'w SystemDescriptor) -> Self {
        SystemContext {
            world,
            descriptor,
            commands: RefCell::new(CommandBuffer::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn registry(&self) -> &Registry {
        self.world.registry()
    }

    pub fn tick(&self) -> u64 {
        self.world.tick()
    }

    /// Binds a query over the world. The query's access must be covered
    /// by the system's declarations.
    pub fn query<V: ViewTuple>(&self) -> Result<Query<'w, V>, crate::error::QueryError> {
        let registry = self.world.registry();
        let mut probe = SystemAccess::default();
        V::declare_access(registry, &mut probe)
            .unwrap_or_else(|err| panic!("system `{}`: {}", self.descriptor.name, err));
        assert!(
            self.descriptor.access.permits(&probe),
            "system `{}` binds a query it did not declare",
            self.descriptor.name
        );
        Query::new(self.world, registry)
    }

    /// Immutable view of a declared databag.
    pub fn databag<D: Databag>(&self) -> Bag<'w, D> {
        let id = self.expect_databag_id::<D>();
        let index = id.index() as usize;
        assert!(
            self.descriptor.access.databags.reads().contains(index)
                || self.descriptor.access.databags.writes().contains(index),
            "system `{}` reads databag `{}` without declaring it",
            self.descriptor.name,
            std::any::type_name::<D>()
        );
        Bag {
            guard: self.world.databag_guard::<D>(id).unwrap_or_else(|| {
                panic!(
                    "databag `{}` was not prepared for system `{}`",
                    std::any::type_name::<D>(),
                    self.descriptor.name
                )
            }),
        }
    }

    /// Mutable view of a declared databag.
    pub fn databag_mut<D: Databag>(&self) -> BagMut<'w, D> {
        let id = self.expect_databag_id::<D>();
        assert!(
            self.descriptor
                .access
                .databags
                .writes()
                .contains(id.index() as usize),
            "system `{}` writes databag `{}` without declaring it",
            self.descriptor.name,
            std::any::type_name::<D>()
        );
        BagMut {
            guard: self.world.databag_guard_mut::<D>(id).unwrap_or_else(|| {
                panic!(
                    "databag `{}` was not prepared for system `{}`",
                    std::any::type_name::<D>(),
                    self.descriptor.name
                )
            }),
        }
    }

    /// Shared view of a component storage. Requires any declared access
    /// to the component.
    pub fn storage<C: Component>(&self) -> StorageRead<'w, C> {
        let id = self.expect_component_id::<C>();
        let access = &self.descriptor.access;
        let index = id.index() as usize;
        assert!(
            access.components.reads().contains(index)
                || access.components.writes().contains(index)
                || access.storages.contains(index),
            "system `{}` reads storage `{}` without declaring it",
            self.descriptor.name,
            std::any::type_name::<C>()
        );
        StorageRead {
            guard: self.expect_column(id),
        }
    }

    /// Exclusive view of a component storage; requires the whole-storage
    /// declaration made with [`SystemBuilder::storage`].
    pub fn storage_mut<C: Component>(&self) -> StorageWrite<'w, C> {
        let id = self.expect_component_id::<C>();
        assert!(
            self.descriptor.access.storages.contains(id.index() as usize),
            "system `{}` takes storage `{}` mutably without declaring it",
            self.descriptor.name,
            std::any::type_name::<C>()
        );
        StorageWrite {
            guard: self.expect_column_mut(id),
        }
    }

    /// Emitter bound to the system's declared emitter name for `E`.
    /// Binding flushes the event storage's stale buckets.
    pub fn emitter<E: Event>(&self) -> EmitterHandle<'w, E> {
        let id = self.expect_event_id::<E>();
        let (_, name) = self
            .descriptor
            .access
            .emitters
            .iter()
            .find(|(event, _)| *event == id)
            .unwrap_or_else(|| {
                panic!(
                    "system `{}` emits `{}` without declaring it",
                    self.descriptor.name,
                    std::any::type_name::<E>()
                )
            });
        let tick = self.world.tick();
        let mut guard = self.world.event_guard_mut::<E>(id).unwrap_or_else(|| {
            panic!(
                "event storage `{}` was not prepared for system `{}`",
                std::any::type_name::<E>(),
                self.descriptor.name
            )
        });
        guard.flush_stale(tick);
        EmitterHandle {
            guard,
            name: name.as_str(),
            tick,
        }
    }

    /// Receiver bound to the system's declared emitter name for `E`.
    /// Yields nothing when no emitter exists under that name.
    pub fn receiver<E: Event>(&self) -> ReceiverHandle<'w, E> {
        let id = self.expect_event_id::<E>();
        let (_, name) = self
            .descriptor
            .access
            .receivers
            .iter()
            .find(|(event, _)| *event == id)
            .unwrap_or_else(|| {
                panic!(
                    "system `{}` receives `{}` without declaring it",
                    self.descriptor.name,
                    std::any::type_name::<E>()
                )
            });
        ReceiverHandle {
            guard: self.world.event_guard::<E>(id),
            name: name.as_str(),
            tick: self.world.tick(),
        }
    }

    /// Validated component insertion/removal over the spawner's member
    /// components.
    pub fn spawner<S: SpawnerTag>(&self) -> SpawnerAccess<'w> {
        let registry = self.world.registry();
        let id = registry
            .spawner_id::<S>()
            .unwrap_or_else(|| panic!("spawner `{}` is not registered", std::any::type_name::<S>()));
        assert!(
            self.descriptor.access.spawners.contains(id.index() as usize),
            "system `{}` uses spawner `{}` without declaring it",
            self.descriptor.name,
            std::any::type_name::<S>()
        );
        SpawnerAccess::new(self.world, id)
    }

    /// Deferred structural mutations, applied in submission order at the
    /// end of the stage.
    pub fn commands(&self) -> RefMut<CommandBuffer> {
        self.commands.borrow_mut()
    }

    pub(crate) fn take_commands(self) -> CommandBuffer {
        self.commands.into_inner()
    }

    fn expect_component_id<C: Component>(&self) -> ComponentKindId {
        self.world
            .registry()
            .component_id::<C>()
            .unwrap_or_else(|| {
                panic!("component `{}` is not registered", std::any::type_name::<C>())
            })
    }

    fn expect_databag_id<D: Databag>(&self) -> DatabagKindId {
        self.world
            .registry()
            .databag_id::<D>()
            .unwrap_or_else(|| panic!("databag `{}` is not registered", std::any::type_name::<D>()))
    }

    fn expect_event_id<E: Event>(&self) -> EventKindId {
        self.world
            .registry()
            .event_id::<E>()
            .unwrap_or_else(|| panic!("event `{}` is not registered", std::any::type_name::<E>()))
    }

    fn expect_column<C: Component>(&self, id: ComponentKindId) -> ColumnRef<'w, C> {
        match self.world.read_column::<C>(id) {
            Ok(Some(guard)) => guard,
            Ok(None) => panic!(
                "storage `{}` was not prepared for system `{}`",
                std::any::type_name::<C>(),
                self.descriptor.name
            ),
            Err(err) => panic!("system `{}`: {}", self.descriptor.name, err),
        }
    }

    fn expect_column_mut<C: Component>(&self, id: ComponentKindId) -> ColumnMut<'w, C> {
        match self.world.write_column::<C>(id) {
            Ok(Some(guard)) => guard,
            Ok(None) => panic!(
                "storage `{}` was not prepared for system `{}`",
                std::any::type_name::<C>(),
                self.descriptor.name
            ),
            Err(err) => panic!("system `{}`: {}", self.descriptor.name, err),
        }
    }
}

/// Shared borrow of a databag for a system's duration.
pub struct Bag<'w, D: Databag> {
    guard: crate::world::BagRef<'w, D>,
}

impl<'w, D: Databag> std::ops::Deref for Bag<'w, D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.guard
    }
}

/// Exclusive borrow of a databag for a system's duration.
pub struct BagMut<'w, D: Databag> {
    guard: crate::world::BagMutRef<'w, D>,
}

impl<'w, D: Databag> std::ops::Deref for BagMut<'w, D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.guard
    }
}

impl<'w, D: Databag> std::ops::DerefMut for BagMut<'w, D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.guard
    }
}

/// Shared borrow of a component column.
pub struct StorageRead<'w, C: Component> {
    guard: ColumnRef<'w, C>,
}

impl<'w, C: Component> std::ops::Deref for StorageRead<'w, C> {
    type Target = crate::storage::Column<C>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

/// Exclusive borrow of a component column, including insert/remove and
/// the shared-steady operations.
pub struct StorageWrite<'w, C: Component> {
    guard: ColumnMut<'w, C>,
}

impl<'w, C: Component> std::ops::Deref for StorageWrite<'w, C> {
    type Target = crate::storage::Column<C>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'w, C: Component> std::ops::DerefMut for StorageWrite<'w, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Emits events under the system's declared emitter name.
pub struct EmitterHandle<'w, E: Event> {
    guard: crate::world::EventMutRef<'w, E>,
    name: &'w str,
    tick: u64,
}

impl<'w, E: Event> EmitterHandle<'w, E> {
    pub fn emit(&mut self, event: E) {
        let (name, tick) = (self.name, self.tick);
        self.guard.emit(name, tick, event);
    }

    pub fn emitter_name(&self) -> &str {
        self.name
    }
}

/// Reads the current tick's events under the system's declared emitter
/// name.
pub struct ReceiverHandle<'w, E: Event> {
    guard: Option<crate::world::EventRef<'w, E>>,
    name: &'w str,
    tick: u64,
}

impl<'w, E: Event> ReceiverHandle<'w, E> {
    pub fn events(&self) -> &[E] {
        match &self.guard {
            Some(guard) => guard.read(self.name, self.tick),
            None => &[],
        }
    }

    pub fn iter(&self) -> std::slice::Iter<E> {
        self.events().iter()
    }

    pub fn emitter_name(&self) -> &str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_ordered() {
        let mut sorted = Phase::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Phase::ALL.to_vec());
        assert_eq!(Phase::Config.index(), 0);
        assert_eq!(Phase::PreRender.index(), 5);
    }

    #[test]
    fn write_conflicts_with_read_and_write() {
        let mut a = SystemAccess::default();
        a.components.write(1);
        let mut b = SystemAccess::default();
        b.components.read(1);
        let mut c = SystemAccess::default();
        c.components.write(1);
        let mut d = SystemAccess::default();
        d.components.read(2);

        assert!(a.conflicts_with(&b));
        assert!(a.conflicts_with(&c));
        assert!(!a.conflicts_with(&d));
        assert!(!b.conflicts_with(&d));
    }

    #[test]
    fn exclusive_conflicts_with_everything() {
        let mut solo = SystemAccess::default();
        solo.exclusive = true;
        let empty = SystemAccess::default();
        assert!(solo.conflicts_with(&empty));
        assert!(empty.conflicts_with(&solo));
    }

    #[test]
    fn emitters_conflict_with_receivers_and_emitters() {
        let event = EventKindId::new(0);
        let mut emit_a = SystemAccess::default();
        emit_a.emitters.push((event, "a".into()));
        let mut emit_b = SystemAccess::default();
        emit_b.emitters.push((event, "b".into()));
        let mut recv = SystemAccess::default();
        recv.receivers.push((event, "a".into()));
        let recv_only = recv.clone();

        assert!(emit_a.conflicts_with(&emit_b));
        assert!(emit_a.conflicts_with(&recv));
        assert!(recv.conflicts_with(&emit_a));
        assert!(!recv.conflicts_with(&recv_only));
    }

    #[test]
    fn empty_access_conflicts_with_nothing() {
        let empty = SystemAccess::default();
        let other = SystemAccess::default();
        assert!(!empty.conflicts_with(&other));
        assert!(empty.is_empty());
    }

    #[test]
    fn whole_storage_access_counts_as_component_write() {
        let mut storage = SystemAccess::default();
        storage.storages.insert(2);
        let mut reader = SystemAccess::default();
        reader.components.read(2);
        assert!(storage.conflicts_with(&reader));
    }

    #[test]
    fn permits_covers_reads_through_writes() {
        let mut declared = SystemAccess::default();
        declared.components.write(3);
        declared.storages.insert(4);

        let mut probe = SystemAccess::default();
        probe.components.read(3);
        probe.components.write(4);
        assert!(declared.permits(&probe));

        let mut outside = SystemAccess::default();
        outside.components.read(9);
        assert!(!declared.permits(&outside));
    }
}
