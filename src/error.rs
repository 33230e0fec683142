//! Error taxonomy of the runtime core.
//!
//! Recoverable lookups return `Option`/empty results at the call site;
//! everything listed here is an explicit failure surfaced to the caller.

use thiserror::Error;

use crate::entity::{EntityId, SharedId, SystemBundleId, SystemId};
use crate::storage::StorageDiscipline;

/// Registration-time failures. Duplicate registration is fatal during
/// normal startup; dynamic (script-origin) systems take the reset path
/// instead and never produce [`RegistryError::NameConflict`].
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("the name `{name}` is already registered as a {kind}")]
    NameConflict { kind: &'static str, name: String },

    #[error("`{name}` is registered but is not a dynamic system")]
    NotDynamic { name: String },

    #[error("unknown {kind} name `{name}`")]
    UnknownName { kind: &'static str, name: String },

    #[error("unknown {kind} id {id}")]
    UnknownId { kind: &'static str, id: u32 },

    #[error("no component is registered for the type `{type_name}`")]
    UnknownComponentType { type_name: &'static str },

    #[error("no databag is registered for the type `{type_name}`")]
    UnknownDatabagType { type_name: &'static str },

    #[error("no event is registered for the type `{type_name}`")]
    UnknownEventType { type_name: &'static str },

    #[error("no spawner is registered for the type `{type_name}`")]
    UnknownSpawnerType { type_name: &'static str },

    #[error("bundle {0} is not registered")]
    UnknownBundle(SystemBundleId),

    #[error("component `{name}` uses a custom discipline; register it with a storage factory")]
    CustomNeedsFactory { name: String },
}

/// Failures raised by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("entity {0} is not present in this storage")]
    MissingEntity(EntityId),

    #[error("shared id {0} does not point to a live value")]
    DeadSharedId(SharedId),

    #[error("operation requires the {expected:?} discipline, storage uses {found:?}")]
    WrongDiscipline {
        expected: StorageDiscipline,
        found: StorageDiscipline,
    },
}

/// Failures raised by world-level component and databag routing.
#[derive(Debug, Error)]
pub enum WorldError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("no storage exists for component id {0}")]
    StorageMissing(u32),

    #[error("component `{component}` does not belong to spawner `{spawner}`")]
    NotInSpawner { spawner: String, component: String },
}

/// Failures detected while composing an execution plan.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("dependency cycle between systems: {}", participants.join(", "))]
    Cycle { participants: Vec<String> },

    #[error("system {0} is not registered")]
    UnknownSystem(SystemId),

    #[error("bundle {0} is not registered")]
    UnknownBundle(SystemBundleId),

    #[error("system `{system}` declares a dependency on `{name}`, which is not registered")]
    UnknownDependency { system: String, name: String },

    #[error("dispatcher `{system}` references sub-pipeline `{name}`, which was not provided")]
    UnresolvedDispatcher { system: String, name: String },

    #[error("system `{system}` targets dispatcher `{name}`, but no such dispatcher is in the pipeline")]
    UnknownParentDispatcher { system: String, name: String },

    #[error("system `{system}` writes databag id {databag}, which cannot be created")]
    MissingDatabag { system: String, databag: u32 },

    #[error("pipeline preparation could not create {kind} id {id}")]
    PrepareFailed { kind: &'static str, id: u32 },

    #[error("failed to build the worker pool: {0}")]
    WorkerPool(String),
}

/// Failures a query can hit while binding against a world.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("a query needs at least one definite component view to drive iteration")]
    NoDriver,

    #[error("the storage of component `{0}` is already borrowed incompatibly")]
    AliasedAccess(&'static str),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Non-recoverable condition signalled by a system body. Aborts the
/// current tick; partial stage results are left in place.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SystemError {
    message: String,
}

impl SystemError {
    pub fn new(message: impl Into<String>) -> Self {
        SystemError {
            message: message.into(),
        }
    }
}

impl From<&str> for SystemError {
    fn from(message: &str) -> Self {
        SystemError::new(message)
    }
}

impl From<String> for SystemError {
    fn from(message: String) -> Self {
        SystemError { message }
    }
}

/// Failures surfaced by a pipeline dispatch or by the host layer.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("system `{system}` failed: {source}")]
    SystemFailed {
        system: String,
        #[source]
        source: SystemError,
    },

    #[error("pipeline preparation failed: {0}")]
    Prepare(#[from] PlanError),

    #[error("no world is active")]
    NoActiveWorld,

    #[error("no pipeline is active")]
    NoActivePipeline,

    #[error("a world is already active")]
    WorldAlreadyActive,

    #[error("unknown world handle")]
    UnknownWorld,

    #[error("unknown pipeline handle")]
    UnknownPipeline,
}
