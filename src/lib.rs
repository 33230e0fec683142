//! Runtime core of an entity-component-system engine embedded in a game
//! engine host.
//!
//! The crate is built around three pieces:
//!
//! * a [`registry::Registry`] of every component, databag, event,
//!   spawner and system kind known at process start, frozen from a
//!   [`registry::RegistryBuilder`] before the first dispatch;
//! * a [`world::World`] storing entity state as typed component columns
//!   plus per-world singleton databags and per-tick event buffers;
//! * a [`pipeline::Pipeline`] composing registered systems into an
//!   immutable, possibly-parallel execution plan dispatched once per
//!   tick against a world.
//!
//! ```ignore
//! let mut registry = RegistryBuilder::new();
//! registry.register_component::<Position>("Position", StorageDiscipline::Dense)?;
//! let step = registry.register_system(
//!     SystemBuilder::new("step")
//!         .phase(Phase::Process)
//!         .with_query::<(Write<Position>,)>()
//!         .build(|ctx| {
//!             ctx.query::<(Write<Position>,)>()
//!                 .unwrap()
//!                 .for_each(|_, (position,)| position.x += 1);
//!         }),
//! )?;
//! let registry = registry.freeze()?;
//!
//! let mut world = World::new(registry.clone());
//! world.create_entity().with(Position { x: 0 });
//!
//! let mut pipeline = Pipeline::builder(registry).add_system(step).build()?;
//! pipeline.dispatch(&mut world)?;
//! ```

pub mod command;
pub mod databag;
pub mod entity;
pub mod error;
pub mod event;
pub mod host;
pub mod pipeline;
pub mod property;
pub mod query;
pub mod registry;
pub mod spawner;
pub mod storage;
pub mod system;
pub mod world;

pub use crate::command::CommandBuffer;
pub use crate::databag::Databag;
pub use crate::entity::{
    ComponentKindId, DatabagKindId, EntityId, EventKindId, SharedId, SpawnerKindId,
    SystemBundleId, SystemId, WorldId,
};
pub use crate::error::{
    DispatchError, PlanError, QueryError, RegistryError, StorageError, SystemError, WorldError,
};
pub use crate::event::{Event, EventStorage};
pub use crate::host::{Ecs, PipelineHandle, WorldHandle};
pub use crate::pipeline::{Pipeline, PipelineBuilder, PipelineConfig};
pub use crate::property::{
    Component, DynamicRecord, PropertyInfo, PropertyKind, PropertyMap, PropertyValue,
};
pub use crate::query::{AnyOf, Batch, Changed, Maybe, Query, Read, View, ViewTuple, Without, Write};
pub use crate::registry::{Registry, RegistryBuilder};
pub use crate::spawner::{SpawnerAccess, SpawnerTag};
pub use crate::storage::{
    ChangeList, Column, ComponentBuf, EntityList, ListOp, Storage, StorageConfig,
    StorageDiscipline,
};
pub use crate::system::{
    Phase, SystemAccess, SystemBuilder, SystemContext, SystemDef, SystemDescriptor, SystemKind,
};
pub use crate::world::{EntityBuilder, World, WorldNotification};

pub mod prelude {
    pub use crate::entity::{EntityId, SharedId};
    pub use crate::error::SystemError;
    pub use crate::pipeline::{Pipeline, PipelineConfig};
    pub use crate::property::{Component, PropertyMap, PropertyValue};
    pub use crate::query::{AnyOf, Batch, Changed, Maybe, Read, Without, Write};
    pub use crate::registry::RegistryBuilder;
    pub use crate::storage::{StorageConfig, StorageDiscipline};
    pub use crate::system::{Phase, SystemBuilder};
    pub use crate::world::World;
}
