//! Engine-facing surface: worlds, pipelines and the active pair.
//!
//! The host owns its worlds and pipelines inside the [`Ecs`] handle and
//! addresses them through plain index handles; nothing in the runtime
//! holds a pointer back into the host. One world and one pipeline may be
//! active at a time, and `dispatch` drives that pair one tick forward.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use crate::command::CommandBuffer;
use crate::error::DispatchError;
use crate::pipeline::Pipeline;
use crate::registry::Registry;
use crate::world::{World, WorldNotification};

/// Index of a world owned by the [`Ecs`] handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct WorldHandle(u32);

/// Index of a pipeline owned by the [`Ecs`] handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PipelineHandle(u32);

/// The host's entry point into the runtime.
pub struct Ecs {
    registry: Arc<Registry>,
    worlds: Vec<Option<World>>,
    pipelines: Vec<Option<Pipeline>>,
    active_world: Option<WorldHandle>,
    active_pipeline: Option<PipelineHandle>,
    commands: CommandBuffer,
    subscribers: Vec<Sender<WorldNotification>>,
}

impl Ecs {
    pub fn new(registry: Arc<Registry>) -> Self {
        Ecs {
            registry,
            worlds: Vec::new(),
            pipelines: Vec::new(),
            active_world: None,
            active_pipeline: None,
            commands: CommandBuffer::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ~~ worlds ~~

    pub fn add_world(&mut self, mut world: World) -> WorldHandle {
        for subscriber in &self.subscribers {
            world.attach_subscriber(subscriber.clone());
        }
        let handle = WorldHandle(self.worlds.len() as u32);
        self.worlds.push(Some(world));
        handle
    }

    pub fn world(&self, handle: WorldHandle) -> Option<&World> {
        self.worlds.get(handle.0 as usize)?.as_ref()
    }

    pub fn world_mut(&mut self, handle: WorldHandle) -> Option<&mut World> {
        self.worlds.get_mut(handle.0 as usize)?.as_mut()
    }

    /// Removes the world, deactivating it first if needed.
    pub fn remove_world(&mut self, handle: WorldHandle) -> Option<World> {
        if self.active_world == Some(handle) {
            self.clear_active_world();
        }
        self.worlds.get_mut(handle.0 as usize)?.take()
    }

    /// Activates the world and delivers its loaded notification. Fails
    /// when another world is already active.
    pub fn set_active_world(&mut self, handle: WorldHandle) -> Result<(), DispatchError> {
        if self.active_world.is_some() {
            return Err(DispatchError::WorldAlreadyActive);
        }
        let world = self
            .worlds
            .get(handle.0 as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(DispatchError::UnknownWorld)?;
        debug!(world = %world.id(), "world activated");
        world.notify(WorldNotification::Loaded(world.id()));
        self.active_world = Some(handle);
        Ok(())
    }

    /// Deactivates the active world, delivering pre-unload then
    /// unloaded.
    pub fn clear_active_world(&mut self) {
        if let Some(handle) = self.active_world.take() {
            if let Some(world) = self.worlds.get(handle.0 as usize).and_then(|w| w.as_ref()) {
                world.notify(WorldNotification::PreUnload(world.id()));
                world.notify(WorldNotification::Unloaded(world.id()));
                debug!(world = %world.id(), "world deactivated");
            }
        }
    }

    pub fn active_world(&self) -> Option<WorldHandle> {
        self.active_world
    }

    // ~~ pipelines ~~

    pub fn add_pipeline(&mut self, pipeline: Pipeline) -> PipelineHandle {
        let handle = PipelineHandle(self.pipelines.len() as u32);
        self.pipelines.push(Some(pipeline));
        handle
    }

    pub fn pipeline(&self, handle: PipelineHandle) -> Option<&Pipeline> {
        self.pipelines.get(handle.0 as usize)?.as_ref()
    }

    pub fn set_active_pipeline(&mut self, handle: PipelineHandle) -> Result<(), DispatchError> {
        if self
            .pipelines
            .get(handle.0 as usize)
            .and_then(|slot| slot.as_ref())
            .is_none()
        {
            return Err(DispatchError::UnknownPipeline);
        }
        self.active_pipeline = Some(handle);
        Ok(())
    }

    pub fn active_pipeline(&self) -> Option<PipelineHandle> {
        self.active_pipeline
    }

    // ~~ notifications and commands ~~

    /// Subscribes to world lifecycle notifications of every world this
    /// handle owns (current and future).
    pub fn subscribe(&mut self) -> Receiver<WorldNotification> {
        let (sender, receiver) = unbounded();
        for world in self.worlds.iter_mut().flatten() {
            world.attach_subscriber(sender.clone());
        }
        self.subscribers.push(sender);
        receiver
    }

    /// Deferred host mutations, drained into the active world at the
    /// start of the next dispatch.
    pub fn commands(&mut self) -> &mut CommandBuffer {
        &mut self.commands
    }

    /// Drives the active pipeline one tick over the active world.
    pub fn dispatch(&mut self) -> Result<(), DispatchError> {
        let world_handle = self.active_world.ok_or(DispatchError::NoActiveWorld)?;
        let pipeline_handle = self.active_pipeline.ok_or(DispatchError::NoActivePipeline)?;
        let world = self
            .worlds
            .get_mut(world_handle.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(DispatchError::UnknownWorld)?;
        let pipeline = self
            .pipelines
            .get_mut(pipeline_handle.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(DispatchError::UnknownPipeline)?;

        self.commands.apply(world);
        pipeline.dispatch(world)
    }
}
