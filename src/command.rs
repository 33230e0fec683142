//! Deferred world mutations.
//!
//! Systems running inside a parallel stage must not mutate shared
//! structural state directly; they record operations here instead. Each
//! system owns a private buffer for the duration of its invocation and
//! the executor applies the buffered commands, in submission order, at
//! the end of the stage.

use crate::entity::{ComponentKindId, EntityId};
use crate::property::{Component, PropertyMap};
use crate::world::{EntityBuilder, World};

type Command = Box<dyn FnOnce(&mut World) + Send>;

/// Ordered buffer of deferred world operations.
#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        CommandBuffer::default()
    }

    /// Records an arbitrary deferred operation.
    pub fn push(&mut self, command: impl FnOnce(&mut World) + Send + 'static) {
        self.commands.push(Box::new(command));
    }

    /// Creates an entity at flush time. The closure receives the builder
    /// to chain component additions onto the fresh entity.
    pub fn spawn(&mut self, build: impl FnOnce(EntityBuilder) + Send + 'static) {
        self.push(move |world| build(world.create_entity()));
    }

    pub fn add_component<C: Component>(&mut self, entity: EntityId, value: C) {
        self.push(move |world| {
            if let Err(err) = world.add_component(entity, value) {
                tracing::error!(%entity, %err, "deferred component add failed");
            }
        });
    }

    pub fn add_component_dynamic(
        &mut self,
        entity: EntityId,
        component: ComponentKindId,
        data: PropertyMap,
    ) {
        self.push(move |world| {
            if let Err(err) = world.add_component_dynamic(entity, component, &data) {
                tracing::error!(%entity, %component, %err, "deferred component add failed");
            }
        });
    }

    pub fn remove_component<C: Component>(&mut self, entity: EntityId) {
        self.push(move |world| {
            world.remove_component::<C>(entity);
        });
    }

    pub fn remove_component_dynamic(&mut self, entity: EntityId, component: ComponentKindId) {
        self.push(move |world| {
            world.remove_component_dynamic(entity, component);
        });
    }

    pub fn destroy_entity(&mut self, entity: EntityId) {
        self.push(move |world| world.destroy_entity(entity));
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Applies the buffered commands in submission order and leaves the
    /// buffer empty.
    pub fn apply(&mut self, world: &mut World) {
        for command in self.commands.drain(..) {
            command(world);
        }
    }
}
