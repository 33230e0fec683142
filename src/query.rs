//! Lazy entity queries over component storages.
//!
//! A query is a tuple of views: the first view able to drive the
//! iteration supplies the candidate entities (the driver), and the
//! remaining views filter and fetch per candidate. Every matching entity
//! is yielded exactly once per iteration.
//!
//! Views: [`Read`], [`Write`], [`Maybe`], [`Without`], [`Changed`],
//! [`Batch`] and [`AnyOf`].

use std::marker::PhantomData;

use fxhash::FxHashSet;

use crate::entity::EntityId;
use crate::error::{QueryError, RegistryError};
use crate::property::Component;
use crate::registry::Registry;
use crate::system::SystemAccess;
use crate::world::{ColumnMut, ColumnRef, World};

/// One element of a query shape.
pub trait View: 'static {
    type Guard<'w>;
    type Item<'g>;

    /// Whether this view can supply the candidate entities.
    const CAN_DRIVE: bool;

    /// Records the view's data access, resolving ids against the
    /// registry.
    fn declare(registry: &Registry, access: &mut SystemAccess) -> Result<(), RegistryError>;

    fn bind<'w>(world: &'w World, registry: &Registry) -> Result<Self::Guard<'w>, QueryError>;

    /// Snapshot of candidate entities. Only called when `CAN_DRIVE`.
    fn driver(guard: &Self::Guard<'_>) -> Vec<EntityId>;

    fn matches(guard: &Self::Guard<'_>, entity: EntityId) -> bool;

    /// Only called after `matches` returned `true`.
    fn fetch<'g>(guard: &'g mut Self::Guard<'_>, entity: EntityId) -> Self::Item<'g>;
}

fn component_id<C: Component>(registry: &Registry) -> Result<crate::entity::ComponentKindId, RegistryError> {
    registry
        .component_id::<C>()
        .ok_or_else(|| RegistryError::UnknownComponentType {
            type_name: std::any::type_name::<C>(),
        })
}

/// Immutable per-entity component view.
pub struct Read<C: Component>(PhantomData<C>);

impl<C: Component> View for Read<C> {
    type Guard<'w> = Option<ColumnRef<'w, C>>;
    type Item<'g> = &'g C;

    const CAN_DRIVE: bool = true;

    fn declare(registry: &Registry, access: &mut SystemAccess) -> Result<(), RegistryError> {
        access.components.read(component_id::<C>(registry)?.index());
        Ok(())
    }

    fn bind<'w>(world: &'w World, registry: &Registry) -> Result<Self::Guard<'w>, QueryError> {
        let id = component_id::<C>(registry)?;
        world.read_column::<C>(id)
    }

    fn driver(guard: &Self::Guard<'_>) -> Vec<EntityId> {
        guard.as_ref().map_or_else(Vec::new, |c| c.entities().to_vec())
    }

    fn matches(guard: &Self::Guard<'_>, entity: EntityId) -> bool {
        guard.as_ref().map_or(false, |c| c.has(entity))
    }

    fn fetch<'g>(guard: &'g mut Self::Guard<'_>, entity: EntityId) -> Self::Item<'g> {
        guard
            .as_ref()
            .and_then(|c| c.get(entity))
            .expect("fetch on a non-matching entity")
    }
}

/// Mutable per-entity component view. Fetching raises an update
/// notification on the storage's change list.
pub struct Write<C: Component>(PhantomData<C>);

impl<C: Component> View for Write<C> {
    type Guard<'w> = Option<ColumnMut<'w, C>>;
    type Item<'g> = &'g mut C;

    const CAN_DRIVE: bool = true;

    fn declare(registry: &Registry, access: &mut SystemAccess) -> Result<(), RegistryError> {
        access.components.write(component_id::<C>(registry)?.index());
        Ok(())
    }

    fn bind<'w>(world: &'w World, registry: &Registry) -> Result<Self::Guard<'w>, QueryError> {
        let id = component_id::<C>(registry)?;
        world.write_column::<C>(id)
    }

    fn driver(guard: &Self::Guard<'_>) -> Vec<EntityId> {
        guard.as_ref().map_or_else(Vec::new, |c| c.entities().to_vec())
    }

    fn matches(guard: &Self::Guard<'_>, entity: EntityId) -> bool {
        guard.as_ref().map_or(false, |c| c.has(entity))
    }

    fn fetch<'g>(guard: &'g mut Self::Guard<'_>, entity: EntityId) -> Self::Item<'g> {
        guard
            .as_mut()
            .and_then(|c| c.get_mut(entity))
            .expect("fetch on a non-matching entity")
    }
}

/// Optional component view: the entity matches regardless, the item is
/// `Some` only when the component is present.
pub struct Maybe<V>(PhantomData<V>);

impl<V: View> View for Maybe<V> {
    type Guard<'w> = V::Guard<'w>;
    type Item<'g> = Option<V::Item<'g>>;

    const CAN_DRIVE: bool = false;

    fn declare(registry: &Registry, access: &mut SystemAccess) -> Result<(), RegistryError> {
        V::declare(registry, access)
    }

    fn bind<'w>(world: &'w World, registry: &Registry) -> Result<Self::Guard<'w>, QueryError> {
        V::bind(world, registry)
    }

    fn driver(_: &Self::Guard<'_>) -> Vec<EntityId> {
        Vec::new()
    }

    fn matches(_: &Self::Guard<'_>, _: EntityId) -> bool {
        true
    }

    fn fetch<'g>(guard: &'g mut Self::Guard<'_>, entity: EntityId) -> Self::Item<'g> {
        if V::matches(&*guard, entity) {
            Some(V::fetch(guard, entity))
        } else {
            None
        }
    }
}

/// Negative filter: the entity must not have the component.
pub struct Without<C: Component>(PhantomData<C>);

impl<C: Component> View for Without<C> {
    type Guard<'w> = Option<ColumnRef<'w, C>>;
    type Item<'g> = ();

    const CAN_DRIVE: bool = false;

    fn declare(registry: &Registry, access: &mut SystemAccess) -> Result<(), RegistryError> {
        access.components.read(component_id::<C>(registry)?.index());
        Ok(())
    }

    fn bind<'w>(world: &'w World, registry: &Registry) -> Result<Self::Guard<'w>, QueryError> {
        let id = component_id::<C>(registry)?;
        world.read_column::<C>(id)
    }

    fn driver(_: &Self::Guard<'_>) -> Vec<EntityId> {
        Vec::new()
    }

    fn matches(guard: &Self::Guard<'_>, entity: EntityId) -> bool {
        guard.as_ref().map_or(true, |c| !c.has(entity))
    }

    fn fetch<'g>(_: &'g mut Self::Guard<'_>, _: EntityId) -> Self::Item<'g> {}
}

/// Restricts the query to entities on the component's change list and
/// drains each yielded entry (the consumer flush). Schedules as a write
/// over the whole storage, since draining mutates the list.
pub struct Changed<C: Component>(PhantomData<C>);

impl<C: Component> View for Changed<C> {
    type Guard<'w> = Option<ColumnMut<'w, C>>;
    type Item<'g> = &'g C;

    const CAN_DRIVE: bool = true;

    fn declare(registry: &Registry, access: &mut SystemAccess) -> Result<(), RegistryError> {
        access.storages.insert(component_id::<C>(registry)?.index() as usize);
        Ok(())
    }

    fn bind<'w>(world: &'w World, registry: &Registry) -> Result<Self::Guard<'w>, QueryError> {
        let id = component_id::<C>(registry)?;
        world.write_column::<C>(id)
    }

    fn driver(guard: &Self::Guard<'_>) -> Vec<EntityId> {
        guard
            .as_ref()
            .map_or_else(Vec::new, |c| c.changed().entities().to_vec())
    }

    fn matches(guard: &Self::Guard<'_>, entity: EntityId) -> bool {
        guard
            .as_ref()
            .map_or(false, |c| c.changed().is_changed(entity) && c.has(entity))
    }

    fn fetch<'g>(guard: &'g mut Self::Guard<'_>, entity: EntityId) -> Self::Item<'g> {
        let column = &mut **guard.as_mut().expect("fetch on a non-matching entity");
        column.notify_updated(entity);
        column.get(entity).expect("changed entry without a value")
    }
}

/// Batch view: yields every value the storage holds for the entity. The
/// built-in disciplines hold exactly one.
pub struct Batch<C: Component>(PhantomData<C>);

impl<C: Component> View for Batch<C> {
    type Guard<'w> = Option<ColumnRef<'w, C>>;
    type Item<'g> = &'g [C];

    const CAN_DRIVE: bool = true;

    fn declare(registry: &Registry, access: &mut SystemAccess) -> Result<(), RegistryError> {
        access.components.read(component_id::<C>(registry)?.index());
        Ok(())
    }

    fn bind<'w>(world: &'w World, registry: &Registry) -> Result<Self::Guard<'w>, QueryError> {
        let id = component_id::<C>(registry)?;
        world.read_column::<C>(id)
    }

    fn driver(guard: &Self::Guard<'_>) -> Vec<EntityId> {
        guard.as_ref().map_or_else(Vec::new, |c| c.entities().to_vec())
    }

    fn matches(guard: &Self::Guard<'_>, entity: EntityId) -> bool {
        guard.as_ref().map_or(false, |c| c.has(entity))
    }

    fn fetch<'g>(guard: &'g mut Self::Guard<'_>, entity: EntityId) -> Self::Item<'g> {
        guard
            .as_ref()
            .and_then(|c| c.get_batch(entity))
            .expect("fetch on a non-matching entity")
    }
}

/// Disjunction: the entity matches when any of the wrapped views match;
/// the item is a tuple of options. Candidates are the deduplicated union
/// of the wrapped drivers.
pub struct AnyOf<T>(PhantomData<T>);

macro_rules! impl_any_of {
    ($($view:ident),*) => {
        impl<$($view: View),*> View for AnyOf<($($view,)*)> {
            type Guard<'w> = ($($view::Guard<'w>,)*);
            type Item<'g> = ($(Option<$view::Item<'g>>,)*);

            const CAN_DRIVE: bool = $($view::CAN_DRIVE)||*;

            fn declare(
                registry: &Registry,
                access: &mut SystemAccess,
            ) -> Result<(), RegistryError> {
                $($view::declare(registry, access)?;)*
                Ok(())
            }

            fn bind<'w>(
                world: &'w World,
                registry: &Registry,
            ) -> Result<Self::Guard<'w>, QueryError> {
                Ok(($($view::bind(world, registry)?,)*))
            }

            fn driver(guard: &Self::Guard<'_>) -> Vec<EntityId> {
                #[allow(non_snake_case)]
                let ($($view,)*) = guard;
                let mut seen = FxHashSet::default();
                let mut out = Vec::new();
                $(
                    if $view::CAN_DRIVE {
                        for entity in $view::driver($view) {
                            if seen.insert(entity) {
                                out.push(entity);
                            }
                        }
                    }
                )*
                out
            }

            fn matches(guard: &Self::Guard<'_>, entity: EntityId) -> bool {
                #[allow(non_snake_case)]
                let ($($view,)*) = guard;
                $($view::matches($view, entity))||*
            }

            fn fetch<'g>(
                guard: &'g mut Self::Guard<'_>,
                entity: EntityId,
            ) -> Self::Item<'g> {
                #[allow(non_snake_case)]
                let ($($view,)*) = guard;
                ($(
                    if $view::matches(&*$view, entity) {
                        Some($view::fetch($view, entity))
                    } else {
                        None
                    },
                )*)
            }
        }
    };
}

impl_any_of!(A, B);
impl_any_of!(A, B, C);
impl_any_of!(A, B, C, D);

/// A query shape: a tuple of views bound together against one world.
pub trait ViewTuple: 'static {
    type Guards<'w>;
    type Items<'g>;

    fn declare_access(registry: &Registry, access: &mut SystemAccess) -> Result<(), RegistryError>;

    fn bind<'w>(world: &'w World, registry: &Registry) -> Result<Self::Guards<'w>, QueryError>;

    fn driver(guards: &Self::Guards<'_>) -> Result<Vec<EntityId>, QueryError>;

    fn matches(guards: &Self::Guards<'_>, entity: EntityId) -> bool;

    fn fetch<'g>(guards: &'g mut Self::Guards<'_>, entity: EntityId) -> Self::Items<'g>;
}

macro_rules! impl_view_tuple {
    ($($view:ident),*) => {
        impl<$($view: View),*> ViewTuple for ($($view,)*) {
            type Guards<'w> = ($($view::Guard<'w>,)*);
            type Items<'g> = ($($view::Item<'g>,)*);

            fn declare_access(
                registry: &Registry,
                access: &mut SystemAccess,
            ) -> Result<(), RegistryError> {
                $($view::declare(registry, access)?;)*
                Ok(())
            }

            fn bind<'w>(
                world: &'w World,
                registry: &Registry,
            ) -> Result<Self::Guards<'w>, QueryError> {
                Ok(($($view::bind(world, registry)?,)*))
            }

            fn driver(guards: &Self::Guards<'_>) -> Result<Vec<EntityId>, QueryError> {
                #[allow(non_snake_case)]
                let ($($view,)*) = guards;
                $(
                    if $view::CAN_DRIVE {
                        return Ok($view::driver($view));
                    }
                )*
                Err(QueryError::NoDriver)
            }

            fn matches(guards: &Self::Guards<'_>, entity: EntityId) -> bool {
                #[allow(non_snake_case)]
                let ($($view,)*) = guards;
                $($view::matches($view, entity))&&*
            }

            fn fetch<'g>(
                guards: &'g mut Self::Guards<'_>,
                entity: EntityId,
            ) -> Self::Items<'g> {
                #[allow(non_snake_case)]
                let ($($view,)*) = guards;
                ($($view::fetch($view, entity),)*)
            }
        }
    };
}

impl_view_tuple!(A);
impl_view_tuple!(A, B);
impl_view_tuple!(A, B, C);
impl_view_tuple!(A, B, C, D);
impl_view_tuple!(A, B, C, D, E);
impl_view_tuple!(A, B, C, D, E, F);
impl_view_tuple!(A, B, C, D, E, F, G);
impl_view_tuple!(A, B, C, D, E, F, G, H);

/// A bound query: holds the storage guards of its views for the duration
/// of the iteration.
pub struct Query<'w, V: ViewTuple> {
    guards: V::Guards<'w>,
    entities: Vec<EntityId>,
}

impl<'w, V: ViewTuple> Query<'w, V> {
    pub(crate) fn new(world: &'w World, registry: &Registry) -> Result<Self, QueryError> {
        let guards = V::bind(world, registry)?;
        let entities = V::driver(&guards)?;
        Ok(Query { guards, entities })
    }

    /// Visits every matching entity exactly once, in the driver
    /// storage's order.
    pub fn for_each(&mut self, mut f: impl FnMut(EntityId, V::Items<'_>)) {
        for index in 0..self.entities.len() {
            let entity = self.entities[index];
            if V::matches(&self.guards, entity) {
                f(entity, V::fetch(&mut self.guards, entity));
            }
        }
    }

    pub fn try_for_each<E>(
        &mut self,
        mut f: impl FnMut(EntityId, V::Items<'_>) -> Result<(), E>,
    ) -> Result<(), E> {
        for index in 0..self.entities.len() {
            let entity = self.entities[index];
            if V::matches(&self.guards, entity) {
                f(entity, V::fetch(&mut self.guards, entity))?;
            }
        }
        Ok(())
    }

    /// Matching entities, without fetching their data.
    pub fn entities(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .copied()
            .filter(|&entity| V::matches(&self.guards, entity))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entities
            .iter()
            .filter(|&&entity| V::matches(&self.guards, entity))
            .count()
    }

    /// Fetches a single entity's items when it matches.
    pub fn get(&mut self, entity: EntityId) -> Option<V::Items<'_>> {
        if V::matches(&self.guards, entity) {
            Some(V::fetch(&mut self.guards, entity))
        } else {
            None
        }
    }
}
