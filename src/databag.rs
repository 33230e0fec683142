//! World-scoped singleton values.
//!
//! A databag is a singleton keyed by its registered kind; the world holds
//! at most one per kind and constructs it lazily from the registered
//! factory on first access.

use downcast_rs::{impl_downcast, Downcast};

/// Marker for world singletons. Blanket-implemented for every type that
/// can live in the world's tables.
pub trait Databag: Downcast + Send + Sync {}

impl_downcast!(Databag);

impl<T: std::any::Any + Send + Sync> Databag for T {}
