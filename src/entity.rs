//! Identifiers used throughout the runtime.
//!
//! Every id is an opaque 32-bit index with an all-ones `NONE` sentinel.
//! Ids are dense within their kind: the registry assigns them in
//! registration order and they never change for the process lifetime.

use std::fmt::{self, Display};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub const NONE: $name = $name(u32::MAX);

            pub fn new(index: u32) -> Self {
                $name(index)
            }

            pub fn index(self) -> u32 {
                self.0
            }

            pub fn is_none(self) -> bool {
                self.0 == u32::MAX
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if self.is_none() {
                    write!(f, "{}(none)", stringify!($name))
                } else {
                    write!(f, "{}", self.0)
                }
            }
        }
    };
}

id_type! {
    /// Names a composition of components inside one [`World`](crate::world::World).
    ///
    /// Entity ids are allocated monotonically per world and are never
    /// recycled; `NONE` is never returned by `create_entity`.
    EntityId
}

id_type! {
    /// Handle to a value inside a shared-steady storage. Many entities may
    /// attach to the same `SharedId`.
    SharedId
}

id_type!(ComponentKindId);
id_type!(DatabagKindId);
id_type!(EventKindId);
id_type!(SpawnerKindId);
id_type!(SystemId);
id_type!(SystemBundleId);

/// Process-unique world identity, used to key per-pipeline preparation
/// state against a specific world.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct WorldId(u64);

impl WorldId {
    pub(crate) fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        WorldId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "world#{}", self.0)
    }
}
