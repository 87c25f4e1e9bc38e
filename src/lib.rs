//! swarm-ecs: an archetype ECS runtime with cached queries.
//!
//! Entities live in tables (archetypes) keyed by their component id set.
//! Queries select tables through term constraints; a cached query
//! precomputes its matching tables and keeps them current through table
//! lifecycle events and monitor-generation driven rematching, so iteration
//! costs O(matched tables) instead of O(all tables).
//!
//! ```
//! use swarm_ecs::prelude::*;
//!
//! let mut world = World::new();
//! let position = world.component::<(f32, f32)>();
//! let e = world.entity();
//! world.set(e, position, (1.0f32, 2.0f32));
//!
//! let q = world.query(QueryDesc::new().with(position)).unwrap();
//! let mut it = world.query_iter(q);
//! while let Some(view) = it.next() {
//!     assert_eq!(view.entities(), &[e]);
//! }
//! ```

pub mod cache;
pub mod engine;
pub mod query;

pub mod prelude {
    pub use crate::cache::iter::{CachedIter, MatchView};
    pub use crate::cache::list::GroupInfo;
    pub use crate::engine::error::{EcsError, EcsResult};
    pub use crate::engine::table::{Table, TableId};
    pub use crate::engine::types::{pair, Entity, Id, CHILD_OF, EMPTY, IS_A, WILDCARD};
    pub use crate::engine::world::{QueryHandle, World};
    pub use crate::query::{CacheKind, QueryDesc, Term};
}
