#![allow(dead_code)]

use std::sync::Once;

use swarm_ecs::prelude::*;

static TRACING: Once = Once::new();

/// Fresh world with test logging wired up once per process.
pub fn world() -> World {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    World::new()
}

pub fn spawn_with(world: &mut World, ids: &[Id]) -> Entity {
    let entity = world.entity();
    for &id in ids {
        world.add_id(entity, id);
    }
    entity
}

/// Collects the table visited by each remaining view of the iterator.
pub fn visited_tables(it: &mut CachedIter<'_>) -> Vec<TableId> {
    let mut tables = Vec::new();
    while let Some(view) = it.next() {
        tables.push(view.table().id());
    }
    tables
}

/// Collects every entity visited, in iteration order.
pub fn visited_entities(it: &mut CachedIter<'_>) -> Vec<Entity> {
    let mut entities = Vec::new();
    while let Some(view) = it.next() {
        entities.extend_from_slice(view.entities());
    }
    entities
}

/// Collects the group id of each visited view.
pub fn visited_groups(it: &mut CachedIter<'_>) -> Vec<u64> {
    let mut groups = Vec::new();
    while let Some(view) = it.next() {
        groups.push(view.group_id());
    }
    groups
}
