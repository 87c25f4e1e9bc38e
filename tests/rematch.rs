mod fixtures;

use fixtures::*;
use swarm_ecs::prelude::*;

#[test]
fn up_term_matches_through_prototype() {
    let mut world = world();
    let a = world.entity();
    let b = world.entity();

    let proto = spawn_with(&mut world, &[b.id()]);
    let e = spawn_with(&mut world, &[pair(IS_A, proto), a.id()]);

    let q = world
        .query(QueryDesc::new().with(a).term(Term::new(b).up(IS_A)))
        .unwrap();
    assert_eq!(world.query_table_count(q), 1);

    let mut it = world.query_iter(q);
    let view = it.next().unwrap();
    assert_eq!(view.entities(), &[e]);
    assert_eq!(view.source(0), Entity::NULL);
    assert_eq!(view.source(1), proto);
    assert!(view.is_up(1));
    assert!(!view.is_up(0));
}

#[test]
fn up_term_matches_through_deep_chains() {
    let mut world = world();
    let a = world.entity();
    let b = world.entity();

    let base = spawn_with(&mut world, &[b.id()]);
    let middle = spawn_with(&mut world, &[pair(IS_A, base)]);
    let e = spawn_with(&mut world, &[pair(IS_A, middle), a.id()]);

    let q = world
        .query(QueryDesc::new().with(a).term(Term::new(b).up(IS_A)))
        .unwrap();
    assert_eq!(world.query_table_count(q), 1);

    let mut it = world.query_iter(q);
    let view = it.next().unwrap();
    assert_eq!(view.entities(), &[e]);
    assert_eq!(view.source(1), base);
}

#[test]
fn rematch_tracks_prototype_changes_and_is_generation_gated() {
    let mut world = world();
    let a = world.entity();
    let b = world.entity();

    let proto = spawn_with(&mut world, &[b.id()]);
    spawn_with(&mut world, &[pair(IS_A, proto), a.id()]);

    let q = world
        .query(QueryDesc::new().with(a).term(Term::new(b).up(IS_A)))
        .unwrap();
    assert_eq!(world.query_table_count(q), 1);
    assert!(world.query_changed(q));

    // Dropping B on the prototype invalidates the indirect match.
    world.remove_id(proto, b.id());
    world.query_rematch(q);
    assert_eq!(world.query_table_count(q), 0);
    assert!(world.query_changed(q));

    // Same generation: rematch is a no-op.
    world.query_rematch(q);
    assert!(!world.query_changed(q));

    // Restoring B brings the table back on the next sweep.
    world.add_id(proto, b.id());
    world.query_rematch(q);
    assert_eq!(world.query_table_count(q), 1);
    assert!(world.query_changed(q));
}

#[test]
fn rematch_is_driven_by_monitored_ids_only() {
    let mut world = world();
    let a = world.entity();
    let b = world.entity();
    let unrelated = world.entity();

    let proto = spawn_with(&mut world, &[b.id()]);
    spawn_with(&mut world, &[pair(IS_A, proto), a.id()]);

    let q = world
        .query(QueryDesc::new().with(a).term(Term::new(b).up(IS_A)))
        .unwrap();
    let _ = world.query_changed(q);

    // Changes to ids nobody monitors do not advance the cache.
    spawn_with(&mut world, &[unrelated.id()]);
    world.query_rematch(q);
    assert!(!world.query_changed(q));
}

#[test]
fn fixed_source_terms_gate_every_table() {
    let mut world = world();
    let a = world.entity();
    let toggle = world.entity();

    let settings = spawn_with(&mut world, &[toggle.id()]);
    let e1 = spawn_with(&mut world, &[a.id()]);

    let q = world
        .query(QueryDesc::new().with(a).term(Term::new(toggle).src(settings)))
        .unwrap();
    assert_eq!(world.query_table_count(q), 1);

    let mut it = world.query_iter(q);
    let view = it.next().unwrap();
    assert_eq!(view.entities(), &[e1]);
    assert_eq!(view.source(1), settings);
    drop(it);

    world.remove_id(settings, toggle.id());
    world.query_rematch(q);
    assert_eq!(world.query_table_count(q), 0);

    world.add_id(settings, toggle.id());
    world.query_rematch(q);
    assert_eq!(world.query_table_count(q), 1);
}

#[test]
fn rematch_updates_wildcard_chains_in_place() {
    let mut world = world();
    let a = world.entity();
    let b = world.entity();
    let rel = world.entity();
    let x = world.entity();
    let y = world.entity();

    let proto = spawn_with(&mut world, &[b.id()]);
    let e = spawn_with(&mut world, &[pair(rel, x), pair(rel, y), pair(IS_A, proto), a.id()]);
    let t = world.entity_table(e).unwrap();

    // Two wildcard matches per table plus an up term so rematch applies.
    let q = world
        .query(
            QueryDesc::new()
                .with(a)
                .with_pair(rel, WILDCARD)
                .term(Term::new(b).up(IS_A)),
        )
        .unwrap();
    assert_eq!(world.query_table_count(q), 1);
    let entry = world.query_cache_table(q, t).unwrap();
    assert_ne!(entry.first(), entry.last());

    // A monitored change that keeps the match; the sweep must reuse both
    // chain links in place.
    let other = world.entity();
    world.add_id(proto, pair(IS_A, other));
    world.query_rematch(q);
    assert_eq!(world.query_table_count(q), 1);

    let mut resolved = Vec::new();
    let mut it = world.query_iter(q);
    while let Some(view) = it.next() {
        resolved.push(view.id(1));
    }
    assert_eq!(resolved, vec![pair(rel, x), pair(rel, y)]);
}
