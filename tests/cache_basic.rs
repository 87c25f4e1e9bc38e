mod fixtures;

use fixtures::*;
use swarm_ecs::prelude::*;

#[test]
fn matches_existing_tables_in_creation_order() {
    let mut world = world();
    let a = world.entity();
    let b = world.entity();
    let c = world.entity();

    // T1(A) x2, T2(A, B) x3, T3(C) x1.
    let e1 = spawn_with(&mut world, &[a.id()]);
    spawn_with(&mut world, &[a.id()]);
    let e3 = spawn_with(&mut world, &[a.id(), b.id()]);
    spawn_with(&mut world, &[a.id(), b.id()]);
    spawn_with(&mut world, &[a.id(), b.id()]);
    spawn_with(&mut world, &[c.id()]);

    let q = world.query(QueryDesc::new().with(a)).unwrap();
    assert_eq!(world.query_table_count(q), 2);
    assert_eq!(world.query_entity_count(q), 5);

    let t1 = world.entity_table(e1).unwrap();
    let t2 = world.entity_table(e3).unwrap();
    assert!(world.query_cache_table(q, t1).is_some());
    assert!(world.query_cache_table(q, t2).is_some());

    let mut it = world.query_iter(q);
    assert_eq!(visited_tables(&mut it), vec![t1, t2]);
}

#[test]
fn new_matching_table_is_appended() {
    let mut world = world();
    let a = world.entity();
    let d = world.entity();

    let e1 = spawn_with(&mut world, &[a.id()]);
    let q = world.query(QueryDesc::new().with(a)).unwrap();
    assert_eq!(world.query_table_count(q), 1);
    assert!(world.query_changed(q));
    assert!(!world.query_changed(q));

    // Joining the already-matched table is not a cache change.
    spawn_with(&mut world, &[a.id()]);
    assert_eq!(world.query_table_count(q), 1);
    assert!(!world.query_changed(q));

    let e4 = spawn_with(&mut world, &[a.id(), d.id()]);
    assert_eq!(world.query_table_count(q), 2);
    assert!(world.query_changed(q));

    let t1 = world.entity_table(e1).unwrap();
    let t4 = world.entity_table(e4).unwrap();
    let mut it = world.query_iter(q);
    assert_eq!(visited_tables(&mut it), vec![t1, t4]);
}

#[test]
fn table_delete_frees_entry_and_restores_empty_tag() {
    let mut world = world();
    let a = world.entity();
    let qe = world.entity();

    let q = world
        .query(QueryDesc::new().with(a).entity(qe))
        .unwrap();
    // Nothing matches yet.
    assert!(world.has_id(qe, EMPTY.id()));

    let e1 = spawn_with(&mut world, &[a.id()]);
    assert!(!world.has_id(qe, EMPTY.id()));

    let t1 = world.entity_table(e1).unwrap();
    world.delete_table(t1);
    assert!(!world.is_alive(e1));
    assert_eq!(world.query_table_count(q), 0);
    assert!(world.query_cache_table(q, t1).is_none());
    assert!(world.has_id(qe, EMPTY.id()));

    // A fresh matching table clears the tag again.
    spawn_with(&mut world, &[a.id()]);
    assert!(!world.has_id(qe, EMPTY.id()));
}

#[test]
fn empty_query_never_matches() {
    let mut world = world();
    let a = world.entity();
    spawn_with(&mut world, &[a.id()]);

    let q = world.query(QueryDesc::new()).unwrap();
    assert_eq!(world.query_table_count(q), 0);
    assert_eq!(world.query_entity_count(q), 0);
    assert!(world.query_iter(q).next().is_none());

    // Tables created later are ignored as well.
    let b = world.entity();
    spawn_with(&mut world, &[b.id()]);
    assert_eq!(world.query_table_count(q), 0);
}

#[test]
fn trivial_cache_predicate() {
    let mut world = world();
    let a = world.entity();
    let b = world.entity();
    let rel = world.entity();

    let plain = world.query(QueryDesc::new().with(a).with(b)).unwrap();
    assert!(world.query_has_trivial_cache(plain));

    let changes = world
        .query(QueryDesc::new().with(a).detect_changes(true))
        .unwrap();
    assert!(!world.query_has_trivial_cache(changes));

    let wildcard = world
        .query(QueryDesc::new().with(a).with_pair(rel, WILDCARD))
        .unwrap();
    assert!(!world.query_has_trivial_cache(wildcard));

    let grouped = world
        .query(QueryDesc::new().with(a).group_by(rel))
        .unwrap();
    assert!(!world.query_has_trivial_cache(grouped));

    let traversing = world
        .query(QueryDesc::new().with(a).term(Term::new(b).up(IS_A)))
        .unwrap();
    assert!(!world.query_has_trivial_cache(traversing));
}

#[test]
fn wildcard_produces_one_match_per_resolved_id() {
    let mut world = world();
    let a = world.entity();
    let rel = world.entity();
    let x = world.entity();
    let y = world.entity();

    // Pairs first so no intermediate table carries `a` and matches.
    let e = spawn_with(&mut world, &[pair(rel, x), pair(rel, y), a.id()]);
    let t = world.entity_table(e).unwrap();

    let q = world
        .query(QueryDesc::new().with(a).with_pair(rel, WILDCARD))
        .unwrap();
    assert_eq!(world.query_table_count(q), 1);

    let entry = world.query_cache_table(q, t).unwrap();
    assert_ne!(entry.first(), entry.last());

    let mut resolved = Vec::new();
    let mut it = world.query_iter(q);
    while let Some(view) = it.next() {
        assert_eq!(view.table().id(), t);
        assert_eq!(view.id(0), a.id());
        resolved.push(view.id(1));
    }
    assert_eq!(resolved, vec![pair(rel, x), pair(rel, y)]);

    // Narrowing the entity to one pair re-matches through a new table.
    world.remove_id(e, pair(rel, y));
    let t2 = world.entity_table(e).unwrap();
    assert_ne!(t, t2);
    assert_eq!(world.query_table_count(q), 2);

    let mut resolved = Vec::new();
    let mut it = world.query_iter(q);
    while let Some(view) = it.next() {
        // The old table is empty now and skipped.
        assert_eq!(view.table().id(), t2);
        resolved.push(view.id(1));
    }
    assert_eq!(resolved, vec![pair(rel, x)]);
}

#[test]
fn not_and_optional_terms() {
    let mut world = world();
    let a = world.entity();
    let b = world.entity();
    let c = world.entity();

    spawn_with(&mut world, &[a.id()]);
    spawn_with(&mut world, &[a.id(), b.id()]);
    let with_c = spawn_with(&mut world, &[a.id(), c.id()]);

    let q = world
        .query(QueryDesc::new().with(a).without(b).optional(c))
        .unwrap();
    assert_eq!(world.query_table_count(q), 2);

    let mut it = world.query_iter(q);
    while let Some(view) = it.next() {
        assert!(view.is_set(0));
        assert!(!view.is_set(1));
        let expect_c = view.table().id() == world.entity_table(with_c).unwrap();
        assert_eq!(view.is_set(2), expect_c);
    }
}

#[test]
fn fini_round_trips_world_state() {
    let mut world = world();
    let a = world.entity();
    let qe = world.entity();

    let q = world
        .query(QueryDesc::new().with(a).entity(qe))
        .unwrap();
    assert!(world.has_id(qe, EMPTY.id()));

    world.query_fini(q).unwrap();
    assert!(!world.has_id(qe, EMPTY.id()));
    assert!(world.query_fini(q).is_err());

    // The slot is recycled with a new generation; the old handle stays dead.
    let q2 = world.query(QueryDesc::new().with(a)).unwrap();
    assert_ne!(q, q2);
}

#[test]
fn unsupported_descriptors_are_rejected() {
    let mut world = world();
    let a = world.entity();
    let b = world.entity();

    let named_var = world.query(QueryDesc::new().term(Term::new(a).src_var("other")));
    assert_eq!(named_var.unwrap_err(), EcsError::Unsupported("named variables are not supported"));

    let filter_inout = world.query(QueryDesc::new().term(Term::new(a).filter()));
    assert!(matches!(filter_inout.unwrap_err(), EcsError::Unsupported(_)));

    let two_cascades = world.query(
        QueryDesc::new()
            .with(a)
            .term(Term::new(a).cascade(CHILD_OF))
            .term(Term::new(b).cascade(CHILD_OF)),
    );
    assert!(matches!(two_cascades.unwrap_err(), EcsError::InvalidParameter(_)));

    let cascade_and_group = world.query(
        QueryDesc::new()
            .with(a)
            .term(Term::new(a).cascade(CHILD_OF))
            .group_by(b),
    );
    assert!(matches!(cascade_and_group.unwrap_err(), EcsError::InvalidParameter(_)));

    world.shutdown();
    let after_shutdown = world.query(QueryDesc::new().with(a));
    assert!(matches!(after_shutdown.unwrap_err(), EcsError::InvalidOperation(_)));
}

#[test]
fn uncached_queries_evaluate_on_demand() {
    let mut world = world();
    let a = world.entity();
    let e1 = spawn_with(&mut world, &[a.id()]);

    let q = world
        .query(QueryDesc::new().with(a).cache_kind(CacheKind::None))
        .unwrap();
    let mut it = world.query_iter(q);
    assert_eq!(visited_entities(&mut it), vec![e1]);
    drop(it);

    let e2 = spawn_with(&mut world, &[a.id()]);
    let mut it = world.query_iter(q);
    assert_eq!(visited_entities(&mut it), vec![e1, e2]);
}
