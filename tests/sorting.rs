mod fixtures;

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use fixtures::*;
use swarm_ecs::prelude::*;

fn by_i32(_: Entity, a: &dyn std::any::Any, _: Entity, b: &dyn std::any::Any) -> std::cmp::Ordering {
    a.downcast_ref::<i32>()
        .unwrap()
        .cmp(b.downcast_ref::<i32>().unwrap())
}

#[test]
fn order_by_merges_tables_into_sorted_slices() {
    let mut world = world();
    let value = world.component::<i32>();
    let tag = world.entity();

    let e1 = world.entity();
    world.set(e1, value, 3);
    let e2 = world.entity();
    world.set(e2, value, 1);
    let e3 = world.entity();
    world.set(e3, value, 2);
    world.add_id(e3, tag.id());
    let e4 = world.entity();
    world.set(e4, value, 4);
    world.add_id(e4, tag.id());

    let q = world
        .query(QueryDesc::new().with(value).order_by(value, by_i32))
        .unwrap();

    let mut it = world.query_iter(q);
    assert_eq!(visited_entities(&mut it), vec![e2, e3, e1, e4]);
    drop(it);

    // Four slices: the order crosses table boundaries every step.
    let mut slices = 0;
    let mut it = world.query_iter(q);
    while let Some(view) = it.next() {
        assert_eq!(view.count(), 1);
        slices += 1;
    }
    assert_eq!(slices, 4);
}

#[test]
fn sorted_view_follows_value_and_membership_changes() {
    let mut world = world();
    let value = world.component::<i32>();

    let e1 = world.entity();
    world.set(e1, value, 3);
    let e2 = world.entity();
    world.set(e2, value, 1);

    let q = world
        .query(QueryDesc::new().with(value).order_by(value, by_i32))
        .unwrap();
    let mut it = world.query_iter(q);
    assert_eq!(visited_entities(&mut it), vec![e2, e1]);
    drop(it);

    world.set(e2, value, 10);
    world.query_update(q);
    let mut it = world.query_iter(q);
    assert_eq!(visited_entities(&mut it), vec![e1, e2]);
    drop(it);

    let e3 = world.entity();
    world.set(e3, value, 0);
    world.query_update(q);
    let mut it = world.query_iter(q);
    assert_eq!(visited_entities(&mut it), vec![e3, e1, e2]);
}

#[test]
fn order_by_clears_match_empty_tables() {
    let mut world = world();
    let value = world.component::<i32>();

    let e1 = world.entity();
    world.set(e1, value, 1);
    let e2 = world.entity();
    world.set(e2, value, 2);

    // Empty out a second matched table.
    let tag = world.entity();
    let e3 = world.entity();
    world.set(e3, value, 3);
    world.add_id(e3, tag.id());
    world.despawn(e3);

    let plain = world
        .query(QueryDesc::new().with(value).match_empty_tables(true))
        .unwrap();
    let mut visited = 0;
    let mut empty_visited = 0;
    let mut it = world.query_iter(plain);
    while let Some(view) = it.next() {
        visited += 1;
        if view.count() == 0 {
            empty_visited += 1;
        }
    }
    assert_eq!((visited, empty_visited), (2, 1));
    drop(it);

    let sorted = world
        .query(
            QueryDesc::new()
                .with(value)
                .match_empty_tables(true)
                .order_by(value, by_i32),
        )
        .unwrap();
    let mut it = world.query_iter(sorted);
    while let Some(view) = it.next() {
        assert!(view.count() > 0);
    }
}

#[test]
fn order_by_validation() {
    let mut world = world();
    let value = world.component::<i32>();
    let other = world.component::<i32>();

    let wildcard = world.query(QueryDesc::new().with(value).order_by(WILDCARD, by_i32));
    assert!(matches!(wildcard.unwrap_err(), EcsError::InvalidParameter(_)));

    let not_queried = world.query(QueryDesc::new().with(value).order_by(other, by_i32));
    assert!(matches!(not_queried.unwrap_err(), EcsError::InvalidParameter(_)));

    // A Not term does not satisfy the order_by requirement.
    let not_term = world.query(QueryDesc::new().with(value).without(other).order_by(other, by_i32));
    assert!(matches!(not_term.unwrap_err(), EcsError::InvalidParameter(_)));
}

#[test]
fn order_by_table_hook_pre_sorts_rows() {
    let mut world = world();
    let value = world.component::<i32>();

    let e1 = world.entity();
    world.set(e1, value, 5);
    let e2 = world.entity();
    world.set(e2, value, 2);
    let e3 = world.entity();
    world.set(e3, value, 9);

    let called = Arc::new(AtomicBool::new(false));
    let witness = called.clone();

    let q = world
        .query(
            QueryDesc::new()
                .with(value)
                .order_by(value, by_i32)
                .order_by_table(move |world, table, column| {
                    witness.store(true, AtomicOrdering::SeqCst);
                    let table = world.table(table).unwrap();
                    let values = table.column_slice::<i32>(column).unwrap();
                    let mut rows: Vec<u32> = (0..values.len() as u32).collect();
                    rows.sort_by_key(|&row| values[row as usize]);
                    rows
                }),
        )
        .unwrap();

    assert!(called.load(AtomicOrdering::SeqCst));
    let mut it = world.query_iter(q);
    assert_eq!(visited_entities(&mut it), vec![e2, e1, e3]);
}

#[test]
fn change_detection_reports_writes() {
    let mut world = world();
    let value = world.component::<i32>();

    let e1 = world.entity();
    world.set(e1, value, 1);

    let q = world
        .query(QueryDesc::new().with(value).detect_changes(true))
        .unwrap();
    assert!(world.query_changed(q));
    assert!(!world.query_changed(q));

    world.set(e1, value, 2);
    assert!(world.query_changed(q));
    assert!(!world.query_changed(q));
}
