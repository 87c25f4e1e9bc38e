use criterion::{black_box, criterion_group, criterion_main, Criterion};
use swarm_ecs::prelude::*;

struct Bed {
    world: World,
    q: QueryHandle,
    position: Entity,
    velocity: Entity,
}

fn build_world(tables: u32, rows_per_table: u32) -> Bed {
    let mut world = World::new();
    let position = world.component::<[f32; 2]>();
    let velocity = world.component::<[f32; 2]>();

    for i in 0..tables {
        let tag = world.entity();
        for j in 0..rows_per_table {
            let e = world.entity();
            world.set(e, position, [i as f32, j as f32]);
            world.set(e, velocity, [1.0, 0.5]);
            world.add_id(e, tag.id());
        }
    }

    let q = world
        .query(QueryDesc::new().with(position).with(velocity))
        .unwrap();
    Bed { world, q, position, velocity }
}

fn cached_iteration(c: &mut Criterion) {
    let bed = build_world(64, 32);
    c.bench_function("cached_iter/64x32", |b| {
        b.iter(|| {
            let mut visited = 0usize;
            let mut it = bed.world.query_iter(bed.q);
            while let Some(view) = it.next() {
                visited += view.count();
            }
            black_box(visited)
        })
    });
}

fn table_event_maintenance(c: &mut Criterion) {
    c.bench_function("table_create_match/256", |b| {
        b.iter(|| {
            let mut bed = build_world(1, 1);
            for _ in 0..256 {
                let tag = bed.world.entity();
                let e = bed.world.entity();
                bed.world.set(e, bed.position, [0.0, 0.0]);
                bed.world.set(e, bed.velocity, [0.0, 1.0]);
                bed.world.add_id(e, tag.id());
            }
            black_box(bed.world.query_table_count(bed.q))
        })
    });
}

criterion_group!(benches, cached_iteration, table_event_maintenance);
criterion_main!(benches);
