use std::hint::black_box;

use chunked_ecs::{
    stages, ComponentDecl, ComponentsInit, EcsConfig, EntitySystemDesc, NamedQueryDesc, QueryDesc, TemplateDesc,
    UpdateStageInfo, World,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

type Point3 = [f32; 3];

const SMALL: usize = 10_000;
const LARGE: usize = 100_000;

fn world(config: EcsConfig) -> World {
    let mut world = World::with_config(config);
    world
        .register_components(&[
            ComponentDecl::of::<Point3>("pos"),
            ComponentDecl::of::<Point3>("vel"),
            ComponentDecl::of::<f32>("hp").tracked(),
        ])
        .unwrap();
    world.add_template(
        TemplateDesc::new("mover")
            .component("pos", [0.0f32; 3])
            .component("vel", [1.0f32, 0.5, 0.25])
            .component("hp", 100.0f32),
    );
    world
}

fn populated(count: usize, config: EcsConfig) -> World {
    let mut world = world(config);
    for _ in 0..count {
        world.create_entity_sync("mover", ComponentsInit::new());
    }
    world
}

fn bench_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("create");

    for count in [SMALL, LARGE] {
        group.bench_with_input(BenchmarkId::new("sync", count), &count, |b, &count| {
            b.iter(|| black_box(populated(count, EcsConfig::default())).num_entities());
        });

        group.bench_with_input(BenchmarkId::new("async", count), &count, |b, &count| {
            b.iter(|| {
                let mut world = world(EcsConfig::default());
                for _ in 0..count {
                    world.create_entity_async("mover", ComponentsInit::new());
                }
                world.tick();
                black_box(world.num_entities())
            });
        });
    }

    group.finish();
}

fn bench_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("iterate");

    let mut world = populated(LARGE, EcsConfig::default());
    let query = world
        .create_query(NamedQueryDesc::new(
            "integrate",
            QueryDesc::new().rw::<Point3>("pos").ro::<Point3>("vel"),
        ))
        .unwrap();
    group.bench_function("query", |b| {
        b.iter(|| {
            world.perform_query(query, |view, _| {
                let pos = view.rw::<Point3>(0).unwrap();
                let vel = view.ro::<Point3>(0).unwrap();
                for (pos, vel) in pos.iter_mut().zip(vel) {
                    pos[0] += vel[0];
                    pos[1] += vel[1];
                    pos[2] += vel[2];
                }
            })
        });
    });

    let mut world = populated(
        LARGE,
        EcsConfig {
            min_parallel_rows: 1024,
            ..Default::default()
        },
    );
    world
        .register_entity_system(
            EntitySystemDesc::new("integrate")
                .rw::<Point3>("pos")
                .ro::<Point3>("vel")
                .on_stage(stages::UPDATE)
                .quant(4096)
                .run(|payload, view, _| {
                    let dt = payload.stage().map_or(0.0, |info| info.dt);
                    let pos = view.rw::<Point3>(0).unwrap();
                    let vel = view.ro::<Point3>(0).unwrap();
                    for (pos, vel) in pos.iter_mut().zip(vel) {
                        pos[0] += vel[0] * dt;
                        pos[1] += vel[1] * dt;
                        pos[2] += vel[2] * dt;
                    }
                }),
        )
        .unwrap();
    let info = UpdateStageInfo::new(stages::UPDATE, 0.016, 0.0);
    group.bench_function("system", |b| b.iter(|| world.update(info)));
    group.bench_function("system_parallel", |b| {
        b.iter(|| {
            world.set_constrained_mt_mode(true);
            world.update(info);
            world.set_constrained_mt_mode(false);
        })
    });

    group.finish();
}

fn bench_tracking(c: &mut Criterion) {
    let mut world = populated(SMALL, EcsConfig::default());
    world
        .register_entity_system(
            EntitySystemDesc::new("hp_watch")
                .rq("hp")
                .track("hp")
                .run(|_, view, _| {
                    black_box(view.entities());
                }),
        )
        .unwrap();
    let query = world
        .create_query(NamedQueryDesc::new("regen", QueryDesc::new().rw::<f32>("hp")))
        .unwrap();

    c.bench_function("tracked_query_writes", |b| {
        b.iter(|| {
            world.perform_query(query, |view, _| {
                for (row, hp) in view.rw::<f32>(0).unwrap().iter_mut().enumerate() {
                    if row % 8 == 0 {
                        *hp += 1.0;
                    }
                }
            });
            black_box(world.perform_track_changes(false))
        });
    });
}

criterion_group!(benches, bench_creation, bench_iteration, bench_tracking);
criterion_main!(benches);
