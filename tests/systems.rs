mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use chunked_ecs::{
    stages, AddTemplateResult, ComponentsInit, EcsConfig, EntityId, EntitySystemDesc, EventComponentChanged,
    EventComponentsAppear, EventComponentsDisappear, EventEntityCreated, EventEntityDestroyed, EventEntityRecreated,
    NamedQueryDesc, QueryDesc, TemplateDesc, UpdateStageInfo, World,
};
use common::{Counter, Damage, Point3};
use parking_lot::Mutex;

type Log<T> = Arc<Mutex<Vec<T>>>;

fn update(world: &mut World) {
    world.update(UpdateStageInfo::new(stages::UPDATE, 0.5, 0.0));
}

/// Registers a system without components that logs its name on the update stage.
fn named_system(world: &mut World, log: &Log<&'static str>, name: &'static str, priority: i32, tag: Option<&str>) {
    let log = log.clone();
    let mut desc = EntitySystemDesc::new(name)
        .on_stage(stages::UPDATE)
        .priority(priority)
        .run(move |_, _, _| log.lock().push(name));
    if let Some(tag) = tag {
        desc = desc.tag(tag);
    }
    world.register_entity_system(desc).unwrap();
}

#[test]
fn systems_run_by_explicit_order_then_priority() {
    let mut world = common::world();
    let log: Log<&str> = Log::default();
    named_system(&mut world, &log, "a", 0, None);
    named_system(&mut world, &log, "b", -1, None);
    named_system(&mut world, &log, "c", 0, None);

    update(&mut world);
    assert_eq!(*log.lock(), ["b", "a", "c"]);

    log.lock().clear();
    world.set_es_order(&["c"]);
    update(&mut world);
    assert_eq!(*log.lock(), ["c", "b", "a"]);

    log.lock().clear();
    assert!(world.enable_es("b", false));
    assert!(!world.enable_es("nope", false));
    update(&mut world);
    assert_eq!(*log.lock(), ["c", "a"]);

    log.lock().clear();
    world.update(UpdateStageInfo::new(stages::RENDER, 0.0, 0.0));
    assert!(log.lock().is_empty());
}

#[test]
fn stages_past_the_mask_run_nothing() {
    let mut world = common::world();
    let log: Log<&str> = Log::default();
    named_system(&mut world, &log, "update", 0, None);
    let late = log.clone();
    world
        .register_entity_system(
            EntitySystemDesc::new("far")
                .on_stage(stages::COUNT + 8)
                .run(move |_, _, _| late.lock().push("far")),
        )
        .unwrap();

    for stage in [stages::COUNT, stages::COUNT + 8, u32::MAX] {
        let info = UpdateStageInfo::new(stage, 0.0, 0.0);
        assert_eq!(info.stage(), stage);
        world.update(info);
    }
    assert!(log.lock().is_empty());

    update(&mut world);
    assert_eq!(*log.lock(), ["update"]);
}

#[test]
fn tags_gate_tagged_systems() {
    let mut world = common::world();
    let log: Log<&str> = Log::default();
    named_system(&mut world, &log, "always", 0, None);
    named_system(&mut world, &log, "debug_draw", 1, Some("debug"));

    world.set_es_tags(Some(&["render"]));
    update(&mut world);
    assert_eq!(*log.lock(), ["always"]);

    log.lock().clear();
    world.set_es_tags(Some(&["debug"]));
    update(&mut world);
    assert_eq!(*log.lock(), ["always", "debug_draw"]);

    log.lock().clear();
    world.set_es_tags(None);
    update(&mut world);
    assert_eq!(*log.lock(), ["always", "debug_draw"]);
}

#[test]
fn duplicate_and_incomplete_systems_are_rejected() {
    let mut world = common::world();
    named_system(&mut world, &Log::default(), "once", 0, None);

    assert!(world
        .register_entity_system(EntitySystemDesc::new("once").run(|_, _, _| {}))
        .is_err());
    assert!(world
        .register_entity_system(EntitySystemDesc::new("no_function").on_stage(stages::UPDATE))
        .is_err());
}

#[test]
fn stage_systems_visit_matching_entities() {
    let mut world = common::world_with_templates();
    world
        .register_entity_system(
            EntitySystemDesc::new("integrate")
                .rw::<Point3>("pos")
                .ro::<Point3>("vel")
                .on_stage(stages::UPDATE)
                .run(|payload, view, _| {
                    let dt = payload.stage().map_or(0.0, |info| info.dt);
                    let pos = view.rw::<Point3>(0).unwrap();
                    let vel = view.ro::<Point3>(0).unwrap();
                    for (pos, vel) in pos.iter_mut().zip(vel) {
                        for axis in 0..3 {
                            pos[axis] += vel[axis] * dt;
                        }
                    }
                }),
        )
        .unwrap();

    let mover = world.create_entity_sync("mover", ComponentsInit::new());
    let unit = world.create_entity_sync("unit", ComponentsInit::new());

    update(&mut world);
    update(&mut world);
    assert_eq!(world.get::<Point3>(mover, "pos"), Some(&[1.0, 0.0, 0.0]));
    assert_eq!(world.get::<Point3>(unit, "pos"), Some(&[0.0, 0.0, 0.0]));
}

/// Registers `on_damage`, which subtracts the damage from `hp` and logs who got hit.
fn damage_system(world: &mut World) -> Log<(EntityId, f32)> {
    let log: Log<(EntityId, f32)> = Log::default();
    let hits = log.clone();
    world
        .register_entity_system(
            EntitySystemDesc::new("on_damage")
                .rw::<f32>("hp")
                .on_event::<Damage>()
                .run(move |payload, view, _| {
                    let Some(Damage(amount)) = payload.event().and_then(|event| event.get::<Damage>()).copied()
                    else {
                        return;
                    };
                    let hp = view.rw::<f32>(0).unwrap();
                    for (eid, hp) in view.entities().iter().zip(hp.iter_mut()) {
                        *hp -= amount;
                        hits.lock().push((*eid, amount));
                    }
                }),
        )
        .unwrap();
    log
}

#[test]
fn entity_events_are_delivered_in_order_on_tick() {
    let mut world = common::world_with_templates();
    let log = damage_system(&mut world);
    let a = world.create_entity_sync("unit", ComponentsInit::new());
    let b = world.create_entity_sync("unit", ComponentsInit::new());

    world.send_event(a, Damage(10.0));
    world.send_event(b, Damage(5.0));
    world.send_event(a, Damage(1.0));
    assert!(log.lock().is_empty());

    world.tick();
    assert_eq!(*log.lock(), [(a, 10.0), (b, 5.0), (a, 1.0)]);
    assert_eq!(world.get::<f32>(a, "hp"), Some(&89.0));
    assert_eq!(world.get::<f32>(b, "hp"), Some(&95.0));
}

#[test]
fn events_to_entities_without_a_row_are_dropped() {
    let mut world = common::world_with_templates();
    let log = damage_system(&mut world);
    let unit = world.create_entity_sync("unit", ComponentsInit::new());
    let mover = world.create_entity_sync("mover", ComponentsInit::new());

    world.destroy_entity_async(unit);
    world.send_event(unit, Damage(1.0));
    world.send_event(mover, Damage(1.0));
    world.tick();

    assert!(log.lock().is_empty());
}

#[test]
fn immediate_events_skip_the_queue() {
    let mut world = common::world_with_templates();
    let log = damage_system(&mut world);
    let unit = world.create_entity_sync("unit", ComponentsInit::new());

    world.send_event_immediate(unit, Damage(3.0));
    assert_eq!(log.lock().len(), 1);

    world.set_constrained_mt_mode(true);
    world.send_event_immediate(unit, Damage(3.0));
    assert_eq!(log.lock().len(), 1);
    world.set_constrained_mt_mode(false);

    world.tick();
    assert_eq!(log.lock().len(), 2);
    assert_eq!(world.get::<f32>(unit, "hp"), Some(&94.0));
}

#[test]
fn broadcasts_reach_every_matching_entity_and_global_systems() {
    let mut world = common::world_with_templates();
    let log = damage_system(&mut world);
    let heard = Counter::default();
    let hits = heard.clone();
    world
        .register_entity_system(
            EntitySystemDesc::new("listener")
                .on_event::<Damage>()
                .run(move |_, view, _| {
                    assert!(view.is_empty());
                    hits.hit();
                }),
        )
        .unwrap();

    let units = [
        world.create_entity_sync("unit", ComponentsInit::new()),
        world.create_entity_sync("unit", ComponentsInit::new()),
    ];
    world.create_entity_sync("mover", ComponentsInit::new());

    world.broadcast_event_immediate(Damage(2.0));
    assert_eq!(heard.get(), 1);
    assert_eq!(log.lock().len(), 2);

    world.broadcast_event(Damage(2.0));
    assert_eq!(heard.get(), 1);
    world.tick();
    assert_eq!(heard.get(), 2);
    for unit in units {
        assert_eq!(world.get::<f32>(unit, "hp"), Some(&96.0));
    }
}

#[test]
fn tracked_components_notify_once_per_flush() {
    let mut world = common::world_with_templates();
    let changed: Log<EntityId> = Log::default();
    let log = changed.clone();
    world
        .register_entity_system(
            EntitySystemDesc::new("hp_watch")
                .rq("hp")
                .track("hp")
                .run(move |payload, view, _| {
                    assert!(payload.event().is_some_and(|event| event.is::<EventComponentChanged>()));
                    log.lock().extend_from_slice(view.entities());
                }),
        )
        .unwrap();

    let first = world.create_entity_sync("unit", ComponentsInit::new());
    let second = world.create_entity_sync("unit", ComponentsInit::new());
    world.tick();
    assert!(changed.lock().is_empty());

    for hp in 1..=5 {
        world.set(first, "hp", hp as f32);
    }
    world.tick();
    assert_eq!(*changed.lock(), [first]);

    changed.lock().clear();
    world.set(first, "hp", 5.0f32);
    world.tick();
    assert!(changed.lock().is_empty());

    let query = world
        .create_query(NamedQueryDesc::new("hurt", QueryDesc::new().rw::<f32>("hp")))
        .unwrap();
    world.perform_query(query, |view, _| {
        let hp = view.rw::<f32>(0).unwrap();
        for (eid, hp) in view.entities().iter().zip(hp.iter_mut()) {
            if *eid == second {
                *hp = 1.0;
            }
        }
    });
    world.tick();
    assert_eq!(*changed.lock(), [second]);

    changed.lock().clear();
    world.perform_query(query, |_, _| {});
    world.tick();
    assert!(changed.lock().is_empty());
}

#[test]
fn tag_filter_changes_keep_the_tracking_baseline() {
    let mut world = common::world_with_templates();
    let changed: Log<EntityId> = Log::default();
    let log = changed.clone();
    world
        .register_entity_system(
            EntitySystemDesc::new("hp_watch")
                .rq("hp")
                .track("hp")
                .run(move |_, view, _| log.lock().extend_from_slice(view.entities())),
        )
        .unwrap();

    world.create_entity_sync("unit", ComponentsInit::new());
    world.tick();
    let query = world
        .create_query(NamedQueryDesc::new("hp", QueryDesc::new().rw::<f32>("hp")))
        .unwrap();

    // The late entity is not in the column snapshot, so the flush compares it to the template.
    world.perform_query(query, |_, _| {});
    let late = world.create_entity_sync("unit", ComponentsInit::new());
    world.set_template_filter_tags(Some(vec![String::from("dev")]));
    world.tick();
    assert!(changed.lock().is_empty());

    world.perform_query(query, |_, _| {});
    world.set(late, "hp", 3.0f32);
    world.tick();
    assert_eq!(*changed.lock(), [late]);
}

#[test]
fn lifecycle_events_follow_the_entity() {
    let mut world = common::world_with_templates();
    let seen: Log<&'static str> = Log::default();
    let log = seen.clone();
    world
        .register_entity_system(
            EntitySystemDesc::new("lifecycle")
                .ro::<Point3>("pos")
                .on_event::<EventEntityCreated>()
                .on_event::<EventEntityRecreated>()
                .on_event::<EventEntityDestroyed>()
                .run(move |payload, view, _| {
                    assert_eq!(view.len(), 1);
                    if let Some(event) = payload.event() {
                        log.lock().push(event.name());
                    }
                }),
        )
        .unwrap();

    let eid = world.create_entity_sync("mover", ComponentsInit::new());
    world.recreate_entity_async(eid, "corpse", ComponentsInit::new());
    world.tick();
    world.destroy_entity_async(eid);
    world.tick();

    assert_eq!(
        *seen.lock(),
        ["EventEntityCreated", "EventEntityRecreated", "EventEntityDestroyed"]
    );
}

#[test]
fn recreation_reports_appearing_and_disappearing_components() {
    let mut world = common::world_with_templates();
    let appeared = Counter::default();
    let disappeared = Counter::default();
    let (up, down) = (appeared.clone(), disappeared.clone());
    world
        .register_entity_system(
            EntitySystemDesc::new("velocity_watch")
                .ro::<Point3>("vel")
                .on_event::<EventComponentsAppear>()
                .on_event::<EventComponentsDisappear>()
                .run(move |payload, view, _| {
                    // The departing row still holds its velocity.
                    assert_eq!(view.ro::<Point3>(0).map(|vel| vel.len()), Some(1));
                    match payload.event() {
                        Some(event) if event.is::<EventComponentsAppear>() => up.hit(),
                        _ => down.hit(),
                    }
                }),
        )
        .unwrap();

    let eid = world.create_entity_sync("mover", ComponentsInit::new());
    assert_eq!((appeared.get(), disappeared.get()), (0, 0));

    world.recreate_entity_async(eid, "corpse", ComponentsInit::new());
    world.tick();
    assert_eq!((appeared.get(), disappeared.get()), (0, 1));

    world.recreate_entity_async(eid, "mover", ComponentsInit::new());
    world.tick();
    assert_eq!((appeared.get(), disappeared.get()), (1, 1));
}

#[test]
fn constrained_mode_refuses_structural_changes() {
    let mut world = common::world_with_templates();

    world.set_constrained_mt_mode(true);
    world.set_constrained_mt_mode(true);
    world.set_constrained_mt_mode(false);
    assert!(world.is_constrained_mt_mode());

    assert!(!world.tick());
    assert_eq!(world.create_entity_sync("unit", ComponentsInit::new()), EntityId::INVALID);
    assert_eq!(world.add_template(TemplateDesc::new("late")), AddTemplateResult::Refused);
    assert!(world
        .register_entity_system(EntitySystemDesc::new("late").run(|_, _, _| {}))
        .is_err());

    let queued = world.create_entity_async("unit", ComponentsInit::new());
    assert!(world.is_loading_entity(queued));
    assert_eq!(world.error_counters().snapshot().contract_violations, 4);

    world.set_constrained_mt_mode(false);
    assert!(!world.is_constrained_mt_mode());
    world.set_constrained_mt_mode(false);
    assert_eq!(world.error_counters().snapshot().contract_violations, 5);

    assert!(world.tick());
    assert!(!world.is_loading_entity(queued));
    assert_eq!(world.get::<f32>(queued, "hp"), Some(&100.0));
}

#[test]
fn quantized_systems_split_work_in_constrained_mode() {
    let mut world = common::world_with(EcsConfig {
        worker_threads: Some(4),
        min_parallel_rows: 16,
        ..Default::default()
    });
    common::add(&mut world, TemplateDesc::new("mover").component("vel", [0.0f32; 3]));
    let jobs = Counter::default();
    let rows = Arc::new(AtomicUsize::new(0));
    let (job_hits, row_hits) = (jobs.clone(), rows.clone());
    world
        .register_entity_system(
            EntitySystemDesc::new("accelerate")
                .rw::<Point3>("vel")
                .on_stage(stages::UPDATE)
                .quant(8)
                .run(move |_, view, _| {
                    for vel in view.rw::<Point3>(0).unwrap() {
                        vel[1] += 1.0;
                    }
                    row_hits.fetch_add(view.len(), Ordering::Relaxed);
                    job_hits.hit();
                }),
        )
        .unwrap();

    let eids: Vec<EntityId> = (0..200)
        .map(|_| world.create_entity_sync("mover", ComponentsInit::new()))
        .collect();

    world.set_constrained_mt_mode(true);
    update(&mut world);
    world.set_constrained_mt_mode(false);
    assert!(jobs.get() >= 25);
    assert_eq!(rows.load(Ordering::Relaxed), 200);

    update(&mut world);
    assert_eq!(rows.load(Ordering::Relaxed), 400);
    assert!(eids
        .iter()
        .all(|&eid| world.get::<Point3>(eid, "vel") == Some(&[0.0, 2.0, 0.0])));
}

#[test]
fn callbacks_queue_work_for_later_passes() {
    let mut world = common::world();
    common::add(&mut world, TemplateDesc::new("spawner").component("score", 0u32));
    let spawned = Arc::new(AtomicUsize::new(0));
    let count = spawned.clone();
    world
        .register_entity_system(
            EntitySystemDesc::new("spawn_chain")
                .rq("score")
                .on_event::<EventEntityCreated>()
                .run(move |_, _, ctx| {
                    if count.fetch_add(1, Ordering::Relaxed) < 3 {
                        ctx.create_entity_async("spawner", ComponentsInit::new());
                    }
                }),
        )
        .unwrap();
    let spawners = world
        .create_query(NamedQueryDesc::new("spawners", QueryDesc::new().rq("score")))
        .unwrap();

    world.create_entity_sync("spawner", ComponentsInit::new());
    assert_eq!(world.query_size(spawners), 1);

    world.tick();
    assert_eq!(world.query_size(spawners), 2);

    world.tick_with(true);
    assert_eq!(world.query_size(spawners), 4);
    assert_eq!(spawned.load(Ordering::Relaxed), 4);
}
