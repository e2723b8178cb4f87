mod common;

use chunked_ecs::{
    ComponentsInit, ConfigError, EcsConfig, EntityId, EntityState, NamedQueryDesc, QueryDesc, TemplateDesc, World,
};
use common::{Counter, Point3, ORIGIN};

#[test]
fn destroyed_ids_stop_resolving() {
    let mut world = common::world_with(EcsConfig {
        min_free_indices: 0,
        ..Default::default()
    });
    common::add(&mut world, TemplateDesc::new("Pos").component("pos", ORIGIN));

    let first = world.create_entity_sync("Pos", ComponentsInit::new());
    assert!(world.does_entity_exist(first));

    assert!(world.destroy_entity_async(first));
    assert!(!world.destroy_entity_async(first));
    assert!(world.does_entity_exist(first));
    assert_eq!(world.entity_state(first), EntityState::Destroying);

    assert!(world.tick());
    assert!(!world.does_entity_exist(first));
    assert_eq!(world.entity_state(first), EntityState::Free);

    let second = world.create_entity_sync("Pos", ComponentsInit::new());
    assert_eq!(second.index(), first.index());
    assert_ne!(second.generation(), first.generation());
    assert!(!world.does_entity_exist(first));
    assert!(world.get::<Point3>(first, "pos").is_none());
}

#[test]
fn position_scenario() {
    let mut world = common::world_with_templates();

    let eid = world.create_entity_sync("Pos", ComponentsInit::new());
    assert!(world.set(eid, "pos", [1.0f32, 0.0, 0.0]));

    let query = world
        .create_query(NamedQueryDesc::new("positions", QueryDesc::new().ro::<Point3>("pos")))
        .unwrap();
    let mut seen = Vec::new();
    assert!(world.perform_query(query, |view, _| {
        let positions = view.ro::<Point3>(0).unwrap();
        seen.extend(view.entities().iter().copied().zip(positions.iter().copied()));
    }));
    assert_eq!(seen, vec![(eid, [1.0, 0.0, 0.0])]);

    world.destroy_entity_async(eid);
    world.tick();
    assert!(!world.does_entity_exist(eid));
    assert_eq!(world.query_size(query), 0);
}

#[test]
fn async_creation_spawns_on_tick() {
    let mut world = common::world_with_templates();

    let eid = world.create_entity_async("unit", ComponentsInit::new().with("hp", 5.0f32));
    assert!(world.does_entity_exist(eid));
    assert!(world.is_loading_entity(eid));
    assert_eq!(world.get_entity_template_name(eid).as_deref(), Some("unit"));
    assert!(world.get::<f32>(eid, "hp").is_none());

    world.tick();
    assert!(!world.is_loading_entity(eid));
    assert_eq!(world.entity_state(eid), EntityState::Alive);
    assert_eq!(world.get::<f32>(eid, "hp"), Some(&5.0));
    assert_eq!(world.get::<String>(eid, "label").map(String::as_str), Some("unit"));
    assert_eq!(world.num_entities(), 1);
}

#[test]
fn unknown_templates_free_the_index() {
    let mut world = common::world_with_templates();

    let eid = world.create_entity_async("missing", ComponentsInit::new());
    assert!(world.does_entity_exist(eid));
    world.tick();

    assert!(!world.does_entity_exist(eid));
    assert_eq!(world.error_counters().snapshot().template_failures, 1);
    assert_eq!(world.create_entity_sync("missing", ComponentsInit::new()), EntityId::INVALID);
    assert_eq!(world.error_counters().snapshot().template_failures, 2);
}

#[test]
fn destroying_a_loading_entity_skips_its_creation() {
    let mut world = common::world_with_templates();

    let eid = world.create_entity_async("unit", ComponentsInit::new());
    assert!(world.destroy_entity_async(eid));
    world.tick();

    assert!(!world.does_entity_exist(eid));
    assert_eq!(world.num_entities(), 0);
}

#[test]
fn recreate_keeps_instance_values() {
    let mut world = common::world_with_templates();
    common::add(
        &mut world,
        TemplateDesc::new("veteran")
            .parent("unit")
            .component("hp", 150.0f32)
            .component("label", String::from("veteran"))
            .component("vel", [0.0f32, 0.0, 1.0]),
    );

    let wounded = world.create_entity_sync("unit", ComponentsInit::new());
    let fresh = world.create_entity_sync("unit", ComponentsInit::new());
    assert!(world.set(wounded, "hp", 42.0f32));

    assert_eq!(world.recreate_entity_async(wounded, "veteran", ComponentsInit::new()), wounded);
    world.recreate_entity_async(fresh, "veteran", ComponentsInit::new().with("label", String::from("rookie")));
    world.tick();

    assert_eq!(world.get::<f32>(wounded, "hp"), Some(&42.0));
    assert_eq!(world.get::<f32>(fresh, "hp"), Some(&150.0));
    assert_eq!(world.get::<String>(wounded, "label").map(String::as_str), Some("veteran"));
    assert_eq!(world.get::<String>(fresh, "label").map(String::as_str), Some("rookie"));
    assert_eq!(world.get::<Point3>(fresh, "vel"), Some(&[0.0, 0.0, 1.0]));
    assert_eq!(world.get_entity_template_name(wounded).as_deref(), Some("veteran"));
    assert!(world.is_entity_component_same_as_template(fresh, "hp"));
    assert!(!world.is_entity_component_same_as_template(wounded, "hp"));
}

#[test]
fn recreate_drops_components_missing_from_the_new_template() {
    let mut world = common::world_with_templates();

    let eid = world.create_entity_sync("mover", ComponentsInit::new());
    assert!(world.set(eid, "pos", [3.0f32, 2.0, 1.0]));
    world.recreate_entity_async(eid, "corpse", ComponentsInit::new());
    world.tick();

    assert!(!world.has(eid, "vel"));
    assert!(world.has(eid, "dead"));
    assert_eq!(world.get::<Point3>(eid, "pos"), Some(&[3.0, 2.0, 1.0]));
    assert_eq!(world.entity_component_count(eid), 2);
}

#[test]
fn singletons() {
    let mut world = common::world_with_templates();
    common::add(&mut world, TemplateDesc::new("game_state").component("score", 0u32).singleton());

    assert!(!world.get_singleton_entity("game_state").is_valid());
    let state = world.get_or_create_singleton_entity("game_state");
    assert!(state.is_valid());
    assert_eq!(world.get_or_create_singleton_entity("game_state"), state);
    assert_eq!(world.get_singleton_entity("game_state"), state);

    world.destroy_entity_async(state);
    world.tick();
    assert!(!world.get_singleton_entity("game_state").is_valid());
}

#[test]
fn defrag_drops_empty_archetypes() {
    let mut world = common::world_with_templates();

    let mover = world.create_entity_sync("mover", ComponentsInit::new());
    let corpse = world.create_entity_sync("corpse", ComponentsInit::new());
    let query = world
        .create_query(NamedQueryDesc::new("velocities", QueryDesc::new().ro::<Point3>("vel")))
        .unwrap();
    assert_eq!(world.query_size(query), 1);

    world.destroy_entity_async(corpse);
    world.tick();
    assert_eq!(world.archetypes().len(), 2);

    assert!(world.defrag_archetypes());
    assert_eq!(world.archetypes().len(), 1);
    assert_eq!(world.get::<Point3>(mover, "vel"), Some(&[1.0, 0.0, 0.0]));
    assert_eq!(world.query_size(query), 1);

    let again = world.create_entity_sync("corpse", ComponentsInit::new());
    assert_eq!(world.get::<bool>(again, "dead"), Some(&true));
}

#[test]
fn clear_forgets_everything() {
    let mut world = common::world_with_templates();

    let eids: Vec<EntityId> = (0..10)
        .map(|_| world.create_entity_sync("unit", ComponentsInit::new()))
        .collect();
    world.create_entity_async("mover", ComponentsInit::new());
    world.clear();

    assert_eq!(world.num_entities(), 0);
    assert!(eids.iter().all(|&eid| !world.does_entity_exist(eid)));
    world.tick();
    assert_eq!(world.num_entities(), 0);

    let eid = world.create_entity_sync("unit", ComponentsInit::new());
    assert_eq!(world.get::<f32>(eid, "hp"), Some(&100.0));
}

#[test]
fn replicated_writes_call_the_hook() {
    let mut world = common::world();
    common::add(&mut world, TemplateDesc::new("scorer").component("score", 0u32));
    let hits = Counter::default();
    let hook = hits.clone();
    world.set_replication_hook(move |_, _| hook.hit());

    let eid = world.create_entity_sync("scorer", ComponentsInit::new());
    assert!(world.set(eid, "score", 5u32));
    assert!(world.set(eid, "score", 5u32));
    assert_eq!(hits.get(), 1);

    *world.get_rw::<u32>(eid, "score") += 1;
    assert_eq!(hits.get(), 2);
    assert_eq!(world.get::<u32>(eid, "score"), Some(&6));
}

#[test]
fn many_entities_span_chunks() {
    let mut world = common::world_with(EcsConfig {
        chunk_byte_budget: 1024,
        ..Default::default()
    });
    common::add(&mut world, TemplateDesc::new("Pos").component("pos", ORIGIN));

    let eids: Vec<EntityId> = (0..500)
        .map(|index| {
            world.create_entity_sync("Pos", ComponentsInit::new().with("pos", [index as f32, 0.0, 0.0]))
        })
        .collect();
    for &eid in eids.iter().step_by(3) {
        world.destroy_entity_async(eid);
    }
    world.tick();

    for (index, &eid) in eids.iter().enumerate() {
        if index % 3 == 0 {
            assert!(!world.does_entity_exist(eid));
        } else {
            assert_eq!(world.get::<Point3>(eid, "pos"), Some(&[index as f32, 0.0, 0.0]));
        }
    }
    assert!(world.archetypes().iter().next().unwrap().chunk_count() > 1);
}

#[test]
fn invalid_chunk_capacity_bounds() {
    let inverted = EcsConfig {
        min_chunk_capacity: 100,
        max_chunk_capacity: 10,
        ..Default::default()
    };
    let zero = EcsConfig {
        chunk_byte_budget: 4,
        min_chunk_capacity: 0,
        ..Default::default()
    };

    for config in [inverted, zero] {
        assert!(matches!(
            World::try_with_config(config.clone()),
            Err(ConfigError::Invalid(_))
        ));

        let mut world = common::world_with(config);
        common::add(&mut world, TemplateDesc::new("Pos").component("pos", ORIGIN));
        let eids: Vec<EntityId> = (0..100)
            .map(|index| {
                world.create_entity_sync("Pos", ComponentsInit::new().with("pos", [index as f32, 0.0, 0.0]))
            })
            .collect();

        let archetype = world.archetypes().iter().next().unwrap();
        assert!(archetype.capacity() >= 1);
        assert_eq!(archetype.len(), 100);
        for (index, &eid) in eids.iter().enumerate() {
            assert_eq!(world.get::<Point3>(eid, "pos"), Some(&[index as f32, 0.0, 0.0]));
        }
    }

    assert!(World::try_with_config(EcsConfig::default()).is_ok());
}

#[test]
fn failed_writes_get_a_fresh_default() {
    let mut world = common::world_with_templates();
    let dead = world.create_entity_sync("unit", ComponentsInit::new());
    world.destroy_entity_async(dead);
    world.tick();

    *world.get_rw::<f32>(dead, "hp") = 42.0;
    assert_eq!(*world.get_rw::<f32>(dead, "hp"), 0.0);

    world.get_rw::<String>(dead, "label").push_str("stale");
    assert!(world.get_rw::<String>(dead, "label").is_empty());
    assert_eq!(world.error_counters().snapshot().dead_entity_writes, 4);
}
