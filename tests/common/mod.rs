#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use chunked_ecs::{AddTemplateResult, ComponentDecl, EcsConfig, EcsEvent, TemplateDesc, World};

pub type Point3 = [f32; 3];

pub const ORIGIN: Point3 = [0.0; 3];

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn declarations() -> Vec<ComponentDecl> {
    vec![
        ComponentDecl::of::<Point3>("pos"),
        ComponentDecl::of::<Point3>("vel"),
        ComponentDecl::of::<f32>("hp").tracked(),
        ComponentDecl::of::<String>("label"),
        ComponentDecl::of::<bool>("dead"),
        ComponentDecl::of::<u32>("score").replicated(),
    ]
}

pub fn world() -> World {
    world_with(EcsConfig::default())
}

pub fn world_with(config: EcsConfig) -> World {
    init_logger();
    let mut world = World::with_config(config);
    world
        .register_components(&declarations())
        .expect("component table registers");
    world
}

pub fn add(world: &mut World, desc: TemplateDesc) {
    let name = desc.name.clone();
    let result = world.add_template(desc);
    assert!(matches!(result, AddTemplateResult::Added(_)), "adding `{name}`: {result:?}");
}

/// `Pos`, `mover` (pos, vel), `unit` (pos, hp, label) and `corpse` (pos, dead).
pub fn world_with_templates() -> World {
    let mut world = world();
    add(&mut world, TemplateDesc::new("Pos").component("pos", ORIGIN));
    add(
        &mut world,
        TemplateDesc::new("mover").parent("Pos").component("vel", [1.0f32, 0.0, 0.0]),
    );
    add(
        &mut world,
        TemplateDesc::new("unit")
            .parent("Pos")
            .component("hp", 100.0f32)
            .component("label", String::from("unit")),
    );
    add(&mut world, TemplateDesc::new("corpse").parent("Pos").component("dead", true));
    world
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Damage(pub f32);

impl EcsEvent for Damage {
    const NAME: &'static str = "Damage";
}

/// Shared counter for system callbacks.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}
