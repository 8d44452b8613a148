//! Entity and component lifecycle: creation, two-phase removal, limbo, and
//! end-of-cycle reclamation.

use ntest::timeout;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use weft_core::{
    CheckError, ComponentDef, ComponentEnumDef, Error, QueryDef, QueryFlavor, Result,
    ScheduleRule, SystemCtx, SystemDef, SystemLogic, World, WorldDef, WorldOptions,
};

use super::{value_component, world_with};

/// Doubles the `value` field of every entity carrying its component.
struct DoubleValues {
    type_id: u16,
}

impl SystemLogic for DoubleValues {
    fn prepare(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        self.type_id = ctx.type_id("A")?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        for entity in ctx.entities(0, QueryFlavor::Current)? {
            let mut view = ctx.bind_mut(entity, self.type_id)?;
            let value = view.read().get_f64(0)?;
            view.set_f64(0, value * 2.0)?;
        }
        Ok(())
    }
}

#[test]
#[timeout(60000)]
fn five_thousand_entities_run_one_frame() {
    let defs = vec![
        WorldDef::Component(value_component("A")),
        WorldDef::Component(value_component("B")),
        WorldDef::Component(value_component("C")),
        WorldDef::Component(value_component("D")),
        WorldDef::Component(value_component("E")),
        WorldDef::System(
            SystemDef::new("double_a", DoubleValues { type_id: 0 })
                .reads(["A"])
                .writes(["A"])
                .query(QueryDef::new().with(["A"]).current()),
        ),
    ];
    let mut world = World::create(WorldOptions {
        defs,
        max_entities: 6_000,
        ..Default::default()
    })
    .unwrap();

    world
        .build(|ctx| {
            let types: Vec<u16> = ["A", "B", "C", "D", "E"]
                .iter()
                .map(|n| ctx.type_id(n))
                .collect::<Result<_>>()?;
            for _ in 0..5_000 {
                let entity = ctx.create_entity()?;
                ctx.add_all(entity, &types)?;
            }
            Ok(())
        })
        .unwrap();

    world.execute().unwrap();

    // Default values double to zero.
    let a = world.type_id("A").unwrap();
    let entities = world
        .system_query("double_a", 0, QueryFlavor::Current)
        .unwrap();
    assert_eq!(entities.len(), 5_000);
    let mut ctx = world.context();
    for entity in entities {
        let view = ctx.bind(entity, a).unwrap();
        assert_eq!(view.get_f64(0).unwrap(), 0.0);
    }
    drop(ctx);
    assert_eq!(world.stats().frames, 1);
    world.check_invariants().unwrap();
}

/// Creates two Bs per A, copying the value over.
struct SpawnB {
    a: u16,
    b: u16,
}

impl SystemLogic for SpawnB {
    fn prepare(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        self.a = ctx.type_id("A")?;
        self.b = ctx.type_id("B")?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        for entity in ctx.entities(0, QueryFlavor::Current)? {
            let value = ctx.bind(entity, self.a)?.get_f64(0)?;
            for _ in 0..2 {
                let spawned = ctx.create_entity()?;
                ctx.add_with(spawned, self.b, |view| view.set_f64(0, value))?;
            }
        }
        Ok(())
    }
}

/// Deletes every entity its query matches.
struct KillAll;

impl SystemLogic for KillAll {
    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        for entity in ctx.entities(0, QueryFlavor::Current)? {
            ctx.delete_entity(entity)?;
        }
        Ok(())
    }
}

#[test]
#[timeout(60000)]
fn spawned_entities_die_within_the_frame() {
    let defs = vec![
        WorldDef::Component(value_component("A")),
        WorldDef::Component(value_component("B")),
        WorldDef::System(
            SystemDef::new("spawn_b", SpawnB { a: 0, b: 0 })
                .reads(["A"])
                .creates(["B"])
                .writes(["B"])
                .query(QueryDef::new().with(["A"]).current())
                .schedule(ScheduleRule::Before("kill_b".to_string())),
        ),
        WorldDef::System(
            SystemDef::new("kill_b", KillAll)
                .updates(["B"])
                .query(QueryDef::new().with(["B"]).current()),
        ),
    ];
    let mut world = World::create(WorldOptions {
        defs,
        max_entities: 4_000,
        max_limbo_components: Some(10_000),
        ..Default::default()
    })
    .unwrap();

    world
        .build(|ctx| {
            let a = ctx.type_id("A")?;
            for i in 0..1_000 {
                let entity = ctx.create_entity()?;
                ctx.add_with(entity, a, |view| view.set_f64(0, i as f64))?;
            }
            Ok(())
        })
        .unwrap();

    world.execute().unwrap();

    assert_eq!(world.entity_count(), 1_000);
    let b_query = world.system_query("kill_b", 0, QueryFlavor::Current).unwrap();
    assert!(b_query.is_empty());
    // 2 000 B components (plus their alive tags) passed through limbo.
    assert!(world.stats().max_limbo_components >= 2_000);
    world.check_invariants().unwrap();
}

/// Adds then removes a component repeatedly inside one execute call.
struct Churn {
    target: u16,
    rounds: usize,
}

impl SystemLogic for Churn {
    fn prepare(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        self.target = ctx.type_id("B")?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        for entity in ctx.entities(0, QueryFlavor::Current)? {
            for _ in 0..self.rounds {
                ctx.add(entity, self.target)?;
                ctx.remove(entity, self.target)?;
            }
        }
        Ok(())
    }
}

#[test]
#[timeout(60000)]
fn add_remove_round_trip_leaves_no_deltas() {
    let defs = vec![
        WorldDef::Component(value_component("A")),
        WorldDef::Component(value_component("B")),
        WorldDef::System(
            SystemDef::new("churn", Churn { target: 0, rounds: 5 })
                .reads(["A"])
                .updates(["B"])
                .query(QueryDef::new().with(["A"]).current()),
        ),
        WorldDef::System(
            SystemDef::new("watch_b", super::Passive)
                .reads(["B"])
                .query(QueryDef::new().with(["B"]).current().added().removed())
                .schedule(ScheduleRule::After("churn".to_string())),
        ),
    ];
    let mut world = World::create(WorldOptions {
        defs,
        max_entities: 100,
        max_shape_changes_per_frame: Some(10_000),
        max_limbo_components: Some(1_000),
        ..Default::default()
    })
    .unwrap();

    world
        .build(|ctx| {
            let a = ctx.type_id("A")?;
            for _ in 0..10 {
                let entity = ctx.create_entity()?;
                ctx.add(entity, a)?;
            }
            Ok(())
        })
        .unwrap();

    world.execute().unwrap();
    // All the churn happened within one flush window, so the net shape is
    // unchanged and the watcher saw nothing.
    assert!(world
        .system_query("watch_b", 0, QueryFlavor::Added)
        .unwrap()
        .is_empty());
    assert!(world
        .system_query("watch_b", 0, QueryFlavor::Removed)
        .unwrap()
        .is_empty());

    world.execute().unwrap();
    assert!(world
        .system_query("watch_b", 0, QueryFlavor::Added)
        .unwrap()
        .is_empty());
    assert!(world
        .system_query("watch_b", 0, QueryFlavor::Removed)
        .unwrap()
        .is_empty());
    world.check_invariants().unwrap();
}

/// Removes A from everything, stashing the last value it saw.
struct Reap {
    a: u16,
}

impl SystemLogic for Reap {
    fn prepare(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        self.a = ctx.type_id("A")?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        for entity in ctx.entities(0, QueryFlavor::Current)? {
            ctx.remove(entity, self.a)?;
        }
        Ok(())
    }
}

/// Reads values out of components the reaper already removed.
struct Mourn {
    a: u16,
    salvaged: std::sync::Arc<std::sync::Mutex<Vec<f64>>>,
}

impl SystemLogic for Mourn {
    fn prepare(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        self.a = ctx.type_id("A")?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        for entity in ctx.entities(0, QueryFlavor::Removed)? {
            let view = ctx.bind_recently_deleted(entity, self.a)?;
            self.salvaged.lock().unwrap().push(view.get_f64(0)?);
        }
        Ok(())
    }
}

#[test]
#[timeout(60000)]
fn removed_components_stay_readable_until_cycle_end() {
    let salvaged = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let defs = vec![
        WorldDef::Component(value_component("A")),
        WorldDef::System(
            SystemDef::new("reap", Reap { a: 0 })
                .updates(["A"])
                .query(QueryDef::new().with(["A"]).current())
                .schedule(ScheduleRule::Before("mourn".to_string())),
        ),
        WorldDef::System(
            SystemDef::new(
                "mourn",
                Mourn {
                    a: 0,
                    salvaged: salvaged.clone(),
                },
            )
            .reads(["A"])
            .query(QueryDef::new().with(["A"]).removed()),
        ),
    ];
    let mut world = world_with(defs, 16);

    world
        .build(|ctx| {
            let a = ctx.type_id("A")?;
            for i in 0..3 {
                let entity = ctx.create_entity()?;
                ctx.add_with(entity, a, |view| view.set_f64(0, i as f64 + 1.0))?;
            }
            Ok(())
        })
        .unwrap();

    world.execute().unwrap();

    // The limbo rows were still readable after removal.
    let mut values = salvaged.lock().unwrap().clone();
    values.sort_by(f64::total_cmp);
    assert_eq!(values, vec![1.0, 2.0, 3.0]);

    // After the cycle completed, they are gone for good.
    let entity = world.create_entity().unwrap();
    let a = world.type_id("A").unwrap();
    let mut ctx = world.context();
    assert!(ctx.bind_recently_deleted(entity, a).is_err());
    drop(ctx);
    world.check_invariants().unwrap();
}

#[test]
#[timeout(60000)]
fn enum_members_exclude_each_other() {
    let defs = vec![WorldDef::Enum(ComponentEnumDef::new(
        "Phase",
        vec![
            ComponentDef::new("Solid"),
            ComponentDef::new("Liquid"),
            ComponentDef::new("Gas"),
        ],
    ))];
    let mut world = world_with(defs, 100);
    let solid = world.type_id("Solid").unwrap();
    let liquid = world.type_id("Liquid").unwrap();

    let entity = world.create_entity().unwrap();
    world.add(entity, solid).unwrap();
    assert!(world.has(entity, solid).unwrap());

    // Two members in one call are rejected outright.
    let entity2 = world.create_entity().unwrap();
    let err = world.add_all(entity2, &[solid, liquid]).unwrap_err();
    assert!(matches!(
        err,
        Error::Check(CheckError::EnumConflict { .. })
    ));

    // Adding a sibling displaces the present member.
    world.add(entity, liquid).unwrap();
    assert!(world.has(entity, liquid).unwrap());
    assert!(!world.has(entity, solid).unwrap());

    world.execute().unwrap();
    world.check_invariants().unwrap();
}

#[test]
#[timeout(60000)]
fn misuse_is_reported() {
    let defs = vec![WorldDef::Component(value_component("A"))];
    let mut world = world_with(defs, 8);
    let a = world.type_id("A").unwrap();

    let entity = world.create_entity().unwrap();
    world.add(entity, a).unwrap();
    assert!(matches!(
        world.add(entity, a).unwrap_err(),
        Error::Check(CheckError::DuplicateComponent { .. })
    ));

    world.remove(entity, a).unwrap();
    assert!(matches!(
        world.remove(entity, a).unwrap_err(),
        Error::Check(CheckError::MissingComponent { .. })
    ));

    world.delete_entity(entity).unwrap();
    world.execute().unwrap();
    // The handle went stale at reclamation.
    assert!(matches!(
        world.add(entity, a).unwrap_err(),
        Error::Check(CheckError::StaleEntityHandle { .. })
    ));

    // Exhaust the pool.
    for _ in 0..8 {
        world.create_entity().unwrap();
    }
    assert!(matches!(
        world.create_entity().unwrap_err(),
        Error::Check(CheckError::EntityCapacityExceeded { limit: 8 })
    ));
}

#[test]
#[timeout(60000)]
fn terminating_twice_is_an_error() {
    let mut world = world_with(vec![WorldDef::Component(value_component("A"))], 16);
    world.execute().unwrap();
    world.terminate().unwrap();
    assert!(matches!(
        world.terminate().unwrap_err(),
        Error::Check(CheckError::AlreadyTerminated)
    ));
    assert!(world.execute().is_err());
}

#[test]
#[timeout(60000)]
fn random_lifecycles_keep_invariants() {
    let defs = vec![
        WorldDef::Component(value_component("A")),
        WorldDef::Component(value_component("B").storage(weft_core::StorageKind::Compact)),
        WorldDef::Component(ComponentDef::new("Tag")),
    ];
    let mut world = world_with(defs, 300);
    let types = [
        world.type_id("A").unwrap(),
        world.type_id("B").unwrap(),
        world.type_id("Tag").unwrap(),
    ];

    let mut rng = StdRng::seed_from_u64(42);
    let mut live: Vec<weft_core::Entity> = Vec::new();
    for _ in 0..30 {
        for _ in 0..40 {
            match rng.gen_range(0..4) {
                0 => {
                    if live.len() < 250 {
                        let entity = world.create_entity().unwrap();
                        live.push(entity);
                    }
                }
                1 => {
                    if !live.is_empty() {
                        let entity = live.swap_remove(rng.gen_range(0..live.len()));
                        world.delete_entity(entity).unwrap();
                    }
                }
                2 => {
                    if let Some(&entity) = live.get(rng.gen_range(0..live.len().max(1))) {
                        let ty = types[rng.gen_range(0..types.len())];
                        if !world.has(entity, ty).unwrap() {
                            world.add(entity, ty).unwrap();
                        }
                    }
                }
                _ => {
                    if let Some(&entity) = live.get(rng.gen_range(0..live.len().max(1))) {
                        let ty = types[rng.gen_range(0..types.len())];
                        if world.has(entity, ty).unwrap() {
                            world.remove(entity, ty).unwrap();
                        }
                    }
                }
            }
        }
        world.execute().unwrap();
        world.check_invariants().unwrap();
    }
}
