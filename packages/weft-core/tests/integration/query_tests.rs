//! Query matching and reactive delta behaviour.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use ntest::timeout;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use weft_core::{
    CheckError, Error, QueryDef, QueryFlavor, Result, ScheduleRule, SystemCtx,
    SystemDef, SystemLogic, World, WorldDef, WorldOptions,
};

use super::{observer, value_component, world_with, FlavorCounter};

/// Adds B to every A-without-B entity.
struct AddB {
    b: u16,
}

impl SystemLogic for AddB {
    fn prepare(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        self.b = ctx.type_id("B")?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        for entity in ctx.entities(0, QueryFlavor::Current)? {
            ctx.add(entity, self.b)?;
        }
        Ok(())
    }
}

/// Removes B from every entity carrying it.
struct RemoveB {
    b: u16,
}

impl SystemLogic for RemoveB {
    fn prepare(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        self.b = ctx.type_id("B")?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        for entity in ctx.entities(0, QueryFlavor::Current)? {
            ctx.remove(entity, self.b)?;
        }
        Ok(())
    }
}

#[test]
#[timeout(60000)]
fn add_remove_ping_pong_reports_full_deltas() {
    let defs = vec![
        WorldDef::Component(value_component("A")),
        WorldDef::Component(value_component("B")),
        WorldDef::System(
            SystemDef::new("add_b", AddB { b: 0 })
                .reads(["A"])
                .updates(["B"])
                .query(QueryDef::new().with(["A"]).without(["B"]).current())
                .schedule(ScheduleRule::Before("remove_b".to_string())),
        ),
        WorldDef::System(
            SystemDef::new("remove_b", RemoveB { b: 0 })
                .updates(["B"])
                .query(QueryDef::new().with(["B"]).current().added().removed()),
        ),
    ];
    let mut world = World::create(WorldOptions {
        defs,
        max_entities: 2_000,
        max_limbo_components: Some(4_000),
        ..Default::default()
    })
    .unwrap();

    world
        .build(|ctx| {
            let a = ctx.type_id("A")?;
            for _ in 0..1_000 {
                let entity = ctx.create_entity()?;
                ctx.add(entity, a)?;
            }
            Ok(())
        })
        .unwrap();

    for _ in 0..4 {
        world.execute().unwrap();
        // At frame end no entity carries B, yet the frame's deltas show
        // the full add and remove waves.
        assert!(world
            .system_query("remove_b", 0, QueryFlavor::Current)
            .unwrap()
            .is_empty());
        assert_eq!(
            world
                .system_query("remove_b", 0, QueryFlavor::Added)
                .unwrap()
                .len(),
            1_000
        );
        assert_eq!(
            world
                .system_query("remove_b", 0, QueryFlavor::Removed)
                .unwrap()
                .len(),
            1_000
        );
        world.check_invariants().unwrap();
    }
}

/// Writes A = 2 on every matched entity while the switch is on.
struct WriteA {
    a: u16,
    enabled: Arc<AtomicBool>,
}

impl SystemLogic for WriteA {
    fn prepare(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        self.a = ctx.type_id("A")?;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(());
        }
        for entity in ctx.entities(0, QueryFlavor::Current)? {
            let mut view = ctx.bind_mut(entity, self.a)?;
            view.set_f64(0, 2.0)?;
        }
        Ok(())
    }
}

#[test]
#[timeout(60000)]
fn changed_fires_once_per_written_frame() {
    let enabled = Arc::new(AtomicBool::new(false));
    let seen = Arc::new(AtomicU32::new(u32::MAX));
    let defs = vec![
        WorldDef::Component(value_component("A").track_writes()),
        WorldDef::System(
            SystemDef::new(
                "writer",
                WriteA {
                    a: 0,
                    enabled: enabled.clone(),
                },
            )
            .reads(["A"])
            .writes(["A"])
            .query(QueryDef::new().with(["A"]).current())
            .schedule(ScheduleRule::Before("reader".to_string())),
        ),
        WorldDef::System(
            SystemDef::new(
                "reader",
                FlavorCounter {
                    flavor: QueryFlavor::Changed,
                    seen: seen.clone(),
                },
            )
            .reads(["A"])
            .query(QueryDef::new().with(["A"]).track(["A"]).changed()),
        ),
    ];
    let mut world = world_with(defs, 100);

    world
        .build(|ctx| {
            let a = ctx.type_id("A")?;
            let entity = ctx.create_entity()?;
            ctx.add_with(entity, a, |view| view.set_f64(0, 1.0))?;
            Ok(())
        })
        .unwrap();

    // Initial values are not writes.
    world.execute().unwrap();
    assert!(world
        .system_query("reader", 0, QueryFlavor::Changed)
        .unwrap()
        .is_empty());

    enabled.store(true, Ordering::Release);
    world.execute().unwrap();
    assert_eq!(
        world
            .system_query("reader", 0, QueryFlavor::Changed)
            .unwrap()
            .len(),
        1
    );

    enabled.store(false, Ordering::Release);
    world.execute().unwrap();
    assert!(world
        .system_query("reader", 0, QueryFlavor::Changed)
        .unwrap()
        .is_empty());
    // The reader itself saw the change the frame it happened.
    assert_eq!(seen.load(Ordering::Acquire), 0);
}

#[test]
#[timeout(60000)]
fn composite_lists_dedup_within_a_frame() {
    let defs = vec![
        WorldDef::Component(value_component("A").track_writes()),
        WorldDef::Component(value_component("B")),
        WorldDef::System(observer(
            "watch",
            QueryDef::new()
                .with(["A"])
                .track(["A"])
                .current()
                .added_or_changed(),
            &["A"],
        )),
    ];
    let mut world = world_with(defs, 100);
    let a = world.type_id("A").unwrap();

    // The entity both starts matching and gets written between frames.
    let entity = world.create_entity().unwrap();
    world.add(entity, a).unwrap();
    world.flush().unwrap();
    {
        let mut ctx = world.context();
        let mut view = ctx.bind_mut(entity, a).unwrap();
        view.set_f64(0, 5.0).unwrap();
    }
    world.execute().unwrap();

    let list = world
        .system_query("watch", 0, QueryFlavor::AddedOrChanged)
        .unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0], entity);
}

#[test]
fn clauses_compose() -> anyhow::Result<()> {
    let defs = vec![
        WorldDef::Component(value_component("A")),
        WorldDef::Component(value_component("B")),
        WorldDef::Component(value_component("C")),
        WorldDef::Component(value_component("D")),
        WorldDef::System(observer(
            "watch",
            QueryDef::new()
                .with(["A"])
                .without(["B"])
                .with_any(["C", "D"])
                .current(),
            &["A", "C", "D"],
        )),
    ];
    let mut world = world_with(defs, 100);
    let (a, b, c, d) = (
        world.type_id("A")?,
        world.type_id("B")?,
        world.type_id("C")?,
        world.type_id("D")?,
    );

    let matching_c = world.create_entity()?;
    world.add_all(matching_c, &[a, c])?;
    let matching_d = world.create_entity()?;
    world.add_all(matching_d, &[a, d])?;
    let excluded = world.create_entity()?;
    world.add_all(excluded, &[a, b, c])?;
    let no_any = world.create_entity()?;
    world.add(no_any, a)?;

    world.execute()?;
    let current: HashSet<_> = world
        .system_query("watch", 0, QueryFlavor::Current)?
        .into_iter()
        .collect();
    assert_eq!(current, HashSet::from([matching_c, matching_d]));
    Ok(())
}

#[test]
#[timeout(60000)]
fn unrequested_flavors_are_refused() {
    let defs = vec![
        WorldDef::Component(value_component("A")),
        WorldDef::System(observer(
            "watch",
            QueryDef::new().with(["A"]).current(),
            &["A"],
        )),
    ];
    let mut world = world_with(defs, 16);
    world.execute().unwrap();
    assert!(matches!(
        world
            .system_query("watch", 0, QueryFlavor::Removed)
            .unwrap_err(),
        Error::Check(CheckError::FlavorNotRequested { flavor: "removed" })
    ));
}

#[test]
#[timeout(60000)]
fn ordered_queries_iterate_sorted() {
    let defs = vec![
        WorldDef::Component(value_component("A")),
        WorldDef::System(observer(
            "watch",
            QueryDef::new()
                .with(["A"])
                .current()
                .order_by(|entity| -(entity.ordinal() as f64)),
            &["A"],
        )),
    ];
    let mut world = world_with(defs, 100);
    let a = world.type_id("A").unwrap();
    let mut created = Vec::new();
    for _ in 0..10 {
        let entity = world.create_entity().unwrap();
        world.add(entity, a).unwrap();
        created.push(entity);
    }
    world.execute().unwrap();

    // Descending creation order: the reverse of what was added.
    let current = world.system_query("watch", 0, QueryFlavor::Current).unwrap();
    created.reverse();
    assert_eq!(current, created);
}

#[test]
#[timeout(60000)]
fn delta_completeness_under_random_shape_churn() {
    let defs = vec![
        WorldDef::Component(value_component("A")),
        WorldDef::Component(value_component("B")),
        WorldDef::System(observer(
            "watch",
            QueryDef::new().with(["A"]).current().added().removed(),
            &["A"],
        )),
    ];
    let mut world = world_with(defs, 200);
    let a = world.type_id("A").unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let mut entities = Vec::new();
    for _ in 0..100 {
        let entity = world.create_entity().unwrap();
        if rng.gen_bool(0.5) {
            world.add(entity, a).unwrap();
        }
        entities.push(entity);
    }
    world.execute().unwrap();

    for _ in 0..20 {
        let previous: HashSet<_> = world
            .system_query("watch", 0, QueryFlavor::Current)
            .unwrap()
            .into_iter()
            .collect();

        // Each entity flips at most once per frame, so the frame's deltas
        // decompose the membership change exactly.
        for &entity in &entities {
            if rng.gen_bool(0.2) {
                if world.has(entity, a).unwrap() {
                    world.remove(entity, a).unwrap();
                } else {
                    world.add(entity, a).unwrap();
                }
            }
        }
        world.execute().unwrap();

        let current: HashSet<_> = world
            .system_query("watch", 0, QueryFlavor::Current)
            .unwrap()
            .into_iter()
            .collect();
        let added: HashSet<_> = world
            .system_query("watch", 0, QueryFlavor::Added)
            .unwrap()
            .into_iter()
            .collect();
        let removed: HashSet<_> = world
            .system_query("watch", 0, QueryFlavor::Removed)
            .unwrap()
            .into_iter()
            .collect();

        let mut reconstructed = previous.clone();
        for entity in &removed {
            reconstructed.remove(entity);
        }
        for entity in &added {
            reconstructed.insert(*entity);
        }
        assert_eq!(reconstructed, current);
        assert!(added.is_disjoint(&previous));
        assert!(removed.is_subset(&previous));
        world.check_invariants().unwrap();
    }
}
