//! Scheduling: cycle rejection, topological execution, and groups.

use std::sync::{Arc, Mutex};

use ntest::timeout;

use weft_core::{
    CheckError, Error, GroupDef, QueryDef, QueryFlavor, Result, ScheduleRule, SystemCtx,
    SystemDef, SystemLogic, World, WorldDef, WorldOptions,
};

use super::{value_component, world_with};

/// Appends its own name to a shared trace on every execute.
struct Trace {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl SystemLogic for Trace {
    fn execute(&mut self, _ctx: &mut SystemCtx) -> Result<()> {
        self.log.lock().unwrap().push(self.name);
        Ok(())
    }
}

fn trace_system(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> SystemDef {
    SystemDef::new(name, Trace { name, log: log.clone() })
}

#[test]
#[timeout(60000)]
fn cyclic_schedules_fail_at_creation() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let defs = vec![
        WorldDef::System(
            trace_system("s1", &log).schedule(ScheduleRule::Before("s2".to_string())),
        ),
        WorldDef::System(
            trace_system("s2", &log).schedule(ScheduleRule::Before("s1".to_string())),
        ),
    ];
    let err = World::create(WorldOptions {
        defs,
        ..Default::default()
    })
    .unwrap_err();
    match err {
        Error::Check(CheckError::PrecedenceCycle { systems }) => {
            assert!(systems.iter().any(|s| s == "s1"));
            assert!(systems.iter().any(|s| s == "s2"));
        }
        other => panic!("expected a precedence cycle, got {:?}", other),
    }
}

#[test]
#[timeout(60000)]
fn disjoint_cycles_report_every_component() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let defs = vec![
        WorldDef::System(
            trace_system("s1", &log).schedule(ScheduleRule::Before("s2".to_string())),
        ),
        WorldDef::System(
            trace_system("s2", &log).schedule(ScheduleRule::Before("s1".to_string())),
        ),
        WorldDef::System(
            trace_system("s3", &log).schedule(ScheduleRule::Before("s4".to_string())),
        ),
        WorldDef::System(
            trace_system("s4", &log).schedule(ScheduleRule::Before("s3".to_string())),
        ),
    ];
    let err = World::create(WorldOptions {
        defs,
        ..Default::default()
    })
    .unwrap_err();
    match err {
        Error::Check(CheckError::PrecedenceCycle { systems }) => {
            // Both independent cycles are named, not just the first.
            for name in ["s1", "s2", "s3", "s4"] {
                assert!(systems.iter().any(|s| s == name), "{} missing", name);
            }
        }
        other => panic!("expected a precedence cycle, got {:?}", other),
    }
}

#[test]
#[timeout(60000)]
fn execution_respects_explicit_and_implicit_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let defs = vec![
        WorldDef::Component(value_component("A")),
        // Declared out of order on purpose: the reader comes first in defs
        // but depends on the writer through the implicit edge.
        WorldDef::System(trace_system("reader", &log).reads(["A"])),
        WorldDef::System(trace_system("writer", &log).writes(["A"])),
        WorldDef::System(
            trace_system("last", &log).schedule(ScheduleRule::After("reader".to_string())),
        ),
        WorldDef::System(
            trace_system("first", &log).schedule(ScheduleRule::Before("writer".to_string())),
        ),
    ];
    let mut world = world_with(defs, 16);
    world.execute().unwrap();
    world.execute().unwrap();

    let trace = log.lock().unwrap();
    let frame: Vec<_> = trace.iter().take(4).collect();
    let position = |name: &str| frame.iter().position(|&&s| s == name).unwrap();
    assert!(position("first") < position("writer"));
    assert!(position("writer") < position("reader"));
    assert!(position("reader") < position("last"));
    // The second frame ran the same order.
    assert_eq!(trace[..4], trace[4..8]);
}

/// Deletes the probe entity handed to it through a shared slot.
struct DeleteMarked {
    slot: Arc<Mutex<Option<weft_core::Entity>>>,
}

impl SystemLogic for DeleteMarked {
    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        if let Some(entity) = self.slot.lock().unwrap().take() {
            ctx.delete_entity(entity)?;
        }
        Ok(())
    }
}

#[test]
#[timeout(60000)]
fn cycles_complete_only_after_every_group_ran() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let slot = Arc::new(Mutex::new(None));
    let defs = vec![
        WorldDef::Component(value_component("A")),
        WorldDef::System(
            SystemDef::new("reaper", DeleteMarked { slot: slot.clone() }).updates(["A"]),
        ),
        WorldDef::System(trace_system("simulate", &log).reads(["A"])),
        WorldDef::Group(GroupDef::new("input", ["reaper"])),
        WorldDef::Group(GroupDef::new("simulation", ["simulate"])),
    ];
    let mut world = world_with(defs, 16);
    let a = world.type_id("A").unwrap();

    let doomed = world.create_entity().unwrap();
    world.add(doomed, a).unwrap();
    *slot.lock().unwrap() = Some(doomed);

    // Only one of the two groups runs: the deletion stays in limbo and the
    // id is not reclaimed.
    world.begin_frame(None, None).unwrap();
    world.execute_group("input").unwrap();
    world.end_frame().unwrap();
    assert_eq!(world.entity_count(), 1);

    // A frame that runs both groups completes the cycle.
    world.begin_frame(None, None).unwrap();
    world.execute_group("input").unwrap();
    world.execute_group("simulation").unwrap();
    world.end_frame().unwrap();
    assert_eq!(world.entity_count(), 0);
    world.check_invariants().unwrap();
}

#[test]
#[timeout(60000)]
fn unknown_group_names_are_rejected() {
    let mut world = world_with(vec![WorldDef::Component(value_component("A"))], 16);
    world.begin_frame(None, None).unwrap();
    assert!(matches!(
        world.execute_group("nope").unwrap_err(),
        Error::Check(CheckError::UnknownGroup(_))
    ));
    world.end_frame().unwrap();
}

/// Observes how many entities its query matches, through a query that only
/// exists to prove access checks hold inside systems.
struct Overreach;

impl SystemLogic for Overreach {
    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        let entities = ctx.entities(0, QueryFlavor::Current)?;
        if let Some(&entity) = entities.first() {
            // B was never declared by this system.
            let b = ctx.type_id("B")?;
            ctx.bind(entity, b)?;
        }
        Ok(())
    }
}

#[test]
#[timeout(60000)]
fn undeclared_access_fails_the_frame() {
    let defs = vec![
        WorldDef::Component(value_component("A")),
        WorldDef::Component(value_component("B")),
        WorldDef::System(
            SystemDef::new("overreach", Overreach)
                .reads(["A"])
                .query(QueryDef::new().with(["A"]).current()),
        ),
    ];
    let mut world = world_with(defs, 16);
    let (a, b) = (world.type_id("A").unwrap(), world.type_id("B").unwrap());
    let entity = world.create_entity().unwrap();
    world.add_all(entity, &[a, b]).unwrap();

    let err = world.execute().unwrap_err();
    assert!(matches!(
        err,
        Error::Check(CheckError::UndeclaredAccess { .. })
    ));
}
