//! Integration tests for the runtime core.

mod lifecycle_tests;
mod query_tests;
mod refs_tests;
mod schedule_tests;

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use weft_core::{
    ComponentDef, FieldKind, QueryDef, QueryFlavor, Result, SystemCtx, SystemDef, SystemLogic,
    World, WorldDef, WorldOptions,
};

/// A component type named `name` with one f64 `value` field.
pub fn value_component(name: &str) -> ComponentDef {
    ComponentDef::new(name).field("value", FieldKind::F64)
}

pub fn world_with(defs: Vec<WorldDef>, max_entities: u32) -> World {
    World::create(WorldOptions {
        defs,
        max_entities,
        ..Default::default()
    })
    .expect("world builds")
}

/// A system that does nothing but carry queries for inspection.
pub struct Passive;

impl SystemLogic for Passive {
    fn execute(&mut self, _ctx: &mut SystemCtx) -> Result<()> {
        Ok(())
    }
}

/// Declares a passive observer system with one query over `with` types.
pub fn observer(name: &str, query: QueryDef, reads: &[&str]) -> SystemDef {
    SystemDef::new(name, Passive)
        .reads(reads.iter().map(|s| s.to_string()))
        .query(query)
}

/// Counts entities in one flavour of its query every frame.
pub struct FlavorCounter {
    pub flavor: QueryFlavor,
    pub seen: Arc<AtomicU32>,
}

impl SystemLogic for FlavorCounter {
    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        let entities = ctx.entities(0, self.flavor)?;
        self.seen
            .store(entities.len() as u32, std::sync::atomic::Ordering::Release);
        Ok(())
    }
}
