//! The laborer side of the bridge: one thread per lane, executing that
//! lane's systems on request.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use weft_core::frame::QueryFeed;
use weft_core::system::{run_hook, SystemHook, SystemSlot};
use weft_core::world::{LaneLocal, WorldShared};
use weft_core::Result;

use crate::request::{Action, Request, Response, WireError};

/// A lane's worker: its systems, its corrals, and its query feed.
pub struct Laborer {
    shared: Arc<WorldShared>,
    local: LaneLocal,
    /// The lane's systems, keyed by their global system index.
    systems: Vec<SystemSlot>,
    by_global: HashMap<usize, usize>,
    feed: QueryFeed,
    requests: Receiver<Request>,
    responses: Sender<Response>,
}

impl Laborer {
    pub fn new(
        shared: Arc<WorldShared>,
        local: LaneLocal,
        systems: Vec<(usize, SystemSlot)>,
        requests: Receiver<Request>,
        responses: Sender<Response>,
    ) -> Self {
        let feed = QueryFeed::new(shared.settings().max_entities);
        let mut slots = Vec::with_capacity(systems.len());
        let mut by_global = HashMap::with_capacity(systems.len());
        for (global, slot) in systems {
            by_global.insert(global, slots.len());
            slots.push(slot);
        }
        Self {
            shared,
            local,
            systems: slots,
            by_global,
            feed,
            requests,
            responses,
        }
    }

    /// The request loop. Runs until a release request or a closed channel.
    pub fn run(mut self) {
        tracing::trace!(lane = self.local.lane(), "laborer started");
        while let Ok(request) = self.requests.recv() {
            if let Some(patch) = &request.buffers_patch {
                // The director already tracked these changes; installing
                // them again must not echo back.
                self.shared.buffers().apply_patch(patch, false, None);
            }
            self.shared.advance_entity_ordinal(request.next_entity_ordinal);

            let release = request.action == Action::Release;
            let result = self.dispatch(request.action);
            let response = Response {
                id: request.id,
                lane: self.local.lane(),
                result: result.as_ref().map(|_| ()).map_err(WireError::from),
                next_entity_ordinal: self.shared.next_entity_ordinal(),
                buffers_patch: self.shared.buffers().make_patch(self.local.lane()),
            };
            if self.responses.send(response).is_err() || release {
                break;
            }
        }
        tracing::trace!(lane = self.local.lane(), "laborer released");
    }

    fn dispatch(&mut self, action: Action) -> Result<()> {
        match action {
            Action::Bootstrap | Action::Release => Ok(()),
            Action::PrepareSystem(system) => self.run_system(system, SystemHook::Prepare, 0.0, 0.0),
            Action::InitializeSystem(system) => {
                self.run_system(system, SystemHook::Initialize, 0.0, 0.0)
            }
            Action::ExecuteSystem {
                system,
                time,
                delta,
            } => self.run_system(system, SystemHook::Execute, time, delta),
            Action::FinalizeSystem(system) => {
                self.run_system(system, SystemHook::Finalize, 0.0, 0.0)
            }
        }
    }

    fn run_system(&mut self, global: usize, hook: SystemHook, time: f64, delta: f64) -> Result<()> {
        let index = *self
            .by_global
            .get(&global)
            .expect("the director routes systems to their own lane");
        self.feed
            .update_queries(self.shared.as_ref(), &mut self.systems)?;
        run_hook(
            self.shared.as_ref(),
            &mut self.local,
            &mut self.systems[index],
            hook,
            time,
            delta,
        )?;
        self.shared.flush(&mut self.local)
    }
}
