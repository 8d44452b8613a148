//! The director: owns the sealed parallel plan and drives laborer lanes.
//!
//! A star topology: the director talks to one laborer per lane over a
//! request channel, and every laborer answers on one shared response
//! channel. The director is itself the lane-0 laborer and runs that lane's
//! systems inline between dispatches. State that only one thread may touch
//! (the removal pointer, the frame clock, the sealed plan) stays on the
//! director.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use weft_core::error::CheckError;
use weft_core::frame::{FrameClock, QueryFeed};
use weft_core::graph::DependencyGraph;
use weft_core::log::LogPointer;
use weft_core::planner::{Plan, Sequencer, ThreadedPlan};
use weft_core::system::{run_hook, SystemHook, SystemSlot};
use weft_core::world::{LaneLocal, World, WorldShared};

use crate::laborer::Laborer;
use crate::request::{Action, Request, Response, WireError};

/// Errors surfaced by the bridge.
#[derive(Debug, thiserror::Error)]
pub enum DirectorError {
    #[error(transparent)]
    Engine(#[from] weft_core::Error),

    /// A laborer's error, rehydrated from the wire.
    #[error(transparent)]
    Laborer(#[from] WireError),

    #[error("lane bridge failure: {0}")]
    Bridge(String),

    #[error("the world was built single-lane; call World::execute directly")]
    NotThreaded,
}

pub type DirectorResult<T> = std::result::Result<T, DirectorError>;

pub struct Director {
    shared: Arc<WorldShared>,
    lane0_local: LaneLocal,
    lane0_systems: Vec<SystemSlot>,
    lane0_index: HashMap<usize, usize>,
    feed0: QueryFeed,
    graph: DependencyGraph,
    plan: ThreadedPlan,
    removal_pointer: LogPointer,
    clock: FrameClock,
    /// Request channels by lane; lane 0 has none.
    requests: Vec<Option<Sender<Request>>>,
    responses: Receiver<Response>,
    threads: Vec<std::thread::JoinHandle<()>>,
    next_id: u32,
    finished: bool,
}

impl Director {
    /// Consumes a multi-lane world, spawns one laborer thread per lane,
    /// bootstraps them, and runs the prepare and initialize passes.
    pub fn launch(world: World) -> DirectorResult<Director> {
        let parts = world.into_parts();
        let Plan::Threaded(plan) = parts.plan else {
            return Err(DirectorError::NotThreaded);
        };

        let mut per_lane: Vec<Vec<(usize, SystemSlot)>> =
            (0..plan.lane_count).map(|_| Vec::new()).collect();
        for (global, slot) in parts.systems.into_iter().enumerate() {
            per_lane[plan.lanes[global]].push((global, slot));
        }

        let mut locals = parts.locals.into_iter();
        let lane0_local = locals.next().expect("lane 0 always exists");
        let mut lane0_systems = Vec::new();
        let mut lane0_index = HashMap::new();
        for (global, slot) in per_lane.remove(0) {
            lane0_index.insert(global, lane0_systems.len());
            lane0_systems.push(slot);
        }

        let (response_tx, responses) = unbounded();
        let mut requests: Vec<Option<Sender<Request>>> = vec![None];
        let mut threads = Vec::new();
        for (offset, systems) in per_lane.into_iter().enumerate() {
            let lane = offset + 1;
            let local = locals
                .next()
                .expect("a local exists for every planned lane");
            let (request_tx, request_rx) = unbounded();
            let laborer = Laborer::new(
                parts.shared.clone(),
                local,
                systems,
                request_rx,
                response_tx.clone(),
            );
            let handle = std::thread::Builder::new()
                .name(format!("weft-lane-{}", lane))
                .spawn(move || laborer.run())
                .map_err(|e| DirectorError::Bridge(format!("failed to spawn lane: {}", e)))?;
            requests.push(Some(request_tx));
            threads.push(handle);
        }

        let feed0 = QueryFeed::new(parts.shared.settings().max_entities);
        let mut director = Director {
            shared: parts.shared,
            lane0_local,
            lane0_systems,
            lane0_index,
            feed0,
            graph: parts.graph,
            plan,
            removal_pointer: parts.removal_pointer,
            clock: parts.clock,
            requests,
            responses,
            threads,
            next_id: 0,
            finished: false,
        };

        for lane in 1..director.plan.lane_count {
            director.call(lane, Action::Bootstrap)?;
        }
        director.hook_pass(SystemHook::Prepare)?;
        director.hook_pass(SystemHook::Initialize)?;
        tracing::debug!(lanes = director.plan.lane_count, "director launched");
        Ok(director)
    }

    fn next_request(&mut self, lane: usize, action: Action) -> Request {
        self.next_id += 1;
        Request {
            id: self.next_id,
            action,
            next_entity_ordinal: self.shared.next_entity_ordinal(),
            buffers_patch: Some(self.shared.buffers().make_patch(lane)),
        }
    }

    fn absorb(&mut self, response: &Response) {
        self.shared
            .buffers()
            .apply_patch(&response.buffers_patch, true, Some(response.lane));
        self.shared
            .advance_entity_ordinal(response.next_entity_ordinal);
    }

    /// One request to one lane, awaited synchronously.
    fn call(&mut self, lane: usize, action: Action) -> DirectorResult<()> {
        let request = self.next_request(lane, action);
        let id = request.id;
        self.requests[lane]
            .as_ref()
            .expect("remote lanes have a channel")
            .send(request)
            .map_err(|_| DirectorError::Bridge("laborer hung up".to_string()))?;
        loop {
            let response = self
                .responses
                .recv()
                .map_err(|_| DirectorError::Bridge("laborer hung up".to_string()))?;
            self.absorb(&response);
            let matched = response.id == id;
            response.result.map_err(DirectorError::Laborer)?;
            if matched {
                return Ok(());
            }
        }
    }

    fn run_lane0(
        shared: &Arc<WorldShared>,
        local: &mut LaneLocal,
        systems: &mut [SystemSlot],
        index: &HashMap<usize, usize>,
        feed: &mut QueryFeed,
        global: usize,
        hook: SystemHook,
        time: f64,
        delta: f64,
    ) -> weft_core::Result<()> {
        feed.update_queries(shared.as_ref(), systems)?;
        let local_index = index[&global];
        run_hook(
            shared.as_ref(),
            local,
            &mut systems[local_index],
            hook,
            time,
            delta,
        )?;
        shared.flush(local)
    }

    /// Prepare / initialize / finalize sweeps, in topological order.
    fn hook_pass(&mut self, hook: SystemHook) -> DirectorResult<()> {
        for position in 0..self.plan.order.len() {
            let system = self.plan.order[position];
            let lane = self.plan.lanes[system];
            if lane == 0 {
                Self::run_lane0(
                    &self.shared,
                    &mut self.lane0_local,
                    &mut self.lane0_systems,
                    &self.lane0_index,
                    &mut self.feed0,
                    system,
                    hook,
                    0.0,
                    0.0,
                )?;
            } else {
                let action = match hook {
                    SystemHook::Prepare => Action::PrepareSystem(system),
                    SystemHook::Initialize => Action::InitializeSystem(system),
                    SystemHook::Finalize => Action::FinalizeSystem(system),
                    SystemHook::Execute => unreachable!("frames go through execute_timed"),
                };
                self.call(lane, action)?;
            }
        }
        Ok(())
    }

    /// One whole frame across all lanes.
    pub fn execute(&mut self) -> DirectorResult<()> {
        self.execute_timed(None, None)
    }

    pub fn execute_timed(&mut self, time: Option<f64>, delta: Option<f64>) -> DirectorResult<()> {
        if self.finished {
            return Err(weft_core::Error::from(CheckError::AlreadyTerminated).into());
        }
        self.shared.flush(&mut self.lane0_local)?;
        self.shared.stamp_frame(self.clock.counter + 1);
        self.clock.begin(time, delta);
        let (frame_time, frame_delta) = (self.clock.time, self.clock.delta);

        let Director {
            shared,
            lane0_local,
            lane0_systems,
            lane0_index,
            feed0,
            graph,
            plan,
            requests,
            responses,
            next_id,
            ..
        } = self;

        let mut sequencer = Sequencer::new(plan, graph);
        let mut inflight: HashMap<u32, usize> = HashMap::new();
        let mut failure: Option<DirectorError> = None;

        while !sequencer.is_done() {
            while failure.is_none() {
                let Some(system) = sequencer.next() else { break };
                let lane = sequencer.lane_of(system);
                if lane == 0 {
                    let result = Self::run_lane0(
                        shared,
                        lane0_local,
                        lane0_systems,
                        lane0_index,
                        feed0,
                        system,
                        SystemHook::Execute,
                        frame_time,
                        frame_delta,
                    );
                    match result {
                        Ok(()) => sequencer.complete(graph, system),
                        Err(error) => failure = Some(error.into()),
                    }
                } else {
                    *next_id += 1;
                    let request = Request {
                        id: *next_id,
                        action: Action::ExecuteSystem {
                            system,
                            time: frame_time,
                            delta: frame_delta,
                        },
                        next_entity_ordinal: shared.next_entity_ordinal(),
                        buffers_patch: Some(shared.buffers().make_patch(lane)),
                    };
                    tracing::trace!(system, lane, "dispatching");
                    if requests[lane].as_ref().unwrap().send(request).is_err() {
                        failure = Some(DirectorError::Bridge("laborer hung up".to_string()));
                        break;
                    }
                    inflight.insert(*next_id, system);
                }
            }

            if sequencer.is_done() {
                break;
            }
            if inflight.is_empty() {
                if failure.is_none() {
                    failure = Some(DirectorError::Bridge(
                        "plan stalled with no runnable system".to_string(),
                    ));
                }
                break;
            }
            match responses.recv() {
                Ok(response) => {
                    shared
                        .buffers()
                        .apply_patch(&response.buffers_patch, true, Some(response.lane));
                    shared.advance_entity_ordinal(response.next_entity_ordinal);
                    let system = inflight
                        .remove(&response.id)
                        .expect("every response matches a dispatch");
                    match response.result {
                        Ok(()) => sequencer.complete(graph, system),
                        Err(wire) => failure = Some(DirectorError::Laborer(wire)),
                    }
                }
                Err(_) => {
                    failure = Some(DirectorError::Bridge("laborer hung up".to_string()));
                    break;
                }
            }
        }

        // On failure the frame aborts: drain stragglers, then finish.
        if let Some(error) = failure {
            while !inflight.is_empty() {
                match responses.recv_timeout(Duration::from_secs(1)) {
                    Ok(response) => {
                        inflight.remove(&response.id);
                    }
                    Err(_) => break,
                }
            }
            self.clock.in_frame = false;
            self.finished = true;
            return Err(error);
        }

        self.feed0
            .update_queries(self.shared.as_ref(), &mut self.lane0_systems)?;
        self.shared.flush(&mut self.lane0_local)?;
        self.shared
            .complete_cycle(&mut self.lane0_local, &mut self.removal_pointer)?;
        self.clock.end();
        Ok(())
    }

    /// Completed frames.
    pub fn frames(&self) -> u64 {
        self.clock.counter
    }

    /// Lanes in the sealed plan, the main lane included.
    pub fn lane_count(&self) -> usize {
        self.plan.lane_count
    }

    pub fn shared(&self) -> &Arc<WorldShared> {
        &self.shared
    }

    /// Runs finalisation and releases every lane.
    pub fn terminate(&mut self) -> DirectorResult<()> {
        if self.finished {
            return Err(weft_core::Error::from(CheckError::AlreadyTerminated).into());
        }
        self.hook_pass(SystemHook::Finalize)?;
        self.release();
        self.finished = true;
        Ok(())
    }

    fn release(&mut self) {
        for lane in 1..self.requests.len() {
            if let Some(sender) = &self.requests[lane] {
                self.next_id += 1;
                let _ = sender.send(Request {
                    id: self.next_id,
                    action: Action::Release,
                    next_entity_ordinal: self.shared.next_entity_ordinal(),
                    buffers_patch: None,
                });
            }
            self.requests[lane] = None;
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Director {
    fn drop(&mut self) {
        if !self.finished {
            self.release();
        }
    }
}
