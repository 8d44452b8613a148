//! The world: the one owning container for everything the runtime holds.
//!
//! All cross-references are ids resolved through the world's arenas:
//! component types and columns by `ComponentTypeId`, systems by index,
//! lanes by index. The shareable half ([`WorldShared`]) is immutable
//! structure plus atomically updated state, so laborer threads hold it
//! behind an `Arc`; everything only the director touches (ref indexer,
//! removal pointer, frame clock, plans) stays in [`World`].

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::buffers::Buffers;
use crate::component::{ComponentType, RowLayout};
use crate::config::{Settings, WorldOptions};
use crate::defs::{ComponentDef, ScheduleRule, WorldDef};
use crate::entity::{Entity, MAX_COMPONENT_TYPES};
use crate::error::{CheckError, Error, InternalError, Result};
use crate::frame::{FrameClock, QueryFeed};
use crate::graph::DependencyGraph;
use crate::log::{ChangeLog, Corral, LogPointer};
use crate::planner::{self, Constraint, Plan, ThreadedPlan};
use crate::pool::EntityPool;
use crate::query::QueryState;
use crate::refs::{RefIndexer, GLOBAL_SELECTOR};
use crate::shape::{ShapeArray, ShapeBinding, ShapeView};
use crate::stats::{SharedCounts, WorldStats};
use crate::storage::{Column, StorageKind};
use crate::system::{run_hook, AccessMasks, SystemCtx, SystemHook, SystemSlot};

/// Per-lane mutable state: the lane's log corrals, its buffer tracker, and
/// its transient entity borrows. Exactly one lane owns each instance.
pub struct LaneLocal {
    pub(crate) lane: usize,
    pub(crate) shape_corral: Corral,
    pub(crate) write_corral: Corral,
    pub(crate) removal_corral: Corral,
    pub(crate) ref_corral: Corral,
    pub(crate) borrows: Vec<u32>,
}

impl LaneLocal {
    pub(crate) fn new(lane: usize, shared: &WorldShared) -> Self {
        Self {
            lane,
            shape_corral: shared.shape_log.corral(),
            write_corral: shared.write_log.corral(),
            removal_corral: shared.removal_log.corral(),
            ref_corral: shared.ref_log.corral(),
            borrows: Vec::new(),
        }
    }

    /// The lane's index, which doubles as its buffers tracker.
    pub fn lane(&self) -> usize {
        self.lane
    }
}

/// The thread-shareable half of a world.
pub struct WorldShared {
    pub(crate) settings: Settings,
    pub(crate) types: Vec<ComponentType>,
    pub(crate) type_names: HashMap<String, u16>,
    pub(crate) columns: Vec<Column>,
    pub(crate) shapes: ShapeArray,
    pub(crate) entities: EntityPool,
    pub(crate) shape_log: ChangeLog,
    pub(crate) write_log: ChangeLog,
    pub(crate) removal_log: ChangeLog,
    pub(crate) ref_log: ChangeLog,
    pub(crate) buffers: Buffers,
    pub(crate) counts: SharedCounts,
    /// The inbound-reference indexer. Ref mutations are structural
    /// changes, which the plan serialises, so the lock is uncontended.
    pub(crate) refs: Mutex<RefIndexer>,
}

impl WorldShared {
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn buffers(&self) -> &Buffers {
        &self.buffers
    }

    /// The creation ordinal counter, carried by every bridge message.
    pub fn next_entity_ordinal(&self) -> u32 {
        self.entities.next_ordinal()
    }

    /// Publishes the running frame's stamp; queries clear their transient
    /// lists when they first see a new stamp.
    pub fn stamp_frame(&self, frame: u64) {
        self.counts.frame.store(frame, std::sync::atomic::Ordering::Release);
    }

    pub fn advance_entity_ordinal(&self, ordinal: u32) {
        self.entities.advance_ordinal(ordinal);
    }
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("systems", &self.systems.len())
            .field("finished", &self.finished)
            .finish()
    }
}

/// The world's execution state after the build.
pub struct World {
    pub(crate) shared: Arc<WorldShared>,
    pub(crate) locals: Vec<LaneLocal>,
    pub(crate) systems: Vec<SystemSlot>,
    /// Group name and member system indices; index 0 is the default group
    /// holding every system.
    pub(crate) groups: Vec<(String, Vec<usize>)>,
    pub(crate) graph: DependencyGraph,
    pub(crate) plan: Plan,
    pub(crate) removal_pointer: LogPointer,
    pub(crate) feed: QueryFeed,
    pub(crate) clock: FrameClock,
    no_queries: Vec<QueryState>,
    full_access: AccessMasks,
    shape_mark: (u32, u32),
    write_mark: (u32, u32),
    peak_shape: usize,
    peak_writes: usize,
    finished: bool,
}

struct EnumInfo {
    name: String,
    member: usize,
    count: usize,
}

impl World {
    /// Builds and seals a world from its options. Single-lane worlds run
    /// their systems' prepare and initialize hooks before returning;
    /// multi-lane worlds defer that to the lane director.
    pub fn create(options: WorldOptions) -> Result<World> {
        let settings = options.resolve()?;

        let mut component_defs: Vec<(ComponentDef, Option<EnumInfo>)> = vec![(
            ComponentDef::new("Alive").storage(StorageKind::Sparse),
            None,
        )];
        let mut system_defs = Vec::new();
        let mut group_defs = Vec::new();
        for def in options.defs {
            match def {
                WorldDef::Component(c) => component_defs.push((c, None)),
                WorldDef::Enum(e) => {
                    let count = e.members.len();
                    for (member, c) in e.members.into_iter().enumerate() {
                        component_defs.push((
                            c,
                            Some(EnumInfo {
                                name: e.name.clone(),
                                member,
                                count,
                            }),
                        ));
                    }
                }
                WorldDef::System(s) => system_defs.push(s),
                WorldDef::Group(g) => group_defs.push(g),
            }
        }

        if component_defs.len() > MAX_COMPONENT_TYPES {
            return Err(CheckError::InvalidOptions(format!(
                "{} component types declared; at most {} are supported",
                component_defs.len(),
                MAX_COMPONENT_TYPES
            ))
            .into());
        }

        let types = Self::seal_types(component_defs, &settings)?;
        let slot_stride = types
            .iter()
            .map(|t| t.binding.word as usize + 1)
            .max()
            .unwrap_or(1);
        let flag_stride = types.len().div_ceil(32);

        let mut type_names = HashMap::with_capacity(types.len());
        for ty in &types {
            if type_names.insert(ty.name.clone(), ty.id).is_some() {
                return Err(CheckError::InvalidOptions(format!(
                    "component type '{}' declared twice",
                    ty.name
                ))
                .into());
            }
        }

        let buffers = Buffers::new();
        for _ in 0..settings.threads {
            buffers.add_tracker();
        }
        let columns = types
            .iter()
            .map(|ty| Column::new(ty, &buffers, settings.max_entities))
            .collect();

        let shared = Arc::new(WorldShared {
            shapes: ShapeArray::new(slot_stride, flag_stride, settings.max_entities),
            entities: EntityPool::new(settings.max_entities),
            shape_log: ChangeLog::new(
                "shape",
                "max_shape_changes_per_frame",
                settings.max_shape_changes_per_frame,
                true,
                false,
            ),
            write_log: ChangeLog::new(
                "write",
                "max_writes_per_frame",
                settings.max_writes_per_frame,
                true,
                false,
            ),
            removal_log: ChangeLog::new(
                "removal",
                "max_limbo_components",
                settings.max_limbo_components,
                false,
                false,
            ),
            ref_log: ChangeLog::new(
                "ref",
                "max_ref_changes_per_frame",
                settings.max_ref_changes_per_frame * 2,
                false,
                true,
            ),
            refs: Mutex::new(RefIndexer::new(&types)),
            types,
            type_names,
            columns,
            buffers,
            counts: SharedCounts::default(),
            settings,
        });

        let locals: Vec<LaneLocal> = (0..shared.settings.threads)
            .map(|lane| LaneLocal::new(lane, shared.as_ref()))
            .collect();

        let (systems, constraints) = Self::seal_systems(system_defs, shared.as_ref())?;
        let groups = Self::seal_groups(group_defs, &systems)?;

        let mut graph = planner::build_graph(&systems, &constraints, shared.types.len());
        graph.seal()?;

        let threads = shared.settings.threads;
        let mut systems = systems;
        let plan = if threads == 1 {
            Plan::Simple {
                order: graph.topological_order(),
            }
        } else {
            let restricted: Vec<bool> = systems
                .iter()
                .map(|s| {
                    let mut touched = s.access.writeish();
                    touched.union_with(&s.access.read);
                    touched.union_with(&s.access.check);
                    let any_restricted = touched
                        .ones()
                        .any(|t| shared.types[t as usize].restricted_to_main_thread);
                    any_restricted
                })
                .collect();
            let lanes = planner::assign_lanes(&systems, &graph, threads, &restricted);
            let lane_count = lanes.iter().copied().max().unwrap_or(0) + 1;
            for (system, &lane) in lanes.iter().enumerate() {
                systems[system].lane = lane;
            }
            tracing::debug!(systems = systems.len(), lanes = lane_count, "parallel plan sealed");
            Plan::Threaded(ThreadedPlan {
                lane_count,
                excluded: planner::excluded_pairs(&systems, &graph),
                impacts: planner::completion_impacts(&systems, &graph, &lanes, lane_count),
                weights: systems.iter().map(|s| s.weight).collect(),
                order: graph.topological_order(),
                lanes,
            })
        };

        let full_access = AccessMasks::all(shared.types.len());
        let feed = QueryFeed::new(shared.settings.max_entities);
        let mut world = World {
            locals,
            systems,
            groups,
            graph,
            plan,
            removal_pointer: LogPointer::default(),
            feed,
            clock: FrameClock::new(),
            no_queries: Vec::new(),
            full_access,
            shape_mark: shared.shape_log.head_snapshot(),
            write_mark: shared.write_log.head_snapshot(),
            peak_shape: 0,
            peak_writes: 0,
            finished: false,
            shared,
        };

        if threads == 1 {
            world.run_hook_pass(SystemHook::Prepare)?;
            world.run_hook_pass(SystemHook::Initialize)?;
        }
        tracing::debug!(
            types = world.shared.types.len(),
            systems = world.systems.len(),
            threads,
            "world created"
        );
        Ok(world)
    }

    fn seal_types(
        defs: Vec<(ComponentDef, Option<EnumInfo>)>,
        settings: &Settings,
    ) -> Result<Vec<ComponentType>> {
        let mut types = Vec::with_capacity(defs.len());
        let mut word: u16 = 0;
        let mut bit: u32 = 0;
        // The open enum slot while its members are sealed.
        let mut group_slot: (u16, u32, u32) = (0, 0, 0);
        let mut enum_members: HashMap<String, Vec<u16>> = HashMap::new();

        for (id, (def, enum_info)) in defs.into_iter().enumerate() {
            let storage = def.storage.unwrap_or(settings.default_component_storage);
            if storage == StorageKind::Sparse && def.capacity.is_some() {
                return Err(CheckError::InvalidOptions(format!(
                    "component '{}' uses sparse storage, which fixes capacity at max_entities",
                    def.name
                ))
                .into());
            }

            let binding = match &enum_info {
                None => {
                    if bit == 32 {
                        word += 1;
                        bit = 0;
                    }
                    let binding = ShapeBinding {
                        word,
                        mask: 1 << bit,
                        value: 1 << bit,
                    };
                    bit += 1;
                    binding
                }
                Some(info) => {
                    if info.member == 0 {
                        let slots = 32 - (info.count as u32).leading_zeros();
                        if bit + slots > 32 {
                            word += 1;
                            bit = 0;
                        }
                        group_slot = (word, bit, slots);
                        bit += slots;
                    }
                    let (gw, gb, gs) = group_slot;
                    ShapeBinding {
                        word: gw,
                        mask: ((1u32 << gs) - 1) << gb,
                        value: (info.member as u32 + 1) << gb,
                    }
                }
            };

            if let Some(info) = &enum_info {
                enum_members
                    .entry(info.name.clone())
                    .or_default()
                    .push(id as u16);
            }

            types.push(ComponentType {
                id: id as u16,
                layout: RowLayout::compute(&def.name, &def.fields)?,
                name: def.name,
                storage,
                capacity: def.capacity,
                tracks_writes: def.tracks_writes,
                internally_indexed: def.internally_indexed,
                restricted_to_main_thread: def.restricted_to_main_thread,
                binding,
                flag_binding: ShapeBinding::bit(id),
                siblings: Vec::new(),
                enum_name: enum_info.map(|info| info.name),
            });
        }

        for ty in &mut types {
            if let Some(group) = &ty.enum_name {
                ty.siblings = enum_members[group].clone();
            }
        }
        Ok(types)
    }

    fn seal_systems(
        defs: Vec<crate::defs::SystemDef>,
        shared: &WorldShared,
    ) -> Result<(Vec<SystemSlot>, Vec<Vec<Constraint>>)> {
        let mut names = HashMap::with_capacity(defs.len());
        for (index, def) in defs.iter().enumerate() {
            if names.insert(def.name.clone(), index).is_some() {
                return Err(CheckError::InvalidOptions(format!(
                    "system '{}' declared twice",
                    def.name
                ))
                .into());
            }
        }

        let type_count = shared.types.len();
        let mut systems = Vec::with_capacity(defs.len());
        let mut constraints = Vec::with_capacity(defs.len());
        for def in defs {
            let resolve_mask = |names: &[String]| -> Result<crate::mask::TypeMask> {
                let mut mask = crate::mask::TypeMask::new(type_count);
                for name in names {
                    mask.set(shared.type_id(name)?);
                }
                Ok(mask)
            };
            let access = AccessMasks {
                read: resolve_mask(&def.reads)?,
                write: resolve_mask(&def.writes)?,
                create: resolve_mask(&def.creates)?,
                update: resolve_mask(&def.updates)?,
                check: resolve_mask(&def.checks)?,
            };
            let queries = def
                .queries
                .into_iter()
                .map(|q| QueryState::seal(q, shared))
                .collect::<Result<Vec<_>>>()?;

            let resolve_system = |name: &String| -> Result<usize> {
                names
                    .get(name)
                    .copied()
                    .ok_or_else(|| Error::Check(CheckError::UnknownSystem(name.clone())))
            };
            let mut resolved = Vec::with_capacity(def.schedule.len());
            for rule in &def.schedule {
                resolved.push(match rule {
                    ScheduleRule::Before(s) => Constraint::Before(resolve_system(s)?),
                    ScheduleRule::After(s) => Constraint::After(resolve_system(s)?),
                    ScheduleRule::InAnyOrderWith(s) => {
                        Constraint::InAnyOrderWith(resolve_system(s)?)
                    }
                    ScheduleRule::BeforeReadersOf(t) => {
                        Constraint::BeforeReadersOf(shared.type_id(t)?)
                    }
                    ScheduleRule::AfterReadersOf(t) => {
                        Constraint::AfterReadersOf(shared.type_id(t)?)
                    }
                    ScheduleRule::BeforeWritersOf(t) => {
                        Constraint::BeforeWritersOf(shared.type_id(t)?)
                    }
                    ScheduleRule::AfterWritersOf(t) => {
                        Constraint::AfterWritersOf(shared.type_id(t)?)
                    }
                    ScheduleRule::InAnyOrderWithReadersOf(t) => {
                        Constraint::InAnyOrderWithReadersOf(shared.type_id(t)?)
                    }
                    ScheduleRule::InAnyOrderWithWritersOf(t) => {
                        Constraint::InAnyOrderWithWritersOf(shared.type_id(t)?)
                    }
                });
            }
            constraints.push(resolved);

            systems.push(SystemSlot {
                name: def.name,
                logic: def.logic,
                access,
                queries,
                weight: def.weight,
                stateless: def.stateless,
                lane: 0,
            });
        }
        Ok((systems, constraints))
    }

    fn seal_groups(
        defs: Vec<crate::defs::GroupDef>,
        systems: &[SystemSlot],
    ) -> Result<Vec<(String, Vec<usize>)>> {
        let mut groups = vec![(
            "default".to_string(),
            (0..systems.len()).collect::<Vec<_>>(),
        )];
        for def in defs {
            let mut members = Vec::with_capacity(def.members.len());
            for name in &def.members {
                let index = systems
                    .iter()
                    .position(|s| &s.name == name)
                    .ok_or_else(|| Error::Check(CheckError::UnknownSystem(name.clone())))?;
                members.push(index);
            }
            groups.push((def.name, members));
        }
        Ok(groups)
    }

    /// How many group completions constitute a full frame cycle.
    fn cycle_group_count(&self) -> usize {
        (self.groups.len() - 1).max(1)
    }

    fn mark_group_executed(&mut self, group: usize) {
        if group == 0 {
            // The default group covers every system, so it completes the
            // cycle on its own.
            for g in 0..self.cycle_group_count() {
                self.clock.mark_group(g);
            }
        } else {
            self.clock.mark_group(group - 1);
        }
    }

    /// A context with full access rights, backed by the main lane. Changes
    /// stage in the lane's corrals and become visible at the next flush
    /// point (frame begin, or an explicit [`World::flush`]).
    pub fn context(&mut self) -> SystemCtx<'_> {
        SystemCtx::new(
            self.shared.as_ref(),
            &mut self.locals[0],
            &mut self.no_queries,
            &self.full_access,
            "world",
            self.clock.time,
            self.clock.delta,
        )
    }

    /// Runs a build callback against the world's own context, then flushes.
    pub fn build(&mut self, f: impl FnOnce(&mut SystemCtx) -> Result<()>) -> Result<()> {
        let mut ctx = self.context();
        f(&mut ctx)?;
        self.flush()
    }

    /// Commits the main lane's staged changes.
    pub fn flush(&mut self) -> Result<()> {
        self.shared.flush(&mut self.locals[0])
    }

    pub fn type_id(&self, name: &str) -> Result<u16> {
        self.shared.type_id(name)
    }

    pub fn create_entity(&mut self) -> Result<Entity> {
        self.shared.create_entity(&mut self.locals[0])
    }

    pub fn delete_entity(&mut self, entity: Entity) -> Result<()> {
        self.shared.delete_entity(&mut self.locals[0], entity)
    }

    pub fn add(&mut self, entity: Entity, type_id: u16) -> Result<()> {
        self.shared.add_component(&mut self.locals[0], entity, type_id)
    }

    pub fn add_all(&mut self, entity: Entity, type_ids: &[u16]) -> Result<()> {
        self.shared.add_all(&mut self.locals[0], entity, type_ids)
    }

    pub fn remove(&mut self, entity: Entity, type_id: u16) -> Result<()> {
        self.shared.remove_component(&mut self.locals[0], entity, type_id)
    }

    pub fn has(&self, entity: Entity, type_id: u16) -> Result<bool> {
        self.shared.has_component(entity, type_id)
    }

    pub fn entity_count(&self) -> u32 {
        self.shared.entity_count()
    }

    /// Inspects one of a system's query lists by flavour.
    pub fn system_query(
        &mut self,
        system: &str,
        query: usize,
        flavor: crate::query::QueryFlavor,
    ) -> Result<Vec<Entity>> {
        let slot = self
            .systems
            .iter_mut()
            .find(|s| s.name == system)
            .ok_or_else(|| Error::Check(CheckError::UnknownSystem(system.to_string())))?;
        let ids = slot.queries[query].entity_ids(self.shared.as_ref(), flavor)?;
        Ok(ids
            .into_iter()
            .map(|id| self.shared.entities.handle_for(id))
            .collect())
    }

    /// Live inbound references to `target` under the global selector.
    pub fn backrefs(&self, target: Entity) -> Result<Vec<Entity>> {
        self.shared.entities.check_valid(target)?;
        let refs = self.shared.refs.lock().unwrap();
        Ok(refs
            .backrefs(target.id, GLOBAL_SELECTOR)
            .iter()
            .map(|&id| self.shared.entities.handle_for(id))
            .collect())
    }

    /// Inbound references including sources whose component sits in limbo,
    /// and targets removed this cycle but not yet finalised.
    pub fn stale_backrefs(&self, target: Entity) -> Result<Vec<Entity>> {
        self.shared.entities.check_valid(target)?;
        let refs = self.shared.refs.lock().unwrap();
        Ok(refs
            .stale_backrefs(target.id, GLOBAL_SELECTOR)
            .iter()
            .map(|&id| self.shared.entities.handle_for(id))
            .collect())
    }

    /// Inbound references through one declared ref field.
    pub fn backrefs_via(
        &self,
        target: Entity,
        source_type: &str,
        field: &str,
    ) -> Result<Vec<Entity>> {
        self.shared.entities.check_valid(target)?;
        let type_id = self.shared.type_id(source_type)?;
        let seq = self.shared.types[type_id as usize].field_seq(field)? as u8;
        let refs = self.shared.refs.lock().unwrap();
        let selector = refs.selector_for(type_id, seq).ok_or_else(|| {
            Error::Check(CheckError::UnknownField {
                component: source_type.to_string(),
                field: field.to_string(),
            })
        })?;
        Ok(refs
            .backrefs(target.id, selector)
            .iter()
            .map(|&id| self.shared.entities.handle_for(id))
            .collect())
    }

    /// Starts a frame: commits staged setup changes, clears every query's
    /// transient lists, and locks in time and delta.
    pub fn begin_frame(&mut self, time: Option<f64>, delta: Option<f64>) -> Result<()> {
        if self.finished {
            return Err(CheckError::AlreadyTerminated.into());
        }
        if matches!(self.plan, Plan::Threaded(_)) {
            return Err(CheckError::ThreadedExecution {
                threads: self.shared.settings.threads,
            }
            .into());
        }
        if self.clock.in_frame {
            return Err(CheckError::InvalidOptions("frame already begun".to_string()).into());
        }
        self.flush()?;
        self.shared
            .counts
            .frame
            .store(self.clock.counter + 1, Ordering::Release);
        self.clock.begin(time, delta);
        self.shape_mark = self.shared.shape_log.head_snapshot();
        self.write_mark = self.shared.write_log.head_snapshot();
        tracing::trace!(frame = self.clock.counter, time = self.clock.time, "frame begun");
        Ok(())
    }

    /// Executes one named group within the current frame.
    pub fn execute_group(&mut self, name: &str) -> Result<()> {
        if !self.clock.in_frame {
            return Err(
                CheckError::InvalidOptions("execute_group outside a frame".to_string()).into(),
            );
        }
        let group = self
            .groups
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| Error::Check(CheckError::UnknownGroup(name.to_string())))?;
        self.run_group(group)
    }

    fn run_group(&mut self, group: usize) -> Result<()> {
        let order = match &self.plan {
            Plan::Simple { order } => order.clone(),
            Plan::Threaded(_) => {
                return Err(CheckError::ThreadedExecution {
                    threads: self.shared.settings.threads,
                }
                .into())
            }
        };
        let members = self.groups[group].1.clone();
        for system in order {
            if !members.contains(&system) {
                continue;
            }
            self.feed.update_queries(self.shared.as_ref(), &mut self.systems)?;
            let result = run_hook(
                self.shared.as_ref(),
                &mut self.locals[0],
                &mut self.systems[system],
                SystemHook::Execute,
                self.clock.time,
                self.clock.delta,
            );
            if let Err(error) = result {
                // The frame aborts; staged changes of the failed system
                // stay uncommitted.
                self.clock.in_frame = false;
                return Err(error);
            }
            self.flush()?;
        }
        self.mark_group_executed(group);
        Ok(())
    }

    /// Ends the frame. When every group has run, the cycle completes: the
    /// ref and removal logs drain and deletions finalise.
    pub fn end_frame(&mut self) -> Result<()> {
        if !self.clock.in_frame {
            return Err(CheckError::InvalidOptions("no frame to end".to_string()).into());
        }
        self.feed.update_queries(self.shared.as_ref(), &mut self.systems)?;
        self.flush()?;
        if self.clock.all_groups_ran(self.cycle_group_count()) {
            self.shared
                .complete_cycle(&mut self.locals[0], &mut self.removal_pointer)?;
        }
        let shape_now = self.shared.shape_log.head_snapshot();
        let write_now = self.shared.write_log.head_snapshot();
        self.peak_shape = self
            .peak_shape
            .max(self.shared.shape_log.entries_between(self.shape_mark, shape_now));
        self.peak_writes = self
            .peak_writes
            .max(self.shared.write_log.entries_between(self.write_mark, write_now));
        self.clock.end();
        Ok(())
    }

    /// One whole frame over the default group.
    pub fn execute(&mut self) -> Result<()> {
        self.execute_timed(None, None)
    }

    /// One whole frame with an explicit time (and optionally delta).
    pub fn execute_timed(&mut self, time: Option<f64>, delta: Option<f64>) -> Result<()> {
        self.begin_frame(time, delta)?;
        self.run_group(0)?;
        self.end_frame()
    }

    fn run_hook_pass(&mut self, hook: SystemHook) -> Result<()> {
        let order = self.plan.init_order().to_vec();
        for system in order {
            self.feed.update_queries(self.shared.as_ref(), &mut self.systems)?;
            run_hook(
                self.shared.as_ref(),
                &mut self.locals[0],
                &mut self.systems[system],
                hook,
                self.clock.time,
                self.clock.delta,
            )?;
            self.flush()?;
        }
        Ok(())
    }

    /// Marks the world finishing: any in-progress frame completes, the
    /// finalize hooks run in plan order, and further execution is refused.
    pub fn terminate(&mut self) -> Result<()> {
        if self.finished {
            return Err(CheckError::AlreadyTerminated.into());
        }
        if self.clock.in_frame {
            self.end_frame()?;
        }
        if matches!(self.plan, Plan::Simple { .. }) {
            self.run_hook_pass(SystemHook::Finalize)?;
        }
        self.finished = true;
        tracing::debug!(frames = self.clock.counter, "world terminated");
        Ok(())
    }

    pub fn stats(&self) -> WorldStats {
        WorldStats {
            entities_current: self.shared.entity_count(),
            entities_peak: self.shared.counts.entities_peak.load(Ordering::Acquire),
            max_limbo_components: self.shared.counts.limbo_peak.load(Ordering::Acquire) as usize,
            frames: self.clock.counter,
            max_shape_changes_observed: self.peak_shape,
            max_writes_observed: self.peak_writes,
        }
    }

    /// Verifies the world's structural invariants at a quiescent point.
    /// A test and debugging facility; failures are engine bugs.
    pub fn check_invariants(&self) -> Result<()> {
        let shared = self.shared.as_ref();
        let max = shared.settings.max_entities;
        let alive = &shared.types[0];

        for id in 1..=max {
            let is_alive = shared.shapes.has(ShapeView::Current, id, &alive.binding);
            let allocated = shared.entities.handle_for(id).ordinal() != 0;
            if is_alive != allocated {
                return Err(Error::Internal(InternalError::InvariantViolated(format!(
                    "entity {}: alive bit {} but pool allocation {}",
                    id, is_alive, allocated
                ))));
            }
        }

        for ty in &shared.types {
            if !matches!(ty.storage, StorageKind::Packed | StorageKind::Compact) {
                continue;
            }
            let column = &shared.columns[ty.id as usize];
            let mut rows = HashMap::new();
            for id in 1..=max {
                if let Some(row) = column.row_for(id) {
                    if let Some(other) = rows.insert(row, id) {
                        return Err(Error::Internal(InternalError::InvariantViolated(format!(
                            "component '{}': entities {} and {} share row {}",
                            ty.name, other, id, row
                        ))));
                    }
                }
                if shared.shapes.has(ShapeView::Current, id, &ty.binding)
                    && column.row_for(id).is_none()
                {
                    return Err(Error::Internal(InternalError::InvariantViolated(format!(
                        "component '{}': entity {} has the shape bit but no row",
                        ty.name, id
                    ))));
                }
            }
            let (live, _, _) = column.occupancy();
            if rows.len() as u32 != live {
                return Err(Error::Internal(InternalError::InvariantViolated(format!(
                    "component '{}': {} bound rows but {} live",
                    ty.name,
                    rows.len(),
                    live
                ))));
            }
        }

        for slot in &self.systems {
            for query in &slot.queries {
                if let Some(id) = query.find_membership_mismatch(shared) {
                    return Err(Error::Internal(InternalError::InvariantViolated(format!(
                        "system '{}': query membership disagrees with shape for entity {}",
                        slot.name, id
                    ))));
                }
            }
        }

        for ty in &shared.types {
            if !ty.has_refs() {
                continue;
            }
            let column = &shared.columns[ty.id as usize];
            for id in 1..=max {
                if !shared.shapes.has(ShapeView::Current, id, &ty.binding) {
                    continue;
                }
                let Some(row) = column.row_for(id) else { continue };
                let data = column.data();
                let base = row as usize * ty.layout.row_size as usize;
                for &seq in &ty.layout.ref_seqs {
                    let offset = ty.layout.fields[seq as usize].offset as usize;
                    let target = data.read_u32(base + offset);
                    if target != 0
                        && !self
                            .shared
                            .refs
                            .lock()
                            .unwrap()
                            .backrefs(target, GLOBAL_SELECTOR)
                            .contains(&id)
                    {
                        return Err(Error::Internal(InternalError::InvariantViolated(format!(
                            "entity {} refers to {} via '{}', but the tracker disagrees",
                            id, target, ty.name
                        ))));
                    }
                }
            }
        }
        Ok(())
    }

    /// Decomposes the world for the lane director.
    pub fn into_parts(self) -> WorldParts {
        WorldParts {
            shared: self.shared,
            locals: self.locals,
            systems: self.systems,
            groups: self.groups,
            graph: self.graph,
            plan: self.plan,
            removal_pointer: self.removal_pointer,
            clock: self.clock,
        }
    }
}

/// The pieces a lane director distributes across laborer threads.
pub struct WorldParts {
    pub shared: Arc<WorldShared>,
    pub locals: Vec<LaneLocal>,
    pub systems: Vec<SystemSlot>,
    pub groups: Vec<(String, Vec<usize>)>,
    pub graph: DependencyGraph,
    pub plan: Plan,
    pub removal_pointer: LogPointer,
    pub clock: FrameClock,
}
