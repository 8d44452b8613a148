//! System behaviour, access rights, and the per-call context.

use crate::component::{ComponentView, ComponentViewMut};
use crate::entity::Entity;
use crate::error::{CheckError, Error, InternalError, Result};
use crate::mask::TypeMask;
use crate::query::{QueryFlavor, QueryState};
use crate::refs::GLOBAL_SELECTOR;
use crate::shape::ShapeView;
use crate::world::{LaneLocal, WorldShared};

/// A system's declared access rights, one mask per right.
#[derive(Debug, Clone)]
pub struct AccessMasks {
    pub read: TypeMask,
    pub write: TypeMask,
    pub create: TypeMask,
    pub update: TypeMask,
    pub check: TypeMask,
}

impl AccessMasks {
    pub fn empty(type_count: usize) -> Self {
        Self {
            read: TypeMask::new(type_count),
            write: TypeMask::new(type_count),
            create: TypeMask::new(type_count),
            update: TypeMask::new(type_count),
            check: TypeMask::new(type_count),
        }
    }

    /// Every right on every type; the world's own context uses this.
    pub fn all(type_count: usize) -> Self {
        let full = TypeMask::from_ids(type_count, 0..type_count as u16);
        Self {
            read: full.clone(),
            write: full.clone(),
            create: full.clone(),
            update: full.clone(),
            check: full,
        }
    }

    /// Types this system may write, including through creation or shape
    /// changes; what the planner treats as a write for conflicts.
    pub fn writeish(&self) -> TypeMask {
        let mut mask = self.write.clone();
        mask.union_with(&self.create);
        mask.union_with(&self.update);
        mask
    }

    fn can_view(&self, type_id: u16) -> bool {
        self.read.contains(type_id)
            || self.write.contains(type_id)
            || self.create.contains(type_id)
            || self.update.contains(type_id)
    }

    fn can_mutate(&self, type_id: u16) -> bool {
        self.write.contains(type_id)
            || self.create.contains(type_id)
            || self.update.contains(type_id)
    }

    fn can_structure(&self, type_id: u16) -> bool {
        self.create.contains(type_id) || self.update.contains(type_id)
    }

    fn can_sense(&self, type_id: u16) -> bool {
        self.can_view(type_id) || self.check.contains(type_id)
    }
}

/// The behaviour of a system. The scheduler drives the four hooks; only
/// `execute` runs every frame.
pub trait SystemLogic: Send {
    fn prepare(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn initialize(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn execute(&mut self, ctx: &mut SystemCtx) -> Result<()>;

    fn finalize(&mut self, ctx: &mut SystemCtx) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// A sealed system: behaviour plus everything resolved at world build.
pub struct SystemSlot {
    pub name: String,
    pub logic: Box<dyn SystemLogic>,
    pub access: AccessMasks,
    pub queries: Vec<QueryState>,
    pub weight: f64,
    pub stateless: bool,
    pub lane: usize,
}

/// Which hook a plan is invoking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemHook {
    Prepare,
    Initialize,
    Execute,
    Finalize,
}

/// What a system sees while one of its hooks runs: its queries, its access
/// rights, its lane's corrals, and the frame clock.
pub struct SystemCtx<'a> {
    shared: &'a WorldShared,
    local: &'a mut LaneLocal,
    queries: &'a mut [QueryState],
    access: &'a AccessMasks,
    system: &'a str,
    time: f64,
    delta: f64,
}

impl<'a> SystemCtx<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shared: &'a WorldShared,
        local: &'a mut LaneLocal,
        queries: &'a mut [QueryState],
        access: &'a AccessMasks,
        system: &'a str,
        time: f64,
        delta: f64,
    ) -> Self {
        Self {
            shared,
            local,
            queries,
            access,
            system,
            time,
            delta,
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn type_id(&self, name: &str) -> Result<u16> {
        self.shared.type_id(name)
    }

    fn undeclared(&self, type_id: u16) -> Error {
        CheckError::UndeclaredAccess {
            system: self.system.to_string(),
            component: self
                .shared
                .types
                .get(type_id as usize)
                .map(|t| t.name.clone())
                .unwrap_or_else(|| format!("#{}", type_id)),
        }
        .into()
    }

    pub fn create_entity(&mut self) -> Result<Entity> {
        self.shared.create_entity(self.local)
    }

    pub fn delete_entity(&mut self, entity: Entity) -> Result<()> {
        self.shared.delete_entity(self.local, entity)
    }

    pub fn add(&mut self, entity: Entity, type_id: u16) -> Result<()> {
        if !self.access.can_structure(type_id) {
            return Err(self.undeclared(type_id));
        }
        self.shared.add_component(self.local, entity, type_id)
    }

    /// Adds a component and initialises fields through the closure. The
    /// initial values do not count as tracked writes.
    pub fn add_with(
        &mut self,
        entity: Entity,
        type_id: u16,
        init: impl FnOnce(&mut ComponentViewMut) -> Result<()>,
    ) -> Result<()> {
        self.add(entity, type_id)?;
        let mut view = self.bind_inner(entity, type_id, false)?;
        init(&mut view)
    }

    pub fn add_all(&mut self, entity: Entity, type_ids: &[u16]) -> Result<()> {
        for &type_id in type_ids {
            if !self.access.can_structure(type_id) {
                return Err(self.undeclared(type_id));
            }
        }
        self.shared.add_all(self.local, entity, type_ids)
    }

    pub fn remove(&mut self, entity: Entity, type_id: u16) -> Result<()> {
        if !self.access.can_structure(type_id) {
            return Err(self.undeclared(type_id));
        }
        self.shared.remove_component(self.local, entity, type_id)
    }

    pub fn has(&self, entity: Entity, type_id: u16) -> Result<bool> {
        if !self.access.can_sense(type_id) {
            return Err(self.undeclared(type_id));
        }
        self.shared.has_component(entity, type_id)
    }

    /// Read access to a component row.
    pub fn bind(&self, entity: Entity, type_id: u16) -> Result<ComponentView<'_>> {
        if !self.access.can_view(type_id) {
            return Err(self.undeclared(type_id));
        }
        self.shared.entities.check_valid(entity)?;
        let ty = self.shared.component_type(type_id)?;
        if !self
            .shared
            .shapes
            .has(ShapeView::Current, entity.id, &ty.binding)
        {
            return Err(CheckError::MissingComponent {
                entity: entity.id,
                component: ty.name.clone(),
            }
            .into());
        }
        let column = &self.shared.columns[type_id as usize];
        let row = column.row_for(entity.id).ok_or(Error::Internal(
            InternalError::MissingRow {
                entity: entity.id,
                type_id,
            },
        ))?;
        Ok(ComponentView::new(
            ty,
            &self.shared.entities,
            column.data(),
            row,
        ))
    }

    /// Read access to a component removed this cycle but not yet
    /// finalised.
    pub fn bind_recently_deleted(&self, entity: Entity, type_id: u16) -> Result<ComponentView<'_>> {
        if !self.access.can_view(type_id) {
            return Err(self.undeclared(type_id));
        }
        self.shared.entities.check_valid(entity)?;
        let ty = self.shared.component_type(type_id)?;
        if !self
            .shared
            .shapes
            .has(ShapeView::Stale, entity.id, &ty.flag_binding)
        {
            return Err(CheckError::MissingComponent {
                entity: entity.id,
                component: ty.name.clone(),
            }
            .into());
        }
        let column = &self.shared.columns[type_id as usize];
        let row = column.row_for(entity.id).ok_or(Error::Internal(
            InternalError::MissingRow {
                entity: entity.id,
                type_id,
            },
        ))?;
        Ok(ComponentView::new(
            ty,
            &self.shared.entities,
            column.data(),
            row,
        ))
    }

    /// Write access to a component row; assignments to tracked fields feed
    /// the write log.
    pub fn bind_mut(&mut self, entity: Entity, type_id: u16) -> Result<ComponentViewMut<'_>> {
        if !self.access.can_mutate(type_id) {
            return Err(self.undeclared(type_id));
        }
        self.bind_inner(entity, type_id, true)
    }

    fn bind_inner(
        &mut self,
        entity: Entity,
        type_id: u16,
        log_writes: bool,
    ) -> Result<ComponentViewMut<'_>> {
        self.shared.entities.check_valid(entity)?;
        let ty = self.shared.component_type(type_id)?;
        if !self
            .shared
            .shapes
            .has(ShapeView::Current, entity.id, &ty.binding)
        {
            return Err(CheckError::MissingComponent {
                entity: entity.id,
                component: ty.name.clone(),
            }
            .into());
        }
        let column = &self.shared.columns[type_id as usize];
        let row = column.row_for(entity.id).ok_or(Error::Internal(
            InternalError::MissingRow {
                entity: entity.id,
                type_id,
            },
        ))?;
        Ok(ComponentViewMut::new(
            ty,
            &self.shared.entities,
            column.data(),
            row,
            entity.id,
            self.local,
            log_writes,
        ))
    }

    /// The entities currently in one of the system's query lists.
    pub fn entities(&mut self, query: usize, flavor: QueryFlavor) -> Result<Vec<Entity>> {
        let ids = self.queries[query].entity_ids(self.shared, flavor)?;
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
}

/// Runs one hook of a system with a context assembled from its parts.
#[allow(clippy::too_many_arguments)]
pub fn run_hook(
    shared: &WorldShared,
    local: &mut LaneLocal,
    slot: &mut SystemSlot,
    hook: SystemHook,
    time: f64,
    delta: f64,
) -> Result<()> {
    let SystemSlot {
        name,
        logic,
        access,
        queries,
        ..
    } = slot;
    let mut ctx = SystemCtx::new(shared, local, queries, access, name, time, delta);
    match hook {
        SystemHook::Prepare => logic.prepare(&mut ctx),
        SystemHook::Initialize => logic.initialize(&mut ctx),
        SystemHook::Execute => logic.execute(&mut ctx),
        SystemHook::Finalize => logic.finalize(&mut ctx),
    }
}
