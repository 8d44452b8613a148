//! Entity lifecycle and shape mutation.
//!
//! These operations live on [`WorldShared`] so any lane can run them against
//! its own corral set. Removal is two-phase: clearing a shape bit stages a
//! removal-log entry, and finalisation happens at cycle end in
//! [`WorldShared::complete_cycle`], unless the component was re-added (or
//! the entry superseded by a second removal) in the meantime. Between the
//! two phases the component is in limbo: its row stays allocated and its
//! stale shape bit stays set.

use std::sync::atomic::Ordering;

use crate::component::ComponentType;
use crate::entity::{pack_entry, unpack_entry, Entity, ALIVE_TYPE_ID};
use crate::error::{CheckError, Error, InternalError, Result};
use crate::log::LogPointer;
use crate::mask::TypeMask;
use crate::refs::{self, RefAction};
use crate::shape::ShapeView;
use crate::world::{LaneLocal, WorldShared};

/// What one end-of-cycle reclamation pass did.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    /// Removal-log entries pending when the cycle completed.
    pub limbo: usize,
    /// Components finalised.
    pub finalized: usize,
    /// Entity ids returned to the pool.
    pub reclaimed: u32,
}

impl WorldShared {
    pub fn type_id(&self, name: &str) -> Result<u16> {
        self.type_names
            .get(name)
            .copied()
            .ok_or_else(|| CheckError::UnknownComponentType(name.to_string()).into())
    }

    pub fn component_type(&self, type_id: u16) -> Result<&ComponentType> {
        self.types
            .get(type_id as usize)
            .ok_or_else(|| Error::Internal(InternalError::UnknownTypeId(type_id)))
    }

    /// Live entities (including those in limbo until reclamation).
    pub fn entity_count(&self) -> u32 {
        self.entities.outstanding()
    }

    /// Allocates an entity: pool draw, alive bit, shape-log entry. The
    /// handle is a transient borrow noted in the lane until its flush.
    pub fn create_entity(&self, local: &mut LaneLocal) -> Result<Entity> {
        let alive = &self.types[ALIVE_TYPE_ID as usize];
        let entity = self.entities.borrow()?;
        local.shape_corral.push(pack_entry(entity.id, ALIVE_TYPE_ID))?;
        self.shapes.install(ShapeView::Current, entity.id, &alive.binding);
        self.shapes
            .install(ShapeView::Stale, entity.id, &alive.flag_binding);
        local.borrows.push(entity.id);
        self.counts
            .entities_peak
            .fetch_max(self.entities.outstanding(), Ordering::AcqRel);
        Ok(entity)
    }

    pub fn has_component(&self, entity: Entity, type_id: u16) -> Result<bool> {
        self.entities.check_valid(entity)?;
        let ty = self.component_type(type_id)?;
        Ok(self.shapes.has(ShapeView::Current, entity.id, &ty.binding))
    }

    /// Whether the component is reachable under recently-deleted access.
    pub fn has_component_stale(&self, entity: Entity, type_id: u16) -> Result<bool> {
        self.entities.check_valid(entity)?;
        let ty = self.component_type(type_id)?;
        Ok(self
            .shapes
            .has(ShapeView::Stale, entity.id, &ty.flag_binding))
    }

    /// Adds a component, with defaults in every field. Adding an enum
    /// member displaces a sibling already in the slot, which follows the
    /// regular removal path.
    pub fn add_component(&self, local: &mut LaneLocal, entity: Entity, type_id: u16) -> Result<()> {
        self.entities.check_valid(entity)?;
        let ty = self.component_type(type_id)?;
        let id = entity.id;

        if self.shapes.has(ShapeView::Current, id, &ty.binding) {
            return Err(CheckError::DuplicateComponent {
                entity: id,
                component: ty.name.clone(),
            }
            .into());
        }

        // An occupied enum slot names the sibling about to be displaced.
        let slot = self.shapes.slot_value(ShapeView::Current, id, &ty.binding);
        let displaced = ty.displaced_sibling(slot);

        local.shape_corral.push(pack_entry(id, type_id))?;
        if let Some(sibling_id) = displaced {
            local.shape_corral.push(pack_entry(id, sibling_id))?;
            local.removal_corral.push(pack_entry(id, sibling_id))?;
        }

        if let Some(sibling_id) = displaced {
            let sibling = &self.types[sibling_id as usize];
            self.shapes
                .install(ShapeView::RemovedThisCycle, id, &sibling.flag_binding);
            if sibling.has_refs() {
                self.log_unreferences(local, id, sibling)?;
            }
        }

        self.shapes.install(ShapeView::Current, id, &ty.binding);
        self.shapes.install(ShapeView::Stale, id, &ty.flag_binding);
        let was_limbo = self.shapes.clear(ShapeView::RemovedThisCycle, id, &ty.flag_binding);

        let column = &self.columns[type_id as usize];
        // A component re-added while in limbo keeps its row.
        let row = match column.row_for(id).filter(|_| was_limbo) {
            Some(row) => row,
            None => column.acquire_row(
                ty,
                id,
                &self.buffers,
                self.settings.max_entities,
                Some(local.lane),
            )?,
        };
        column.init_row(row, ty);
        Ok(())
    }

    /// Adds several components at once, rejecting two members of one enum.
    pub fn add_all(&self, local: &mut LaneLocal, entity: Entity, type_ids: &[u16]) -> Result<()> {
        for (i, &a) in type_ids.iter().enumerate() {
            for &b in &type_ids[i + 1..] {
                let (ta, tb) = (self.component_type(a)?, self.component_type(b)?);
                if let (Some(group), Some(other)) = (&ta.enum_name, &tb.enum_name) {
                    if group == other {
                        return Err(CheckError::EnumConflict {
                            group: group.clone(),
                            first: ta.name.clone(),
                            second: tb.name.clone(),
                        }
                        .into());
                    }
                }
            }
        }
        for &type_id in type_ids {
            self.add_component(local, entity, type_id)?;
        }
        Ok(())
    }

    /// First phase of removal: the current bit clears, the removal log
    /// gains an entry, and the component enters limbo.
    pub fn remove_component(
        &self,
        local: &mut LaneLocal,
        entity: Entity,
        type_id: u16,
    ) -> Result<()> {
        self.entities.check_valid(entity)?;
        if type_id == ALIVE_TYPE_ID {
            return Err(CheckError::ReservedComponent("Alive".to_string()).into());
        }
        self.remove_component_unchecked(local, entity.id, type_id)
    }

    fn remove_component_unchecked(
        &self,
        local: &mut LaneLocal,
        id: u32,
        type_id: u16,
    ) -> Result<()> {
        let ty = self.component_type(type_id)?;
        if !self.shapes.has(ShapeView::Current, id, &ty.binding) {
            return Err(CheckError::MissingComponent {
                entity: id,
                component: ty.name.clone(),
            }
            .into());
        }
        local.shape_corral.push(pack_entry(id, type_id))?;
        local.removal_corral.push(pack_entry(id, type_id))?;
        self.shapes.clear(ShapeView::Current, id, &ty.binding);
        self.shapes
            .install(ShapeView::RemovedThisCycle, id, &ty.flag_binding);
        if ty.has_refs() {
            self.log_unreferences(local, id, ty)?;
        }
        Ok(())
    }

    /// Deletes an entity: every component follows the removal path, the
    /// alive bit clears, and the target's live inbound edges release so
    /// their source fields read as null for the rest of the cycle. Stale
    /// trackers keep the edges until finalisation.
    pub fn delete_entity(&self, local: &mut LaneLocal, entity: Entity) -> Result<()> {
        self.entities.check_valid(entity)?;
        let id = entity.id;
        for type_id in 1..self.types.len() as u16 {
            let ty = &self.types[type_id as usize];
            if self.shapes.has(ShapeView::Current, id, &ty.binding) {
                self.remove_component_unchecked(local, id, type_id)?;
            }
        }
        let alive = &self.types[ALIVE_TYPE_ID as usize];
        local.shape_corral.push(pack_entry(id, ALIVE_TYPE_ID))?;
        local.removal_corral.push(pack_entry(id, ALIVE_TYPE_ID))?;
        self.shapes.clear(ShapeView::Current, id, &alive.binding);
        self.shapes
            .install(ShapeView::RemovedThisCycle, id, &alive.flag_binding);
        self.refs.lock().unwrap().clear_all_refs(self, id, false)?;
        Ok(())
    }

    /// Logs the outbound edges of a component entering limbo. No release
    /// flag: stale trackers keep the source listed until finalisation.
    fn log_unreferences(&self, local: &mut LaneLocal, id: u32, ty: &ComponentType) -> Result<()> {
        let column = &self.columns[ty.id as usize];
        let Some(row) = column.row_for(id) else {
            return Err(Error::Internal(InternalError::MissingRow {
                entity: id,
                type_id: ty.id,
            }));
        };
        let data = column.data();
        let base = row as usize * ty.layout.row_size as usize;
        for &seq in &ty.layout.ref_seqs {
            let offset = ty.layout.fields[seq as usize].offset as usize;
            let target = data.read_u32(base + offset);
            if target != 0 {
                let (w0, w1) =
                    refs::encode_entry(RefAction::Unreference, id, seq, ty.id, target);
                local.ref_corral.push_pair(w0, w1)?;
            }
        }
        Ok(())
    }

    /// Nulls a ref field if it still points at `expected`. Called by the
    /// indexer when a target's inbound edges are cleared; silently skips
    /// sources whose row is already gone.
    pub(crate) fn clear_ref_field(
        &self,
        src: u32,
        src_type: u16,
        seq: u8,
        expected: u32,
    ) -> Result<()> {
        let ty = self.component_type(src_type)?;
        let column = &self.columns[src_type as usize];
        let Some(row) = column.row_for(src) else {
            return Ok(());
        };
        let offset = ty.layout.fields[seq as usize].offset as usize;
        let at = row as usize * ty.layout.row_size as usize + offset;
        let data = column.data();
        if data.read_u32(at) == expected {
            data.write_u32(at, 0);
        }
        Ok(())
    }

    /// Evaluates a query's clauses against the live shape.
    pub fn match_shape(
        &self,
        id: u32,
        with: &TypeMask,
        without: &TypeMask,
        with_any: &[TypeMask],
    ) -> bool {
        for type_id in with.ones() {
            if !self
                .shapes
                .has(ShapeView::Current, id, &self.types[type_id as usize].binding)
            {
                return false;
            }
        }
        for type_id in without.ones() {
            if self
                .shapes
                .has(ShapeView::Current, id, &self.types[type_id as usize].binding)
            {
                return false;
            }
        }
        for mask in with_any {
            let hit = mask.ones().any(|type_id| {
                self.shapes
                    .has(ShapeView::Current, id, &self.types[type_id as usize].binding)
            });
            if !hit {
                return false;
            }
        }
        true
    }

    /// Stages a write-log entry for a tracked field assignment.
    pub fn track_write(&self, local: &mut LaneLocal, id: u32, type_id: u16) -> Result<()> {
        local.write_corral.push(pack_entry(id, type_id))
    }

    /// Flush point: commits the lane's corrals and drains its transient
    /// entity borrows.
    pub fn flush(&self, local: &mut LaneLocal) -> Result<()> {
        self.shape_log.commit(&mut local.shape_corral)?;
        self.write_log.commit(&mut local.write_corral)?;
        self.removal_log.commit(&mut local.removal_corral)?;
        self.ref_log.commit(&mut local.ref_corral)?;
        local.borrows.clear();
        Ok(())
    }

    /// End-of-cycle reclamation: drains the ref log, finalises removals
    /// that were not re-added, releases refs with the release flag, and
    /// returns deleted entity ids to the pool.
    pub fn complete_cycle(
        &self,
        local: &mut LaneLocal,
        removal_pointer: &mut LogPointer,
    ) -> Result<CycleReport> {
        let mut indexer = self.refs.lock().unwrap();
        indexer.drain(self, local)?;

        let mut report = CycleReport {
            limbo: self.removal_log.count_since(removal_pointer)?,
            ..CycleReport::default()
        };
        self.counts
            .limbo_peak
            .fetch_max(report.limbo as u32, Ordering::AcqRel);

        let mut entries = Vec::with_capacity(report.limbo);
        self.removal_log.drain(removal_pointer, |entry| {
            entries.push(entry);
            Ok(())
        })?;

        for entry in entries {
            let (id, type_id) = unpack_entry(entry);
            let ty = self.component_type(type_id)?;
            if self.shapes.has(ShapeView::Current, id, &ty.binding) {
                // Re-added during the cycle; not finalised.
                continue;
            }
            if !self
                .shapes
                .clear(ShapeView::RemovedThisCycle, id, &ty.flag_binding)
            {
                // Already finalised through an earlier entry.
                continue;
            }
            self.shapes.clear(ShapeView::Stale, id, &ty.flag_binding);
            report.finalized += 1;

            if type_id == ALIVE_TYPE_ID {
                indexer.clear_all_refs(self, id, true)?;
                self.entities.reclaim(id)?;
                report.reclaimed += 1;
            } else {
                self.release_component(local, id, ty)?;
            }
        }

        // Releases staged during finalisation drop sources from the stale
        // trackers.
        indexer.drain(self, local)?;
        tracing::trace!(
            limbo = report.limbo,
            finalized = report.finalized,
            reclaimed = report.reclaimed,
            "cycle completed"
        );
        Ok(report)
    }

    /// Finalises one component: outbound refs release fully, fields null
    /// out, and the row returns to the column.
    fn release_component(
        &self,
        local: &mut LaneLocal,
        id: u32,
        ty: &ComponentType,
    ) -> Result<()> {
        let column = &self.columns[ty.id as usize];
        if ty.has_refs() {
            if let Some(row) = column.row_for(id) {
                let data = column.data();
                let base = row as usize * ty.layout.row_size as usize;
                for &seq in &ty.layout.ref_seqs {
                    let offset = ty.layout.fields[seq as usize].offset as usize;
                    let target = data.read_u32(base + offset);
                    if target != 0 {
                        let (w0, w1) = refs::encode_entry(
                            RefAction::UnreferenceRelease,
                            id,
                            seq,
                            ty.id,
                            target,
                        );
                        local.ref_corral.push_pair(w0, w1)?;
                        data.write_u32(base + offset, 0);
                    }
                }
            }
        }
        column.release_row(id)
    }
}
