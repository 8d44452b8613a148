//! Borrowed views over one component row.
//!
//! A view is bound for a single access and not retained across engine
//! calls. Readers take [`ComponentView`]; writers take [`ComponentViewMut`],
//! which logs tracked writes and ref-field transitions as it goes.

use std::sync::Arc;

use crate::buffers::RawBuffer;
use crate::entity::Entity;
use crate::error::{CheckError, Result};
use crate::pool::EntityPool;
use crate::refs::{self, RefAction};
use crate::world::LaneLocal;

use super::field::{FieldDef, FieldKind};
use super::ComponentType;

fn field_error(field: &FieldDef, requested: &'static str) -> crate::error::Error {
    CheckError::FieldTypeMismatch {
        field: field.name.clone(),
        actual: field.kind.label(),
        requested,
    }
    .into()
}

/// Read-only view of one component row.
pub struct ComponentView<'a> {
    ty: &'a ComponentType,
    pool: &'a EntityPool,
    data: Arc<RawBuffer>,
    base: usize,
}

impl<'a> ComponentView<'a> {
    pub(crate) fn new(
        ty: &'a ComponentType,
        pool: &'a EntityPool,
        data: Arc<RawBuffer>,
        row: u32,
    ) -> Self {
        let base = row as usize * ty.layout.row_size as usize;
        Self {
            ty,
            pool,
            data,
            base,
        }
    }

    fn field(&self, seq: usize) -> &'a FieldDef {
        &self.ty.layout.fields[seq]
    }

    pub fn get_bool(&self, seq: usize) -> Result<bool> {
        let field = self.field(seq);
        match field.kind {
            FieldKind::Bool => {
                Ok(self.data.read_u8(self.base + field.offset as usize) & (1 << field.bit) != 0)
            }
            _ => Err(field_error(field, "bool")),
        }
    }

    pub fn get_int(&self, seq: usize) -> Result<i64> {
        let field = self.field(seq);
        let at = self.base + field.offset as usize;
        match field.kind {
            FieldKind::I8 => Ok(self.data.read_i8(at) as i64),
            FieldKind::U8 => Ok(self.data.read_u8(at) as i64),
            FieldKind::I16 => Ok(self.data.read_i16(at) as i64),
            FieldKind::U16 => Ok(self.data.read_u16(at) as i64),
            FieldKind::I32 => Ok(self.data.read_i32(at) as i64),
            FieldKind::U32 => Ok(self.data.read_u32(at) as i64),
            _ => Err(field_error(field, "integer")),
        }
    }

    pub fn get_f32(&self, seq: usize) -> Result<f32> {
        let field = self.field(seq);
        match field.kind {
            FieldKind::F32 => Ok(self.data.read_f32(self.base + field.offset as usize)),
            _ => Err(field_error(field, "f32")),
        }
    }

    pub fn get_f64(&self, seq: usize) -> Result<f64> {
        let field = self.field(seq);
        match field.kind {
            FieldKind::F64 => Ok(self.data.read_f64(self.base + field.offset as usize)),
            _ => Err(field_error(field, "f64")),
        }
    }

    /// The current choice of a static string field.
    pub fn get_static(&self, seq: usize) -> Result<&'a str> {
        let field = self.field(seq);
        let at = self.base + field.offset as usize;
        match &field.kind {
            FieldKind::StaticString { choices } => {
                let index = if choices.len() <= u8::MAX as usize {
                    self.data.read_u8(at) as usize
                } else {
                    self.data.read_u16(at) as usize
                };
                Ok(choices[index.min(choices.len() - 1)].as_str())
            }
            _ => Err(field_error(field, "static string")),
        }
    }

    /// Copies out the value of a dynamic string field.
    pub fn get_string(&self, seq: usize) -> Result<String> {
        let field = self.field(seq);
        let at = self.base + field.offset as usize;
        match field.kind {
            FieldKind::DynamicString { max_bytes } => {
                let len = (self.data.read_u16(at) as usize).min(max_bytes as usize);
                let mut bytes = vec![0u8; len];
                self.data.read_bytes(at + 2, &mut bytes);
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ => Err(field_error(field, "dynamic string")),
        }
    }

    /// The referenced entity, or `None` for a null ref.
    pub fn get_ref(&self, seq: usize) -> Result<Option<Entity>> {
        let field = self.field(seq);
        match field.kind {
            FieldKind::Ref => {
                let id = self.data.read_u32(self.base + field.offset as usize);
                Ok((id != 0).then(|| self.pool.handle_for(id)))
            }
            _ => Err(field_error(field, "ref")),
        }
    }
}

/// Writable view of one component row.
pub struct ComponentViewMut<'a> {
    ty: &'a ComponentType,
    pool: &'a EntityPool,
    data: Arc<RawBuffer>,
    base: usize,
    entity_id: u32,
    local: &'a mut LaneLocal,
    /// Initial-value writes (during add) are not logged; only mutations of
    /// settled components feed the write log and changed queries.
    log_writes: bool,
}

impl<'a> ComponentViewMut<'a> {
    pub(crate) fn new(
        ty: &'a ComponentType,
        pool: &'a EntityPool,
        data: Arc<RawBuffer>,
        row: u32,
        entity_id: u32,
        local: &'a mut LaneLocal,
        log_writes: bool,
    ) -> Self {
        let base = row as usize * ty.layout.row_size as usize;
        Self {
            ty,
            pool,
            data,
            base,
            entity_id,
            local,
            log_writes,
        }
    }

    /// A read view over the same row.
    pub fn read(&self) -> ComponentView<'_> {
        ComponentView {
            ty: self.ty,
            pool: self.pool,
            data: self.data.clone(),
            base: self.base,
        }
    }

    fn field(&self, seq: usize) -> &'a FieldDef {
        &self.ty.layout.fields[seq]
    }

    fn note_write(&mut self) -> Result<()> {
        if self.log_writes && self.ty.tracks_writes {
            self.local
                .write_corral
                .push(crate::entity::pack_entry(self.entity_id, self.ty.id))?;
        }
        Ok(())
    }

    pub fn set_bool(&mut self, seq: usize, value: bool) -> Result<()> {
        let field = self.field(seq);
        match field.kind {
            FieldKind::Bool => {
                let at = self.base + field.offset as usize;
                let byte = self.data.read_u8(at);
                let byte = if value {
                    byte | (1 << field.bit)
                } else {
                    byte & !(1 << field.bit)
                };
                self.data.write_u8(at, byte);
                self.note_write()
            }
            _ => Err(field_error(field, "bool")),
        }
    }

    pub fn set_int(&mut self, seq: usize, value: i64) -> Result<()> {
        let field = self.field(seq);
        let at = self.base + field.offset as usize;
        match field.kind {
            FieldKind::I8 => self.data.write_i8(at, value as i8),
            FieldKind::U8 => self.data.write_u8(at, value as u8),
            FieldKind::I16 => self.data.write_i16(at, value as i16),
            FieldKind::U16 => self.data.write_u16(at, value as u16),
            FieldKind::I32 => self.data.write_i32(at, value as i32),
            FieldKind::U32 => self.data.write_u32(at, value as u32),
            _ => return Err(field_error(field, "integer")),
        }
        self.note_write()
    }

    pub fn set_f32(&mut self, seq: usize, value: f32) -> Result<()> {
        let field = self.field(seq);
        match field.kind {
            FieldKind::F32 => {
                self.data.write_f32(self.base + field.offset as usize, value);
                self.note_write()
            }
            _ => Err(field_error(field, "f32")),
        }
    }

    pub fn set_f64(&mut self, seq: usize, value: f64) -> Result<()> {
        let field = self.field(seq);
        match field.kind {
            FieldKind::F64 => {
                self.data.write_f64(self.base + field.offset as usize, value);
                self.note_write()
            }
            _ => Err(field_error(field, "f64")),
        }
    }

    pub fn set_static(&mut self, seq: usize, value: &str) -> Result<()> {
        let field = self.field(seq);
        let at = self.base + field.offset as usize;
        match &field.kind {
            FieldKind::StaticString { choices } => {
                let index =
                    choices
                        .iter()
                        .position(|c| c == value)
                        .ok_or_else(|| CheckError::UnknownChoice {
                            field: field.name.clone(),
                            value: value.to_string(),
                        })?;
                if choices.len() <= u8::MAX as usize {
                    self.data.write_u8(at, index as u8);
                } else {
                    self.data.write_u16(at, index as u16);
                }
                self.note_write()
            }
            _ => Err(field_error(field, "static string")),
        }
    }

    pub fn set_string(&mut self, seq: usize, value: &str) -> Result<()> {
        let field = self.field(seq);
        let at = self.base + field.offset as usize;
        match field.kind {
            FieldKind::DynamicString { max_bytes } => {
                if value.len() > max_bytes as usize {
                    return Err(CheckError::StringTooLong {
                        field: field.name.clone(),
                        limit: max_bytes as usize,
                        len: value.len(),
                    }
                    .into());
                }
                self.data.write_u16(at, value.len() as u16);
                self.data.write_bytes(at + 2, value.as_bytes());
                self.note_write()
            }
            _ => Err(field_error(field, "dynamic string")),
        }
    }

    /// Points the ref field at `target` (or null). A change of target logs
    /// an unreference of the old target with the release flag (the old
    /// edge is fully gone, stale trackers included) and a reference to the
    /// new one.
    pub fn set_ref(&mut self, seq: usize, target: Option<Entity>) -> Result<()> {
        let field = self.field(seq);
        if field.kind != FieldKind::Ref {
            return Err(field_error(field, "ref"));
        }
        if let Some(target) = target {
            self.pool.check_valid(target)?;
        }
        let at = self.base + field.offset as usize;
        let old = self.data.read_u32(at);
        let new = target.map(|e| e.id()).unwrap_or(0);
        if old == new {
            return Ok(());
        }
        self.data.write_u32(at, new);
        if old != 0 {
            let (w0, w1) = refs::encode_entry(
                RefAction::UnreferenceRelease,
                self.entity_id,
                field.seq,
                self.ty.id,
                old,
            );
            self.local.ref_corral.push_pair(w0, w1)?;
        }
        if new != 0 {
            let (w0, w1) = refs::encode_entry(
                RefAction::Reference,
                self.entity_id,
                field.seq,
                self.ty.id,
                new,
            );
            self.local.ref_corral.push_pair(w0, w1)?;
        }
        self.note_write()
    }
}
