//! Column storage strategies.
//!
//! A column maps `(component type, entity id)` to a row of bytes. `Sparse`
//! storage indexes rows directly by entity id and never frees them. `Packed`
//! keeps a dense row array plus an id-to-row index of i8/i16/i32 (widened as
//! the column grows) and a freelist of spare rows. `Compact` shares the
//! packed implementation; a shrink pass would hook into `release_row`.
//!
//! Rows are recycled internally and never observed by queries, which list
//! entities rather than rows.

use std::sync::Mutex;

use crate::buffers::{BufferCell, Buffers, ElementKind};
use crate::component::ComponentType;
use crate::error::{CheckError, Error, InternalError, Result};

/// Storage strategy for a component type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Sparse,
    Packed,
    Compact,
}

struct PackedState {
    next_row: u32,
    capacity: u32,
    spares: Vec<u32>,
}

enum StorageImpl {
    Sparse,
    Packed {
        index: BufferCell,
        state: Mutex<PackedState>,
    },
}

/// One component type's column.
pub struct Column {
    type_id: u16,
    row_size: u32,
    data: BufferCell,
    data_key: String,
    index_key: String,
    storage: StorageImpl,
}

fn index_kind(capacity: u32) -> ElementKind {
    if capacity <= 1 << 7 {
        ElementKind::I8
    } else if capacity <= 1 << 15 {
        ElementKind::I16
    } else {
        ElementKind::I32
    }
}

impl Column {
    /// Initial dense capacity of a packed column before any growth.
    const INITIAL_ROWS: u32 = 8;

    pub fn new(ty: &ComponentType, buffers: &Buffers, max_entities: u32) -> Self {
        let row_size = ty.layout.row_size;
        let data_key = format!("component/{}/rows", ty.name);
        let index_key = format!("component/{}/index", ty.name);

        let storage = match ty.storage {
            StorageKind::Sparse => StorageImpl::Sparse,
            StorageKind::Packed | StorageKind::Compact => {
                let capacity = Self::INITIAL_ROWS.min(ty.capacity.unwrap_or(max_entities)).max(1);
                let index = buffers.register(
                    &index_key,
                    max_entities as usize + 1,
                    index_kind(capacity),
                    Some(-1),
                    None,
                    false,
                );
                StorageImpl::Packed {
                    index,
                    state: Mutex::new(PackedState {
                        next_row: 0,
                        capacity,
                        spares: Vec::new(),
                    }),
                }
            }
        };

        let rows = match &storage {
            StorageImpl::Sparse => max_entities as usize + 1,
            StorageImpl::Packed { state, .. } => state.lock().unwrap().capacity as usize,
        };
        let data = buffers.register(
            &data_key,
            (rows * row_size as usize).max(1),
            ElementKind::U8,
            None,
            None,
            false,
        );

        Self {
            type_id: ty.id,
            row_size,
            data,
            data_key,
            index_key,
            storage,
        }
    }

    pub fn row_size(&self) -> u32 {
        self.row_size
    }

    /// The current data buffer. Re-loaded at every bind so growth is
    /// observed without explicit rebinding.
    pub fn data(&self) -> std::sync::Arc<crate::buffers::RawBuffer> {
        self.data.load_full()
    }

    /// The row holding `id`, if one is bound.
    pub fn row_for(&self, id: u32) -> Option<u32> {
        match &self.storage {
            StorageImpl::Sparse => Some(id),
            StorageImpl::Packed { index, .. } => {
                let row = index.load().element_i32(id as usize);
                (row >= 0).then_some(row as u32)
            }
        }
    }

    /// Allocates a row for `id`, growing the column if the dense array is
    /// full. Growth may widen the index element kind, which re-registers
    /// the index buffer and patches every other lane.
    pub fn acquire_row(
        &self,
        ty: &ComponentType,
        id: u32,
        buffers: &Buffers,
        max_entities: u32,
        tracker: Option<usize>,
    ) -> Result<u32> {
        match &self.storage {
            StorageImpl::Sparse => Ok(id),
            StorageImpl::Packed { index, state } => {
                let mut state = state.lock().unwrap();
                let row = if let Some(spare) = state.spares.pop() {
                    spare
                } else {
                    if state.next_row == state.capacity {
                        let limit = ty.capacity.unwrap_or(max_entities);
                        if state.capacity >= limit {
                            return Err(CheckError::ComponentCapacityExceeded {
                                component: ty.name.clone(),
                                capacity: limit,
                            }
                            .into());
                        }
                        let grown = (state.capacity * 2).min(limit);
                        buffers.register(
                            &self.data_key,
                            (grown as usize * self.row_size as usize).max(1),
                            ElementKind::U8,
                            None,
                            tracker,
                            false,
                        );
                        if index_kind(grown) != index_kind(state.capacity) {
                            buffers.register(
                                &self.index_key,
                                max_entities as usize + 1,
                                index_kind(grown),
                                Some(-1),
                                tracker,
                                false,
                            );
                        }
                        tracing::debug!(
                            component = %ty.name,
                            capacity = grown,
                            "packed column grown"
                        );
                        state.capacity = grown;
                    }
                    let row = state.next_row;
                    state.next_row += 1;
                    row
                };
                index.load().set_element_i32(id as usize, row as i32);
                Ok(row)
            }
        }
    }

    /// Returns `id`'s row to the freelist. Sparse storage keeps rows in
    /// place.
    pub fn release_row(&self, id: u32) -> Result<()> {
        match &self.storage {
            StorageImpl::Sparse => Ok(()),
            StorageImpl::Packed { index, state } => {
                let slot = index.load().element_i32(id as usize);
                if slot < 0 {
                    return Err(Error::Internal(InternalError::MissingRow {
                        entity: id,
                        type_id: self.type_id,
                    }));
                }
                index.load().set_element_i32(id as usize, -1);
                state.lock().unwrap().spares.push(slot as u32);
                Ok(())
            }
        }
    }

    /// Copies the default row into place for a freshly acquired row.
    pub fn init_row(&self, row: u32, ty: &ComponentType) {
        if self.row_size > 0 {
            self.data()
                .write_bytes(row as usize * self.row_size as usize, &ty.layout.default_row);
        }
    }

    /// `(live rows, spare rows, capacity)`, for the invariant checker.
    pub fn occupancy(&self) -> (u32, u32, u32) {
        match &self.storage {
            StorageImpl::Sparse => (0, 0, 0),
            StorageImpl::Packed { state, .. } => {
                let state = state.lock().unwrap();
                (
                    state.next_row - state.spares.len() as u32,
                    state.spares.len() as u32,
                    state.capacity,
                )
            }
        }
    }
}
