//! World configuration.

use crate::defs::WorldDef;
use crate::entity::MAX_ENTITY_ID;
use crate::error::{CheckError, Result};
use crate::storage::StorageKind;

/// Options for constructing a world.
///
/// The `Option` limits derive their defaults from `max_entities` when left
/// unset, as documented per field.
pub struct WorldOptions {
    /// Component types, component enums, systems, and groups.
    pub defs: Vec<WorldDef>,
    /// Positive: exact lane count. Zero or negative: offset from the
    /// detected CPU count. One lane runs everything on the caller's thread.
    pub threads: i32,
    /// Maximum live entities (default 10 000).
    pub max_entities: u32,
    /// Removal-log capacity (default `ceil(max_entities / 5)`).
    pub max_limbo_components: Option<usize>,
    /// Shape-log capacity (default `max_entities * 2`).
    pub max_shape_changes_per_frame: Option<usize>,
    /// Write-log capacity (default `max_entities * 4`).
    pub max_writes_per_frame: Option<usize>,
    /// Ref-log capacity in entries (default `max_entities`).
    pub max_ref_changes_per_frame: Option<usize>,
    /// Storage for component types that don't pick one (default packed).
    pub default_component_storage: StorageKind,
}

impl Default for WorldOptions {
    fn default() -> Self {
        Self {
            defs: Vec::new(),
            threads: 1,
            max_entities: 10_000,
            max_limbo_components: None,
            max_shape_changes_per_frame: None,
            max_writes_per_frame: None,
            max_ref_changes_per_frame: None,
            default_component_storage: StorageKind::Packed,
        }
    }
}

/// Resolved limits, with every default applied.
#[derive(Debug, Clone)]
pub struct Settings {
    pub threads: usize,
    pub max_entities: u32,
    pub max_limbo_components: usize,
    pub max_shape_changes_per_frame: usize,
    pub max_writes_per_frame: usize,
    pub max_ref_changes_per_frame: usize,
    pub default_component_storage: StorageKind,
}

impl WorldOptions {
    pub(crate) fn resolve(&self) -> Result<Settings> {
        if self.max_entities == 0 || self.max_entities > MAX_ENTITY_ID {
            return Err(CheckError::InvalidOptions(format!(
                "max_entities must be between 1 and {}",
                MAX_ENTITY_ID
            ))
            .into());
        }
        let threads = if self.threads > 0 {
            self.threads as usize
        } else {
            let detected = std::thread::available_parallelism()
                .map(|n| n.get() as i32)
                .unwrap_or(1);
            (detected + self.threads).max(1) as usize
        };
        let max_entities = self.max_entities as usize;
        Ok(Settings {
            threads,
            max_entities: self.max_entities,
            max_limbo_components: self
                .max_limbo_components
                .unwrap_or(max_entities.div_ceil(5)),
            max_shape_changes_per_frame: self
                .max_shape_changes_per_frame
                .unwrap_or(max_entities * 2),
            max_writes_per_frame: self.max_writes_per_frame.unwrap_or(max_entities * 4),
            max_ref_changes_per_frame: self.max_ref_changes_per_frame.unwrap_or(max_entities),
            default_component_storage: self.default_component_storage,
        })
    }
}
