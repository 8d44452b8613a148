//! Component type descriptors, row layout, and row views.

mod field;
mod layout;
mod view;

pub use field::{FieldDef, FieldKind, FieldSpec, FieldValue};
pub use layout::RowLayout;
pub use view::{ComponentView, ComponentViewMut};

use crate::error::Result;
use crate::shape::ShapeBinding;
use crate::storage::StorageKind;

/// A sealed component type descriptor, created once at world construction.
#[derive(Debug)]
pub struct ComponentType {
    pub id: u16,
    pub name: String,
    pub storage: StorageKind,
    /// Hard row-count bound for packed and compact storage.
    pub capacity: Option<u32>,
    pub tracks_writes: bool,
    pub internally_indexed: bool,
    pub restricted_to_main_thread: bool,
    /// Where this type lives inside the `current` shape words (enum members
    /// share a multi-bit slot here).
    pub binding: ShapeBinding,
    /// The type's private bit in the stale and removed-this-cycle arrays.
    pub flag_binding: ShapeBinding,
    /// For enum members: the group's member type ids, where the member at
    /// index `k` occupies slot value `k + 1`. Empty for plain types.
    pub siblings: Vec<u16>,
    /// The enum group's name, for conflict diagnostics.
    pub enum_name: Option<String>,
    pub layout: RowLayout,
}

impl ComponentType {
    pub fn has_refs(&self) -> bool {
        !self.layout.ref_seqs.is_empty()
    }

    /// Resolves a field name to its sequence number.
    pub fn field_seq(&self, name: &str) -> Result<usize> {
        self.layout.field_seq(&self.name, name)
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.layout.fields
    }

    /// The sibling displaced by installing this member, given the previous
    /// slot value reported by the shape array.
    pub(crate) fn displaced_sibling(&self, previous_slot_value: u32) -> Option<u16> {
        if previous_slot_value == 0 || previous_slot_value == self.binding.value >> self.binding.mask.trailing_zeros() {
            return None;
        }
        self.siblings.get(previous_slot_value as usize - 1).copied()
    }
}
