//! Row layout computation.
//!
//! Fields are placed at fixed byte offsets in declaration order, padded to
//! their natural alignment; booleans pack into shared bytes, eight to a
//! byte. The row size is padded to the row's widest alignment so packed
//! columns stay aligned.

use crate::error::{CheckError, Result};

use super::field::{FieldDef, FieldKind, FieldSpec, FieldValue};

/// The sealed layout of one component row.
#[derive(Debug, Clone)]
pub struct RowLayout {
    pub fields: Vec<FieldDef>,
    pub row_size: u32,
    /// A row's bytes with every field at its default, copied on add.
    pub default_row: Vec<u8>,
    /// Sequence numbers of ref fields, scanned on removal.
    pub ref_seqs: Vec<u8>,
}

impl RowLayout {
    pub fn compute(component: &str, specs: &[FieldSpec]) -> Result<Self> {
        if specs.len() > crate::entity::MAX_FIELDS_PER_TYPE {
            return Err(CheckError::InvalidOptions(format!(
                "component '{}' declares {} fields; at most {} are supported",
                component,
                specs.len(),
                crate::entity::MAX_FIELDS_PER_TYPE
            ))
            .into());
        }

        let mut fields = Vec::with_capacity(specs.len());
        let mut offset = 0u32;
        let mut max_align = 1u32;
        // Booleans share bytes; the cursor points at the byte currently
        // being filled and the next free bit within it.
        let mut bool_byte: Option<(u32, u8)> = None;

        for (seq, spec) in specs.iter().enumerate() {
            if fields
                .iter()
                .any(|f: &FieldDef| f.name == spec.name)
            {
                return Err(CheckError::InvalidOptions(format!(
                    "component '{}' declares field '{}' twice",
                    component, spec.name
                ))
                .into());
            }
            spec.default.validate_for(&spec.name, &spec.kind)?;

            let (field_offset, bit) = if spec.kind == FieldKind::Bool {
                match bool_byte {
                    Some((byte, bit)) if bit < 7 => {
                        bool_byte = Some((byte, bit + 1));
                        (byte, bit + 1)
                    }
                    _ => {
                        let byte = offset;
                        offset += 1;
                        bool_byte = Some((byte, 0));
                        (byte, 0)
                    }
                }
            } else {
                let align = spec.kind.alignment() as u32;
                max_align = max_align.max(align);
                let padded = offset.div_ceil(align) * align;
                offset = padded + spec.kind.byte_size() as u32;
                (padded, 0)
            };

            fields.push(FieldDef {
                name: spec.name.clone(),
                seq: seq as u8,
                kind: spec.kind.clone(),
                offset: field_offset,
                bit,
                default: spec.default.clone(),
            });
        }

        let row_size = offset.div_ceil(max_align) * max_align;
        let mut default_row = vec![0u8; row_size as usize];
        for field in &fields {
            encode_default(&mut default_row, field);
        }
        let ref_seqs = fields
            .iter()
            .filter(|f| f.kind == FieldKind::Ref)
            .map(|f| f.seq)
            .collect();

        Ok(Self {
            fields,
            row_size,
            default_row,
            ref_seqs,
        })
    }

    pub fn field_seq(&self, component: &str, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| {
                CheckError::UnknownField {
                    component: component.to_string(),
                    field: name.to_string(),
                }
                .into()
            })
    }
}

fn encode_default(row: &mut [u8], field: &FieldDef) {
    let at = field.offset as usize;
    match (&field.kind, &field.default) {
        (FieldKind::Bool, FieldValue::Bool(v)) => {
            if *v {
                row[at] |= 1 << field.bit;
            }
        }
        (FieldKind::I8, FieldValue::Int(v)) => row[at] = *v as i8 as u8,
        (FieldKind::U8, FieldValue::Int(v)) => row[at] = *v as u8,
        (FieldKind::I16, FieldValue::Int(v)) => {
            row[at..at + 2].copy_from_slice(&(*v as i16).to_le_bytes())
        }
        (FieldKind::U16, FieldValue::Int(v)) => {
            row[at..at + 2].copy_from_slice(&(*v as u16).to_le_bytes())
        }
        (FieldKind::I32, FieldValue::Int(v)) => {
            row[at..at + 4].copy_from_slice(&(*v as i32).to_le_bytes())
        }
        (FieldKind::U32, FieldValue::Int(v)) => {
            row[at..at + 4].copy_from_slice(&(*v as u32).to_le_bytes())
        }
        (FieldKind::F32, FieldValue::Float(v)) => {
            row[at..at + 4].copy_from_slice(&(*v as f32).to_le_bytes())
        }
        (FieldKind::F64, FieldValue::Float(v)) => {
            row[at..at + 8].copy_from_slice(&v.to_le_bytes())
        }
        (FieldKind::StaticString { choices }, FieldValue::Str(s)) => {
            let index = choices.iter().position(|c| c == s).unwrap_or(0);
            if choices.len() <= u8::MAX as usize {
                row[at] = index as u8;
            } else {
                row[at..at + 2].copy_from_slice(&(index as u16).to_le_bytes());
            }
        }
        (FieldKind::DynamicString { .. }, FieldValue::Str(s)) => {
            row[at..at + 2].copy_from_slice(&(s.len() as u16).to_le_bytes());
            row[at + 2..at + 2 + s.len()].copy_from_slice(s.as_bytes());
        }
        (FieldKind::Ref, FieldValue::Ref(target)) => {
            let id = target.map(|e| e.id()).unwrap_or(0);
            row[at..at + 4].copy_from_slice(&id.to_le_bytes());
        }
        // Defaults are validated against the kind at compute time.
        _ => unreachable!(),
    }
}
