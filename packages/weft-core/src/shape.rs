//! Per-entity shape tracking.
//!
//! An entity's shape records which component types it carries, packed into a
//! fixed stride of u32 words. In the `current` array, plain component types
//! occupy one bit and the members of a component enum share one multi-bit
//! slot, so installing one member implicitly clears its siblings.
//!
//! Two further arrays run in parallel and always use one private bit per
//! type (two members of an enum can sit in limbo at once): `stale` (live
//! plus components removed during the current cycle, read by
//! recently-deleted access) and `removed_this_cycle` (set at remove,
//! cleared at cycle end, guarding double finalisation).

use std::sync::atomic::{AtomicU32, Ordering};

/// Where a component type lives inside a shape word.
///
/// `has` holds when `word & mask == value`. For a plain type, `mask` and
/// `value` are the same single bit; for an enum member in the `current`
/// array, `mask` covers the group's slot and `value` is the member's index
/// plus one within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapeBinding {
    pub word: u16,
    pub mask: u32,
    pub value: u32,
}

impl ShapeBinding {
    /// A plain single-bit binding, as used in the flag arrays.
    pub fn bit(index: usize) -> Self {
        ShapeBinding {
            word: (index / 32) as u16,
            mask: 1 << (index % 32),
            value: 1 << (index % 32),
        }
    }

    #[inline]
    fn shift(&self) -> u32 {
        self.mask.trailing_zeros()
    }
}

/// Which of the three parallel shape arrays to address.
///
/// `Current` is addressed with a type's slot binding; `Stale` and
/// `RemovedThisCycle` with its flag binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeView {
    Current,
    Stale,
    RemovedThisCycle,
}

/// The shape words for every entity, in atomic storage shared by all lanes.
pub struct ShapeArray {
    slot_stride: usize,
    flag_stride: usize,
    current: Box<[AtomicU32]>,
    stale: Box<[AtomicU32]>,
    removed: Box<[AtomicU32]>,
}

fn alloc_words(len: usize) -> Box<[AtomicU32]> {
    (0..len).map(|_| AtomicU32::new(0)).collect::<Vec<_>>().into_boxed_slice()
}

impl ShapeArray {
    /// `slot_stride` covers the enum-packed current array; `flag_stride`
    /// covers the one-bit-per-type stale and removed arrays.
    pub fn new(slot_stride: usize, flag_stride: usize, max_entities: u32) -> Self {
        let entities = max_entities as usize + 1;
        Self {
            slot_stride,
            flag_stride,
            current: alloc_words(slot_stride * entities),
            stale: alloc_words(flag_stride * entities),
            removed: alloc_words(flag_stride * entities),
        }
    }

    #[inline]
    fn words(&self, view: ShapeView) -> (&[AtomicU32], usize) {
        match view {
            ShapeView::Current => (&self.current, self.slot_stride),
            ShapeView::Stale => (&self.stale, self.flag_stride),
            ShapeView::RemovedThisCycle => (&self.removed, self.flag_stride),
        }
    }

    #[inline]
    fn slot(&self, view: ShapeView, id: u32, binding: &ShapeBinding) -> &AtomicU32 {
        let (words, stride) = self.words(view);
        &words[id as usize * stride + binding.word as usize]
    }

    /// Whether the entity has the component in this view.
    #[inline]
    pub fn has(&self, view: ShapeView, id: u32, binding: &ShapeBinding) -> bool {
        self.slot(view, id, binding).load(Ordering::Acquire) & binding.mask == binding.value
    }

    /// Raw value of the binding's slot, shifted down. Zero means empty; for
    /// an enum slot, a non-zero value is the present member's index plus one.
    #[inline]
    pub fn slot_value(&self, view: ShapeView, id: u32, binding: &ShapeBinding) -> u32 {
        let word = self.slot(view, id, binding).load(Ordering::Acquire);
        (word & binding.mask) >> binding.shift()
    }

    /// Installs the component, returning the slot's previous value (shifted
    /// down). A non-zero return from an enum slot identifies the displaced
    /// sibling.
    #[inline]
    pub fn install(&self, view: ShapeView, id: u32, binding: &ShapeBinding) -> u32 {
        let previous = self
            .slot(view, id, binding)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some((word & !binding.mask) | binding.value)
            })
            .unwrap();
        (previous & binding.mask) >> binding.shift()
    }

    /// Clears the component iff it is the one present in the slot. Returns
    /// whether it was.
    #[inline]
    pub fn clear(&self, view: ShapeView, id: u32, binding: &ShapeBinding) -> bool {
        self.slot(view, id, binding)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                if word & binding.mask == binding.value {
                    Some(word & !binding.mask)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Zeroes every word of an entity in one view.
    pub fn clear_entity(&self, view: ShapeView, id: u32) {
        let (words, stride) = self.words(view);
        for word in &words[id as usize * stride..(id as usize + 1) * stride] {
            word.store(0, Ordering::Release);
        }
    }

    /// Raw word access, for the invariant checker.
    pub fn word(&self, view: ShapeView, id: u32, word: usize) -> u32 {
        let (words, stride) = self.words(view);
        words[id as usize * stride + word].load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(1000)]
    fn plain_bits_install_and_clear() {
        let shapes = ShapeArray::new(2, 2, 16);
        let a = ShapeBinding::bit(3);
        let b = ShapeBinding::bit(39);

        assert!(!shapes.has(ShapeView::Current, 5, &a));
        assert_eq!(shapes.install(ShapeView::Current, 5, &a), 0);
        assert!(shapes.has(ShapeView::Current, 5, &a));
        assert!(!shapes.has(ShapeView::Current, 5, &b));
        assert!(!shapes.has(ShapeView::Stale, 5, &a));

        assert!(shapes.clear(ShapeView::Current, 5, &a));
        assert!(!shapes.clear(ShapeView::Current, 5, &a));
    }

    #[test]
    #[timeout(1000)]
    fn enum_slots_displace_siblings() {
        let shapes = ShapeArray::new(1, 1, 16);
        // A three-member enum in bits 2..4: values 1, 2, 3.
        let slot = |k: u32| ShapeBinding {
            word: 0,
            mask: 0b11 << 2,
            value: k << 2,
        };
        let first = slot(1);
        let second = slot(2);

        assert_eq!(shapes.install(ShapeView::Current, 3, &first), 0);
        assert!(shapes.has(ShapeView::Current, 3, &first));

        // Installing the second member reports the first as displaced.
        assert_eq!(shapes.install(ShapeView::Current, 3, &second), 1);
        assert!(shapes.has(ShapeView::Current, 3, &second));
        assert!(!shapes.has(ShapeView::Current, 3, &first));

        // Clearing the displaced member is a no-op.
        assert!(!shapes.clear(ShapeView::Current, 3, &first));
        assert!(shapes.clear(ShapeView::Current, 3, &second));
        assert_eq!(shapes.slot_value(ShapeView::Current, 3, &second), 0);
    }

    #[test]
    #[timeout(1000)]
    fn flag_arrays_keep_private_bits() {
        let shapes = ShapeArray::new(1, 1, 16);
        let first = ShapeBinding::bit(2);
        let second = ShapeBinding::bit(3);

        // Both members of an enum can be flagged at once in the removed
        // array even though they exclude each other in current.
        shapes.install(ShapeView::RemovedThisCycle, 4, &first);
        shapes.install(ShapeView::RemovedThisCycle, 4, &second);
        assert!(shapes.has(ShapeView::RemovedThisCycle, 4, &first));
        assert!(shapes.has(ShapeView::RemovedThisCycle, 4, &second));
    }
}
