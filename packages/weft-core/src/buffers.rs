//! Named, typed backing arrays shared between lanes.
//!
//! Every array lives behind an [`ArcSwap`] cell. Growing or retyping an
//! array allocates a replacement, copies the old contents, and stores it
//! into the cell, so every holder observes the new array on its next load
//! without locks. Replacements are additionally recorded per tracker as a
//! patch, which the lane bridge ships to laborers so they re-bind any cached
//! views before touching the data again.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;

/// Element type of a backing array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl ElementKind {
    /// Element size in bytes.
    pub fn size(&self) -> usize {
        match self {
            ElementKind::U8 | ElementKind::I8 => 1,
            ElementKind::U16 | ElementKind::I16 => 2,
            ElementKind::U32 | ElementKind::I32 | ElementKind::F32 => 4,
            ElementKind::F64 => 8,
        }
    }
}

/// A raw shared byte buffer with a declared element kind.
///
/// All accessors take `&self`: the buffer is written through interior
/// mutability. Soundness rests on the sealed plan's access discipline:
/// a region is written only by the one system (or the director) that holds
/// write rights over it at that point of the frame, and no conflicting
/// system runs concurrently.
pub struct RawBuffer {
    kind: ElementKind,
    len_bytes: usize,
    bytes: UnsafeCell<Box<[u8]>>,
}

// SAFETY: concurrent access is constrained by the sealed plan; writers to a
// given region are never scheduled concurrently with readers or writers of
// the same region.
unsafe impl Sync for RawBuffer {}
unsafe impl Send for RawBuffer {}

impl RawBuffer {
    /// Allocates a zero-filled buffer of `len` elements.
    pub fn new(kind: ElementKind, len: usize) -> Self {
        let len_bytes = len * kind.size();
        Self {
            kind,
            len_bytes,
            bytes: UnsafeCell::new(vec![0u8; len_bytes].into_boxed_slice()),
        }
    }

    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Length in elements.
    pub fn len(&self) -> usize {
        self.len_bytes / self.kind.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len_bytes == 0
    }

    /// Length in bytes.
    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    #[inline]
    fn ptr(&self) -> *mut u8 {
        // SAFETY: the box is never reallocated after construction.
        unsafe { (*self.bytes.get()).as_mut_ptr() }
    }

    /// Reads `N` bytes at a byte offset into `out`.
    #[inline]
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.len_bytes);
        // SAFETY: bounds asserted; access discipline per the type docs.
        unsafe { std::ptr::copy_nonoverlapping(self.ptr().add(offset), out.as_mut_ptr(), out.len()) }
    }

    /// Writes `src` at a byte offset.
    #[inline]
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        debug_assert!(offset + src.len() <= self.len_bytes);
        // SAFETY: bounds asserted; access discipline per the type docs.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr().add(offset), src.len()) }
    }

    /// Borrows a byte range.
    ///
    /// # Safety
    /// The caller must not hold the slice across any operation that may
    /// write the same region, per the access discipline in the type docs.
    #[inline]
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len_bytes);
        std::slice::from_raw_parts(self.ptr().add(offset), len)
    }

    /// Zeroes a byte range.
    #[inline]
    pub fn zero(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len_bytes);
        // SAFETY: bounds asserted; access discipline per the type docs.
        unsafe { std::ptr::write_bytes(self.ptr().add(offset), 0, len) }
    }
}

macro_rules! primitive_accessors {
    ($(($read:ident, $write:ident, $ty:ty)),+ $(,)?) => {
        impl RawBuffer {
            $(
                #[inline]
                pub fn $read(&self, offset: usize) -> $ty {
                    debug_assert!(offset + std::mem::size_of::<$ty>() <= self.len_bytes);
                    // SAFETY: bounds asserted; unaligned read is always valid.
                    unsafe { (self.ptr().add(offset) as *const $ty).read_unaligned() }
                }

                #[inline]
                pub fn $write(&self, offset: usize, value: $ty) {
                    debug_assert!(offset + std::mem::size_of::<$ty>() <= self.len_bytes);
                    // SAFETY: bounds asserted; access discipline per the type docs.
                    unsafe { (self.ptr().add(offset) as *mut $ty).write_unaligned(value) }
                }
            )+
        }
    };
}

primitive_accessors!(
    (read_u8, write_u8, u8),
    (read_i8, write_i8, i8),
    (read_u16, write_u16, u16),
    (read_i16, write_i16, i16),
    (read_u32, write_u32, u32),
    (read_i32, write_i32, i32),
    (read_f32, write_f32, f32),
    (read_f64, write_f64, f64),
);

impl RawBuffer {
    /// Reads element `index` as a widened signed value, dispatching on the
    /// element kind. Used by storage index arrays, whose width grows with
    /// column capacity.
    #[inline]
    pub fn element_i32(&self, index: usize) -> i32 {
        match self.kind {
            ElementKind::I8 => self.read_i8(index) as i32,
            ElementKind::I16 => self.read_i16(index * 2) as i32,
            ElementKind::I32 => self.read_i32(index * 4),
            _ => unreachable!("index arrays are signed"),
        }
    }

    /// Writes element `index` from a widened signed value.
    #[inline]
    pub fn set_element_i32(&self, index: usize, value: i32) {
        match self.kind {
            ElementKind::I8 => self.write_i8(index, value as i8),
            ElementKind::I16 => self.write_i16(index * 2, value as i16),
            ElementKind::I32 => self.write_i32(index * 4, value),
            _ => unreachable!("index arrays are signed"),
        }
    }

    /// Fills every element with a signed value, dispatching on kind.
    pub fn fill_i32(&self, value: i32) {
        for i in 0..self.len() {
            self.set_element_i32(i, value);
        }
    }
}

impl std::fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBuffer")
            .field("kind", &self.kind)
            .field("len_bytes", &self.len_bytes)
            .finish_non_exhaustive()
    }
}

/// A shared cell holding the current incarnation of a named buffer.
pub type BufferCell = Arc<ArcSwap<RawBuffer>>;

/// One replaced buffer inside a patch.
#[derive(Debug, Clone)]
pub struct PatchEntry {
    pub buffer: Arc<RawBuffer>,
    pub kind: ElementKind,
}

/// Pending buffer replacements for one tracker, keyed by buffer name.
pub type BuffersPatch = HashMap<String, PatchEntry>;

struct BufferEntry {
    cell: BufferCell,
    laborer_only: bool,
}

struct BuffersInner {
    entries: HashMap<String, BufferEntry>,
    trackers: Vec<BuffersPatch>,
}

/// Directory of named shared buffers with per-tracker change sets.
pub struct Buffers {
    inner: RwLock<BuffersInner>,
}

impl Buffers {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BuffersInner {
                entries: HashMap::new(),
                trackers: Vec::new(),
            }),
        }
    }

    /// Registers a change tracker (one per lane) and returns its index.
    pub fn add_tracker(&self) -> usize {
        let mut inner = self.inner.write().unwrap();
        inner.trackers.push(HashMap::new());
        inner.trackers.len() - 1
    }

    /// Returns the cell for `key`, allocating or replacing the buffer so it
    /// holds at least `len` elements of `kind`.
    ///
    /// If an older buffer exists and the request is larger or differs in
    /// element kind, a new buffer is allocated, the old contents are copied
    /// (element-converted on a kind change), the tail is filled with
    /// `filler`, and the replacement is recorded with every tracker except
    /// the requester's.
    pub fn register(
        &self,
        key: &str,
        len: usize,
        kind: ElementKind,
        filler: Option<i32>,
        requester: Option<usize>,
        laborer_only: bool,
    ) -> BufferCell {
        let mut inner = self.inner.write().unwrap();

        if let Some(entry) = inner.entries.get(key) {
            let cell = entry.cell.clone();
            let current = cell.load_full();
            if current.kind() == kind && current.len() >= len {
                return cell;
            }

            let replacement = Arc::new(RawBuffer::new(kind, len.max(current.len())));
            if current.kind() == kind {
                let mut scratch = vec![0u8; current.len_bytes()];
                current.read_bytes(0, &mut scratch);
                replacement.write_bytes(0, &scratch);
            } else {
                for i in 0..current.len() {
                    replacement.set_element_i32(i, current.element_i32(i));
                }
            }
            if let Some(fill) = filler {
                for i in current.len()..replacement.len() {
                    replacement.set_element_i32(i, fill);
                }
            }
            tracing::debug!(key, len, ?kind, "buffer re-registered");
            cell.store(replacement.clone());
            Self::record(&mut inner.trackers, key, &replacement, kind, requester);
            return cell;
        }

        let buffer = Arc::new(RawBuffer::new(kind, len));
        if let Some(fill) = filler {
            buffer.fill_i32(fill);
        }
        let cell: BufferCell = Arc::new(ArcSwap::from(buffer.clone()));
        inner.entries.insert(
            key.to_string(),
            BufferEntry {
                cell: cell.clone(),
                laborer_only,
            },
        );
        Self::record(&mut inner.trackers, key, &buffer, kind, requester);
        cell
    }

    fn record(
        trackers: &mut [BuffersPatch],
        key: &str,
        buffer: &Arc<RawBuffer>,
        kind: ElementKind,
        requester: Option<usize>,
    ) {
        for (index, patch) in trackers.iter_mut().enumerate() {
            if Some(index) == requester {
                continue;
            }
            patch.insert(
                key.to_string(),
                PatchEntry {
                    buffer: buffer.clone(),
                    kind,
                },
            );
        }
    }

    /// Drains and returns the pending change set for a tracker.
    pub fn make_patch(&self, tracker: usize) -> BuffersPatch {
        let mut inner = self.inner.write().unwrap();
        std::mem::take(&mut inner.trackers[tracker])
    }

    /// Installs every buffer referenced by `patch`, optionally propagating
    /// the changes to all trackers except `skipped`.
    pub fn apply_patch(&self, patch: &BuffersPatch, track_changes: bool, skipped: Option<usize>) {
        let mut inner = self.inner.write().unwrap();
        for (key, entry) in patch {
            if let Some(existing) = inner.entries.get(key) {
                existing.cell.store(entry.buffer.clone());
            } else {
                let cell: BufferCell = Arc::new(ArcSwap::from(entry.buffer.clone()));
                inner.entries.insert(
                    key.clone(),
                    BufferEntry {
                        cell,
                        laborer_only: false,
                    },
                );
            }
            if track_changes {
                Self::record(&mut inner.trackers, key, &entry.buffer, entry.kind, skipped);
            }
        }
    }

    /// Looks up the cell for `key` without registering.
    pub fn get(&self, key: &str) -> Option<BufferCell> {
        let inner = self.inner.read().unwrap();
        inner.entries.get(key).map(|e| e.cell.clone())
    }

    /// Keys the bridge should not replicate to the director.
    pub fn laborer_only(&self, key: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner.entries.get(key).map(|e| e.laborer_only).unwrap_or(false)
    }
}

impl Default for Buffers {
    fn default() -> Self {
        Self::new()
    }
}
