//! Circular change logs with per-writer corrals.
//!
//! A [`ChangeLog`] is a ring of u32 entries shared by every lane. Writers
//! never touch the ring directly: each lane appends to its own [`Corral`]
//! and merges it into the ring at a flush point with [`ChangeLog::commit`].
//! Consumers hold generation-tagged [`LogPointer`]s; a pointer is valid as
//! long as it lags the ring by less than one full generation, and a pointer
//! lapped by two or more commits reports the log's capacity as exceeded.
//!
//! Shape and write logs sort the corral by the entry's high bits (the
//! component type id) at commit, so consumers see contiguous type runs. The
//! ref log appends two-word entries; its capacity is forced even and words
//! are pushed in pairs, so an entry never straddles a generation wrap.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::entity::ENTITY_ID_BITS;
use crate::error::{CheckError, Error, InternalError, Result};

/// A consumer's read position in a [`ChangeLog`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogPointer {
    pub index: u32,
    pub generation: u32,
    pub corral_index: u32,
    pub corral_generation: u32,
}

/// Per-writer staging area, merged into the ring at commit.
#[derive(Debug)]
pub struct Corral {
    entries: Vec<u32>,
    generation: u32,
    capacity: usize,
    log: &'static str,
    param: &'static str,
}

impl Corral {
    /// Stages one entry. Fails when the corral already holds as many
    /// entries as the ring can carry.
    #[inline]
    pub fn push(&mut self, value: u32) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(CheckError::LogCapacityExceeded {
                log: self.log,
                capacity: self.capacity,
                param: self.param,
            }
            .into());
        }
        self.entries.push(value);
        Ok(())
    }

    /// Stages a two-word entry.
    #[inline]
    pub fn push_pair(&mut self, first: u32, second: u32) -> Result<()> {
        self.push(first)?;
        self.push(second)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// A contiguous run of committed entries.
#[derive(Debug)]
pub struct LogSegment<'a> {
    entries: &'a [AtomicU32],
    lo: usize,
    hi: usize,
}

impl<'a> LogSegment<'a> {
    pub fn len(&self) -> usize {
        self.hi - self.lo
    }

    pub fn is_empty(&self) -> bool {
        self.lo == self.hi
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + 'a {
        self.entries[self.lo..self.hi]
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
    }
}

/// Lock-free-per-writer append log over a shared ring.
pub struct ChangeLog {
    log: &'static str,
    param: &'static str,
    capacity: usize,
    entries: Box<[AtomicU32]>,
    /// `generation << 32 | write_index`, updated with a single release store
    /// so consumers snapshot both halves consistently.
    header: AtomicU64,
    sort_by_type: bool,
    paired: bool,
}

impl ChangeLog {
    /// Creates a log of `capacity` entries.
    ///
    /// `log` names the log in errors, `param` names the configuration
    /// parameter that sizes it. `sort_by_type` stable-sorts corrals by the
    /// entry's high bits at commit; `paired` forces an even capacity for
    /// two-word entries (the two are mutually exclusive).
    pub fn new(
        log: &'static str,
        param: &'static str,
        capacity: usize,
        sort_by_type: bool,
        paired: bool,
    ) -> Self {
        assert!(!(sort_by_type && paired), "paired logs are never sorted");
        let capacity = if paired { (capacity + 1) & !1 } else { capacity };
        let capacity = capacity.max(2);
        let entries: Vec<AtomicU32> = (0..capacity).map(|_| AtomicU32::new(0)).collect();
        Self {
            log,
            param,
            capacity,
            entries: entries.into_boxed_slice(),
            header: AtomicU64::new(0),
            sort_by_type,
            paired,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Creates a corral for one writer of this log.
    pub fn corral(&self) -> Corral {
        Corral {
            entries: Vec::new(),
            generation: 0,
            capacity: self.capacity,
            log: self.log,
            param: self.param,
        }
    }

    #[inline]
    fn head(&self) -> (u32, u32) {
        let header = self.header.load(Ordering::Acquire);
        ((header >> 32) as u32, header as u32)
    }

    /// Snapshot of `(generation, write_index)`, for frame statistics.
    pub fn head_snapshot(&self) -> (u32, u32) {
        self.head()
    }

    /// Entries committed between two head snapshots.
    pub fn entries_between(&self, from: (u32, u32), to: (u32, u32)) -> usize {
        let generations = to.0.wrapping_sub(from.0) as usize;
        generations * self.capacity + to.1 as usize - from.1 as usize
    }

    /// Captures the current read position, including the corral's state, for
    /// a later conditional commit.
    pub fn pointer(&self, corral: &Corral) -> LogPointer {
        let (generation, index) = self.head();
        LogPointer {
            index,
            generation,
            corral_index: corral.entries.len() as u32,
            corral_generation: corral.generation,
        }
    }

    /// Merges the corral into the ring and advances the head.
    pub fn commit(&self, corral: &mut Corral) -> Result<()> {
        if corral.entries.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.paired || corral.entries.len() % 2 == 0);
        if self.sort_by_type {
            corral.entries.sort_by_key(|value| value >> ENTITY_ID_BITS);
        }
        let (mut generation, mut index) = self.head();
        for &value in &corral.entries {
            self.entries[index as usize].store(value, Ordering::Relaxed);
            index += 1;
            if index as usize == self.capacity {
                index = 0;
                generation = generation.wrapping_add(1);
            }
        }
        self.header
            .store(((generation as u64) << 32) | index as u64, Ordering::Release);
        corral.entries.clear();
        corral.generation = corral.generation.wrapping_add(1);
        Ok(())
    }

    /// Commits only if the ring and the corral are still in the exact state
    /// captured by `pointer`. Returns whether the commit happened.
    pub fn commit_conditional(&self, corral: &mut Corral, pointer: &LogPointer) -> Result<bool> {
        let (generation, index) = self.head();
        if generation != pointer.generation
            || index != pointer.index
            || corral.generation != pointer.corral_generation
            || corral.entries.len() as u32 != pointer.corral_index
        {
            return Ok(false);
        }
        self.commit(corral)?;
        Ok(true)
    }

    /// Returns the next contiguous run of committed entries after `pointer`,
    /// advancing it. Returns `None` once the pointer has caught up. Call in
    /// a loop: a run never crosses a generation wrap.
    pub fn process_since(&self, pointer: &mut LogPointer) -> Result<Option<LogSegment<'_>>> {
        let (generation, index) = self.head();
        match generation.wrapping_sub(pointer.generation) {
            0 => {
                if pointer.index == index {
                    return Ok(None);
                }
                if pointer.index > index {
                    return Err(Error::Internal(InternalError::PointerAheadOfLog {
                        log: self.log,
                    }));
                }
                let segment = LogSegment {
                    entries: &self.entries,
                    lo: pointer.index as usize,
                    hi: index as usize,
                };
                pointer.index = index;
                Ok(Some(segment))
            }
            1 => {
                // The previous generation's tail is intact only while the
                // new generation has not written past our position.
                if index > pointer.index {
                    return Err(self.capacity_error());
                }
                let segment = LogSegment {
                    entries: &self.entries,
                    lo: pointer.index as usize,
                    hi: self.capacity,
                };
                pointer.index = 0;
                pointer.generation = generation;
                Ok(Some(segment))
            }
            _ => Err(self.capacity_error()),
        }
    }

    /// Entries between `pointer` and the head, validating the pointer.
    pub fn count_since(&self, pointer: &LogPointer) -> Result<usize> {
        let (generation, index) = self.head();
        match generation.wrapping_sub(pointer.generation) {
            0 => {
                if pointer.index > index {
                    return Err(Error::Internal(InternalError::PointerAheadOfLog {
                        log: self.log,
                    }));
                }
                Ok((index - pointer.index) as usize)
            }
            1 => {
                if index > pointer.index {
                    return Err(self.capacity_error());
                }
                Ok(self.capacity - pointer.index as usize + index as usize)
            }
            _ => Err(self.capacity_error()),
        }
    }

    /// Drains committed entries through `consume`, advancing `pointer`.
    pub fn drain(
        &self,
        pointer: &mut LogPointer,
        mut consume: impl FnMut(u32) -> Result<()>,
    ) -> Result<()> {
        while let Some(segment) = self.process_since(pointer)? {
            for value in segment.iter() {
                consume(value)?;
            }
        }
        Ok(())
    }

    /// Drains committed two-word entries through `consume`.
    pub fn drain_pairs(
        &self,
        pointer: &mut LogPointer,
        mut consume: impl FnMut(u32, u32) -> Result<()>,
    ) -> Result<()> {
        debug_assert!(self.paired);
        while let Some(segment) = self.process_since(pointer)? {
            debug_assert!(segment.len() % 2 == 0);
            let mut iter = segment.iter();
            while let (Some(first), Some(second)) = (iter.next(), iter.next()) {
                consume(first, second)?;
            }
        }
        Ok(())
    }

    /// Drains the ring, commits the corral, then drains again so the
    /// caller's own staged entries are consumed in the same pass.
    pub fn drain_and_commit(
        &self,
        corral: &mut Corral,
        pointer: &mut LogPointer,
        mut consume: impl FnMut(u32) -> Result<()>,
    ) -> Result<()> {
        self.drain(pointer, &mut consume)?;
        self.commit(corral)?;
        self.drain(pointer, &mut consume)
    }

    /// Two-word-entry variant of [`ChangeLog::drain_and_commit`].
    pub fn drain_pairs_and_commit(
        &self,
        corral: &mut Corral,
        pointer: &mut LogPointer,
        mut consume: impl FnMut(u32, u32) -> Result<()>,
    ) -> Result<()> {
        self.drain_pairs(pointer, &mut consume)?;
        self.commit(corral)?;
        self.drain_pairs(pointer, &mut consume)
    }

    fn capacity_error(&self) -> Error {
        CheckError::LogCapacityExceeded {
            log: self.log,
            capacity: self.capacity,
            param: self.param,
        }
        .into()
    }
}
