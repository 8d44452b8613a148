//! Inbound reference tracking.
//!
//! Every ref-field mutation logs what happened to the old and new targets;
//! the indexer drains the ref log at cycle end and maintains, per selector
//! and per target, the list of referring entities ("backrefs").
//!
//! Each selector keeps two trackers per target: a live one, and a stale one
//! that also covers sources whose component sits in limbo. A plain
//! unreference (the source component was removed this cycle) drops the
//! source from the live tracker only; an unreference with the release flag
//! (a live overwrite, or finalisation) drops it from both.

use std::collections::HashMap;

use crate::entity::{ENTITY_ID_BITS, ENTITY_ID_MASK, TYPE_ID_BITS};
use crate::error::Result;
use crate::log::LogPointer;
use crate::world::{LaneLocal, WorldShared};

/// What a ref-log entry records about its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefAction {
    Reference,
    Unreference,
    UnreferenceRelease,
}

const ACTION_SHIFT: u32 = ENTITY_ID_BITS + crate::entity::FIELD_SEQ_BITS;

/// Packs one two-word ref-log entry:
/// word 0 is `src | seq << 22 | action << 29`, word 1 is `target | src_type << 22`.
pub(crate) fn encode_entry(
    action: RefAction,
    src: u32,
    seq: u8,
    src_type: u16,
    target: u32,
) -> (u32, u32) {
    let action = match action {
        RefAction::Reference => 0u32,
        RefAction::Unreference => 1,
        RefAction::UnreferenceRelease => 2,
    };
    (
        src | ((seq as u32) << ENTITY_ID_BITS) | (action << ACTION_SHIFT),
        target | ((src_type as u32) << ENTITY_ID_BITS),
    )
}

pub(crate) fn decode_entry(w0: u32, w1: u32) -> (RefAction, u32, u8, u16, u32) {
    let action = match (w0 >> ACTION_SHIFT) & 0b11 {
        0 => RefAction::Reference,
        1 => RefAction::Unreference,
        _ => RefAction::UnreferenceRelease,
    };
    let src = w0 & ENTITY_ID_MASK;
    let seq = ((w0 >> ENTITY_ID_BITS) & ((1 << crate::entity::FIELD_SEQ_BITS) - 1)) as u8;
    let src_type = ((w1 >> ENTITY_ID_BITS) & ((1 << TYPE_ID_BITS) - 1)) as u16;
    let target = w1 & ENTITY_ID_MASK;
    (action, src, seq, src_type, target)
}

/// Source-side tag: `(type, field seq, internal index)` packed into a u32.
/// The internal index is reserved for internally indexed source types.
fn make_tag(src_type: u16, seq: u8, internal_index: u32) -> u32 {
    src_type as u32
        | ((seq as u32) << TYPE_ID_BITS)
        | (internal_index << (TYPE_ID_BITS + crate::entity::FIELD_SEQ_BITS))
}

fn tag_type_and_seq(tag: u32) -> (u16, u8) {
    (
        (tag & ((1 << TYPE_ID_BITS) - 1)) as u16,
        ((tag >> TYPE_ID_BITS) & ((1 << crate::entity::FIELD_SEQ_BITS) - 1)) as u8,
    )
}

/// Past this many tags for one source, membership switches from a linear
/// scan to a hash multiset.
const TAG_SET_SPILL: usize = 1000;

#[derive(Debug)]
enum TagSet {
    Small(Vec<u32>),
    Large(HashMap<u32, u32>),
}

impl Default for TagSet {
    fn default() -> Self {
        TagSet::Small(Vec::new())
    }
}

impl TagSet {
    fn add(&mut self, tag: u32) {
        match self {
            TagSet::Small(tags) => {
                tags.push(tag);
                if tags.len() > TAG_SET_SPILL {
                    let mut counts: HashMap<u32, u32> = HashMap::with_capacity(tags.len());
                    for &t in tags.iter() {
                        *counts.entry(t).or_insert(0) += 1;
                    }
                    *self = TagSet::Large(counts);
                }
            }
            TagSet::Large(counts) => *counts.entry(tag).or_insert(0) += 1,
        }
    }

    fn remove(&mut self, tag: u32) -> bool {
        match self {
            TagSet::Small(tags) => match tags.iter().position(|&t| t == tag) {
                Some(at) => {
                    tags.swap_remove(at);
                    true
                }
                None => false,
            },
            TagSet::Large(counts) => match counts.get_mut(&tag) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        counts.remove(&tag);
                    }
                    true
                }
                None => false,
            },
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            TagSet::Small(tags) => tags.is_empty(),
            TagSet::Large(counts) => counts.is_empty(),
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = u32> + '_> {
        match self {
            TagSet::Small(tags) => Box::new(tags.iter().copied()),
            TagSet::Large(counts) => Box::new(
                counts
                    .iter()
                    .flat_map(|(&tag, &count)| std::iter::repeat(tag).take(count as usize)),
            ),
        }
    }
}

/// The materialised inbound-edge list for one `(target, selector)` pair.
#[derive(Debug, Default)]
pub struct Tracker {
    entities: Vec<u32>,
    positions: HashMap<u32, usize>,
    /// Absent on precise selectors, where a source can appear at most once.
    tags: Option<HashMap<u32, TagSet>>,
}

impl Tracker {
    fn new(precise: bool) -> Self {
        Self {
            entities: Vec::new(),
            positions: HashMap::new(),
            tags: (!precise).then(HashMap::new),
        }
    }

    /// Lists `src` as referring, returning whether it was newly listed.
    fn track(&mut self, src: u32, tag: u32) -> bool {
        match &mut self.tags {
            Some(tags) => {
                let set = tags.entry(src).or_default();
                let newly = set.is_empty();
                set.add(tag);
                if newly {
                    self.positions.insert(src, self.entities.len());
                    self.entities.push(src);
                }
                newly
            }
            None => {
                if self.positions.contains_key(&src) {
                    false
                } else {
                    self.positions.insert(src, self.entities.len());
                    self.entities.push(src);
                    true
                }
            }
        }
    }

    /// Drops one `(src, tag)` edge; `src` stays listed until its last tag
    /// disappears. Returns whether `src` was delisted.
    fn untrack(&mut self, src: u32, tag: u32) -> bool {
        match &mut self.tags {
            Some(tags) => {
                let Some(set) = tags.get_mut(&src) else {
                    return false;
                };
                if !set.remove(tag) || !set.is_empty() {
                    return false;
                }
                tags.remove(&src);
                self.delist(src);
                true
            }
            None => {
                if self.positions.contains_key(&src) {
                    self.delist(src);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn delist(&mut self, src: u32) {
        let at = self.positions.remove(&src).expect("tracked entity has a position");
        self.entities.swap_remove(at);
        if let Some(&moved) = self.entities.get(at) {
            self.positions.insert(moved, at);
        }
    }

    /// The referring entities. Callers must not mutate through this.
    pub fn entities(&self) -> &[u32] {
        &self.entities
    }

    fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// `(source, type, seq)` triples, for field clearing. Precise selectors
    /// reconstruct the pair from the selector key.
    fn edges(&self, precise_key: Option<(u16, u8)>) -> Vec<(u32, u16, u8)> {
        match &self.tags {
            Some(tags) => {
                let mut out = Vec::new();
                for &src in &self.entities {
                    if let Some(set) = tags.get(&src) {
                        for tag in set.iter() {
                            let (ty, seq) = tag_type_and_seq(tag);
                            out.push((src, ty, seq));
                        }
                    }
                }
                out
            }
            None => {
                let (ty, seq) = precise_key.expect("precise selectors carry their key");
                self.entities.iter().map(|&src| (src, ty, seq)).collect()
            }
        }
    }
}

/// Which inbound edges one tracker set covers.
#[derive(Debug)]
pub struct Selector {
    pub source_type: Option<u16>,
    pub source_seq: Option<u8>,
    pub target_type: Option<u16>,
    precise: bool,
    track_stale: bool,
    track_writes: bool,
    live: HashMap<u32, Tracker>,
    stale: HashMap<u32, Tracker>,
}

impl Selector {
    fn matches(&self, src_type: u16, seq: u8) -> bool {
        self.source_type.map_or(true, |t| t == src_type)
            && self.source_seq.map_or(true, |s| s == seq)
    }
}

/// The global selector's index; it matches every edge and tracks stale.
pub const GLOBAL_SELECTOR: usize = 0;

/// Drains the ref log and maintains every selector's trackers.
pub struct RefIndexer {
    pointer: LogPointer,
    selectors: Vec<Selector>,
}

impl RefIndexer {
    /// Builds the global selector plus one precise selector per declared
    /// ref field.
    pub fn new(types: &[crate::component::ComponentType]) -> Self {
        let mut selectors = vec![Selector {
            source_type: None,
            source_seq: None,
            target_type: None,
            precise: false,
            track_stale: true,
            track_writes: false,
            live: HashMap::new(),
            stale: HashMap::new(),
        }];
        for ty in types {
            for &seq in &ty.layout.ref_seqs {
                selectors.push(Selector {
                    source_type: Some(ty.id),
                    source_seq: Some(seq),
                    target_type: None,
                    precise: !ty.internally_indexed,
                    track_stale: false,
                    track_writes: false,
                    live: HashMap::new(),
                    stale: HashMap::new(),
                });
            }
        }
        Self {
            pointer: LogPointer::default(),
            selectors,
        }
    }

    /// Finds the precise selector for `(source type, field seq)`.
    pub fn selector_for(&self, source_type: u16, seq: u8) -> Option<usize> {
        self.selectors
            .iter()
            .position(|s| s.source_type == Some(source_type) && s.source_seq == Some(seq))
    }

    /// The live backrefs of `target` under a selector.
    pub fn backrefs(&self, target: u32, selector: usize) -> &[u32] {
        self.selectors[selector]
            .live
            .get(&target)
            .map(|t| t.entities())
            .unwrap_or(&[])
    }

    /// Backrefs including sources whose component is in limbo.
    pub fn stale_backrefs(&self, target: u32, selector: usize) -> &[u32] {
        let sel = &self.selectors[selector];
        let map = if sel.track_stale { &sel.stale } else { &sel.live };
        map.get(&target).map(|t| t.entities()).unwrap_or(&[])
    }

    /// Drains the ring, commits the lane's staged ref entries, and drains
    /// again so they are dispatched in the same pass.
    pub fn drain(&mut self, shared: &WorldShared, local: &mut LaneLocal) -> Result<()> {
        let Self { pointer, selectors } = self;
        let mut corral = std::mem::replace(&mut local.ref_corral, shared.ref_log.corral());
        let result = shared.ref_log.drain_pairs_and_commit(&mut corral, pointer, |w0, w1| {
            Self::dispatch(selectors, local, w0, w1)
        });
        local.ref_corral = corral;
        result
    }

    fn dispatch(selectors: &mut [Selector], local: &mut LaneLocal, w0: u32, w1: u32) -> Result<()> {
        let (action, src, seq, src_type, target) = decode_entry(w0, w1);
        let tag = make_tag(src_type, seq, 0);
        for sel in selectors.iter_mut() {
            if !sel.matches(src_type, seq) {
                continue;
            }
            let changed = match action {
                RefAction::Reference => {
                    let precise = sel.precise;
                    if sel.track_stale {
                        sel.stale
                            .entry(target)
                            .or_insert_with(|| Tracker::new(precise))
                            .track(src, tag);
                    }
                    sel.live
                        .entry(target)
                        .or_insert_with(|| Tracker::new(precise))
                        .track(src, tag)
                }
                RefAction::Unreference | RefAction::UnreferenceRelease => {
                    if action == RefAction::UnreferenceRelease && sel.track_stale {
                        if let Some(tracker) = sel.stale.get_mut(&target) {
                            tracker.untrack(src, tag);
                            if tracker.is_empty() {
                                sel.stale.remove(&target);
                            }
                        }
                    }
                    match sel.live.get_mut(&target) {
                        Some(tracker) => {
                            let delisted = tracker.untrack(src, tag);
                            if tracker.is_empty() {
                                sel.live.remove(&target);
                            }
                            delisted
                        }
                        // The tracker may already be gone if the target was
                        // cleared wholesale before this entry drained.
                        None => false,
                    }
                }
            };
            if changed && sel.track_writes {
                if let Some(target_type) = sel.target_type {
                    local
                        .write_corral
                        .push(crate::entity::pack_entry(target, target_type))?;
                }
            }
        }
        Ok(())
    }

    /// Clears the inbound edges of a target. Called twice per deletion:
    /// at removal (`finalize` false) the live trackers drop the target and
    /// every live source's ref field is nulled, while stale trackers keep
    /// their edges for recently-deleted access; at finalisation
    /// (`finalize` true) the stale trackers release too and any field
    /// re-pointed at the target during limbo is nulled.
    pub fn clear_all_refs(
        &mut self,
        shared: &WorldShared,
        target: u32,
        finalize: bool,
    ) -> Result<()> {
        for sel in self.selectors.iter_mut() {
            let precise_key = sel
                .source_type
                .zip(sel.source_seq)
                .filter(|_| sel.precise);
            let mut trackers = vec![sel.live.remove(&target)];
            if finalize {
                trackers.push(sel.stale.remove(&target));
            }
            for tracker in trackers.into_iter().flatten() {
                for (src, src_type, seq) in tracker.edges(precise_key) {
                    shared.clear_ref_field(src, src_type, seq, target)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(1000)]
    fn entry_encoding_round_trips() {
        for action in [
            RefAction::Reference,
            RefAction::Unreference,
            RefAction::UnreferenceRelease,
        ] {
            let (w0, w1) = encode_entry(action, 12_345, 17, 42, 678);
            assert_eq!(decode_entry(w0, w1), (action, 12_345, 17, 42, 678));
        }
    }

    #[test]
    #[timeout(1000)]
    fn tracker_is_a_multiset_over_tags() {
        let mut tracker = Tracker::new(false);
        let tag_a = make_tag(1, 0, 0);
        let tag_b = make_tag(1, 1, 0);

        assert!(tracker.track(5, tag_a));
        // A second field of the same source does not list it twice.
        assert!(!tracker.track(5, tag_b));
        assert_eq!(tracker.entities(), &[5]);

        // The source stays listed until its last tag disappears.
        assert!(!tracker.untrack(5, tag_a));
        assert_eq!(tracker.entities(), &[5]);
        assert!(tracker.untrack(5, tag_b));
        assert!(tracker.entities().is_empty());
    }

    #[test]
    #[timeout(1000)]
    fn tag_sets_spill_to_hashing() {
        let mut set = TagSet::default();
        for i in 0..1200u32 {
            set.add(make_tag(1, 0, i));
        }
        assert!(matches!(set, TagSet::Large(_)));
        for i in 0..1200u32 {
            assert!(set.remove(make_tag(1, 0, i)));
        }
        assert!(set.is_empty());
    }

    #[test]
    #[timeout(1000)]
    fn precise_trackers_delist_directly() {
        let mut tracker = Tracker::new(true);
        let tag = make_tag(2, 0, 0);
        assert!(tracker.track(7, tag));
        assert!(tracker.track(9, tag));
        assert!(tracker.untrack(7, tag));
        assert_eq!(tracker.entities(), &[9]);
    }
}
