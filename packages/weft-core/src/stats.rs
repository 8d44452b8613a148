//! Runtime counters.

use std::sync::atomic::{AtomicU32, AtomicU64};

/// Counters updated from any lane.
#[derive(Debug, Default)]
pub struct SharedCounts {
    pub entities_peak: AtomicU32,
    pub limbo_peak: AtomicU32,
    /// The running frame's stamp; queries clear their transient lists when
    /// they first see a new stamp.
    pub frame: AtomicU64,
}

/// A snapshot of the world's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WorldStats {
    /// Entities alive or awaiting reclamation.
    pub entities_current: u32,
    pub entities_peak: u32,
    /// Most components observed in limbo at any cycle end.
    pub max_limbo_components: usize,
    /// Frames completed.
    pub frames: u64,
    /// Most shape-log entries committed in one frame.
    pub max_shape_changes_observed: usize,
    /// Most write-log entries committed in one frame.
    pub max_writes_observed: usize,
}
