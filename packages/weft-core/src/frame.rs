//! Frame timing and the log-to-query feed.

use std::time::Instant;

use crate::error::Result;
use crate::log::LogPointer;
use crate::query::EntityBitset;
use crate::system::SystemSlot;
use crate::world::WorldShared;

/// Tracks frame time, delta, and group completion across one frame.
pub struct FrameClock {
    epoch: Instant,
    prev_time: Option<f64>,
    pub time: f64,
    pub delta: f64,
    pub in_frame: bool,
    executed_groups: u64,
    pub counter: u64,
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            prev_time: None,
            time: 0.0,
            delta: 0.0,
            in_frame: false,
            executed_groups: 0,
            counter: 0,
        }
    }

    /// Seconds since the world was created.
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Locks in this frame's time and delta.
    pub fn begin(&mut self, time: Option<f64>, delta: Option<f64>) {
        debug_assert!(!self.in_frame);
        self.time = time.unwrap_or_else(|| self.now());
        self.delta = delta.unwrap_or_else(|| self.time - self.prev_time.unwrap_or(self.time));
        self.in_frame = true;
        self.executed_groups = 0;
    }

    pub fn mark_group(&mut self, group: usize) {
        self.executed_groups |= 1 << group;
    }

    pub fn all_groups_ran(&self, group_count: usize) -> bool {
        self.executed_groups.count_ones() as usize >= group_count
    }

    /// Releases the frame and advances the counter.
    pub fn end(&mut self) {
        debug_assert!(self.in_frame);
        self.prev_time = Some(self.time);
        self.in_frame = false;
        self.counter += 1;
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One consumer of the shape and write logs, feeding a set of systems'
/// queries. The single-lane plan runs one feed over every system; each
/// laborer runs its own over the systems of its lane.
pub struct QueryFeed {
    shape_pointer: LogPointer,
    write_pointer: LogPointer,
    processed: EntityBitset,
}

impl QueryFeed {
    pub fn new(max_entities: u32) -> Self {
        Self {
            shape_pointer: LogPointer::default(),
            write_pointer: LogPointer::default(),
            processed: EntityBitset::new(max_entities),
        }
    }

    /// Drains committed shape and write entries into the given systems'
    /// queries. An entity's shape events coalesce per drain batch: the
    /// first one triggers the old-versus-new comparison, later ones are
    /// skipped through the processed set.
    pub fn update_queries(
        &mut self,
        shared: &WorldShared,
        systems: &mut [SystemSlot],
    ) -> Result<()> {
        let QueryFeed {
            shape_pointer,
            write_pointer,
            processed,
        } = self;

        let frame = shared.counts.frame.load(std::sync::atomic::Ordering::Acquire);
        for slot in systems.iter_mut() {
            for query in &mut slot.queries {
                query.ensure_frame(frame);
            }
        }

        processed.clear();
        shared.shape_log.drain(shape_pointer, |entry| {
            let (id, _) = crate::entity::unpack_entry(entry);
            if !processed.insert(id) {
                return Ok(());
            }
            for slot in systems.iter_mut() {
                for query in &mut slot.queries {
                    query.handle_shape_update(shared, id)?;
                }
            }
            Ok(())
        })?;

        shared.write_log.drain(write_pointer, |entry| {
            let (id, type_id) = crate::entity::unpack_entry(entry);
            for slot in systems.iter_mut() {
                for query in &mut slot.queries {
                    query.handle_write(shared, id, type_id)?;
                }
            }
            Ok(())
        })
    }
}
