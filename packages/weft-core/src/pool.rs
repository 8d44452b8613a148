//! Entity id pools.
//!
//! [`IntPool`] is a lock-free FILO stack of free entity ids: `take` is a
//! single atomic decrement so any lane may draw ids concurrently, while
//! `give_back` is reserved for the director during end-of-cycle reclamation.
//! [`EntityPool`] layers ordinal stamping and handle validity on top.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use crate::entity::Entity;
use crate::error::{CheckError, Error, InternalError, Result};

/// Lock-free stack of free entity ids.
pub struct IntPool {
    slots: Box<[AtomicU32]>,
    /// Number of ids currently in the pool. Goes transiently negative under
    /// concurrent takes, which is why it is signed.
    top: AtomicI64,
    limit: u32,
}

impl IntPool {
    /// Creates a pool holding ids `1..=limit`, popped in ascending order.
    pub fn new(limit: u32) -> Self {
        let slots: Vec<AtomicU32> = (0..limit).map(|i| AtomicU32::new(limit - i)).collect();
        Self {
            slots: slots.into_boxed_slice(),
            top: AtomicI64::new(limit as i64),
            limit,
        }
    }

    /// Pops a free id. Fails when the pool is empty.
    pub fn take(&self) -> Result<u32> {
        let top = self.top.fetch_sub(1, Ordering::AcqRel);
        if top <= 0 {
            self.top.fetch_add(1, Ordering::AcqRel);
            return Err(CheckError::EntityCapacityExceeded { limit: self.limit }.into());
        }
        Ok(self.slots[(top - 1) as usize].load(Ordering::Acquire))
    }

    /// Pushes an id back. Only the director calls this, so the push does not
    /// need to contend with concurrent takes.
    pub fn give_back(&self, id: u32) -> Result<()> {
        let top = self.top.load(Ordering::Acquire);
        if top >= self.limit as i64 {
            return Err(Error::Internal(InternalError::SpuriousPoolReturn { id }));
        }
        self.slots[top as usize].store(id, Ordering::Release);
        self.top.store(top + 1, Ordering::Release);
        Ok(())
    }

    /// Number of ids currently available.
    pub fn available(&self) -> u32 {
        self.top.load(Ordering::Acquire).max(0) as u32
    }

    /// Number of ids currently handed out.
    pub fn outstanding(&self) -> u32 {
        self.limit - self.available()
    }
}

/// Entity id allocation with ordinal stamping and stale-handle detection.
pub struct EntityPool {
    ids: IntPool,
    /// Creation ordinal per id; 0 while the id sits in the pool.
    ordinals: Box<[AtomicU32]>,
    next_ordinal: AtomicU32,
}

impl EntityPool {
    pub fn new(max_entities: u32) -> Self {
        let ordinals: Vec<AtomicU32> = (0..=max_entities).map(|_| AtomicU32::new(0)).collect();
        Self {
            ids: IntPool::new(max_entities),
            ordinals: ordinals.into_boxed_slice(),
            next_ordinal: AtomicU32::new(1),
        }
    }

    /// Draws a fresh id and stamps it with the next creation ordinal.
    pub fn borrow(&self) -> Result<Entity> {
        let id = self.ids.take()?;
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::AcqRel);
        self.ordinals[id as usize].store(ordinal, Ordering::Release);
        Ok(Entity::new(id, ordinal))
    }

    /// Returns a reclaimed id to the pool and invalidates outstanding handles.
    pub fn reclaim(&self, id: u32) -> Result<()> {
        self.ordinals[id as usize].store(0, Ordering::Release);
        self.ids.give_back(id)
    }

    /// Rejects handles whose entity has been reclaimed (and possibly reused).
    pub fn check_valid(&self, entity: Entity) -> Result<()> {
        if entity.id == 0
            || self.ordinals[entity.id as usize].load(Ordering::Acquire) != entity.ordinal
        {
            return Err(CheckError::StaleEntityHandle { id: entity.id }.into());
        }
        Ok(())
    }

    /// Rebuilds a handle from a raw id, as logged entries carry ids only.
    pub fn handle_for(&self, id: u32) -> Entity {
        Entity::new(id, self.ordinals[id as usize].load(Ordering::Acquire))
    }

    /// Creation ordinal counter, exposed for cross-lane propagation.
    pub fn next_ordinal(&self) -> u32 {
        self.next_ordinal.load(Ordering::Acquire)
    }

    /// Advances the ordinal counter to at least `ordinal`.
    pub fn advance_ordinal(&self, ordinal: u32) {
        self.next_ordinal.fetch_max(ordinal, Ordering::AcqRel);
    }

    pub fn outstanding(&self) -> u32 {
        self.ids.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(1000)]
    fn take_order_is_filo() {
        let pool = IntPool::new(4);
        assert_eq!(pool.take().unwrap(), 1);
        assert_eq!(pool.take().unwrap(), 2);
        pool.give_back(1).unwrap();
        assert_eq!(pool.take().unwrap(), 1);
        assert_eq!(pool.take().unwrap(), 3);
        assert_eq!(pool.take().unwrap(), 4);
        assert!(pool.take().is_err());
    }

    #[test]
    #[timeout(1000)]
    fn spurious_return_is_rejected() {
        let pool = IntPool::new(2);
        let err = pool.give_back(1).unwrap_err();
        assert!(matches!(
            err,
            Error::Internal(InternalError::SpuriousPoolReturn { id: 1 })
        ));
    }

    #[test]
    #[timeout(1000)]
    fn stale_handles_are_rejected() {
        let pool = EntityPool::new(8);
        let a = pool.borrow().unwrap();
        assert!(pool.check_valid(a).is_ok());

        pool.reclaim(a.id()).unwrap();
        assert!(pool.check_valid(a).is_err());

        // Reusing the id produces a distinct ordinal.
        let b = pool.borrow().unwrap();
        assert_eq!(b.id(), a.id());
        assert_ne!(b.ordinal(), a.ordinal());
        assert!(pool.check_valid(b).is_ok());
        assert!(pool.check_valid(a).is_err());
    }

    #[test]
    #[timeout(1000)]
    fn concurrent_takes_hand_out_unique_ids() {
        use std::sync::Arc;

        let pool = Arc::new(IntPool::new(1000));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                let mut ids = Vec::new();
                for _ in 0..250 {
                    ids.push(pool.take().unwrap());
                }
                ids
            }));
        }
        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert!(pool.take().is_err());
    }
}
