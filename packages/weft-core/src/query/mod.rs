//! Query matching and reactive delta lists.
//!
//! A query is sealed from name-based clauses into type-id masks. The engine
//! feeds it shape and write events as change logs drain; the query keeps its
//! `current` membership up to date and appends to whichever transient lists
//! (added, removed, changed, and their composites) were requested. Transient
//! lists clear at frame start, so a frame's deltas stay readable after the
//! frame ends.

mod list;

pub use list::{EntityBitset, PackedEntityList, TransientList};

use crate::entity::{Entity, ALIVE_TYPE_ID};
use crate::error::{CheckError, Result};
use crate::mask::TypeMask;
use crate::world::WorldShared;

/// Orders a query's current list by a numeric key per entity.
pub type OrderKeyFn = Box<dyn Fn(Entity) -> f64 + Send + Sync>;

/// Which lists a query materialises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFlavors {
    pub current: bool,
    pub added: bool,
    pub removed: bool,
    pub changed: bool,
    pub added_or_changed: bool,
    pub changed_or_removed: bool,
    pub added_changed_or_removed: bool,
}

/// One list of a query, for retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFlavor {
    Current,
    Added,
    Removed,
    Changed,
    AddedOrChanged,
    ChangedOrRemoved,
    AddedChangedOrRemoved,
}

impl QueryFlavor {
    fn label(&self) -> &'static str {
        match self {
            QueryFlavor::Current => "current",
            QueryFlavor::Added => "added",
            QueryFlavor::Removed => "removed",
            QueryFlavor::Changed => "changed",
            QueryFlavor::AddedOrChanged => "addedOrChanged",
            QueryFlavor::ChangedOrRemoved => "changedOrRemoved",
            QueryFlavor::AddedChangedOrRemoved => "addedChangedOrRemoved",
        }
    }
}

/// A query as declared on a system, with clauses by type name.
#[derive(Default)]
pub struct QueryDef {
    pub with: Vec<String>,
    pub without: Vec<String>,
    pub with_any: Vec<Vec<String>>,
    pub track: Vec<String>,
    pub flavors: QueryFlavors,
    pub order_by: Option<OrderKeyFn>,
}

impl QueryDef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn without<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.without.extend(types.into_iter().map(Into::into));
        self
    }

    /// Adds one any-of clause; the query matches only if at least one type
    /// of every such clause is present.
    pub fn with_any<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_any
            .push(types.into_iter().map(Into::into).collect());
        self
    }

    /// Tracks writes to the named types for the changed flavours.
    pub fn track<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.track.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn current(mut self) -> Self {
        self.flavors.current = true;
        self
    }

    pub fn added(mut self) -> Self {
        self.flavors.added = true;
        self
    }

    pub fn removed(mut self) -> Self {
        self.flavors.removed = true;
        self
    }

    pub fn changed(mut self) -> Self {
        self.flavors.changed = true;
        self
    }

    pub fn added_or_changed(mut self) -> Self {
        self.flavors.added_or_changed = true;
        self
    }

    pub fn changed_or_removed(mut self) -> Self {
        self.flavors.changed_or_removed = true;
        self
    }

    pub fn added_changed_or_removed(mut self) -> Self {
        self.flavors.added_changed_or_removed = true;
        self
    }

    pub fn order_by(mut self, key: impl Fn(Entity) -> f64 + Send + Sync + 'static) -> Self {
        self.order_by = Some(Box::new(key));
        self
    }
}

struct OrderState {
    key: OrderKeyFn,
    max_key: f64,
    sorted: bool,
}

/// A sealed query and its lists.
pub struct QueryState {
    with: TypeMask,
    without: TypeMask,
    with_any: Vec<TypeMask>,
    track: TypeMask,
    flavors: QueryFlavors,
    /// Packed list when `current` was requested; shadow bitset otherwise.
    current: Option<PackedEntityList>,
    shadow: Option<EntityBitset>,
    added: Option<TransientList>,
    removed: Option<TransientList>,
    changed: Option<TransientList>,
    added_or_changed: Option<TransientList>,
    changed_or_removed: Option<TransientList>,
    added_changed_or_removed: Option<TransientList>,
    order: Option<OrderState>,
    /// Stamp of the frame the transient lists belong to.
    frame: u64,
}

impl QueryState {
    /// Resolves a definition against the sealed component types.
    pub fn seal(def: QueryDef, shared: &WorldShared) -> Result<Self> {
        let type_count = shared.types.len();
        let resolve = |names: &[String]| -> Result<TypeMask> {
            let mut mask = TypeMask::new(type_count);
            for name in names {
                mask.set(shared.type_id(name)?);
            }
            Ok(mask)
        };

        let mut with = resolve(&def.with)?;
        with.set(ALIVE_TYPE_ID);
        let track = resolve(&def.track)?;
        for type_id in track.ones() {
            if !shared.types[type_id as usize].tracks_writes {
                return Err(CheckError::InvalidOptions(format!(
                    "query tracks '{}', which does not track writes",
                    shared.types[type_id as usize].name
                ))
                .into());
            }
        }
        let wants_changed = def.flavors.changed
            || def.flavors.added_or_changed
            || def.flavors.changed_or_removed
            || def.flavors.added_changed_or_removed;
        if wants_changed && track.is_empty() {
            return Err(CheckError::InvalidOptions(
                "changed flavours require tracked types".to_string(),
            )
            .into());
        }

        let max = shared.settings.max_entities;
        let transient = |requested: bool| requested.then(|| TransientList::new(max));
        Ok(Self {
            with,
            without: resolve(&def.without)?,
            with_any: def
                .with_any
                .iter()
                .map(|group| resolve(group))
                .collect::<Result<_>>()?,
            track,
            flavors: def.flavors,
            current: def.flavors.current.then(|| PackedEntityList::new(max)),
            shadow: (!def.flavors.current).then(|| EntityBitset::new(max)),
            added: transient(def.flavors.added),
            removed: transient(def.flavors.removed),
            changed: transient(def.flavors.changed),
            added_or_changed: transient(def.flavors.added_or_changed),
            changed_or_removed: transient(def.flavors.changed_or_removed),
            added_changed_or_removed: transient(def.flavors.added_changed_or_removed),
            order: def.order_by.map(|key| OrderState {
                key,
                max_key: f64::NEG_INFINITY,
                sorted: true,
            }),
            frame: 0,
        })
    }

    pub fn contains(&self, id: u32) -> bool {
        match (&self.current, &self.shadow) {
            (Some(list), _) => list.contains(id),
            (None, Some(shadow)) => shadow.contains(id),
            (None, None) => false,
        }
    }

    /// Applies one shape event: compares tracked membership against the
    /// live match and records the transition.
    pub fn handle_shape_update(&mut self, shared: &WorldShared, id: u32) -> Result<()> {
        let had = self.contains(id);
        let has = shared.match_shape(id, &self.with, &self.without, &self.with_any);
        if has == had {
            return Ok(());
        }
        if has {
            if let Some(list) = &mut self.current {
                list.add(id);
                if let Some(order) = &mut self.order {
                    let key = (order.key)(shared.entities.handle_for(id));
                    if key < order.max_key {
                        order.sorted = false;
                    } else {
                        order.max_key = key;
                    }
                }
            }
            if let Some(shadow) = &mut self.shadow {
                shadow.insert(id);
            }
            if let Some(list) = &mut self.added {
                list.push_dedup(id);
            }
            if let Some(list) = &mut self.added_or_changed {
                list.push_dedup(id);
            }
            if let Some(list) = &mut self.added_changed_or_removed {
                list.push_dedup(id);
            }
        } else {
            if let Some(list) = &mut self.current {
                // Ordered lists shift so removal doesn't unsort them.
                if self.order.is_some() {
                    list.remove_ordered(id);
                } else {
                    list.remove(id);
                }
            }
            if let Some(shadow) = &mut self.shadow {
                shadow.remove(id);
            }
            if let Some(list) = &mut self.removed {
                list.push_dedup(id);
            }
            if let Some(list) = &mut self.changed_or_removed {
                list.push_dedup(id);
            }
            if let Some(list) = &mut self.added_changed_or_removed {
                list.push_dedup(id);
            }
        }
        Ok(())
    }

    /// Applies one write event for a tracked component type.
    pub fn handle_write(&mut self, shared: &WorldShared, id: u32, type_id: u16) -> Result<()> {
        if !self.track.contains(type_id) {
            return Ok(());
        }
        if !shared.match_shape(id, &self.with, &self.without, &self.with_any) {
            return Ok(());
        }
        if let Some(list) = &mut self.changed {
            list.push_dedup(id);
        }
        if let Some(list) = &mut self.added_or_changed {
            list.push_dedup(id);
        }
        if let Some(list) = &mut self.changed_or_removed {
            list.push_dedup(id);
        }
        if let Some(list) = &mut self.added_changed_or_removed {
            list.push_dedup(id);
        }
        Ok(())
    }

    /// Clears the transient lists on the first touch of a new frame, so a
    /// completed frame's deltas stay readable until the next frame starts.
    pub fn ensure_frame(&mut self, frame: u64) {
        if self.frame == frame {
            return;
        }
        self.frame = frame;
        for list in [
            &mut self.added,
            &mut self.removed,
            &mut self.changed,
            &mut self.added_or_changed,
            &mut self.changed_or_removed,
            &mut self.added_changed_or_removed,
        ]
        .into_iter()
        .flatten()
        {
            list.clear();
        }
        if let Some(order) = &mut self.order {
            order.sorted = false;
        }
    }

    /// The requested list's entity ids. Sorts an ordered current list
    /// lazily before its first iteration of the frame.
    pub fn entity_ids(&mut self, shared: &WorldShared, flavor: QueryFlavor) -> Result<Vec<u32>> {
        let requested = match flavor {
            QueryFlavor::Current => self.flavors.current,
            QueryFlavor::Added => self.flavors.added,
            QueryFlavor::Removed => self.flavors.removed,
            QueryFlavor::Changed => self.flavors.changed,
            QueryFlavor::AddedOrChanged => self.flavors.added_or_changed,
            QueryFlavor::ChangedOrRemoved => self.flavors.changed_or_removed,
            QueryFlavor::AddedChangedOrRemoved => self.flavors.added_changed_or_removed,
        };
        if !requested {
            return Err(CheckError::FlavorNotRequested {
                flavor: flavor.label(),
            }
            .into());
        }
        if flavor == QueryFlavor::Current {
            let list = self.current.as_mut().expect("current flavour has a list");
            if let Some(order) = &mut self.order {
                if !order.sorted {
                    let key = &order.key;
                    list.sort_by_key(|id| key(shared.entities.handle_for(id)));
                    order.sorted = true;
                    order.max_key = list
                        .entries()
                        .last()
                        .map(|&id| key(shared.entities.handle_for(id)))
                        .unwrap_or(f64::NEG_INFINITY);
                }
            }
            return Ok(list.entries().to_vec());
        }
        let list = match flavor {
            QueryFlavor::Added => &self.added,
            QueryFlavor::Removed => &self.removed,
            QueryFlavor::Changed => &self.changed,
            QueryFlavor::AddedOrChanged => &self.added_or_changed,
            QueryFlavor::ChangedOrRemoved => &self.changed_or_removed,
            QueryFlavor::AddedChangedOrRemoved => &self.added_changed_or_removed,
            QueryFlavor::Current => unreachable!(),
        };
        Ok(list.as_ref().expect("requested flavour has a list").entries().to_vec())
    }

    /// Current size without flavour checks, for the invariant checker.
    pub fn current_len(&self) -> usize {
        self.current.as_ref().map(|l| l.len()).unwrap_or(0)
    }

    /// The first entity whose tracked membership disagrees with the live
    /// shape, if any. Used by the invariant checker at quiescent points.
    pub fn find_membership_mismatch(&self, shared: &WorldShared) -> Option<u32> {
        (1..=shared.settings.max_entities).find(|&id| {
            self.contains(id) != shared.match_shape(id, &self.with, &self.without, &self.with_any)
        })
    }
}
