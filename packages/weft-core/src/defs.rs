//! World definitions: the component types, enums, systems, and groups a
//! world is constructed from.
//!
//! Definitions are plain builders resolved by name at world construction;
//! the sealed world holds everything by id.

use crate::component::{FieldKind, FieldSpec, FieldValue};
use crate::query::QueryDef;
use crate::storage::StorageKind;
use crate::system::SystemLogic;

/// One entry in [`crate::WorldOptions::defs`].
pub enum WorldDef {
    Component(ComponentDef),
    Enum(ComponentEnumDef),
    System(SystemDef),
    Group(GroupDef),
}

/// Declares a component type.
#[derive(Debug, Clone)]
pub struct ComponentDef {
    pub name: String,
    pub fields: Vec<FieldSpec>,
    /// Defaults to the world's `default_component_storage`.
    pub storage: Option<StorageKind>,
    pub capacity: Option<u32>,
    pub tracks_writes: bool,
    pub internally_indexed: bool,
    pub restricted_to_main_thread: bool,
}

impl ComponentDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            storage: None,
            capacity: None,
            tracks_writes: false,
            internally_indexed: false,
            restricted_to_main_thread: false,
        }
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec::new(name, kind));
        self
    }

    pub fn field_with(
        mut self,
        name: impl Into<String>,
        kind: FieldKind,
        default: FieldValue,
    ) -> Self {
        self.fields.push(FieldSpec::new(name, kind).with_default(default));
        self
    }

    pub fn storage(mut self, storage: StorageKind) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn track_writes(mut self) -> Self {
        self.tracks_writes = true;
        self
    }

    pub fn internally_indexed(mut self) -> Self {
        self.internally_indexed = true;
        self
    }

    pub fn restricted_to_main_thread(mut self) -> Self {
        self.restricted_to_main_thread = true;
        self
    }
}

/// Declares a set of mutually exclusive component types sharing one
/// multi-bit shape slot.
pub struct ComponentEnumDef {
    pub name: String,
    pub members: Vec<ComponentDef>,
}

impl ComponentEnumDef {
    pub fn new(name: impl Into<String>, members: Vec<ComponentDef>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }
}

/// A scheduling constraint on a system.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleRule {
    Before(String),
    After(String),
    InAnyOrderWith(String),
    BeforeReadersOf(String),
    AfterReadersOf(String),
    BeforeWritersOf(String),
    AfterWritersOf(String),
    InAnyOrderWithReadersOf(String),
    InAnyOrderWithWritersOf(String),
}

/// Declares a system: its behaviour, access rights, queries, and schedule.
pub struct SystemDef {
    pub name: String,
    pub logic: Box<dyn SystemLogic>,
    pub reads: Vec<String>,
    pub writes: Vec<String>,
    pub creates: Vec<String>,
    pub updates: Vec<String>,
    pub checks: Vec<String>,
    pub queries: Vec<QueryDef>,
    pub schedule: Vec<ScheduleRule>,
    /// Relative cost hint used by the parallel planner.
    pub weight: f64,
    /// Stateless systems carry no lane affinity during merging.
    pub stateless: bool,
}

impl SystemDef {
    pub fn new(name: impl Into<String>, logic: impl SystemLogic + 'static) -> Self {
        Self {
            name: name.into(),
            logic: Box::new(logic),
            reads: Vec::new(),
            writes: Vec::new(),
            creates: Vec::new(),
            updates: Vec::new(),
            checks: Vec::new(),
            queries: Vec::new(),
            schedule: Vec::new(),
            weight: 1.0,
            stateless: false,
        }
    }

    pub fn reads<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn writes<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.writes.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn creates<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.creates.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn updates<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.updates.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn checks<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.checks.extend(types.into_iter().map(Into::into));
        self
    }

    pub fn query(mut self, query: QueryDef) -> Self {
        self.queries.push(query);
        self
    }

    pub fn schedule(mut self, rule: ScheduleRule) -> Self {
        self.schedule.push(rule);
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn stateless(mut self) -> Self {
        self.stateless = true;
        self
    }
}

/// Declares an execution group. The implicit default group holds every
/// system in definition order.
#[derive(Debug, Clone)]
pub struct GroupDef {
    pub name: String,
    pub members: Vec<String>,
}

impl GroupDef {
    pub fn new<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }
}
