//! Runtime error types.
//!
//! Errors come in two tiers: [`CheckError`] for precondition violations the
//! host program can avoid, and [`InternalError`] for conditions that should
//! be impossible and indicate a bug in the engine.

use thiserror::Error;

/// Precondition violations caused by misuse of the engine API.
///
/// The world is left in a consistent state; changes staged before the error
/// but not yet flushed are discarded with their corral.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckError {
    /// Entity id pool exhausted
    #[error("entity capacity of {limit} exceeded; raise max_entities")]
    EntityCapacityExceeded { limit: u32 },

    /// A change log (or a consumer pointer into it) overflowed
    #[error("{log} log capacity of {capacity} exceeded; raise {param}")]
    LogCapacityExceeded {
        log: &'static str,
        capacity: usize,
        param: &'static str,
    },

    /// Component added to an entity that already has it
    #[error("entity {entity} already has component '{component}'")]
    DuplicateComponent { entity: u32, component: String },

    /// Component removed from (or read on) an entity that doesn't have it
    #[error("entity {entity} has no component '{component}'")]
    MissingComponent { entity: u32, component: String },

    /// Two members of the same component enum added in one call
    #[error("components '{first}' and '{second}' are both members of enum '{group}' and are mutually exclusive")]
    EnumConflict {
        group: String,
        first: String,
        second: String,
    },

    /// The engine-managed alive tag was added or removed directly
    #[error("component '{0}' is managed by the engine")]
    ReservedComponent(String),

    /// Entity handle outlived the entity it referred to
    #[error("stale entity handle for id {id}; the entity was deleted and the id reused")]
    StaleEntityHandle { id: u32 },

    /// Component accessed from a system that didn't declare access to it
    #[error("system '{system}' accessed component '{component}' without declaring it")]
    UndeclaredAccess { system: String, component: String },

    /// Query list iterated without the matching flavour having been requested
    #[error("query did not request the '{flavor}' flavour")]
    FlavorNotRequested { flavor: &'static str },

    /// The schedule constraints form a cycle
    #[error("precedence cycle among systems: {}", systems.join(" -> "))]
    PrecedenceCycle { systems: Vec<String> },

    /// A packed or compact column hit its configured capacity
    #[error("component '{component}' exceeded its capacity of {capacity}")]
    ComponentCapacityExceeded { component: String, capacity: u32 },

    /// World construction options are inconsistent
    #[error("invalid world options: {0}")]
    InvalidOptions(String),

    /// Field accessed with the wrong typed accessor
    #[error("field '{field}' is {actual}, not {requested}")]
    FieldTypeMismatch {
        field: String,
        actual: &'static str,
        requested: &'static str,
    },

    /// Dynamic string value longer than the field allows
    #[error("value of {len} bytes exceeds the {limit}-byte limit of field '{field}'")]
    StringTooLong {
        field: String,
        limit: usize,
        len: usize,
    },

    /// Static string value not among the field's declared choices
    #[error("'{value}' is not a declared choice of field '{field}'")]
    UnknownChoice { field: String, value: String },

    /// Name lookup failed
    #[error("no component type named '{0}'")]
    UnknownComponentType(String),

    /// Name lookup failed
    #[error("no system named '{0}'")]
    UnknownSystem(String),

    /// Name lookup failed
    #[error("no group named '{0}'")]
    UnknownGroup(String),

    /// Name lookup failed
    #[error("component '{component}' has no field named '{field}'")]
    UnknownField { component: String, field: String },

    /// World configured for multiple lanes but driven directly
    #[error("world was built with {threads} lanes; execute it through a lane director")]
    ThreadedExecution { threads: usize },

    /// `terminate` called twice
    #[error("world is already terminated")]
    AlreadyTerminated,
}

/// Invariant violations. These indicate a bug in the engine itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InternalError {
    /// A log consumer pointer points past the log head
    #[error("log pointer ahead of the {log} log head; please report a bug")]
    PointerAheadOfLog { log: &'static str },

    /// More ids returned to the pool than were ever taken
    #[error("entity id {id} returned with no outstanding borrow; please report a bug")]
    SpuriousPoolReturn { id: u32 },

    /// A log entry referenced a component type id that was never defined
    #[error("log entry referenced unknown component type id {0}; please report a bug")]
    UnknownTypeId(u16),

    /// Shape bit set but the storage strategy has no row for the entity
    #[error("entity {entity} has component type {type_id} in its shape but no storage row; please report a bug")]
    MissingRow { entity: u32, type_id: u16 },

    /// The invariant checker found an inconsistency
    #[error("invariant violated: {0}; please report a bug")]
    InvariantViolated(String),
}

/// Top-level error type for all engine operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Check(#[from] CheckError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

pub type Result<T> = std::result::Result<T, Error>;
