//! The director/laborer message contract.
//!
//! Every request carries the current entity creation ordinal and an
//! optional buffers patch; every response returns the updated ordinal and
//! the laborer's outgoing patch. Errors cross the boundary flattened to
//! `{name, message, stack}` and are rehydrated on the director.

use weft_core::buffers::BuffersPatch;
use weft_core::Error;

use serde::{Deserialize, Serialize};

/// What the director asks a laborer to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    Bootstrap,
    PrepareSystem(usize),
    InitializeSystem(usize),
    ExecuteSystem {
        system: usize,
        time: f64,
        delta: f64,
    },
    FinalizeSystem(usize),
    Release,
}

/// A director-to-laborer request.
pub struct Request {
    pub id: u32,
    pub action: Action,
    pub next_entity_ordinal: u32,
    pub buffers_patch: Option<BuffersPatch>,
}

/// A laborer-to-director response.
pub struct Response {
    pub id: u32,
    pub lane: usize,
    pub result: Result<(), WireError>,
    pub next_entity_ordinal: u32,
    pub buffers_patch: BuffersPatch,
}

/// An engine error flattened for the boundary crossing.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{name} in laborer: {message}")]
pub struct WireError {
    pub name: String,
    pub message: String,
    pub stack: String,
}

impl From<&Error> for WireError {
    fn from(error: &Error) -> Self {
        let name = match error {
            Error::Check(_) => "CheckError",
            Error::Internal(_) => "InternalError",
        };
        Self {
            name: name.to_string(),
            message: error.to_string(),
            stack: std::backtrace::Backtrace::capture().to_string(),
        }
    }
}
