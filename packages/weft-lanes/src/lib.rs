//! Multi-lane worker coordination for the weft entity-component-system.
//!
//! One director owns the sealed parallel plan and drives one laborer per
//! lane over message channels; buffers patches and the entity ordinal ride
//! on every request and response.

pub mod director;
pub mod laborer;
pub mod request;

pub use director::{Director, DirectorError, DirectorResult};
pub use laborer::Laborer;
pub use request::{Action, Request, Response, WireError};
