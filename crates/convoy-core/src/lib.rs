pub mod envelope;
pub mod errors;
pub mod ids;
pub mod model;

pub use envelope::{ClientEnvelope, EnvelopeError, ServerEnvelope};
pub use errors::{AuthFailure, ChatError};
