pub mod error;
pub mod verifier;

pub use error::{IntegrityError, IntegrityResult};
pub use verifier::IntegrityVerifier;
