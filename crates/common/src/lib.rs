//! Common types shared by the task key proxy crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, fingerprint};
