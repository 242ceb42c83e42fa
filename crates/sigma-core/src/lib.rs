//! sigma-core: shared types, configuration schema, and the error taxonomy used
//! by the key-derivation and scatter crates.

pub mod config;
pub mod error;
pub mod types;

pub use error::{SigmaError, SigmaResult};
pub use types::{unix_now, FileId, FILE_ID_SIZE};
