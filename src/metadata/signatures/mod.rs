//! Signature types describing original methods, callbacks and locals.

mod types;

pub use types::*;
