//! Low-level byte access shared by the instruction codec and method body parsing.
//!
//! - [`crate::file::io`] - bounds-checked little-endian primitive reads and writes
//! - [`crate::file::parser`] - cursor-based reader used by the decoder

pub mod io;
pub mod parser;
