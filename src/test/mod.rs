//! Shared helpers for unit tests: a small CIL evaluator to execute synthesized bodies and an
//! in-process runtime backed by arena memory.

mod evaluator;
mod runtime;

pub use evaluator::*;
pub use runtime::*;

use crate::metadata::method::write_body;

// Helper function to wrap raw code into a tiny or fat method body without locals
pub fn method_body(code: &[u8], max_stack: u16) -> Vec<u8> {
    write_body(code, max_stack, 0, false, &[]).unwrap()
}
