//! Metadata needed to identify, describe and re-emit methods.
//!
//! - [`crate::metadata::token`] - metadata tokens
//! - [`crate::metadata::signatures`] - parameter, return and local types
//! - [`crate::metadata::method`] - method identity, descriptor and body layout

/// Method identity, descriptor and body layout
pub mod method;
/// Parameter, return and local types
pub mod signatures;
/// Metadata tokens
pub mod token;
