//!
//! naml-std-core - Core Runtime Types
//!
//! This crate provides the fundamental types shared across the naml standard
//! library crates:
//!
//! - `HeapHeader` and `HeapTag` for reference-counted heap objects
//! - `NamlString` for heap-allocated strings with UTF-8 support
//! - Exception handling primitives for try/catch support
//!
//! All heap objects use atomic reference counting for thread safety.
//!

pub mod value;
pub mod exception;

pub use value::*;
pub use exception::*;
