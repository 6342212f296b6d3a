//! Testing utilities for plugin developers
//!
//! Enabled with the `testing` feature.

pub mod builders;
pub mod mocks;

pub use builders::RequestBuilder;
pub use mocks::{MockPlugin, MockProbe};
