//! Testing utilities and mock implementations
//!
//! Lets the publisher, listener and dispatcher be exercised without a broker.

pub mod mocks;

pub use mocks::*;
