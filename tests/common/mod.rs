//! Common test utilities and helpers
//!
//! - Message and notification fixtures
//! - Scripted history and mutation fakes
//! - Engine harness over the in-memory broker
//! - Assertion and polling macros

#![allow(dead_code)]

pub mod assertions;
pub mod fakes;
pub mod fixtures;

pub use fakes::*;
pub use fixtures::*;
