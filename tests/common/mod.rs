//! Shared test utilities for orchestrator, chaos and integration tests.
//!
//! This module provides:
//! - An in-memory registry acting as tag lister
//! - A mock relay copying tags inside that registry
//! - A counting auth refresher
//! - `registry:2` testcontainer setup

#![allow(dead_code)]

pub mod containers;
pub mod mock_registry;

pub use containers::*;
pub use mock_registry::*;
