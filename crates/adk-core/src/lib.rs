//! `adk-core` — data model, error taxonomy, configuration, the
//! observable-event bus, and the external-interface traits shared by
//! every other crate in the agent development kit.
//!
//! Nothing in this crate depends on another workspace crate; everything
//! else depends on this one.

pub mod config;
pub mod error;
pub mod events;
pub mod interfaces;
pub mod model;
pub mod sanitize;

pub use error::{AdkError, Result};
