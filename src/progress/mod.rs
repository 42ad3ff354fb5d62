//! Live progress for running evaluations.
//!
//! The orchestrator publishes into a [`ProgressBroadcaster`]; observers
//! subscribe per session, or use [`follow`] to stay attached across lag
//! and connectivity loss.

pub mod broadcaster;
pub mod reconnect;

pub use broadcaster::ProgressBroadcaster;
pub use reconnect::{follow, Connectivity, ReconnectPolicy};
