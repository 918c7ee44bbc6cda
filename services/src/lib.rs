//! Volbot Services
//!
//! Control API implementations driven by chat commands.

pub mod obs;

pub use obs::{auth_response, ObsClient, ObsError};
