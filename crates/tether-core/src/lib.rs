//! Shared vocabulary for tether: branded identifiers, the closed event
//! union that flows through a runner, and boundary parsing of the agent's
//! dynamic messages.

pub mod agent;
pub mod errors;
pub mod events;
pub mod ids;
pub mod permission;

pub use errors::CoreError;
