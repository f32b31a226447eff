//! Service helpers shared by the engine and the HTTP layer
//!
//! - `events` - broadcast bus for award notifications
//! - `response` - JSON response builders

pub mod events;
pub mod response;

pub use events::{spawn_logging_listener, EventBus, EventListener, RewardEvent};
