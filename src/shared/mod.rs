//! Shared state and messaging between trigger sources, the worker and the
//! presentation sink

pub mod messages;
pub mod process;
pub mod state;

pub use messages::AppEvent;
pub use state::{IndexHandle, RuntimeStats, StatsSnapshot};
