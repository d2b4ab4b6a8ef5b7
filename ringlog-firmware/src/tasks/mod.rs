//! Embassy async tasks
//!
//! Each task runs independently and communicates via channels/signals.

pub mod store;
pub mod tick;

pub use store::{store_task, Store};
pub use tick::tick_task;
