pub mod error;
pub mod history;
pub mod logging;
pub mod manager;
pub mod network;
pub mod policy;
pub mod process;
pub mod progress;
pub mod queue;
