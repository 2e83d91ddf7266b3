pub mod forward;
pub mod health;
pub mod monitor;

pub use monitor::{ToolMonitor, ToolTarget};
