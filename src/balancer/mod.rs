pub mod instance;
pub mod store;
pub mod views;

pub use instance::{BalanceLabel, InstanceState, InstanceStatus};
pub use store::{ModelStore, Selection};
pub use views::{CombinedView, ModelGlobalView, NodeView};
