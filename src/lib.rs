pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod ledger;
pub mod node;
pub mod registry;
pub mod shutdown;
pub mod store;

pub use error::{ControllerError, Result};
