pub mod config;
pub mod error;
pub mod events;
pub mod retry;
pub mod types;

pub use config::CatalogConfig;
pub use error::{CatalogError, Result};
pub use events::{CatalogEvent, EventBus};
pub use retry::RetryPolicy;
pub use types::*;
