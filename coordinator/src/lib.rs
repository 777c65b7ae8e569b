pub mod actor;
pub mod config;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod monitor;
pub mod records;
pub mod socket;
pub mod state;
pub mod storage;
pub mod token;
pub mod ttl;

pub use actor::{Coordinator, CoordinatorHandle, QueueStats};
pub use config::{Config, CoordinatorConfig, StorageUrls};
pub use error::{AdmissionError, CoordinatorError};
pub use state::AppState;
