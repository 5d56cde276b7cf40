pub mod circuits;
pub mod config;
pub mod energy;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod parser;
pub mod scheduler;
pub mod state;
pub mod validate;

pub use config::Config;
pub use error::{AppError, Result};
pub use scheduler::{PollScheduler, SchedulerState};
