pub mod clamav;
pub mod config;
pub mod database;
pub mod error;
pub mod journal;
pub mod metrics;
pub mod quarantine;
pub mod scanner;
pub mod scheduler;
pub mod service;

pub use error::{Error, Result};
pub use scanner::{ScanResult, ScanStatus};
pub use service::{QuarantineService, SystemStatus};
