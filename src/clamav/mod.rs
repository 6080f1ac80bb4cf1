pub mod client;
pub mod parser;
pub mod types;

pub use client::{ClamAVClient, ClamAVClientImpl, ClamAVConnection, ScanMode};
pub use types::{DatabaseHeader, EngineVerdict, Version};
