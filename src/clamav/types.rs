use serde::{Deserialize, Serialize};

/// What the engine said about one file, decoded once at the socket boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum EngineVerdict {
    Clean,
    SignatureFound { name: String },
    EngineError { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version {
    pub clamav: String,
    pub database: u32,
    pub database_date: String,
}

/// Header of a ClamAV signature container (`.cvd` / `.cld`), the first 512
/// bytes of the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseHeader {
    pub build_time: String,
    pub version: u32,
    pub signatures: u32,
    pub functionality_level: u32,
    pub md5: String,
}
