use std::path::PathBuf;

use thiserror::Error;

/// Startup configuration failures. These abort the process with exit code 2.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("`{key}` out of range: {value} (allowed {min}..={max})")]
    OutOfRange {
        key: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("options blob at {path} is not valid JSON: {source}")]
    MalformedOptions {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub const EXIT_CODE: i32 = 2;
}

/// Data-file failures. Fatal (exit code 3) only when they leave a
/// default-enabled engine without usable data; opt-in engines degrade to
/// disabled instead.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("no usable data for required engine `{engine}` (missing categories: {missing:?})")]
    RequiredEngineData {
        engine: &'static str,
        missing: Vec<String>,
    },
}

impl DataError {
    pub const EXIT_CODE: i32 = 3;
}
