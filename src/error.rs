//! Error types for sideload-pack

use crate::progress::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for sideload operations
pub type SideloadResult<T> = Result<T, SideloadError>;

/// Errors that can occur while rewriting or sideloading a package
#[derive(Error, Debug)]
pub enum SideloadError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Tool download or cache failure
    #[error("Provisioning error: {0}")]
    Provisioning(String),

    /// An external tool (decompiler, recompiler, signer) exited unsuccessfully
    #[error("{stage} failed ({status}): {output}")]
    ExternalTool {
        /// Stage the tool was run for
        stage: Stage,
        /// Exit status description
        status: String,
        /// Captured stdout/stderr
        output: String,
    },

    /// The decompiled tree has no AndroidManifest.xml
    #[error("AndroidManifest.xml not found in {0}")]
    ManifestNotFound(PathBuf),

    /// The manifest exists but cannot be read as a package manifest
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// A companion data rename failed
    #[error(
        "Failed to rename {} to {}: {source} (rolled back: {rolled_back})",
        from.display(),
        to.display()
    )]
    Relocation {
        /// Path being renamed
        from: PathBuf,
        /// Intended target path
        to: PathBuf,
        /// Underlying filesystem error
        #[source]
        source: std::io::Error,
        /// Whether already-applied renames were restored
        rolled_back: bool,
    },

    /// Device bridge call failed
    #[error("Device communication error: {0}")]
    DeviceCommunication(String),

    /// Input path is not an apk, zip or directory
    #[error("Unsupported input: {0}")]
    UnsupportedInput(PathBuf),

    /// Zip extraction error
    #[error("Extraction error: {0}")]
    Extraction(String),
}

impl SideloadError {
    /// Pipeline stage this error is reported under, if any
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SideloadError::Provisioning(_) => Some(Stage::Provision),
            SideloadError::ExternalTool { stage, .. } => Some(*stage),
            SideloadError::ManifestNotFound(_) | SideloadError::InvalidManifest(_) => {
                Some(Stage::Rewrite)
            }
            SideloadError::Relocation { .. } => Some(Stage::Relocate),
            SideloadError::DeviceCommunication(_) => Some(Stage::Install),
            SideloadError::Extraction(_) => Some(Stage::Extract),
            _ => None,
        }
    }
}
