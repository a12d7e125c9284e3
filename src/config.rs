//! Sideload configuration
//!
//! Loaded from a TOML file such as `sideload.toml`:
//!
//! ```toml
//! [tools]
//! cache_dir = "~/.cache/sideload-pack/tools"
//! java = "java"
//! allow_insecure = false
//!
//! [tools.decompiler]
//! url = "https://github.com/iBotPeaches/Apktool/releases/download/v2.7.0/apktool_2.7.0.jar"
//! file_name = "apktool.jar"
//!
//! [signing]                  # optional, debug key when absent
//! keystore = "android.keystore"
//! alias = "mykey"
//! password = "secret"
//!
//! [identity]
//! prefix = "com.r"
//! max_suffix = 999999
//! mode = "literal"           # or "attribute"
//!
//! [pipeline]
//! output_dir = "."
//!
//! [device]
//! adb = "adb"
//! obb_root = "/sdcard/Android/obb"
//!
//! [install]
//! rename_package = true
//! ```

use crate::error::SideloadResult;
use crate::identity::{RewriteMode, DEFAULT_MAX_SUFFIX, DEFAULT_PREFIX};
use crate::provisioner::{ToolKind, ToolSource};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete sideload configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideloadConfig {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub signing: Option<SigningConfig>,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub install: InstallConfig,
}

impl SideloadConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> SideloadResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> SideloadResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from `path` if it exists, otherwise use defaults
    pub fn load(path: impl AsRef<Path>) -> SideloadResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn with_rename(mut self, rename: bool) -> Self {
        self.install.rename_package = rename;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tools.cache_dir = dir.into();
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipeline.output_dir = dir.into();
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipeline.work_dir = dir.into();
        self
    }
}

/// Java tool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Directory the jars are cached in
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Java executable
    #[serde(default = "default_java")]
    pub java: String,
    /// Allow plain HTTP tool downloads
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default = "default_decompiler")]
    pub decompiler: ToolSource,
    #[serde(default = "default_signer")]
    pub signer: ToolSource,
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sideload-pack")
        .join("tools")
}

fn default_java() -> String {
    "java".to_string()
}

fn default_decompiler() -> ToolSource {
    ToolKind::Decompiler.default_source()
}

fn default_signer() -> ToolSource {
    ToolKind::Signer.default_source()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            java: default_java(),
            allow_insecure: false,
            decompiler: default_decompiler(),
            signer: default_signer(),
        }
    }
}

/// Keystore used instead of the signer's debug key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningConfig {
    pub keystore: PathBuf,
    pub alias: String,
    pub password: String,
    /// Defaults to the store password
    #[serde(default)]
    pub key_password: Option<String>,
}

/// Identifier generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_max_suffix")]
    pub max_suffix: u32,
    #[serde(default)]
    pub mode: RewriteMode,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_max_suffix() -> u32 {
    DEFAULT_MAX_SUFFIX
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            max_suffix: default_max_suffix(),
            mode: RewriteMode::default(),
        }
    }
}

/// Working and output locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Parent of the per-run work directories
    #[serde(default = "std::env::temp_dir")]
    pub work_dir: PathBuf,
    /// Where rebuilt archives are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir(),
            output_dir: default_output_dir(),
        }
    }
}

/// Device bridge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_adb")]
    pub adb: String,
    /// Target a specific device
    #[serde(default)]
    pub serial: Option<String>,
    /// Device directory holding per-package OBB folders
    #[serde(default = "default_obb_root")]
    pub obb_root: String,
    #[serde(default = "default_true")]
    pub no_launch: bool,
}

fn default_adb() -> String {
    "adb".to_string()
}

fn default_obb_root() -> String {
    "/sdcard/Android/obb".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb: default_adb(),
            serial: None,
            obb_root: default_obb_root(),
            no_launch: true,
        }
    }
}

/// Install job behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Rewrite the package identifier before installing
    #[serde(default)]
    pub rename_package: bool,
    /// Keep the rebuilt archive after a successful install
    #[serde(default)]
    pub keep_renamed_archive: bool,
}
