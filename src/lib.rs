//! Sideload Pack - install Android packages under fresh identities
//!
//! This crate sideloads an apk and its OBB expansion files onto a connected
//! device. Optionally the package is first moved onto a new, random package
//! identifier so several copies of the same app can live side by side.
//!
//! # Identity pipeline
//!
//! 1. Provision apktool and uber-apk-signer (downloaded once, cached)
//! 2. Decode the apk into a per-run temporary directory
//! 3. Rewrite the package identifier in `AndroidManifest.xml`
//! 4. Rebuild the apk to `<output_dir>/<new-identifier>.apk`
//! 5. Sign it in place
//! 6. Rename the OBB directory and the files inside it to match
//! 7. Remove the temporary directory
//!
//! # Quick Start
//!
//! ```no_run
//! use sideload_pack::{AdbBridge, InstallJob, SideloadConfig, TracingSink};
//!
//! let config = SideloadConfig::load("sideload.toml")?.with_rename(true);
//! let bridge = AdbBridge::from_config(&config.device);
//! let report = InstallJob::new("/downloads/game", config)
//!     .spawn(bridge, TracingSink)
//!     .join()
//!     .expect("install thread panicked")?;
//! println!("{}", report.to_json()?);
//! # Ok::<(), sideload_pack::SideloadError>(())
//! ```

mod companion;
mod config;
mod device;
mod error;
mod exec;
mod identity;
mod installer;
mod pipeline;
pub mod progress;
mod provisioner;

pub use companion::{relocate, CompanionDataSet, RelocationPlan, Rename};
pub use config::{
    DeviceConfig, IdentityConfig, InstallConfig, PipelineConfig, SideloadConfig, SigningConfig,
    ToolsConfig,
};
pub use device::{parse_package_list, AdbBridge, DeviceBridge};
pub use error::{SideloadError, SideloadResult};
pub use exec::{args, CommandExecutor, SystemCommandExecutor, ToolOutput};
pub use identity::{
    compute_new_identifier, patch, patch_attribute, IdentifierToken, IdentityRewriter,
    ManifestDocument, RandomSource, RewriteMode, SequenceRandom, ThreadRandom,
    DEFAULT_MAX_SUFFIX, DEFAULT_PREFIX,
};
pub use installer::{
    extract_zip, find_package_payload, push_companion, InputKind, InstallJob, InstallReport,
    PackagePayload,
};
pub use pipeline::{
    IdentityPipeline, PipelineResult, PipelineState, SourceArchive, MANIFEST_FILE,
};
pub use progress::{
    ConsoleProgress, NullSink, ProgressEvent, ProgressSink, ProgressStyles, RecordingSink, Stage,
    TracingSink,
};
pub use provisioner::{
    check_java, verify_checksum, Fetcher, HttpFetcher, ToolBinary, ToolKind, ToolProvisioner,
    ToolSource,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
