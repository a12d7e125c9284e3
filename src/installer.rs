//! Install jobs
//!
//! Accepts an `.apk`, a `.zip` bundle or a directory, optionally moves the
//! package onto a new identifier, installs it and pushes its OBB files to
//! `<obb_root>/<identifier>/`.

use crate::companion::CompanionDataSet;
use crate::config::SideloadConfig;
use crate::device::DeviceBridge;
use crate::error::{SideloadError, SideloadResult};
use crate::identity::IdentifierToken;
use crate::pipeline::{IdentityPipeline, SourceArchive};
use crate::progress::{ProgressSink, Stage};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

/// Kind of install input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Apk,
    Zip,
    Directory,
}

impl InputKind {
    /// Classify `path`; anything else is `UnsupportedInput`
    pub fn classify(path: &Path) -> SideloadResult<Self> {
        if path.is_dir() {
            return Ok(InputKind::Directory);
        }
        if path.is_file() {
            let ext = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_ascii_lowercase);
            match ext.as_deref() {
                Some("apk") => return Ok(InputKind::Apk),
                Some("zip") => return Ok(InputKind::Zip),
                _ => {}
            }
        }
        Err(SideloadError::UnsupportedInput(path.to_path_buf()))
    }

    /// Short user-facing description
    pub fn describe(&self) -> &'static str {
        match self {
            InputKind::Apk => "Found APK file",
            InputKind::Zip => "Found ZIP archive",
            InputKind::Directory => "Found directory",
        }
    }
}

/// The apk and optional OBB directory found in an input folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagePayload {
    pub apk: PathBuf,
    pub companion: Option<PathBuf>,
}

fn glob_first(pattern: &str) -> Option<PathBuf> {
    glob::glob(pattern)
        .ok()?
        .filter_map(Result::ok)
        .find(|path| path.is_file())
}

/// Find the apk directly in `folder` and the directory of the first OBB below it
pub fn find_package_payload(folder: &Path) -> SideloadResult<PackagePayload> {
    let base = folder
        .to_str()
        .map(glob::Pattern::escape)
        .ok_or_else(|| SideloadError::UnsupportedInput(folder.to_path_buf()))?;

    let apk = glob_first(&format!("{}/*.apk", base))
        .ok_or_else(|| SideloadError::UnsupportedInput(folder.to_path_buf()))?;
    let companion = glob_first(&format!("{}/**/*.obb", base))
        .and_then(|obb| obb.parent().map(Path::to_path_buf));

    tracing::info!(
        target: "sideload::install",
        apk = %apk.display(),
        obb = ?companion,
        "Found package payload"
    );
    Ok(PackagePayload { apk, companion })
}

/// Extract a zip bundle into `dest`
pub fn extract_zip(archive_path: &Path, dest: &Path) -> SideloadResult<usize> {
    fs::create_dir_all(dest)?;

    let file = fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| SideloadError::Extraction(format!("Failed to read zip: {}", e)))?;

    let mut extracted = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| SideloadError::Extraction(format!("Failed to read zip entry: {}", e)))?;

        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!("Skipping unsafe zip entry: {}", entry.name());
            continue;
        };
        let full_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&full_path)?;
        } else {
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = fs::File::create(&full_path)?;
            io::copy(&mut entry, &mut outfile)?;
            extracted += 1;
        }
    }

    tracing::info!(
        "Unpacked {} files from {}",
        extracted,
        archive_path.display()
    );
    Ok(extracted)
}

/// Create `<obb_root>/<dir name>` on the device and push every `.obb` in `root`
pub fn push_companion(
    bridge: &dyn DeviceBridge,
    root: &Path,
    obb_root: &str,
    sink: &dyn ProgressSink,
) -> SideloadResult<Vec<String>> {
    let set = CompanionDataSet::discover(root)?;
    let dir_name = set
        .token()
        .ok_or_else(|| SideloadError::UnsupportedInput(root.to_path_buf()))?;
    let remote_dir = format!("{}/{}", obb_root.trim_end_matches('/'), dir_name);

    let obb_files: Vec<&PathBuf> = set
        .files
        .iter()
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("obb"))
        })
        .collect();
    if obb_files.is_empty() {
        return Ok(Vec::new());
    }

    sink.report(Stage::Push, "Installing obb files");
    bridge.shell(&format!("mkdir -p {}", remote_dir))?;

    let mut pushed = Vec::with_capacity(obb_files.len());
    for file in obb_files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote = format!("{}/{}", remote_dir, name);
        bridge.push(file, &remote)?;
        sink.report(Stage::Push, &format!("Installed {}", file.display()));
        pushed.push(remote);
    }
    Ok(pushed)
}

/// Summary of a finished install
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub input: InputKind,
    /// Archive handed to the device
    pub archive: PathBuf,
    /// Set when the package was renamed
    pub identifier: Option<IdentifierToken>,
    /// Local OBB directory that was pushed
    pub companion_root: Option<PathBuf>,
    /// Remote paths of pushed OBB files
    pub pushed: Vec<String>,
}

impl InstallReport {
    pub fn to_json(&self) -> SideloadResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// One install of an apk, zip bundle or folder
pub struct InstallJob {
    input: PathBuf,
    config: SideloadConfig,
    pipeline: Option<IdentityPipeline>,
}

impl InstallJob {
    pub fn new(input: impl Into<PathBuf>, config: SideloadConfig) -> Self {
        Self {
            input: input.into(),
            config,
            pipeline: None,
        }
    }

    /// Use a preconfigured identity pipeline for renames
    pub fn with_pipeline(mut self, pipeline: IdentityPipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Run the job on a background thread
    pub fn spawn<B, S>(self, bridge: B, sink: S) -> JoinHandle<SideloadResult<InstallReport>>
    where
        B: DeviceBridge + Send + 'static,
        S: ProgressSink + Send + 'static,
    {
        thread::spawn(move || {
            let mut job = self;
            job.run(&bridge, &sink)
        })
    }

    /// Run the job on the current thread
    pub fn run(
        &mut self,
        bridge: &dyn DeviceBridge,
        sink: &dyn ProgressSink,
    ) -> SideloadResult<InstallReport> {
        sink.report(Stage::Install, "Installer started...");
        // Pipeline failures are already reported by the pipeline itself.
        let mut reported = false;
        let result = self.execute(bridge, sink, &mut reported);
        match &result {
            Ok(_) => sink.report(Stage::Cleanup, "Installing complete"),
            Err(_) if reported => {}
            Err(e) => {
                let stage = e.stage().unwrap_or(Stage::Install);
                sink.report(stage, &format!("Error: {}", e));
            }
        }
        result
    }

    fn execute(
        &mut self,
        bridge: &dyn DeviceBridge,
        sink: &dyn ProgressSink,
        reported: &mut bool,
    ) -> SideloadResult<InstallReport> {
        let kind = InputKind::classify(&self.input)?;
        sink.report(Stage::Install, kind.describe());

        // Extracted bundles live until the job ends.
        let (payload, _extracted) = match kind {
            InputKind::Apk => (
                PackagePayload {
                    apk: self.input.clone(),
                    companion: None,
                },
                None,
            ),
            InputKind::Zip => {
                sink.report(Stage::Extract, "Unpacking ZIP...");
                fs::create_dir_all(&self.config.pipeline.work_dir)?;
                let dir = tempfile::Builder::new()
                    .prefix("sideload-zip-")
                    .tempdir_in(&self.config.pipeline.work_dir)?;
                extract_zip(&self.input, dir.path())?;
                (find_package_payload(dir.path())?, Some(dir))
            }
            InputKind::Directory => (find_package_payload(&self.input)?, None),
        };

        let (archive, companion_root, identifier) = if self.config.install.rename_package {
            sink.report(Stage::Rewrite, "Renaming package...");
            let config = &self.config;
            let pipeline = self
                .pipeline
                .get_or_insert_with(|| IdentityPipeline::from_config(config));
            let result = pipeline
                .run(
                    &SourceArchive::new(&payload.apk),
                    payload.companion.as_deref(),
                    sink,
                )
                .inspect_err(|_| *reported = true)?;
            let root = result.companion_root().map(Path::to_path_buf);
            (result.archive, root, Some(result.identifier))
        } else {
            (payload.apk, payload.companion, None)
        };

        let delivered = self.deliver(bridge, &archive, companion_root.as_deref(), sink);

        // A rebuilt archive is removed whether or not delivery succeeded.
        sink.report(Stage::Cleanup, "Cleaning files");
        let removed = if identifier.is_some() && !self.config.install.keep_renamed_archive {
            fs::remove_file(&archive)
        } else {
            Ok(())
        };
        let pushed = delivered?;
        removed?;

        Ok(InstallReport {
            input: kind,
            archive,
            identifier,
            companion_root,
            pushed,
        })
    }

    /// Install the archive, then push its OBB files
    fn deliver(
        &self,
        bridge: &dyn DeviceBridge,
        archive: &Path,
        companion_root: Option<&Path>,
        sink: &dyn ProgressSink,
    ) -> SideloadResult<Vec<String>> {
        sink.report(Stage::Install, &format!("Installing {}", archive.display()));
        bridge.install(archive, self.config.device.no_launch)?;

        match companion_root {
            Some(root) => push_companion(bridge, root, &self.config.device.obb_root, sink),
            None => Ok(Vec::new()),
        }
    }
}
