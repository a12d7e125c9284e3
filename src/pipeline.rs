//! Package identity pipeline
//!
//! Runs provision → decompile → rewrite → recompile → sign → relocate →
//! cleanup, each stage gating the next. Every run decodes into its own
//! temporary directory, which is removed on every exit path, and writes the
//! rebuilt archive to `<output_dir>/<new-identifier>.apk`.

use crate::companion::{relocate, CompanionDataSet};
use crate::config::{SideloadConfig, SigningConfig};
use crate::error::{SideloadError, SideloadResult};
use crate::exec::{CommandExecutor, SystemCommandExecutor, ToolOutput};
use crate::identity::{IdentifierToken, IdentityRewriter};
use crate::progress::{ProgressSink, Stage};
use crate::provisioner::{check_java, ToolBinary, ToolKind, ToolProvisioner};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Manifest file name inside a decoded apk
pub const MANIFEST_FILE: &str = "AndroidManifest.xml";

/// Input archive; never modified by the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceArchive {
    path: PathBuf,
}

impl SourceArchive {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Pending,
    Provisioned,
    Decompiled,
    Rewritten,
    Recompiled,
    Signed,
    Relocated,
    Done,
    Failed(Stage),
}

/// Output of a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    /// Signed, rebuilt archive
    pub archive: PathBuf,
    pub identifier: IdentifierToken,
    /// Relocated companion data, if any was supplied
    pub companion: Option<CompanionDataSet>,
}

impl PipelineResult {
    pub fn companion_root(&self) -> Option<&Path> {
        self.companion.as_ref().map(|set| set.root.as_path())
    }
}

/// Rewrites an apk onto a fresh package identifier
pub struct IdentityPipeline {
    provisioner: ToolProvisioner,
    rewriter: IdentityRewriter,
    executor: Box<dyn CommandExecutor + Send + Sync>,
    java: String,
    signing: Option<SigningConfig>,
    work_dir: PathBuf,
    output_dir: PathBuf,
    state: PipelineState,
}

impl IdentityPipeline {
    pub fn new(provisioner: ToolProvisioner, rewriter: IdentityRewriter) -> Self {
        Self {
            provisioner,
            rewriter,
            executor: Box::new(SystemCommandExecutor),
            java: "java".to_string(),
            signing: None,
            work_dir: std::env::temp_dir(),
            output_dir: PathBuf::from("."),
            state: PipelineState::Pending,
        }
    }

    /// Build a pipeline from configuration
    pub fn from_config(config: &SideloadConfig) -> Self {
        let tools = &config.tools;
        let provisioner = ToolProvisioner::new(&tools.cache_dir)
            .allow_insecure(tools.allow_insecure)
            .with_source(ToolKind::Decompiler, tools.decompiler.clone())
            .with_source(ToolKind::Signer, tools.signer.clone());
        let rewriter = IdentityRewriter::new()
            .with_prefix(config.identity.prefix.clone())
            .with_max_suffix(config.identity.max_suffix)
            .with_mode(config.identity.mode);

        let mut pipeline = Self::new(provisioner, rewriter)
            .with_java(tools.java.clone())
            .with_work_dir(&config.pipeline.work_dir)
            .with_output_dir(&config.pipeline.output_dir);
        pipeline.signing = config.signing.clone();
        pipeline
    }

    pub fn with_executor(mut self, executor: impl CommandExecutor + Send + Sync + 'static) -> Self {
        self.executor = Box::new(executor);
        self
    }

    pub fn with_java(mut self, java: impl Into<String>) -> Self {
        self.java = java.into();
        self
    }

    pub fn with_signing(mut self, signing: SigningConfig) -> Self {
        self.signing = Some(signing);
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn rewriter(&self) -> &IdentityRewriter {
        &self.rewriter
    }

    /// Run the whole pipeline for `archive`
    ///
    /// `companion` is the OBB directory to relocate, if any. Failures are
    /// reported to `sink` tagged with the failing stage and returned; no
    /// stage is retried.
    pub fn run(
        &mut self,
        archive: &SourceArchive,
        companion: Option<&Path>,
        sink: &dyn ProgressSink,
    ) -> SideloadResult<PipelineResult> {
        self.state = PipelineState::Pending;
        let mut stage = Stage::Provision;

        let result = self.execute(archive, companion, sink, &mut stage);
        if let Err(e) = &result {
            let stage = e.stage().unwrap_or(stage);
            self.state = PipelineState::Failed(stage);
            tracing::error!(target: "sideload::pipeline", stage = %stage, "Pipeline failed: {}", e);
            sink.report(stage, &format!("Error: {}", e));
        }
        result
    }

    fn execute(
        &mut self,
        archive: &SourceArchive,
        companion: Option<&Path>,
        sink: &dyn ProgressSink,
        stage: &mut Stage,
    ) -> SideloadResult<PipelineResult> {
        if !archive.exists() {
            return Err(SideloadError::UnsupportedInput(archive.path().to_path_buf()));
        }

        *stage = Stage::Provision;
        sink.report(*stage, "Provisioning tools...");
        let java = check_java(self.executor.as_ref(), &self.java)?;
        tracing::debug!(target: "sideload::pipeline", java = %java, "Java available");
        let apktool = self.provisioner.ensure(ToolKind::Decompiler)?;
        let signer = self.provisioner.ensure(ToolKind::Signer)?;
        self.state = PipelineState::Provisioned;

        *stage = Stage::Decompile;
        sink.report(*stage, &format!("Decoding {}", archive.path().display()));
        fs::create_dir_all(&self.work_dir)?;
        // Dropped (and deleted) on every early return below.
        let work = tempfile::Builder::new()
            .prefix("sideload-")
            .tempdir_in(&self.work_dir)?;
        let decoded = work.path().join("decoded");
        self.run_jar(
            &apktool,
            vec![
                "d".into(),
                "-f".into(),
                "-o".into(),
                decoded.clone().into(),
                archive.path().into(),
            ],
            *stage,
        )?;
        self.state = PipelineState::Decompiled;

        *stage = Stage::Rewrite;
        let manifest = decoded.join(MANIFEST_FILE);
        if !manifest.is_file() {
            return Err(SideloadError::ManifestNotFound(decoded));
        }
        let identifier = self.rewriter.rewrite(&manifest)?;
        sink.report(
            *stage,
            &format!("Renaming package {} -> {}", identifier.old, identifier.new),
        );
        self.state = PipelineState::Rewritten;

        *stage = Stage::Recompile;
        sink.report(*stage, "Rebuilding apk...");
        fs::create_dir_all(&self.output_dir)?;
        let output = self.output_dir.join(format!("{}.apk", identifier.new));
        let built = self.run_jar(
            &apktool,
            vec!["b".into(), "-o".into(), output.clone().into(), decoded.into()],
            *stage,
        );
        if let Err(e) = built {
            remove_partial(&output);
            return Err(e);
        }
        self.state = PipelineState::Recompiled;

        *stage = Stage::Sign;
        sink.report(*stage, "Signing apk...");
        if let Err(e) = self.run_jar(&signer, self.sign_args(&output), *stage) {
            remove_partial(&output);
            return Err(e);
        }
        self.state = PipelineState::Signed;

        let companion = match companion {
            Some(root) => {
                *stage = Stage::Relocate;
                sink.report(*stage, &format!("Renaming obb data in {}", root.display()));
                let set = CompanionDataSet::discover(root)?;
                let moved = relocate(&set, &identifier.new).inspect_err(|_| {
                    sink.report(
                        Stage::Relocate,
                        &format!("Archive {} is signed and usable", output.display()),
                    );
                })?;
                self.state = PipelineState::Relocated;
                Some(moved)
            }
            None => None,
        };

        *stage = Stage::Cleanup;
        sink.report(*stage, "Removing temporary directory...");
        work.close()?;
        self.state = PipelineState::Done;

        tracing::info!(
            target: "sideload::pipeline",
            archive = %output.display(),
            old = %identifier.old,
            new = %identifier.new,
            "Package identity rewritten"
        );

        Ok(PipelineResult {
            archive: output,
            identifier,
            companion,
        })
    }

    fn sign_args(&self, archive: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-a".into(), archive.into(), "--overwrite".into()];
        if let Some(signing) = &self.signing {
            let key_password = signing
                .key_password
                .clone()
                .unwrap_or_else(|| signing.password.clone());
            args.extend([
                "--ks".into(),
                signing.keystore.clone().into(),
                "--ksAlias".into(),
                signing.alias.clone().into(),
                "--ksPass".into(),
                signing.password.clone().into(),
                "--ksKeyPass".into(),
                key_password.into(),
            ]);
        }
        args
    }

    /// `java -jar <tool> <args...>`, failing on non-zero exit
    fn run_jar(
        &self,
        tool: &ToolBinary,
        args: Vec<OsString>,
        stage: Stage,
    ) -> SideloadResult<ToolOutput> {
        let mut full: Vec<OsString> = vec!["-jar".into(), tool.local_path.clone().into()];
        full.extend(args);

        tracing::debug!(
            target: "sideload::pipeline",
            stage = %stage,
            tool = tool.kind.name(),
            "Running {} {:?}", self.java, full
        );
        self.executor.run(&self.java, &full)?.check(stage)
    }
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!("Failed to remove partial archive {}: {}", path.display(), e);
        }
    }
}
