//! Device bridge
//!
//! The install job only needs five device operations, captured by
//! [`DeviceBridge`]. [`AdbBridge`] implements them on top of the `adb` CLI.

use crate::config::DeviceConfig;
use crate::error::{SideloadError, SideloadResult};
use crate::exec::{args, CommandExecutor, SystemCommandExecutor, ToolOutput};
use std::ffi::OsString;
use std::path::Path;

/// Operations on a connected device
pub trait DeviceBridge {
    /// Install an apk; `no_launch` keeps the app from being started afterwards
    fn install(&self, archive: &Path, no_launch: bool) -> SideloadResult<()>;

    /// Copy a local file to `remote`
    fn push(&self, local: &Path, remote: &str) -> SideloadResult<()>;

    /// Run a shell command on the device and return its output
    fn shell(&self, command: &str) -> SideloadResult<String>;

    fn uninstall(&self, identifier: &str) -> SideloadResult<()>;

    /// Installed package identifiers
    fn list_packages(&self) -> SideloadResult<Vec<String>>;
}

impl<T: DeviceBridge + ?Sized> DeviceBridge for &T {
    fn install(&self, archive: &Path, no_launch: bool) -> SideloadResult<()> {
        (**self).install(archive, no_launch)
    }

    fn push(&self, local: &Path, remote: &str) -> SideloadResult<()> {
        (**self).push(local, remote)
    }

    fn shell(&self, command: &str) -> SideloadResult<String> {
        (**self).shell(command)
    }

    fn uninstall(&self, identifier: &str) -> SideloadResult<()> {
        (**self).uninstall(identifier)
    }

    fn list_packages(&self) -> SideloadResult<Vec<String>> {
        (**self).list_packages()
    }
}

/// `adb` command line bridge
pub struct AdbBridge {
    executor: Box<dyn CommandExecutor + Send + Sync>,
    adb: String,
    serial: Option<String>,
}

impl AdbBridge {
    pub fn new() -> Self {
        Self::from_config(&DeviceConfig::default())
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            executor: Box::new(SystemCommandExecutor),
            adb: config.adb.clone(),
            serial: config.serial.clone(),
        }
    }

    pub fn with_executor(mut self, executor: impl CommandExecutor + Send + Sync + 'static) -> Self {
        self.executor = Box::new(executor);
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    fn adb(&self, command: Vec<OsString>) -> SideloadResult<ToolOutput> {
        let mut full = Vec::with_capacity(command.len() + 2);
        if let Some(serial) = &self.serial {
            full.push(OsString::from("-s"));
            full.push(OsString::from(serial));
        }
        full.extend(command);

        let output = self
            .executor
            .run(&self.adb, &full)
            .map_err(|e| SideloadError::DeviceCommunication(format!("failed to run adb: {}", e)))?;

        if !output.success() {
            return Err(SideloadError::DeviceCommunication(format!(
                "adb {:?} failed ({}): {}",
                full,
                output.status(),
                output.combined()
            )));
        }
        Ok(output)
    }
}

impl Default for AdbBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Older adb versions exit 0 even when the package manager reports `Failure`
fn ensure_pm_success(output: &ToolOutput, what: &str) -> SideloadResult<()> {
    let combined = output.combined();
    if combined.lines().any(|line| line.trim_start().starts_with("Failure")) {
        return Err(SideloadError::DeviceCommunication(format!(
            "{} failed: {}",
            what, combined
        )));
    }
    Ok(())
}

impl DeviceBridge for AdbBridge {
    fn install(&self, archive: &Path, no_launch: bool) -> SideloadResult<()> {
        tracing::info!(target: "sideload::device", archive = %archive.display(), "Installing");
        if !no_launch {
            tracing::debug!(target: "sideload::device", "adb install never launches the app");
        }
        let output = self.adb(vec!["install".into(), "-r".into(), archive.into()])?;
        ensure_pm_success(&output, "install")
    }

    fn push(&self, local: &Path, remote: &str) -> SideloadResult<()> {
        tracing::info!(
            target: "sideload::device",
            local = %local.display(),
            remote = %remote,
            "Pushing"
        );
        self.adb(vec!["push".into(), local.into(), remote.into()])?;
        Ok(())
    }

    fn shell(&self, command: &str) -> SideloadResult<String> {
        tracing::debug!(target: "sideload::device", command = %command, "Shell");
        Ok(self.adb(args(["shell", command]))?.stdout)
    }

    fn uninstall(&self, identifier: &str) -> SideloadResult<()> {
        tracing::info!(target: "sideload::device", identifier = %identifier, "Uninstalling");
        let output = self.adb(args(["uninstall", identifier]))?;
        ensure_pm_success(&output, "uninstall")
    }

    fn list_packages(&self) -> SideloadResult<Vec<String>> {
        let output = self.shell("pm list packages")?;
        Ok(parse_package_list(&output))
    }
}

/// Parse `pm list packages` output (`package:<id>` per line)
pub fn parse_package_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}
