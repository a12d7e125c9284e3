//! Test doubles shared by the integration tests
#![allow(dead_code)]

use sideload_pack::{
    CommandExecutor, DeviceBridge, Fetcher, IdentityPipeline, IdentityRewriter, SequenceRandom,
    SideloadError, SideloadResult, ToolOutput, ToolProvisioner,
};
use std::ffi::OsString;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A minimal, well-formed jar
pub fn jar_bytes() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    writer.start_file("META-INF/MANIFEST.MF", options).unwrap();
    writer.write_all(b"Manifest-Version: 1.0\n").unwrap();
    writer.finish().unwrap().into_inner()
}

pub const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8" standalone="no"?>
<manifest xmlns:android="http://schemas.android.com/apk/res/android" package="com.studio.game">
    <application android:label="Game">
        <provider android:authorities="com.studio.game.provider"/>
    </application>
</manifest>
"#;

/// Counts fetches and serves a fixed body
#[derive(Clone)]
pub struct FakeFetcher {
    pub calls: Arc<AtomicUsize>,
    pub body: Vec<u8>,
    pub fail: bool,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            body: jar_bytes(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str) -> SideloadResult<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SideloadError::Provisioning(format!("connection refused: {url}")));
        }
        Ok(self.body.clone())
    }
}

/// Stands in for `java -jar apktool.jar` / `java -jar apksigner.jar`
#[derive(Clone)]
pub struct FakeJava {
    pub calls: Arc<Mutex<Vec<Vec<String>>>>,
    /// "version", "d", "b" or "sign"
    pub fail: Option<&'static str>,
    pub manifest: Option<String>,
}

impl FakeJava {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            fail: None,
            manifest: Some(MANIFEST.to_string()),
        }
    }

    pub fn failing(stage: &'static str) -> Self {
        Self {
            fail: Some(stage),
            ..Self::new()
        }
    }

    pub fn without_manifest() -> Self {
        Self {
            manifest: None,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Tool sub-commands in call order ("d", "b", "sign")
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|args| args.len() > 2 && args[0] == "-jar")
            .map(|args| match args[2].as_str() {
                "-a" => "sign".to_string(),
                other => other.to_string(),
            })
            .collect()
    }
}

impl CommandExecutor for FakeJava {
    fn run(&self, _program: &str, args: &[OsString]) -> SideloadResult<ToolOutput> {
        let args: Vec<String> = args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        self.calls.lock().unwrap().push(args.clone());

        if args == ["-version"] {
            if self.fail == Some("version") {
                return Ok(ToolOutput::failed(127, "java: command not found"));
            }
            return Ok(ToolOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: "openjdk version \"17.0.2\"".to_string(),
            });
        }

        match args[2].as_str() {
            "d" => {
                if self.fail == Some("d") {
                    return Ok(ToolOutput::failed(1, "brut.androlib.AndrolibException"));
                }
                let out = Path::new(&args[5]);
                fs::create_dir_all(out.join("res")).unwrap();
                if let Some(manifest) = &self.manifest {
                    fs::write(out.join("AndroidManifest.xml"), manifest).unwrap();
                }
                Ok(ToolOutput::ok("I: Using Apktool 2.7.0"))
            }
            "b" => {
                if self.fail == Some("b") {
                    return Ok(ToolOutput::failed(1, "W: could not build"));
                }
                fs::write(&args[4], b"PK\x03\x04rebuilt").unwrap();
                Ok(ToolOutput::ok("I: Built apk"))
            }
            "-a" => {
                if self.fail == Some("sign") {
                    return Ok(ToolOutput::failed(1, "keystore error"));
                }
                assert!(Path::new(&args[3]).exists(), "signing a missing archive");
                Ok(ToolOutput::ok("VERIFY\nSuccess"))
            }
            other => panic!("unexpected java invocation: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCall {
    Install(PathBuf, bool),
    Push(PathBuf, String),
    Shell(String),
    Uninstall(String),
    ListPackages,
}

/// Records every device call
#[derive(Clone, Default)]
pub struct RecordingBridge {
    pub calls: Arc<Mutex<Vec<BridgeCall>>>,
    pub fail_install: bool,
}

impl RecordingBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: BridgeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl DeviceBridge for RecordingBridge {
    fn install(&self, archive: &Path, no_launch: bool) -> SideloadResult<()> {
        self.record(BridgeCall::Install(archive.to_path_buf(), no_launch));
        if self.fail_install {
            return Err(SideloadError::DeviceCommunication("no devices/emulators found".into()));
        }
        Ok(())
    }

    fn push(&self, local: &Path, remote: &str) -> SideloadResult<()> {
        self.record(BridgeCall::Push(local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    fn shell(&self, command: &str) -> SideloadResult<String> {
        self.record(BridgeCall::Shell(command.to_string()));
        Ok(String::new())
    }

    fn uninstall(&self, identifier: &str) -> SideloadResult<()> {
        self.record(BridgeCall::Uninstall(identifier.to_string()));
        Ok(())
    }

    fn list_packages(&self) -> SideloadResult<Vec<String>> {
        self.record(BridgeCall::ListPackages);
        Ok(Vec::new())
    }
}

/// Pipeline wired to fakes, drawing suffixes 123 then 456
pub fn fake_pipeline(root: &Path, java: FakeJava) -> IdentityPipeline {
    let provisioner = ToolProvisioner::new(root.join("cache")).with_fetcher(FakeFetcher::new());
    let rewriter = IdentityRewriter::new().with_random(SequenceRandom::new(vec![123, 456]));
    IdentityPipeline::new(provisioner, rewriter)
        .with_executor(java)
        .with_work_dir(root.join("work"))
        .with_output_dir(root.join("out"))
}

/// Directory entries of `dir`, empty when missing
pub fn entries(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(read) => read.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}
