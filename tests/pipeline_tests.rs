//! Tests for sideload-pack pipeline module

mod common;

use common::{entries, fake_pipeline, FakeJava};
use sideload_pack::{
    PipelineState, RecordingSink, SideloadError, SigningConfig, SourceArchive, Stage,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn source_apk(root: &Path) -> SourceArchive {
    let apk = root.join("app.apk");
    fs::write(&apk, b"PK\x03\x04original").unwrap();
    SourceArchive::new(apk)
}

fn obb_dir(root: &Path) -> PathBuf {
    let dir = root.join("com.studio.game");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("com.studio.game.main.obb"), b"main").unwrap();
    fs::write(dir.join("com.studio.game.patch.obb"), b"patch").unwrap();
    dir
}

#[test]
fn test_run_without_companion() {
    let temp = TempDir::new().unwrap();
    let java = FakeJava::new();
    let mut pipeline = fake_pipeline(temp.path(), java.clone());
    let archive = source_apk(temp.path());
    let sink = RecordingSink::new();

    let result = pipeline.run(&archive, None, &sink).unwrap();

    assert_eq!(result.identifier.old, "com.studio.game");
    assert_eq!(result.identifier.new, "com.r123.game");
    assert_eq!(result.archive, temp.path().join("out").join("com.r123.game.apk"));
    assert!(result.archive.exists());
    assert!(result.companion.is_none());
    assert!(result.companion_root().is_none());
    assert_eq!(pipeline.state(), PipelineState::Done);
    assert_eq!(java.commands(), vec!["d", "b", "sign"]);

    // Input untouched
    assert_eq!(fs::read(archive.path()).unwrap(), b"PK\x03\x04original");
    assert_eq!(
        sink.stages(),
        vec![
            Stage::Provision,
            Stage::Decompile,
            Stage::Rewrite,
            Stage::Recompile,
            Stage::Sign,
            Stage::Cleanup
        ]
    );
}

#[test]
fn test_run_with_companion() {
    let temp = TempDir::new().unwrap();
    let mut pipeline = fake_pipeline(temp.path(), FakeJava::new());
    let archive = source_apk(temp.path());
    let obb = obb_dir(temp.path());
    let sink = RecordingSink::new();

    let result = pipeline.run(&archive, Some(&obb), &sink).unwrap();

    let companion = result.companion.as_ref().unwrap();
    assert_eq!(companion.root, temp.path().join("com.r123.game"));
    assert_eq!(companion.len(), 2);
    assert!(companion.root.join("com.r123.game.main.obb").exists());
    assert!(companion.root.join("com.r123.game.patch.obb").exists());
    assert!(!obb.exists());
    assert!(sink.stages().contains(&Stage::Relocate));
    assert_eq!(pipeline.state(), PipelineState::Done);
}

#[test]
fn test_manifest_is_rewritten_before_build() {
    let temp = TempDir::new().unwrap();
    let java = FakeJava::new();
    let mut pipeline = fake_pipeline(temp.path(), java.clone());
    let archive = source_apk(temp.path());

    pipeline.run(&archive, None, &RecordingSink::new()).unwrap();

    // The decoded tree is gone, but the rewriter remembers what it issued
    assert!(pipeline.rewriter().issued().contains("com.r123.game"));
    let build = java
        .calls()
        .into_iter()
        .find(|args| args.get(2).map(String::as_str) == Some("b"))
        .unwrap();
    assert!(build[3] == "-o" && build[4].ends_with("com.r123.game.apk"));
}

#[test]
fn test_recompile_failure_skips_signing() {
    let temp = TempDir::new().unwrap();
    let java = FakeJava::failing("b");
    let mut pipeline = fake_pipeline(temp.path(), java.clone());
    let archive = source_apk(temp.path());
    let obb = obb_dir(temp.path());
    let sink = RecordingSink::new();

    let err = pipeline.run(&archive, Some(&obb), &sink).unwrap_err();

    match &err {
        SideloadError::ExternalTool { stage, output, .. } => {
            assert_eq!(*stage, Stage::Recompile);
            assert!(output.contains("could not build"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(java.commands(), vec!["d", "b"]);
    assert!(!temp.path().join("out").join("com.r123.game.apk").exists());
    assert_eq!(pipeline.state(), PipelineState::Failed(Stage::Recompile));
    // Companion data untouched
    assert!(obb.join("com.studio.game.main.obb").exists());

    let last = sink.events().pop().unwrap();
    assert_eq!(last.stage, Stage::Recompile);
    assert!(last.message.starts_with("Error:"));
}

#[test]
fn test_decompile_failure_aborts() {
    let temp = TempDir::new().unwrap();
    let java = FakeJava::failing("d");
    let mut pipeline = fake_pipeline(temp.path(), java.clone());
    let archive = source_apk(temp.path());

    let err = pipeline
        .run(&archive, None, &RecordingSink::new())
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Decompile));
    assert_eq!(java.commands(), vec!["d"]);
    assert_eq!(pipeline.state(), PipelineState::Failed(Stage::Decompile));
}

#[test]
fn test_sign_failure_removes_unsigned_archive() {
    let temp = TempDir::new().unwrap();
    let mut pipeline = fake_pipeline(temp.path(), FakeJava::failing("sign"));
    let archive = source_apk(temp.path());

    let err = pipeline
        .run(&archive, None, &RecordingSink::new())
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Sign));
    assert!(entries(&temp.path().join("out")).is_empty());
}

#[test]
fn test_missing_manifest() {
    let temp = TempDir::new().unwrap();
    let java = FakeJava::without_manifest();
    let mut pipeline = fake_pipeline(temp.path(), java.clone());
    let archive = source_apk(temp.path());

    let err = pipeline
        .run(&archive, None, &RecordingSink::new())
        .unwrap_err();

    assert!(matches!(err, SideloadError::ManifestNotFound(_)));
    assert_eq!(java.commands(), vec!["d"]);
    assert_eq!(pipeline.state(), PipelineState::Failed(Stage::Rewrite));
}

#[test]
fn test_missing_java_fails_provisioning() {
    let temp = TempDir::new().unwrap();
    let mut pipeline = fake_pipeline(temp.path(), FakeJava::failing("version"));
    let archive = source_apk(temp.path());

    let err = pipeline
        .run(&archive, None, &RecordingSink::new())
        .unwrap_err();

    assert!(matches!(err, SideloadError::Provisioning(_)));
    assert_eq!(pipeline.state(), PipelineState::Failed(Stage::Provision));
}

#[test]
fn test_missing_source_archive() {
    let temp = TempDir::new().unwrap();
    let java = FakeJava::new();
    let mut pipeline = fake_pipeline(temp.path(), java.clone());

    let err = pipeline
        .run(
            &SourceArchive::new(temp.path().join("missing.apk")),
            None,
            &RecordingSink::new(),
        )
        .unwrap_err();

    assert!(matches!(err, SideloadError::UnsupportedInput(_)));
    assert!(java.calls().is_empty());
}

#[test]
fn test_work_dir_removed_on_success_and_failure() {
    let temp = TempDir::new().unwrap();
    let archive = source_apk(temp.path());

    let mut ok = fake_pipeline(temp.path(), FakeJava::new());
    ok.run(&archive, None, &RecordingSink::new()).unwrap();
    assert!(entries(&temp.path().join("work")).is_empty());

    let mut failing = fake_pipeline(temp.path(), FakeJava::without_manifest());
    failing
        .run(&archive, None, &RecordingSink::new())
        .unwrap_err();
    assert!(entries(&temp.path().join("work")).is_empty());
}

#[test]
fn test_relocation_failure_keeps_signed_archive() {
    let temp = TempDir::new().unwrap();
    let mut pipeline = fake_pipeline(temp.path(), FakeJava::new());
    let archive = source_apk(temp.path());
    let obb = obb_dir(temp.path());
    // Target directory already taken
    fs::create_dir(temp.path().join("com.r123.game")).unwrap();

    let sink = RecordingSink::new();
    let err = pipeline.run(&archive, Some(&obb), &sink).unwrap_err();

    assert!(matches!(err, SideloadError::Relocation { .. }));
    assert_eq!(pipeline.state(), PipelineState::Failed(Stage::Relocate));
    assert!(temp.path().join("out").join("com.r123.game.apk").exists());
    assert!(obb.join("com.studio.game.main.obb").exists());
}

#[test]
fn test_keystore_arguments() {
    let temp = TempDir::new().unwrap();
    let java = FakeJava::new();
    let mut pipeline = fake_pipeline(temp.path(), java.clone()).with_signing(SigningConfig {
        keystore: PathBuf::from("android.keystore"),
        alias: "mykey".to_string(),
        password: "secret".to_string(),
        key_password: None,
    });
    let archive = source_apk(temp.path());

    pipeline.run(&archive, None, &RecordingSink::new()).unwrap();

    let sign = java
        .calls()
        .into_iter()
        .find(|args| args.get(2).map(String::as_str) == Some("-a"))
        .unwrap();
    assert_eq!(sign[4], "--overwrite");
    assert_eq!(
        &sign[5..],
        &["--ks", "android.keystore", "--ksAlias", "mykey", "--ksPass", "secret", "--ksKeyPass", "secret"]
    );
}

#[test]
fn test_rerun_issues_new_identifier() {
    let temp = TempDir::new().unwrap();
    let mut pipeline = fake_pipeline(temp.path(), FakeJava::new());
    let archive = source_apk(temp.path());

    let first = pipeline.run(&archive, None, &RecordingSink::new()).unwrap();
    let second = pipeline.run(&archive, None, &RecordingSink::new()).unwrap();

    assert_ne!(first.identifier.new, second.identifier.new);
    assert!(first.archive.exists() && second.archive.exists());
}

#[test]
fn test_channel_sink_observer() {
    let temp = TempDir::new().unwrap();
    let mut pipeline = fake_pipeline(temp.path(), FakeJava::new());
    let archive = source_apk(temp.path());
    let (tx, rx) = std::sync::mpsc::channel();

    pipeline.run(&archive, None, &tx).unwrap();
    drop(tx);

    let events: Vec<_> = rx.iter().collect();
    assert!(events
        .iter()
        .any(|e| e.stage == Stage::Rewrite && e.message.contains("com.r123.game")));
}
