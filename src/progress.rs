//! Progress reporting for sideload runs
//!
//! Every stage reports structured [`ProgressEvent`]s to a caller-supplied
//! [`ProgressSink`]. Sinks exist for channels, `tracing`, tests and an
//! indicatif console spinner.

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Mutex;
use std::time::Duration;

/// Stage of a sideload run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Tool download / cache lookup
    Provision,
    /// apktool decode
    Decompile,
    /// Manifest identifier rewrite
    Rewrite,
    /// apktool build
    Recompile,
    /// Archive signing
    Sign,
    /// Companion data rename
    Relocate,
    /// Work directory removal
    Cleanup,
    /// Zip extraction
    Extract,
    /// Package install on device
    Install,
    /// Companion data push to device
    Push,
}

impl Stage {
    /// Lowercase stage name
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Provision => "provision",
            Stage::Decompile => "decompile",
            Stage::Rewrite => "rewrite",
            Stage::Recompile => "recompile",
            Stage::Sign => "sign",
            Stage::Relocate => "relocate",
            Stage::Cleanup => "cleanup",
            Stage::Extract => "extract",
            Stage::Install => "install",
            Stage::Push => "push",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stage-tagged progress message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.message)
    }
}

/// Consumer of progress events
pub trait ProgressSink {
    /// Receive one event
    fn emit(&self, event: ProgressEvent);

    /// Shorthand for emitting a new event
    fn report(&self, stage: Stage, message: &str) {
        self.emit(ProgressEvent::new(stage, message));
    }
}

impl<T: ProgressSink + ?Sized> ProgressSink for &T {
    fn emit(&self, event: ProgressEvent) {
        (**self).emit(event)
    }
}

impl ProgressSink for Sender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver just means nobody is listening anymore.
        let _ = self.send(event);
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        tracing::info!(
            target: "sideload::progress",
            stage = %event.stage,
            "{}",
            event.message
        );
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of recorded events
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Stages in the order they were reported, without repeats in a row
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = Vec::new();
        for event in self.events() {
            if stages.last() != Some(&event.stage) {
                stages.push(event.stage);
            }
        }
        stages
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Style presets for console progress
pub struct ProgressStyles;

impl ProgressStyles {
    /// Style for indeterminate operations (spinner only)
    pub fn spinner() -> ProgressStyle {
        ProgressStyle::with_template("{spinner:.green} {prefix:.bold} {msg} [{elapsed_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
    }

    /// Style for success message
    pub fn success() -> ProgressStyle {
        ProgressStyle::with_template("{prefix:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    /// Style for error message
    pub fn error() -> ProgressStyle {
        ProgressStyle::with_template("{prefix:.red} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }
}

/// Console spinner showing the current stage
pub struct ConsoleProgress {
    bar: ProgressBar,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyles::spinner());
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    /// Finish with a success line
    pub fn success(&self, msg: &str) {
        self.bar.set_style(ProgressStyles::success());
        self.bar.set_prefix("✓");
        self.bar.finish_with_message(msg.to_string());
    }

    /// Finish with an error line
    pub fn error(&self, msg: &str) {
        self.bar.set_style(ProgressStyles::error());
        self.bar.set_prefix("✗");
        self.bar.finish_with_message(msg.to_string());
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleProgress {
    fn emit(&self, event: ProgressEvent) {
        self.bar.set_prefix(event.stage.to_string());
        self.bar.set_message(event.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_progress_styles() {
        let _ = ProgressStyles::spinner();
        let _ = ProgressStyles::success();
        let _ = ProgressStyles::error();
    }

    #[test]
    fn test_channel_sink() {
        let (tx, rx) = mpsc::channel();
        tx.report(Stage::Sign, "signing");
        drop(tx);

        let events: Vec<_> = rx.iter().collect();
        assert_eq!(events, vec![ProgressEvent::new(Stage::Sign, "signing")]);
    }

    #[test]
    fn test_channel_sink_without_receiver() {
        let (tx, rx) = mpsc::channel::<ProgressEvent>();
        drop(rx);
        tx.report(Stage::Cleanup, "nobody listens");
    }

    #[test]
    fn test_recording_sink_stages() {
        let sink = RecordingSink::new();
        sink.report(Stage::Provision, "a");
        sink.report(Stage::Provision, "b");
        sink.report(Stage::Decompile, "c");

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.stages(), vec![Stage::Provision, Stage::Decompile]);
    }

    #[test]
    fn test_event_display() {
        let event = ProgressEvent::new(Stage::Relocate, "moving obb");
        assert_eq!(event.to_string(), "[relocate] moving obb");
    }

    #[test]
    fn test_console_progress() {
        let progress = ConsoleProgress::new();
        progress.report(Stage::Install, "Installing...");
        progress.success("Done");
    }
}
