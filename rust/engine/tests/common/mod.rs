//! Shared test utilities for the engine crate.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use halfempty_engine::{EngineConfig, EventEmitter, MinimizeEvent};

/// Create a temporary directory for fixtures.
pub fn make_tempdir() -> tempfile::TempDir {
    tempfile::tempdir().expect("tempdir")
}

/// Write an executable `/bin/sh` predicate into `dir`.
pub fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("predicate.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    let mut perms = fs::metadata(&path).expect("script metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod script");
    path
}

/// Write the input fixture into `dir`.
pub fn input(dir: &tempfile::TempDir, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join("input.bin");
    fs::write(&path, bytes).expect("write input");
    path
}

/// An engine configuration sized for tests.
pub fn config(script: &Path) -> EngineConfig {
    let mut config = EngineConfig::new(script);
    config.num_workers = 4;
    config.cleanup_workers = 2;
    config
}

/// An emitter that records every event for later assertions.
#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<MinimizeEvent>>,
}

impl RecordingEmitter {
    pub fn events(&self) -> Vec<MinimizeEvent> {
        self.events.lock().expect("emitter lock").clone()
    }

    /// Number of speculative candidates that were discarded.
    pub fn discards(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, MinimizeEvent::CandidateDiscarded { .. }))
            .count()
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit(&self, event: MinimizeEvent) {
        self.events.lock().expect("emitter lock").push(event);
    }
}
