//! Shared fake fleet for behavioural tests.
//!
//! Integration tests are compiled as separate crates, so this file is pulled
//! in with `#[path = "common/fleet.rs"] mod fleet;`. Every call to
//! [`Fleet::orchestrator`] builds a fresh orchestrator over the same registry
//! file, standing in for a separate process.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use gangway::test_support::{FakeCloud, target};
use gangway::{
    Collaborators, FileRegistry, NonInteractivePicker, Orchestrator, Policy, Registry,
    RegistryEntry,
};
use tempfile::TempDir;

/// Instance id of the single fake target.
pub const WEB: &str = "i-0123456789abcdef0";

pub struct Fleet {
    _tmp: TempDir,
    pub dir: Utf8PathBuf,
    pub cloud: Arc<FakeCloud>,
}

impl Fleet {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
        Self {
            _tmp: tmp,
            dir,
            cloud: Arc::new(FakeCloud::with_targets(vec![target(WEB, "web")])),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let policy = Policy {
            retry_backoff: Duration::from_millis(1),
            ..Policy::default()
        };
        let collaborators = Collaborators::from_cloud(
            &self.cloud,
            Arc::new(FileRegistry::new(self.dir.join("registry.json"))),
            Arc::new(NonInteractivePicker),
        );
        Orchestrator::new(collaborators, &policy)
    }

    pub fn entries(&self) -> Vec<RegistryEntry> {
        FileRegistry::new(self.dir.join("registry.json"))
            .list_all()
            .unwrap_or_else(|err| panic!("registry readable: {err}"))
    }

    pub fn payload(&self, name: &str, size: usize) -> (Utf8PathBuf, Vec<u8>) {
        let bytes = (0..size)
            .map(|n| u8::try_from(n % 251).unwrap_or_default())
            .collect::<Vec<_>>();
        let path = self.dir.join(name);
        std::fs::write(&path, &bytes).unwrap_or_else(|err| panic!("write {path}: {err}"));
        (path, bytes)
    }
}
