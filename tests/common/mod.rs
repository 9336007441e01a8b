#![allow(dead_code)]

use mission_relay::{ManualClock, MissionCoordinator, MissionRelayConfig};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// A mission root in a temp directory driven by a manual clock.
pub struct TestMission {
    pub dir: TempDir,
    pub clock: ManualClock,
    pub config: MissionRelayConfig,
    pub coordinator: Arc<MissionCoordinator>,
}

impl TestMission {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut MissionRelayConfig)) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let mut config = MissionRelayConfig::default();
        config.mission.root = dir.path().to_path_buf();
        config.retry.jitter = false;
        tweak(&mut config);

        let clock = ManualClock::default();
        let coordinator = MissionCoordinator::with_clock(config.clone(), Arc::new(clock.clone()))
            .await
            .expect("coordinator opens");
        Self {
            dir,
            clock,
            config,
            coordinator: Arc::new(coordinator),
        }
    }

    /// A second, independent coordinator on the same root, standing in for
    /// another agent process. It shares only the files on disk.
    pub async fn open_peer(&self) -> Arc<MissionCoordinator> {
        let coordinator = MissionCoordinator::with_clock(self.config.clone(), Arc::new(self.clock.clone()))
            .await
            .expect("peer coordinator opens");
        Arc::new(coordinator)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write a document behind the coordinator's back.
    pub fn write_external(&self, name: &str, content: &str) {
        let path = self.root().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("parent dir");
        }
        std::fs::write(path, content).expect("external write");
    }

    pub fn read_disk(&self, name: &str) -> String {
        std::fs::read_to_string(self.root().join(name)).expect("document on disk")
    }
}
