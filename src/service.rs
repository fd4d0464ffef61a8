use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::compactor;
use crate::directory::InMemoryDirectory;
use crate::engine::{Collaborators, Engine, EngineConfig};
use crate::notify::NotifyHub;

pub const DIRECTORY_FILE: &str = "directory.json";
pub const WAL_FILE: &str = "bookings.wal";

/// Everything a connection needs: the booking engine plus the directory and
/// notice hub it was wired to.
pub struct Service {
    pub engine: Arc<Engine>,
    pub directory: Arc<InMemoryDirectory>,
    pub hub: Arc<NotifyHub>,
    pub data_dir: PathBuf,
}

impl Service {
    /// Open (or create) the directory snapshot and booking WAL under `data_dir`
    /// and spawn the background compactor. Must be called inside a tokio runtime.
    pub fn open(data_dir: &Path, config: EngineConfig, compact_threshold: u64) -> io::Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let directory = Arc::new(InMemoryDirectory::open(&data_dir.join(DIRECTORY_FILE))?);
        let hub = Arc::new(NotifyHub::new());
        let collaborators = Collaborators::in_memory(directory.clone(), hub.clone());
        let engine = Arc::new(Engine::new(data_dir.join(WAL_FILE), collaborators, config)?);

        let compactor_engine = engine.clone();
        let compactor_hub = hub.clone();
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, compactor_hub, compact_threshold).await;
        });

        Ok(Self {
            engine,
            directory,
            hub,
            data_dir: data_dir.to_path_buf(),
        })
    }
}
