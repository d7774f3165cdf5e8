//! Optional pidfile: written at startup, removed on clean shutdown. The
//! only persisted state this server has (SPEC_FULL.md §6).

use std::path::{Path, PathBuf};

use tracing::warn;

pub struct Pidfile {
    path: Option<PathBuf>,
}

impl Pidfile {
    pub fn write(path: Option<PathBuf>) -> std::io::Result<Self> {
        if let Some(path) = &path {
            std::fs::write(path, format!("{}\n", std::process::id()))?;
        }
        Ok(Self { path })
    }

    pub fn remove(&self) {
        if let Some(path) = &self.path {
            if let Err(err) = std::fs::remove_file(path) {
                warn!(?err, path = %path.display(), "failed to remove pidfile");
            }
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
