//! Storage Layer
//!
//! Platform directories for the config file and the debug image sink.

use crate::capture::RawImage;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "quizlens", "quizlens")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}

/// Default location of the config file
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}

/// Where debug images go when `capture.debug_dir` is not set
pub fn debug_images_dir() -> Result<PathBuf> {
    Ok(get_data_dir()?.join("debug_images"))
}

/// Writes intermediate images of a run as `<run id>_<stage>.png`.
///
/// Failures are logged and ignored; the sink never affects a run.
#[derive(Debug, Clone)]
pub struct DebugImageSink {
    dir: PathBuf,
}

impl DebugImageSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `configured` or the data dir default
    pub fn resolve(configured: Option<&Path>) -> Result<Self> {
        let dir = match configured {
            Some(dir) => dir.to_path_buf(),
            None => debug_images_dir()?,
        };
        Ok(Self::new(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, run_id: &Uuid, stage: &str, image: &RawImage) {
        if image.is_empty() {
            return;
        }
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!("Cannot create debug image dir {:?}: {}", self.dir, e);
            return;
        }
        let path = self.dir.join(format!("{}_{}.png", run_id.simple(), stage));
        match image.save_png(&path) {
            Ok(()) => debug!("Saved debug image {:?}", path),
            Err(e) => warn!("Failed to save debug image {:?}: {}", path, e),
        }
    }
}
