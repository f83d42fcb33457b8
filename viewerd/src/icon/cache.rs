use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat};
use crate::config::IconConfig;
use crate::icon::hash::{density_name, icon_file_stem};

const ICON_EXTENSION: &str = "png";

/// Content-addressed lookup of icon images.
///
/// An icon for URL `u` lives at `<storage_dir>/<dimension>/i_<sha256(u)>.png`.
/// Icons shipped with the application are looked up first in `resource_dir`
/// under the same file name.
#[derive(Debug, Clone)]
pub struct IconCache {
    storage_dir: PathBuf,
    resource_dir: Option<PathBuf>,
    dimension: String,
}

impl IconCache {
    pub fn new(storage_dir: impl Into<PathBuf>, resource_dir: Option<PathBuf>, display_density: f32) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            resource_dir,
            dimension: density_name(display_density).to_string(),
        }
    }

    pub fn from_config(config: &IconConfig) -> Self {
        Self::new(
            config.storage_dir.clone(),
            config.resource_dir.clone(),
            config.display_density,
        )
    }

    /// Dimension tag of this display, e.g. "xhdpi"
    pub fn dimension(&self) -> &str {
        &self.dimension
    }

    /// Deterministic storage path of `url` for a dimension tag
    pub fn storage_path(&self, url: &str, dimension: &str) -> PathBuf {
        self.storage_dir
            .join(dimension)
            .join(format!("{}.{}", icon_file_stem(url), ICON_EXTENSION))
    }

    fn resource_path(&self, url: &str) -> Option<PathBuf> {
        self.resource_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.{}", icon_file_stem(url), ICON_EXTENSION)))
    }

    /// Local file holding the icon for `url`, if any
    pub fn lookup(&self, url: &str) -> Option<PathBuf> {
        if let Some(resource) = self.resource_path(url) {
            if resource.is_file() {
                return Some(resource);
            }
        }

        let stored = self.storage_path(url, &self.dimension);
        stored.is_file().then_some(stored)
    }

    pub fn is_available(&self, url: &str) -> bool {
        self.lookup(url).is_some()
    }

    /// Encode `image` as PNG under the storage path of `url`
    pub fn store_image(&self, url: &str, image: &DynamicImage) -> Result<PathBuf> {
        let path = self.storage_path(url, &self.dimension);
        let part = prepare_part_file(&path)?;

        image
            .save_with_format(&part, ImageFormat::Png)
            .with_context(|| format!("Failed to encode icon to {}", part.display()))?;
        std::fs::rename(&part, &path)
            .with_context(|| format!("Failed to move icon into {}", path.display()))?;

        Ok(path)
    }
}

/// Create the parent directory of `path` and return the temporary sibling a
/// writer fills before renaming it into place, so a partially written icon
/// is never reported as available.
pub fn prepare_part_file(path: &Path) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(path.with_extension("part"))
}
