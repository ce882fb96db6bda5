//! Named reference images and masks, loaded once and read-only thereafter.
//!
//! The store is an explicitly owned value injected into the engine, so
//! multiple engines (parallel test runs included) never share state through
//! a process-wide registry.

use std::{collections::HashMap, path::Path};

use image::GrayImage;

use crate::error::EngineError;

#[derive(Default)]
pub struct ReferenceStore {
    references: HashMap<String, GrayImage>,
    masks: HashMap<String, GrayImage>,
}

impl ReferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-memory reference image under `name`.
    pub fn insert_reference(&mut self, name: impl Into<String>, image: GrayImage) {
        self.references.insert(name.into(), image);
    }

    /// Register an in-memory binary mask under `name`. Any non-zero pixel
    /// counts as "on".
    pub fn insert_mask(&mut self, name: impl Into<String>, mask: GrayImage) {
        self.masks.insert(name.into(), mask);
    }

    /// Load a reference image from disk, converting to grayscale.
    pub fn load_reference(
        &mut self,
        name: impl Into<String>,
        path: &Path,
    ) -> Result<(), EngineError> {
        let image = load_gray(path)?;
        self.references.insert(name.into(), image);
        Ok(())
    }

    /// Load a mask from disk, converting to grayscale.
    pub fn load_mask(&mut self, name: impl Into<String>, path: &Path) -> Result<(), EngineError> {
        let mask = load_gray(path)?;
        self.masks.insert(name.into(), mask);
        Ok(())
    }

    pub fn reference(&self, name: &str) -> Option<&GrayImage> {
        self.references.get(name)
    }

    pub fn mask(&self, name: &str) -> Option<&GrayImage> {
        self.masks.get(name)
    }

    pub fn reference_names(&self) -> impl Iterator<Item = &str> {
        self.references.keys().map(String::as_str)
    }
}

fn load_gray(path: &Path) -> Result<GrayImage, EngineError> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|source| EngineError::ImageLoad {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn in_memory_entries_are_retrievable() {
        let mut store = ReferenceStore::new();
        store.insert_reference("front", GrayImage::from_pixel(8, 8, Luma([128])));
        store.insert_mask("front", GrayImage::from_pixel(8, 8, Luma([255])));

        assert!(store.reference("front").is_some());
        assert!(store.mask("front").is_some());
        assert!(store.reference("back").is_none());
        assert!(store.mask("back").is_none());
    }

    #[test]
    fn stores_do_not_share_state() {
        let mut first = ReferenceStore::new();
        first.insert_reference("front", GrayImage::from_pixel(4, 4, Luma([0])));
        let second = ReferenceStore::new();
        assert!(second.reference("front").is_none());
    }

    #[test]
    fn missing_file_reports_path() {
        let mut store = ReferenceStore::new();
        let err = store
            .load_reference("x", Path::new("/nonexistent/ref.png"))
            .expect_err("load should fail");
        assert!(err.to_string().contains("/nonexistent/ref.png"));
    }
}
