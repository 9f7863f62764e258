//! Named, fixed-shape numeric buffers shared by the worker pool.
//!
//! Each buffer is a memory-mapped file `<folder>/<name>.dat`. Allocating a
//! buffer that already exists re-opens it without touching its contents
//! unless `clobber` is set, which lets an interrupted run resume.

pub mod buffer;
pub mod layout;

use std::path::{Path, PathBuf};

use crate::error::{PhotError, Result};

pub use buffer::{Element, SharedArray};
pub use layout::{ModellingBuffers, WorkspaceLayout};

/// A folder of shared buffers.
#[derive(Clone, Debug)]
pub struct Workspace {
    folder: PathBuf,
}

impl Workspace {
    /// Use `folder` as the backing store, creating it if needed.
    pub fn new(folder: impl Into<PathBuf>) -> Result<Self> {
        let folder = folder.into();
        std::fs::create_dir_all(&folder)?;
        Ok(Self { folder })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn buffer_path(&self, name: &str) -> PathBuf {
        self.folder.join(format!("{name}.dat"))
    }

    /// Allocate buffer `name` with the given shape.
    ///
    /// With `clobber == false` an existing buffer is re-opened as is; its
    /// shape and element type must match the request. With `clobber == true`
    /// (or when no buffer exists) it is created and set to `fill`.
    pub fn allocate<T: Element>(
        &self,
        name: &str,
        shape: &[usize],
        fill: T,
        clobber: bool,
    ) -> Result<SharedArray<T>> {
        let path = self.buffer_path(name);
        if path.exists() && !clobber {
            let array = SharedArray::<T>::open(name, &path)?;
            if array.shape() != shape {
                return Err(PhotError::WorkspaceShapeMismatch {
                    name: name.to_string(),
                    expected: shape.to_vec(),
                    found: array.shape().to_vec(),
                });
            }
            return Ok(array);
        }
        SharedArray::create(name, &path, shape, fill)
    }

    /// Open an existing buffer of any shape.
    pub fn open<T: Element>(&self, name: &str) -> Result<SharedArray<T>> {
        SharedArray::open(name, &self.buffer_path(name))
    }

    /// Names of the buffers present in the folder, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.folder)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "dat") {
                if let Some(stem) = path.file_stem() {
                    names.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
