//! Raw firmware images.
//!
//! Images are flat binaries written byte for byte starting at the target
//! address. No container format is parsed.

use {
    crate::error::{Error, Result},
    log::debug,
    std::{
        fs::File,
        io::{BufReader, Read},
        path::{Path, PathBuf},
    },
};

/// A firmware image loaded into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    path: Option<PathBuf>,
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Load an image from disk.
    ///
    /// Unreadable files fail with [`Error::File`]. An empty file loads
    /// fine; flashing it is rejected later.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware from: {}", path.display());

        let file_error = |source| Error::File {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(file_error)?;
        let mut reader = BufReader::new(file);

        let mut data = Vec::new();
        reader.read_to_end(&mut data).map_err(file_error)?;
        debug!("Loaded {} bytes", data.len());

        Ok(Self {
            path: Some(path.to_path_buf()),
            data,
        })
    }

    /// Wrap bytes that are already in memory.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { path: None, data }
    }

    /// Where the image was loaded from.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Take the image bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image has no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
