//! Per-volume usage accounting (spec.md §3, §4.2), ported from the
//! original's `storage::Volume::getUsageInfo`/`withRequired`.

use camino::Utf8Path;
use tracing::instrument;

use crate::error::StorageError;

/// A byte count paired with the percentage of overall volume capacity it
/// represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Figure {
    pub bytes: u64,
    pub percent: u32,
}

/// `path, size, free, reserved, reserved_by, available, required, err`
/// (spec.md §3). `required` is `None` until `.with_required()` is called.
#[derive(Debug, Clone)]
pub struct StorageUsage {
    pub path: String,
    pub size: Figure,
    pub free: Figure,
    pub reserved: Figure,
    pub reserved_by: String,
    pub available: Figure,
    pub required: Option<Figure>,
}

impl StorageUsage {
    /// Attaches a caller-computed required-bytes estimate, expressed also
    /// as a percentage of `size` when `size` is known.
    pub fn with_required(mut self, bytes: u64) -> Self {
        let percent = if self.size.bytes > 0 {
            ((bytes as f64 / self.size.bytes as f64) * 100.0).ceil() as u32
        } else {
            0
        };
        self.required = Some(Figure { bytes, percent });
        self
    }

    /// `Err(InsufficientSpace)` when the attached `required` figure exceeds
    /// `available` (spec.md §4.2, boundary: exactly 1 byte over fails).
    pub fn check(&self) -> Result<(), StorageError> {
        let Some(required) = self.required else {
            return Ok(());
        };
        if required.bytes > self.available.bytes {
            return Err(StorageError::InsufficientSpace {
                path: self.path.clone(),
                required: required.bytes,
                available: self.available.bytes,
            });
        }
        Ok(())
    }
}

/// Reports per-volume free/reserved/available bytes, applying a watermark.
pub struct StorageAccountant;

impl StorageAccountant {
    /// `usage(path, reserved_percent, reserved_by) -> StorageUsage`
    /// (spec.md §4.2). Reads block size and free-block count; as root this
    /// is total-free, as non-root it is user-available (`f_bavail`).
    #[instrument(skip(reserved_by))]
    pub fn usage(
        path: &Utf8Path,
        reserved_percent: u32,
        reserved_by: &str,
    ) -> Result<StorageUsage, StorageError> {
        let stat = rustix::fs::statvfs(path.as_std_path()).map_err(|e| StorageError::StatFailed {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        let block_size = stat.f_frsize.max(1);
        let block_numb = stat.f_blocks;
        let free_block_numb = if is_root() { stat.f_bfree } else { stat.f_bavail };

        let size_bytes = block_size * block_numb;
        let free_bytes = block_size * free_block_numb;
        let free_percent = if block_numb > 0 {
            ((free_block_numb as f64 / block_numb as f64) * 100.0).floor() as u32
        } else {
            0
        };

        let reserved_bytes =
            ((block_numb as f64 * (reserved_percent as f64 / 100.0)).ceil() as u64) * block_size;
        let available_bytes = free_bytes.saturating_sub(reserved_bytes).max(0);
        let available_percent = free_percent.saturating_sub(reserved_percent);

        Ok(StorageUsage {
            path: path.to_string(),
            size: Figure {
                bytes: size_bytes,
                percent: 100,
            },
            free: Figure {
                bytes: free_bytes,
                percent: free_percent,
            },
            reserved: Figure {
                bytes: reserved_bytes,
                percent: reserved_percent,
            },
            reserved_by: reserved_by.to_string(),
            available: Figure {
                bytes: available_bytes,
                percent: available_percent,
            },
            required: None,
        })
    }
}

fn is_root() -> bool {
    rustix::process::getuid().is_root()
}
