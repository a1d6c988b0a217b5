//! Mapped memory backing an arena.
//!
//! A segment is either named (a file below `/dev/shm`, shared between
//! processes) or anonymous (private to one process, used by tests and
//! single-process tools). Both are page aligned, zero filled on creation
//! and pre-faulted.

use crate::error::{ShmError, ShmResult};
use crate::platform::{anonymous_mmap, attach_segment_mmap, create_segment_mmap, unlink_segment};
use evo::shm::consts::{PAGE_SIZE, SHM_MAX_SIZE, SHM_MIN_SIZE};
use memmap2::MmapMut;
use std::path::PathBuf;
use tracing::debug;

/// Root directory of named segments.
pub const SHM_DIR: &str = "/dev/shm";

/// A mapped segment.
pub struct Segment {
    name: Option<String>,
    path: Option<PathBuf>,
    base: *mut u8,
    len: usize,
    // Keeps the mapping alive; all access goes through `base`.
    _mmap: MmapMut,
}

// The mapping is plain memory; synchronization is the arena's job.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Map a private anonymous segment.
    pub fn anonymous(size: usize) -> ShmResult<Self> {
        validate_segment_size(size)?;
        let mut mmap = anonymous_mmap(size)?;
        debug!("Mapped anonymous segment of {} bytes", size);
        Ok(Self {
            name: None,
            path: None,
            base: mmap.as_mut_ptr(),
            len: size,
            _mmap: mmap,
        })
    }

    /// Create a new named segment. Fails with `AlreadyExists` if present.
    pub fn create(name: &str, size: usize) -> ShmResult<Self> {
        validate_segment_size(size)?;
        let path = segment_path(name);
        let mut mmap = create_segment_mmap(&path, name, size)?;
        debug!("Created segment {} ({} bytes)", path.display(), size);
        Ok(Self {
            name: Some(name.to_string()),
            path: Some(path),
            base: mmap.as_mut_ptr(),
            len: size,
            _mmap: mmap,
        })
    }

    /// Map an existing named segment.
    pub fn attach(name: &str) -> ShmResult<Self> {
        let path = segment_path(name);
        let mut mmap = attach_segment_mmap(&path, name)?;
        let len = mmap.len();
        validate_segment_size(len)?;
        debug!("Attached segment {} ({} bytes)", path.display(), len);
        Ok(Self {
            name: Some(name.to_string()),
            path: Some(path),
            base: mmap.as_mut_ptr(),
            len,
            _mmap: mmap,
        })
    }

    /// Segment name, `None` for anonymous segments.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Base address in this process.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; segments are never empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Remove the backing file. The mapping stays valid until dropped.
    pub fn unlink(&self) -> ShmResult<()> {
        match &self.path {
            Some(path) => {
                debug!("Unlinking segment {}", path.display());
                unlink_segment(path)
            }
            None => Ok(()),
        }
    }
}

/// Path of a named segment.
pub fn segment_path(name: &str) -> PathBuf {
    PathBuf::from(SHM_DIR).join(name)
}

/// Validate segment size constraints
pub fn validate_segment_size(size: usize) -> ShmResult<()> {
    if !(SHM_MIN_SIZE..=SHM_MAX_SIZE).contains(&size) || size % PAGE_SIZE != 0 {
        return Err(ShmError::InvalidSize { size });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_size_validation() {
        assert!(validate_segment_size(SHM_MIN_SIZE).is_ok());
        assert!(validate_segment_size(1024 * 1024).is_ok());

        assert!(validate_segment_size(4096).is_err()); // Too small
        assert!(validate_segment_size(SHM_MIN_SIZE + 1).is_err()); // Not page-aligned
        assert!(validate_segment_size(2 * 1024 * 1024 * 1024).is_err()); // Too large
    }

    #[test]
    fn test_anonymous_segment() {
        let seg = Segment::anonymous(SHM_MIN_SIZE).unwrap();
        assert_eq!(seg.len(), SHM_MIN_SIZE);
        assert!(seg.name().is_none());
        assert_eq!(seg.base() as usize % PAGE_SIZE, 0);
        assert!(seg.unlink().is_ok());
    }

    #[test]
    fn test_named_segment_create_attach() {
        let name = format!("evo_hal_seg_test_{}", std::process::id());
        let seg = Segment::create(&name, SHM_MIN_SIZE).unwrap();
        unsafe { seg.base().add(100).write(0xAB) };

        assert!(matches!(
            Segment::create(&name, SHM_MIN_SIZE),
            Err(ShmError::AlreadyExists { .. })
        ));

        let other = Segment::attach(&name).unwrap();
        assert_eq!(other.len(), SHM_MIN_SIZE);
        assert_eq!(unsafe { other.base().add(100).read() }, 0xAB);

        seg.unlink().unwrap();
        assert!(matches!(
            Segment::attach(&name),
            Err(ShmError::NotFound { .. })
        ));
    }
}
