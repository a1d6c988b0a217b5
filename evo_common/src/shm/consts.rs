//! SHM (Shared Memory) constants.
//!
//! These constants define the fundamental parameters of the HAL arena.
//! They are the single source of truth - all other crates import from here.

/// Magic bytes identifying an initialized HAL arena: `"EVO_HAL\0"`.
pub const EVO_HAL_MAGIC: [u8; 8] = *b"EVO_HAL\0";

/// Minimum arena size in bytes.
///
/// The arena header, the root record and a handful of descriptors must fit,
/// so anything below 64 KiB is rejected.
pub const SHM_MIN_SIZE: usize = 64 * 1024;

/// Maximum arena size in bytes.
///
/// Offsets are stored as `u32`, so 1 GiB keeps every offset comfortably
/// representable.
pub const SHM_MAX_SIZE: usize = 1_073_741_824; // 1GB

/// Default arena size (1 MiB).
pub const SHM_DEFAULT_SIZE: usize = 1024 * 1024;

/// Memory page size used for segment size validation.
pub const PAGE_SIZE: usize = 4096;

/// CPU cache line size in bytes.
///
/// The arena header is aligned to this to keep the hot allocator words
/// away from neighbouring data.
pub const CACHE_LINE_SIZE: usize = 64;

/// Granularity by which the heap grows into the realtime gap.
pub const HEAP_GROW_CHUNK: usize = 16 * 1024;
