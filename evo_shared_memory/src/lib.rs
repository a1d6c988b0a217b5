//! # EVO Shared Memory Arena
//!
//! The storage layer of the EVO HAL: one shared memory segment, mapped at a
//! different address in every attached process, holding every HAL object.
//!
//! ## Features
//!
//! - **Position Independence**: every stored reference is a [`ShmOff`]
//!   offset; [`Arena::ptr`] translates it for the calling process
//! - **Two Allocation Regions**: a top-down realtime region for value
//!   storage that is never reclaimed, and a bottom-up heap with free for
//!   descriptors and strings
//! - **Cross-Process Mutex**: [`ShmMutex`] with an RAII guard and recovery
//!   of locks abandoned by dead processes
//! - **Intrusive Lists**: offset-linked circular lists ([`dlist`])
//! - **Layout Versioning**: attach refuses segments built with a different
//!   structure layout
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────────────────────┐     ┌──────────────┐
//! │  Process A   │     │        /dev/shm/<name>            │     │  Process B   │
//! │              │     │ ┌────────┬──────┬─────┬─────────┐ │     │              │
//! │ Arena::open  ├────►│ │ header │ heap │ gap │ rt vals │ │◄────┤ Arena::open  │
//! │  base = 0x7f…│     │ └────────┴──────┴─────┴─────────┘ │     │  base = 0x7e…│
//! └──────────────┘     └───────────────────────────────────┘     └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use evo_shared_memory::{Arena, SHM_MIN_SIZE};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let arena = Arena::anonymous(SHM_MIN_SIZE, 0x1234)?;
//! let guard = arena.lock();
//! let name = arena.alloc_str(&guard, "spindle.speed")?;
//! let value = arena.alloc_value(&guard)?;
//! drop(guard);
//!
//! assert_eq!(arena.str_at(name), "spindle.speed");
//! arena.value(value).store(42, std::sync::atomic::Ordering::Relaxed);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! All fallible operations return [`ShmResult`]. Exhaustion is reported as
//! [`ShmError::OutOfMemory`] and never leaves a partial allocation behind.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod dlist;
pub mod error;
mod heap;
pub mod mutex;
pub mod platform;
pub mod segment;
pub mod version;

pub use arena::{Arena, ArenaGuard, ArenaHeader, ArenaStats, SHM_NULL, ShmOff};
pub use dlist::DListLink;
pub use error::{ShmError, ShmResult};
pub use evo::shm::consts::{SHM_DEFAULT_SIZE, SHM_MAX_SIZE, SHM_MIN_SIZE};
pub use mutex::{ShmMutex, ShmMutexGuard};
pub use segment::Segment;
pub use version::{combine_version, struct_version_hash};

/// Initialize tracing for processes that do not install their own subscriber.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
