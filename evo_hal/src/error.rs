//! Process-wide last-error capture.
//!
//! Every public [`Hal`](crate::Hal) operation that fails logs the error and
//! stores its message here, so front-ends that only see a return code can
//! still show what went wrong.

use evo_common::hal::error::{HalError, HalResult};
use parking_lot::Mutex;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, warn};

static LAST_ERROR: LazyLock<Mutex<Option<String>>> = LazyLock::new(|| Mutex::new(None));
static ERROR_COUNT: AtomicU64 = AtomicU64::new(0);

/// Message of the most recent failed HAL operation in this process.
pub fn last_error() -> Option<String> {
    LAST_ERROR.lock().clone()
}

/// Number of failed HAL operations since the last clear.
pub fn error_count(clear: bool) -> u64 {
    if clear {
        *LAST_ERROR.lock() = None;
        ERROR_COUNT.swap(0, Ordering::Relaxed)
    } else {
        ERROR_COUNT.load(Ordering::Relaxed)
    }
}

pub(crate) fn record_error(e: &HalError) {
    // Config-class failures are routine for interactive use
    if e.is_config_error() {
        warn!("{}", e);
    } else {
        error!("{}", e);
    }
    *LAST_ERROR.lock() = Some(e.to_string());
    ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Record the error of a public operation before handing it back.
pub(crate) trait Recorded {
    fn recorded(self) -> Self;
}

impl<T> Recorded for HalResult<T> {
    #[inline]
    fn recorded(self) -> Self {
        if let Err(e) = &self {
            record_error(e);
        }
        self
    }
}

/// Run `op` and record its error, if any.
#[inline]
pub(crate) fn recording<T>(op: impl FnOnce() -> HalResult<T>) -> HalResult<T> {
    op().recorded()
}
