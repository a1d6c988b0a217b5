//! Linux-specific shared memory and scheduling operations

use crate::error::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Create a new file-backed segment; fails if the file already exists.
pub fn create_segment_mmap(path: &Path, name: &str, size: usize) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => ShmError::AlreadyExists {
                name: name.to_string(),
            },
            _ => ShmError::Io { source: e },
        })?;

    file.set_len(size as u64)?;

    // Fault every page in now so realtime code never takes a first-touch fault
    let mmap = unsafe { MmapOptions::new().populate().map_mut(&file)? };
    Ok(mmap)
}

/// Attach to an existing file-backed segment.
pub fn attach_segment_mmap(path: &Path, name: &str) -> ShmResult<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => ShmError::NotFound {
                name: name.to_string(),
            },
            _ => ShmError::Io { source: e },
        })?;

    let mmap = unsafe { MmapOptions::new().populate().map_mut(&file)? };
    Ok(mmap)
}

/// Map a process-private anonymous segment.
pub fn anonymous_mmap(size: usize) -> ShmResult<MmapMut> {
    Ok(MmapOptions::new().len(size).populate().map_anon()?)
}

/// Remove the backing file of a named segment.
pub fn unlink_segment(path: &Path) -> ShmResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ShmError::Io { source: e }),
    }
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Use a null signal (None) to test for process existence without sending a signal
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false, // No such process
        Err(nix::Error::EPERM) => true,  // Process exists but no permission to signal
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

/// Switch the calling thread to `SCHED_FIFO` at `priority`.
pub fn set_fifo_priority(priority: u32) -> ShmResult<()> {
    let param = libc::sched_param {
        sched_priority: priority as libc::c_int,
    };
    let rc = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if rc == 0 {
        Ok(())
    } else {
        Err(ShmError::Io {
            source: std::io::Error::from_raw_os_error(rc),
        })
    }
}

/// Restrict the calling thread to a single CPU.
pub fn pin_to_cpu(cpu: usize) -> ShmResult<()> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(get_current_pid()));
    }

    #[test]
    fn test_anonymous_mapping_is_zeroed() {
        let mmap = anonymous_mmap(8192).unwrap();
        assert_eq!(mmap.len(), 8192);
        assert!(mmap.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_attach_missing_segment() {
        let path = Path::new("/dev/shm/evo_hal_test_missing_segment");
        assert!(matches!(
            attach_segment_mmap(path, "missing"),
            Err(ShmError::NotFound { .. })
        ));
    }
}
