//! Platform specific operations.

pub mod linux;

pub use linux::{
    anonymous_mmap, attach_segment_mmap, create_segment_mmap, get_current_pid, is_process_alive,
    pin_to_cpu, set_fifo_priority, unlink_segment,
};
