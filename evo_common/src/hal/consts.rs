//! HAL (Hardware Abstraction Layer) constants.
//!
//! Limits and defaults of the object database, scheduler and change
//! detection engine.

/// Maximum length of any HAL object name, in bytes.
pub const HAL_NAME_LEN: usize = 127;

/// Name of the bootstrap component created with every new segment.
pub const HAL_LIB_NAME: &str = "hal_lib";

/// Number of slots in the shared epsilon table.
pub const MAX_EPSILON: usize = 5;

/// Value every epsilon slot starts with.
pub const DEFAULT_EPSILON: f64 = 0.00001;

/// Deepest nesting of groups accepted by group compilation.
pub const MAX_NESTED_GROUPS: usize = 10;

/// Priority assigned to the first thread.
pub const PRIO_HIGHEST: u32 = 99;

/// Lowest priority a thread can be assigned.
pub const PRIO_LOWEST: u32 = 1;

/// Group flag: report only members that changed.
pub const GROUP_REPORT_ON_CHANGE: u32 = 1;

/// Group flag: monitor every member regardless of its own flag.
pub const GROUP_MONITOR_ALL_MEMBERS: u32 = 2;

/// Member flag: track changes of this member.
pub const MEMBER_MONITOR_CHANGE: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_range() {
        assert!(PRIO_HIGHEST > PRIO_LOWEST);
    }

    #[test]
    fn test_epsilon_defaults() {
        assert!(MAX_EPSILON > 0);
        assert!(DEFAULT_EPSILON > 0.0 && DEFAULT_EPSILON < 1.0);
    }

    #[test]
    fn test_group_flags_are_distinct() {
        assert_eq!(GROUP_REPORT_ON_CHANGE & GROUP_MONITOR_ALL_MEMBERS, 0);
    }
}
