//! # EVO HAL Library
//!
//! The HAL runtime: a shared object database of components, pins, signals
//! and parameters, a periodic function scheduler and a change-detection
//! engine, all living in one [`evo_shared_memory::Arena`] that every
//! attached process maps.
//!
//! # Module Structure
//!
//! - [`registry`] - Generic object list, lookup, iteration, garbage sweep
//! - [`component`] / [`instance`] - Ownership roots and their lifecycle
//! - [`pin`] / [`signal`] / [`param`] - The wiring model
//! - [`funct`] / [`thread`] - Exported functions and periodic threads
//! - [`group`] / [`cgroup`] / [`ccomp`] - Change detection
//! - [`command`] - Textual command interpreter used by `evo_halcmd`
//! - [`error`] - Process-wide last-error capture
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         shared segment                           │
//! │  ┌──────────┐   ┌───────────────────────────────────────────┐    │
//! │  │ HalData  │──►│ objects (name ordered dlist)              │    │
//! │  │ (root)   │   │  comp ─ inst ─ pin ─ sig ─ param ─ funct  │    │
//! │  │ epsilon  │   │  thread ─ group ─ member                  │    │
//! │  └──────────┘   └───────────────────────────────────────────┘    │
//! │        ▲                     ▲                   ▲               │
//! └────────┼─────────────────────┼───────────────────┼───────────────┘
//!          │                     │                   │
//!    ┌─────┴─────┐        ┌──────┴──────┐     ┌──────┴──────┐
//!    │ Hal (A)   │        │ Hal (B)     │     │ evo_halcmd  │
//!    │ functs,   │        │ components  │     │ Interpreter │
//!    │ threads   │        │ pins        │     │             │
//!    └───────────┘        └─────────────┘     └─────────────┘
//! ```
//!
//! Function callables, instance hooks and thread tasks are process-local;
//! everything else is visible to every process attached to the segment.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod context;
mod data;
mod object;

pub mod ccomp;
pub mod cgroup;
pub mod command;
pub mod component;
pub mod error;
pub mod funct;
pub mod group;
pub mod instance;
pub mod param;
pub mod pin;
pub mod registry;
pub mod signal;
pub mod thread;

// Re-export key types for convenience
pub use crate::ccomp::CompiledComp;
pub use crate::cgroup::{CompiledGroup, ReportEvent};
pub use crate::command::Interpreter;
pub use crate::component::CompInfo;
pub use crate::context::{Hal, in_rt_context};
pub use crate::error::{error_count, last_error};
pub use crate::funct::{FunctArgs, FunctCall, FunctInfo, FunctSpec};
pub use crate::group::{GroupInfo, MemberInfo};
pub use crate::instance::{InstanceHooks, InstanceInfo, InstanceRequest};
pub use crate::object::ObjectFlags;
pub use crate::param::{ParamInfo, ParamPtr};
pub use crate::pin::{PinInfo, PinPtr};
pub use crate::registry::{Cursor, ObjectSummary, Selector, Visit};
pub use crate::signal::SignalInfo;
pub use crate::thread::{ThreadInfo, ThreadOptions};
