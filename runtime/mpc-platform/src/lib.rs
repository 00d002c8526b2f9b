//! MPC platform abstraction - hardware seams for the component runtime
//!
//! # Purpose
//! The component runtime drives a DSP coprocessor (the MPC) but never talks
//! to hardware directly. This crate defines the two seams it goes through:
//! [`DspAllocator`] for coprocessor memory and [`ExecutiveEngine`] for the
//! executive's remote services (lifecycle calls, stack programming,
//! interrupt routing, power). It also carries the small shared vocabulary
//! (cores, domains, priorities) and the generation-checked [`HandleTable`]
//! used by everything that hands out handles.
//!
//! # Architecture
//! Real deployments implement the two traits over the mailbox transport of
//! the SoC. The `mock` feature provides in-memory implementations with the
//! same observable behavior plus call recording, so the runtime can be
//! tested hosted.
//!
//! # Testing Strategy
//! - Unit tests: handle table reuse and stale-handle detection, mock
//!   allocator accounting, mock executive scripting
//! - Integration tests: driven from the component-manager crate

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

mod executive;
mod handle;
mod memory;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use executive::{CallMode, ExecutiveEngine, ServiceKind};
pub use handle::{Handle, HandleTable};
pub use memory::{checked_align_up, ChunkId, DspAllocator, MemKind, MemoryChunk};

use thiserror::Error;

/// Error type shared by the platform seams.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("out of coprocessor memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("coprocessor core {core:?} is not responding")]
    NotResponding { core: CoreId },

    #[error("executive service failed (code {code})")]
    ServiceFailed { code: i32 },

    #[error("handle table full (capacity {capacity})")]
    TableFull { capacity: usize },

    #[error("interrupt line {line} already bound")]
    IrqAlreadyBound { line: u32 },
}

pub type Result<T> = core::result::Result<T, PlatformError>;

/// One DSP core of the coprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId(pub u8);

/// An execution domain hosted on one core.
///
/// Domains are configured outside the runtime; the allocator knows which
/// core each domain runs on (see [`DspAllocator::domain_core`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u32);

/// Scheduling band of a component instance on its core.
///
/// The order is meaningful: a caller above the executive's service priority
/// must not wait on the service, so lifecycle calls from it are deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Background = 0,
    Normal = 1,
    Urgent = 2,
}

/// Number of scheduling bands per core.
pub const PRIORITY_COUNT: usize = 3;

impl Priority {
    pub const ALL: [Priority; PRIORITY_COUNT] =
        [Priority::Background, Priority::Normal, Priority::Urgent];

    /// Index into per-priority tables (stack budgets).
    pub fn index(self) -> usize {
        self as usize
    }
}
