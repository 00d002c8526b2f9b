//! Component manager for the MPC DSP coprocessor.
//!
//! # Purpose
//! Loads component binaries (COF images) onto coprocessor cores and drives
//! their lifecycle. Loading is two-phase: a *template* holds everything
//! instances share (code and constant regions, relocated once, plus the
//! parsed tables), and each *instance* gets freshly materialized private
//! data regions, instance relocations and patchable call-site cells.
//! Instances move through `Idle -> Stopped <-> Runnable` under the control
//! of the host; every transition is a remote call into the per-core
//! executive.
//!
//! # Architecture
//! [`ComponentManager`] owns the component repository (installed images),
//! the interface registry (interned interface types), the template cache,
//! the instance table and the per-core stack budgets. Hardware access goes
//! through the two `mpc-platform` seams, so the whole runtime runs hosted
//! against the mock backends.
//!
//! The manager is single-threaded by contract: every operation takes
//! `&mut self`, so exclusivity is compile-time. Callers that share it
//! across contexts serialize outside.
//!
//! # Testing Strategy
//! - Unit tests: parser, registry, layout and table bookkeeping per module
//! - Integration tests: end-to-end load/lifecycle/bind scenarios against
//!   the mock platform (`tests/integration_test.rs`)

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod descriptor;
pub mod parser;
pub mod registry;

mod binding;
mod instance;
mod layout;
mod lifecycle;
mod manager;
mod template;

pub use instance::ClientCounters;
pub use lifecycle::{DestroyMode, State};
pub use manager::{ComponentManager, DEFAULT_STACK_WORDS, MAX_INSTANCES, MAX_TEMPLATES};
pub use parser::ParseError;

use alloc::string::String;

use mpc_platform::{CoreId, PlatformError};
use thiserror::Error;

/// Handle to a live component instance.
pub type ComponentHandle = mpc_platform::Handle;

/// Identity of one manager client (a host-side context using a component).
///
/// Clients only matter for singleton components, where the one instance is
/// multiplexed and the manager keeps per-client use counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u32);

/// Errors of the component manager API.
#[derive(Debug, Error)]
pub enum CmError {
    #[error("invalid component image: {0}")]
    InvalidFormat(#[from] ParseError),

    #[error("out of coprocessor memory (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("no component named {name:?} is installed")]
    ComponentNotFound { name: String },

    #[error("component {name:?} is already installed")]
    AlreadyInstalled { name: String },

    #[error("coprocessor core {core:?} is not responding")]
    MpcNotResponding { core: CoreId },

    #[error("required interface {interface:?} is not bound")]
    RequireInterfaceUnbound { interface: String },

    #[error("component is not stopped")]
    ComponentNotStopped,

    #[error("component is not started")]
    ComponentNotStarted,

    #[error("component still has interface bindings")]
    ComponentNotUnbound,

    #[error("illegal binding: {reason}")]
    IllegalBinding { reason: &'static str },

    #[error("no property named {name:?}")]
    PropertyNotFound { name: String },

    #[error("no attribute named {name:?}")]
    AttributeNotFound { name: String },

    #[error("unknown component handle")]
    UnknownComponent,

    #[error("out of handles")]
    NoMoreHandles,

    #[error("interrupt line {line} already bound")]
    InterruptBusy { line: u32 },

    #[error("executive service failed (code {code})")]
    ServiceFailed { code: i32 },
}

impl From<PlatformError> for CmError {
    fn from(e: PlatformError) -> Self {
        match e {
            PlatformError::OutOfMemory { requested } => CmError::OutOfMemory { requested },
            PlatformError::NotResponding { core } => CmError::MpcNotResponding { core },
            PlatformError::ServiceFailed { code } => CmError::ServiceFailed { code },
            PlatformError::TableFull { .. } => CmError::NoMoreHandles,
            PlatformError::IrqAlreadyBound { line } => CmError::InterruptBusy { line },
        }
    }
}

pub type Result<T> = core::result::Result<T, CmError>;

/// Word written into unbound call-site cells. Calls through an unbound
/// slot fault immediately instead of wandering into stale code.
pub const UNBOUND_WORD: u32 = 0xFFFF_FFFF;
