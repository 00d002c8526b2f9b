//! Executive engine seam: remote services of the coprocessor executive.
//!
//! Every DSP core runs a small executive that owns lifecycle entry
//! dispatch, per-priority stack programming, interrupt routing and the
//! hardware power gate. The component runtime reaches it only through
//! [`ExecutiveEngine`].

use crate::{CoreId, Priority, Result};

/// Which lifecycle entry a service call dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Construct,
    Start,
    Stop,
    Destroy,
}

/// How a service call is delivered.
///
/// `Synchronous` blocks the caller until the executive returns. `Deferred`
/// queues the call; it is used when the calling context runs above the
/// executive's own service priority and must not wait on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallMode {
    Synchronous,
    Deferred,
}

/// Remote services of the per-core executive.
///
/// Methods take `&self`; the transport (a mailbox in real deployments)
/// serializes internally, and callers are serialized above this seam.
pub trait ExecutiveEngine {
    /// Whether the core's executive answers its heartbeat.
    fn is_core_running(&self, core: CoreId) -> bool;

    /// The priority the executive's service context runs at on `core`.
    fn service_priority(&self, core: CoreId) -> Priority;

    /// Dispatch one lifecycle entry on `core`.
    ///
    /// `this` is the instance's data base address on the DSP, `entry` the
    /// code address of the lifecycle routine. A nonzero status from the
    /// routine surfaces as [`PlatformError::ServiceFailed`].
    ///
    /// [`PlatformError::ServiceFailed`]: crate::PlatformError::ServiceFailed
    fn call_service(
        &self,
        core: CoreId,
        kind: ServiceKind,
        mode: CallMode,
        this: u32,
        entry: u32,
    ) -> Result<()>;

    /// Program the stack budget (in words) for one priority band on `core`.
    /// Returns the budget actually programmed.
    fn update_stack(&self, core: CoreId, priority: Priority, words: u32) -> Result<u32>;

    /// Route interrupt `line` on `core` to a handler at `entry`.
    fn bind_interrupt(&self, core: CoreId, line: u32, entry: u32) -> Result<()>;

    /// Drop the routing for interrupt `line` on `core`.
    fn unbind_interrupt(&self, core: CoreId, line: u32);

    /// Raise the hardware power gate for `core`'s peripheral block.
    fn hardware_enable(&self, core: CoreId) -> Result<()>;

    /// Release the hardware power gate.
    fn hardware_disable(&self, core: CoreId);
}
