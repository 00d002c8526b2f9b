//! Lifecycle state machine.
//!
//! Construct, start and stop travel to the coprocessor as executive
//! service calls. Every call is preceded by a liveness probe, and the
//! delivery mode depends on whether the instance outranks the executive's
//! own service context on that core. Singleton templates multiplex the
//! transitions: clients join and leave, and only the edges of the
//! aggregate count reach the coprocessor.

use cof::CompClass;
use log::debug;
use mpc_platform::{CallMode, CoreId, ExecutiveEngine, Priority, ServiceKind};

use crate::instance::ComponentInstance;
use crate::template::Template;
use crate::{ClientId, CmError, Result};

/// Where an instance stands in its life.
///
/// `Idle` exists only between region build and construct; callers observe
/// `Stopped` or `Runnable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Stopped,
    Runnable,
}

/// How thorough a destroy should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyMode {
    /// Check preconditions, always run the destroy entry.
    Normal,
    /// Skip preconditions, run the destroy entry only if the core answers.
    Force,
    /// Skip preconditions and never call the coprocessor.
    ForceSilent,
}

/// One lifecycle service call: liveness probe, mode selection, dispatch.
pub(crate) fn service_rpc<E: ExecutiveEngine>(
    engine: &E,
    core: CoreId,
    priority: Priority,
    kind: ServiceKind,
    this: u32,
    entry: u32,
) -> Result<()> {
    if !engine.is_core_running(core) {
        return Err(CmError::MpcNotResponding { core });
    }
    // An instance above the executive's service band must not wait on it
    let mode = if priority > engine.service_priority(core) {
        CallMode::Deferred
    } else {
        CallMode::Synchronous
    };
    engine.call_service(core, kind, mode, this, entry)?;
    Ok(())
}

/// Construct transition, run once per instance during instantiation.
/// Firmware has no construct and comes up running.
pub(crate) fn construct<E: ExecutiveEngine>(
    instance: &mut ComponentInstance,
    template: &Template,
    engine: &E,
) -> Result<()> {
    if template.class == CompClass::Firmware {
        instance.state = State::Runnable;
        return Ok(());
    }
    if let Some(entry) = template.lifecycle_entry(ServiceKind::Construct) {
        service_rpc(
            engine,
            instance.core,
            instance.priority,
            ServiceKind::Construct,
            instance.this,
            entry,
        )?;
    }
    instance.state = State::Stopped;
    Ok(())
}

pub(crate) fn start<E: ExecutiveEngine>(
    instance: &mut ComponentInstance,
    template: &Template,
    engine: &E,
    client: ClientId,
) -> Result<()> {
    match instance.state {
        State::Runnable => {
            // Already running; singleton clients join for free
            if template.is_singleton() {
                instance.client_mut(client).starts += 1;
            }
            Ok(())
        }
        State::Idle => Err(CmError::ComponentNotStopped),
        State::Stopped => {
            for (index, req) in template.requires.iter().enumerate() {
                if !req.kind.must_bind_before_start() {
                    continue;
                }
                if instance.bindings[index].iter().any(|slot| slot.is_none()) {
                    return Err(CmError::RequireInterfaceUnbound {
                        interface: req.name.clone(),
                    });
                }
            }

            let core = instance.core;
            let mut hw_raised = false;
            if template.hardware && !instance.hw_on {
                if !engine.is_core_running(core) {
                    return Err(CmError::MpcNotResponding { core });
                }
                engine.hardware_enable(core)?;
                instance.hw_on = true;
                hw_raised = true;
            }

            if let Some(entry) = template.lifecycle_entry(ServiceKind::Start) {
                if let Err(e) = service_rpc(
                    engine,
                    core,
                    instance.priority,
                    ServiceKind::Start,
                    instance.this,
                    entry,
                ) {
                    if hw_raised {
                        engine.hardware_disable(core);
                        instance.hw_on = false;
                    }
                    return Err(e);
                }
            }

            instance.state = State::Runnable;
            if template.is_singleton() {
                instance.client_mut(client).starts += 1;
            }
            debug!("{}[{}] started", template.name, instance.label);
            Ok(())
        }
    }
}

pub(crate) fn stop<E: ExecutiveEngine>(
    instance: &mut ComponentInstance,
    template: &Template,
    engine: &E,
    client: ClientId,
) -> Result<()> {
    if template.is_singleton() {
        let counters = instance.client_mut(client);
        if counters.starts == 0 {
            return Err(CmError::ComponentNotStarted);
        }
        counters.starts -= 1;
        if instance.total_starts() > 0 {
            // Other start requests still outstanding
            return Ok(());
        }
        if let Err(e) = real_stop(instance, template, engine) {
            // Leave the counters as they were so the stop can be retried
            instance.client_mut(client).starts += 1;
            return Err(e);
        }
        Ok(())
    } else {
        if instance.state != State::Runnable {
            return Err(CmError::ComponentNotStarted);
        }
        real_stop(instance, template, engine)
    }
}

fn real_stop<E: ExecutiveEngine>(
    instance: &mut ComponentInstance,
    template: &Template,
    engine: &E,
) -> Result<()> {
    debug_assert_eq!(instance.state, State::Runnable);
    let core = instance.core;

    let rpc_result = match template.lifecycle_entry(ServiceKind::Stop) {
        Some(entry) => service_rpc(
            engine,
            core,
            instance.priority,
            ServiceKind::Stop,
            instance.this,
            entry,
        ),
        None => Ok(()),
    };

    // The power gate drops even when the stop call failed
    if instance.hw_on {
        engine.hardware_disable(core);
        instance.hw_on = false;
    }

    rpc_result?;
    instance.state = State::Stopped;
    debug!("{}[{}] stopped", template.name, instance.label);
    Ok(())
}
