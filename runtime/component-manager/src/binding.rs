//! Interface binding.
//!
//! Binding wires one member of a client's required interface to one member
//! of a server's provided interface by patching the client's call-site
//! cells: word zero becomes the server's "this", the following words the
//! server's method addresses. Everything is validated before the first
//! word is written, so a refused bind changes nothing.

use alloc::rc::Rc;
use alloc::vec::Vec;

use log::debug;
use mpc_platform::{Handle, HandleTable};

use crate::descriptor::MemoryRef;
use crate::instance::ComponentInstance;
use crate::template::Template;
use crate::{ClientId, CmError, Result};

/// One bound require slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub server: Handle,
    pub provide_index: usize,
    pub provide_member: usize,
    /// Bind calls stacked on this slot; above 1 only for singleton clients.
    pub count: u32,
}

fn illegal(reason: &'static str) -> CmError {
    CmError::IllegalBinding { reason }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn bind(
    instances: &mut HandleTable<ComponentInstance>,
    templates: &HandleTable<Template>,
    client: Handle,
    require: &str,
    require_member: usize,
    server: Handle,
    provide: &str,
    provide_member: usize,
    client_id: ClientId,
) -> Result<()> {
    // Validate and plan against immutable state first
    let client_inst = instances.get(client).ok_or(CmError::UnknownComponent)?;
    let server_inst = instances.get(server).ok_or(CmError::UnknownComponent)?;
    let client_tpl = templates
        .get(client_inst.template)
        .ok_or(CmError::UnknownComponent)?;
    let server_tpl = templates
        .get(server_inst.template)
        .ok_or(CmError::UnknownComponent)?;

    let require_index = client_tpl
        .find_require(require)
        .ok_or_else(|| illegal("no such required interface"))?;
    let req = &client_tpl.requires[require_index];
    if require_member >= req.collection as usize {
        return Err(illegal("required collection index out of range"));
    }
    if !req.kind.has_patch_sites() {
        return Err(illegal("required interface is static or virtual"));
    }
    if req.kind.is_intrinsic() {
        return Err(illegal("required interface is intrinsic"));
    }

    let provide_index = server_tpl
        .find_provide(provide)
        .ok_or_else(|| illegal("no such provided interface"))?;
    let pro = &server_tpl.provides[provide_index];
    if provide_member >= pro.collection as usize {
        return Err(illegal("provided collection index out of range"));
    }
    if pro.kind.is_virtual() {
        return Err(illegal("provided interface is virtual"));
    }
    if !Rc::ptr_eq(&req.descriptor, &pro.descriptor) {
        return Err(illegal("interface types differ"));
    }
    if client_inst.core != server_inst.core {
        return Err(illegal("instances live on different cores"));
    }

    let multiplex = match &client_inst.bindings[require_index][require_member] {
        Some(existing) => {
            if !client_tpl.is_singleton() {
                return Err(illegal("slot is already bound"));
            }
            if existing.server != server
                || existing.provide_index != provide_index
                || existing.provide_member != provide_member
            {
                return Err(illegal("slot is already bound to a different provider"));
            }
            true
        }
        None => false,
    };

    let server_this = server_inst.this;
    let cells: Vec<MemoryRef> = req.sites[require_member].clone();
    let method_addrs: Vec<u32> = if multiplex {
        Vec::new()
    } else {
        pro.methods[provide_member]
            .iter()
            .map(|&addr| match server_tpl.resolve_code_addr(addr) {
                Some(a) => a,
                None => unreachable!("provided method without an address"),
            })
            .collect()
    };

    // Patch the client
    let client_is_singleton = client_tpl.is_singleton();
    let patched = instances.get_mut(client).ok_or(CmError::UnknownComponent)?;
    if multiplex {
        match &mut patched.bindings[require_index][require_member] {
            Some(existing) => existing.count += 1,
            None => unreachable!("multiplex bind on an empty slot"),
        }
    } else {
        for &cell in &cells {
            patched.write_word(client_tpl, cell, server_this);
            for (k, &addr) in method_addrs.iter().enumerate() {
                let word = MemoryRef {
                    segment: cell.segment,
                    offset: cell.offset + 4 * (k as u32 + 1),
                };
                patched.write_word(client_tpl, word, addr);
            }
        }
        patched.bindings[require_index][require_member] = Some(Binding {
            server,
            provide_index,
            provide_member,
            count: 1,
        });
    }
    if client_is_singleton {
        patched.client_mut(client_id).binds += 1;
    }

    // Count the remote use; with a self-bind this re-borrows the client
    match instances.get_mut(server) {
        Some(s) => s.provided_refs += 1,
        None => unreachable!("server vanished during bind"),
    }

    debug!(
        "bound {}#{}[{}] -> {}#{}[{}]",
        require,
        client.index(),
        require_member,
        provide,
        server.index(),
        provide_member
    );
    Ok(())
}

pub(crate) fn unbind(
    instances: &mut HandleTable<ComponentInstance>,
    templates: &HandleTable<Template>,
    client: Handle,
    require: &str,
    require_member: usize,
    client_id: ClientId,
) -> Result<()> {
    let client_inst = instances.get(client).ok_or(CmError::UnknownComponent)?;
    let client_tpl = templates
        .get(client_inst.template)
        .ok_or(CmError::UnknownComponent)?;
    let require_index = client_tpl
        .find_require(require)
        .ok_or_else(|| illegal("no such required interface"))?;
    if require_member >= client_inst.bindings[require_index].len() {
        return Err(illegal("required collection index out of range"));
    }
    let binding = client_inst.bindings[require_index][require_member]
        .ok_or_else(|| illegal("slot is not bound"))?;

    let client_is_singleton = client_tpl.is_singleton();
    let patched = instances.get_mut(client).ok_or(CmError::UnknownComponent)?;
    if client_is_singleton {
        let counters = patched.client_mut(client_id);
        counters.binds = counters.binds.saturating_sub(1);
    }
    let remaining = match &mut patched.bindings[require_index][require_member] {
        Some(b) => {
            b.count -= 1;
            b.count
        }
        None => unreachable!("slot emptied during unbind"),
    };
    if remaining == 0 {
        patched.poison_cell(client_tpl, require_index, require_member);
        patched.bindings[require_index][require_member] = None;
    }

    // The server may have been force-destroyed; its side of the count
    // disappeared with it
    match instances.get_mut(binding.server) {
        Some(s) => s.provided_refs = s.provided_refs.saturating_sub(1),
        None => debug!("unbind {}: server already gone", require),
    }
    Ok(())
}
