//! The component manager.
//!
//! # Purpose
//! Owns every table the runtime needs: the image repository, the template
//! cache, the instance table, the interface registry and the per-core
//! per-priority stack budgets. All public operations go through `&mut
//! self`; callers serialize access, and the exclusive borrow makes that
//! contract structural.
//!
//! # Architecture
//! `install` only stores bytes. The first `instantiate` for a core parses
//! the image and makes a [`Template`] resident; later instantiations on
//! that core reuse it for as long as at least one instance is alive.
//! Instantiation itself is a strict effect sequence: private regions,
//! table registration, interrupt routing, stack budget, construct call.
//! Each failure unwinds everything before it, so a failed call leaves the
//! tables exactly as they were.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, info, warn};
use mpc_platform::{
    CoreId, DomainId, DspAllocator, ExecutiveEngine, Handle, HandleTable, Priority, ServiceKind,
};

use crate::binding;
use crate::instance::{ClientCounters, ComponentInstance};
use crate::lifecycle::{self, DestroyMode, State};
use crate::parser;
use crate::registry::InterfaceRegistry;
use crate::template::Template;
use crate::{ClientId, CmError, ComponentHandle, Result};

pub const MAX_TEMPLATES: usize = 64;
pub const MAX_INSTANCES: usize = 256;

/// Stack budget every priority band starts from, in words.
pub const DEFAULT_STACK_WORDS: u32 = 1024;

pub struct ComponentManager<A, E> {
    allocator: A,
    engine: E,
    registry: InterfaceRegistry,
    /// Installed images by component name.
    repository: BTreeMap<String, Vec<u8>>,
    templates: HandleTable<Template>,
    instances: HandleTable<ComponentInstance>,
    /// Highest stack budget programmed per core and priority band.
    budgets: BTreeMap<(CoreId, Priority), u32>,
}

/// Follow a template handle the manager itself issued.
fn template_ref(templates: &HandleTable<Template>, handle: Handle) -> &Template {
    match templates.get(handle) {
        Some(t) => t,
        // Instances hold their template alive; the handle cannot go stale
        None => unreachable!("template handle invalidated while in use"),
    }
}

impl<A: DspAllocator, E: ExecutiveEngine> ComponentManager<A, E> {
    pub fn new(allocator: A, engine: E) -> Self {
        Self {
            allocator,
            engine,
            registry: InterfaceRegistry::new(),
            repository: BTreeMap::new(),
            templates: HandleTable::new(MAX_TEMPLATES),
            instances: HandleTable::new(MAX_INSTANCES),
            budgets: BTreeMap::new(),
        }
    }

    /// The memory side of the platform, mainly for inspection in tests.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// The executive side of the platform, mainly for inspection in tests.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Register an image under `name`. The bytes are parsed lazily, on the
    /// first instantiation.
    pub fn install(&mut self, name: &str, image: &[u8]) -> Result<()> {
        if self.repository.contains_key(name) {
            return Err(CmError::AlreadyInstalled {
                name: String::from(name),
            });
        }
        self.repository.insert(String::from(name), image.to_vec());
        info!("installed component {:?} ({} bytes)", name, image.len());
        Ok(())
    }

    /// Remove an image from the repository. Templates already resident
    /// keep working; only future cold loads are affected.
    pub fn uninstall(&mut self, name: &str) -> Result<()> {
        match self.repository.remove(name) {
            Some(_) => Ok(()),
            None => Err(CmError::ComponentNotFound {
                name: String::from(name),
            }),
        }
    }

    pub fn installed(&self, name: &str) -> bool {
        self.repository.contains_key(name)
    }

    /// Create (or, for singletons, join) an instance of `name` in `domain`.
    pub fn instantiate(
        &mut self,
        name: &str,
        domain: DomainId,
        priority: Priority,
        label: &str,
        client: ClientId,
    ) -> Result<ComponentHandle> {
        let core = self.allocator.domain_core(domain);

        let (template_handle, cold) = match self.find_template(core, name) {
            Some(handle) => (handle, false),
            None => (self.load_template(name, core, domain)?, true),
        };

        // Singletons share their one instance across clients
        let singleton_join = match self.templates.get(template_handle) {
            Some(t) => t.singleton,
            None => None,
        };
        if let Some(existing) = singleton_join {
            let instance = self
                .instances
                .get_mut(existing)
                .ok_or(CmError::UnknownComponent)?;
            instance.refs += 1;
            instance.client_mut(client).instances += 1;
            debug!("{:?}: client {} joined the singleton", name, client.0);
            return Ok(existing);
        }

        if self.instances.is_full() {
            self.unload_if_cold(template_handle, cold);
            return Err(CmError::NoMoreHandles);
        }

        // Private regions
        let build = {
            let template = template_ref(&self.templates, template_handle);
            ComponentInstance::build_regions(template, domain, &self.allocator)
        };
        let chunks = match build {
            Ok(chunks) => chunks,
            Err(e) => {
                self.unload_if_cold(template_handle, cold);
                return Err(e);
            }
        };

        // Assemble, relocate, poison, register
        let handle = {
            let template = template_ref(&self.templates, template_handle);
            let mut instance = ComponentInstance::assemble(
                template_handle,
                template,
                domain,
                priority,
                label,
                chunks,
                client,
            );
            instance.apply_instance_relocs(template);
            instance.poison_all_sites(template);
            match self.instances.insert(instance) {
                Ok(handle) => handle,
                // Capacity was prechecked under the same exclusive borrow
                Err(_) => unreachable!("instance table full after precheck"),
            }
        };

        // Interrupt routing
        let mut irq_failure: Option<CmError> = None;
        {
            let template = template_ref(&self.templates, template_handle);
            for pro in template.provides.iter().filter(|p| p.kind.is_interrupt()) {
                let Some(line) = pro.irq_line else { continue };
                let Some(entry) = pro
                    .methods
                    .first()
                    .and_then(|member| member.first())
                    .and_then(|&addr| template.resolve_code_addr(addr))
                else {
                    continue;
                };
                match self.engine.bind_interrupt(core, line, entry) {
                    Ok(()) => match self.instances.get_mut(handle) {
                        Some(instance) => instance.irq_lines.push(line),
                        None => {}
                    },
                    Err(e) => {
                        irq_failure = Some(e.into());
                        break;
                    }
                }
            }
        }
        if let Some(e) = irq_failure {
            self.unwind_new_instance(handle, template_handle, cold);
            return Err(e);
        }

        // Stack budget
        let min_stack = template_ref(&self.templates, template_handle).min_stack;
        if let Err(e) = self.ensure_budget(core, priority, min_stack) {
            self.unwind_new_instance(handle, template_handle, cold);
            return Err(e);
        }

        // Construct call
        let constructed = {
            let template = template_ref(&self.templates, template_handle);
            match self.instances.get_mut(handle) {
                Some(instance) => lifecycle::construct(instance, template, &self.engine),
                None => Err(CmError::UnknownComponent),
            }
        };
        if let Err(e) = constructed {
            self.unwind_new_instance(handle, template_handle, cold);
            return Err(e);
        }

        if let Some(template) = self.templates.get_mut(template_handle) {
            template.instances += 1;
            if template.is_singleton() {
                template.singleton = Some(handle);
            }
        }
        info!(
            "instantiated {:?} as {:?} (domain {}, {:?})",
            name, label, domain.0, priority
        );
        Ok(handle)
    }

    pub fn start(&mut self, handle: ComponentHandle, client: ClientId) -> Result<()> {
        let template_handle = self
            .instances
            .get(handle)
            .ok_or(CmError::UnknownComponent)?
            .template;
        let template = template_ref(&self.templates, template_handle);
        match self.instances.get_mut(handle) {
            Some(instance) => lifecycle::start(instance, template, &self.engine, client),
            None => Err(CmError::UnknownComponent),
        }
    }

    pub fn stop(&mut self, handle: ComponentHandle, client: ClientId) -> Result<()> {
        let template_handle = self
            .instances
            .get(handle)
            .ok_or(CmError::UnknownComponent)?
            .template;
        let template = template_ref(&self.templates, template_handle);
        match self.instances.get_mut(handle) {
            Some(instance) => lifecycle::stop(instance, template, &self.engine, client),
            None => Err(CmError::UnknownComponent),
        }
    }

    /// Release one reference to the instance and, when it was the last,
    /// tear the instance (and possibly its template) down.
    pub fn destroy(
        &mut self,
        handle: ComponentHandle,
        client: ClientId,
        mode: DestroyMode,
    ) -> Result<()> {
        // Every check happens before the first effect
        let instance = self.instances.get(handle).ok_or(CmError::UnknownComponent)?;
        let template_handle = instance.template;
        let template = template_ref(&self.templates, template_handle);
        let singleton = template.is_singleton();

        if singleton {
            let known = instance
                .clients
                .get(&client)
                .map(|c| c.instances > 0)
                .unwrap_or(false);
            if !known {
                return Err(CmError::UnknownComponent);
            }
        }

        let last_ref = instance.refs <= 1;
        if last_ref && mode == DestroyMode::Normal {
            if instance.state == State::Runnable {
                return Err(CmError::ComponentNotStopped);
            }
            if instance.bound_slots() > 0 || instance.provided_refs > 0 {
                return Err(CmError::ComponentNotUnbound);
            }
            if template.lifecycle_entry(ServiceKind::Destroy).is_some()
                && !self.engine.is_core_running(instance.core)
            {
                return Err(CmError::MpcNotResponding {
                    core: instance.core,
                });
            }
        }

        if !last_ref {
            // Other clients keep the singleton alive
            let instance = self
                .instances
                .get_mut(handle)
                .ok_or(CmError::UnknownComponent)?;
            instance.refs -= 1;
            if singleton {
                instance.client_mut(client).instances -= 1;
            }
            return Ok(());
        }

        // Last reference: full teardown
        let instance = match self.instances.remove(handle) {
            Some(instance) => instance,
            None => return Err(CmError::UnknownComponent),
        };
        let core = instance.core;

        let entry = template_ref(&self.templates, template_handle)
            .lifecycle_entry(ServiceKind::Destroy);
        if let Some(entry) = entry {
            let deliver = match mode {
                DestroyMode::Normal => true,
                DestroyMode::Force => self.engine.is_core_running(core),
                DestroyMode::ForceSilent => false,
            };
            if deliver {
                // The destructor cannot veto destruction at this point
                if let Err(e) = lifecycle::service_rpc(
                    &self.engine,
                    core,
                    instance.priority,
                    ServiceKind::Destroy,
                    instance.this,
                    entry,
                ) {
                    warn!("destroy entry failed, tearing down anyway: {}", e);
                }
            }
        }

        // A forced destroy may find the power gate still raised
        if instance.hw_on {
            self.engine.hardware_disable(core);
        }

        for &line in &instance.irq_lines {
            self.engine.unbind_interrupt(core, line);
        }

        self.recompute_budget(core, instance.priority);

        let last_instance = match self.templates.get_mut(template_handle) {
            Some(template) => {
                template.instances -= 1;
                if singleton {
                    template.singleton = None;
                }
                template.instances == 0
            }
            None => false,
        };

        instance.release(&self.allocator);

        if last_instance {
            if let Some(template) = self.templates.remove(template_handle) {
                template.unload(&self.allocator, &mut self.registry);
            }
        }
        Ok(())
    }

    /// Wire one member of the client's required interface to one member of
    /// the server's provided interface.
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        &mut self,
        client: ComponentHandle,
        require: &str,
        require_member: usize,
        server: ComponentHandle,
        provide: &str,
        provide_member: usize,
        client_id: ClientId,
    ) -> Result<()> {
        binding::bind(
            &mut self.instances,
            &self.templates,
            client,
            require,
            require_member,
            server,
            provide,
            provide_member,
            client_id,
        )
    }

    pub fn unbind(
        &mut self,
        client: ComponentHandle,
        require: &str,
        require_member: usize,
        client_id: ClientId,
    ) -> Result<()> {
        binding::unbind(
            &mut self.instances,
            &self.templates,
            client,
            require,
            require_member,
            client_id,
        )
    }

    pub fn get_property(&self, handle: ComponentHandle, name: &str) -> Result<String> {
        let instance = self.instances.get(handle).ok_or(CmError::UnknownComponent)?;
        let template = template_ref(&self.templates, instance.template);
        template
            .property(name)
            .map(String::from)
            .ok_or_else(|| CmError::PropertyNotFound {
                name: String::from(name),
            })
    }

    /// Host-side read of a named attribute word, wherever its segment was
    /// placed for this instance.
    pub fn read_attribute(&self, handle: ComponentHandle, name: &str) -> Result<u32> {
        let instance = self.instances.get(handle).ok_or(CmError::UnknownComponent)?;
        let template = template_ref(&self.templates, instance.template);
        let mref = template
            .find_attribute(name)
            .ok_or_else(|| CmError::AttributeNotFound {
                name: String::from(name),
            })?;
        Ok(instance.read_word(template, mref))
    }

    pub fn state(&self, handle: ComponentHandle) -> Result<State> {
        self.instances
            .get(handle)
            .map(|i| i.state)
            .ok_or(CmError::UnknownComponent)
    }

    pub fn template_name(&self, handle: ComponentHandle) -> Result<&str> {
        let instance = self.instances.get(handle).ok_or(CmError::UnknownComponent)?;
        Ok(template_ref(&self.templates, instance.template)
            .name
            .as_str())
    }

    pub fn instance_label(&self, handle: ComponentHandle) -> Result<&str> {
        self.instances
            .get(handle)
            .map(|i| i.label.as_str())
            .ok_or(CmError::UnknownComponent)
    }

    /// The memory domain an instance was placed in.
    pub fn instance_domain(&self, handle: ComponentHandle) -> Result<DomainId> {
        self.instances
            .get(handle)
            .map(|i| i.domain)
            .ok_or(CmError::UnknownComponent)
    }

    /// Singleton bookkeeping for one client, all zero when untouched.
    pub fn client_counters(
        &self,
        handle: ComponentHandle,
        client: ClientId,
    ) -> Result<ClientCounters> {
        let instance = self.instances.get(handle).ok_or(CmError::UnknownComponent)?;
        Ok(instance.clients.get(&client).copied().unwrap_or_default())
    }

    pub fn live_instances(&self) -> usize {
        self.instances.len()
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    pub fn interned_interfaces(&self) -> usize {
        self.registry.len()
    }

    pub fn stack_budget(&self, core: CoreId, priority: Priority) -> u32 {
        self.budgets
            .get(&(core, priority))
            .copied()
            .unwrap_or(DEFAULT_STACK_WORDS)
    }

    fn find_template(&self, core: CoreId, name: &str) -> Option<Handle> {
        // Resident templates are few; a scan beats keeping an index in sync
        self.templates
            .iter()
            .find(|(_, t)| t.core == core && t.name == name)
            .map(|(handle, _)| handle)
    }

    fn load_template(&mut self, name: &str, core: CoreId, domain: DomainId) -> Result<Handle> {
        if self.templates.is_full() {
            return Err(CmError::NoMoreHandles);
        }
        let image = self
            .repository
            .get(name)
            .ok_or_else(|| CmError::ComponentNotFound {
                name: String::from(name),
            })?;
        let descriptor = parser::parse(image, &mut self.registry)?;
        let template = Template::load(
            descriptor,
            core,
            domain,
            &self.allocator,
            &mut self.registry,
        )?;
        match self.templates.insert(template) {
            Ok(handle) => Ok(handle),
            // Capacity was prechecked under the same exclusive borrow
            Err(_) => unreachable!("template table full after precheck"),
        }
    }

    /// Undo a template load performed by the current call, unless an
    /// instance took a reference in the meantime.
    fn unload_if_cold(&mut self, template_handle: Handle, cold: bool) {
        if !cold {
            return;
        }
        let droppable = match self.templates.get(template_handle) {
            Some(template) => template.instances == 0,
            None => false,
        };
        if droppable {
            if let Some(template) = self.templates.remove(template_handle) {
                template.unload(&self.allocator, &mut self.registry);
            }
        }
    }

    /// Reverse everything `instantiate` did for a half-built instance:
    /// interrupt routing, table entry, private memory, cold template.
    /// The stack budget stays as programmed; it is a high-water mark that
    /// the next destroy recomputes.
    fn unwind_new_instance(&mut self, handle: Handle, template_handle: Handle, cold: bool) {
        if let Some(instance) = self.instances.remove(handle) {
            for &line in &instance.irq_lines {
                self.engine.unbind_interrupt(instance.core, line);
            }
            instance.release(&self.allocator);
        }
        self.unload_if_cold(template_handle, cold);
    }

    /// Raise the budget for a priority band when a template needs more
    /// than what is currently programmed.
    fn ensure_budget(&mut self, core: CoreId, priority: Priority, min_stack: u32) -> Result<()> {
        let current = self.stack_budget(core, priority);
        if min_stack <= current {
            return Ok(());
        }
        if !self.engine.is_core_running(core) {
            return Err(CmError::MpcNotResponding { core });
        }
        let programmed = self.engine.update_stack(core, priority, min_stack)?;
        self.budgets.insert((core, priority), programmed);
        debug!(
            "stack budget raised to {} words (core {}, {:?})",
            programmed, core.0, priority
        );
        Ok(())
    }

    /// Recompute one band's budget as the maximum over the remaining
    /// instances. Never assumes the previous value was still the maximum.
    fn recompute_budget(&mut self, core: CoreId, priority: Priority) {
        let current = self.stack_budget(core, priority);
        let mut needed = DEFAULT_STACK_WORDS;
        for (_, instance) in self.instances.iter() {
            if instance.core != core || instance.priority != priority {
                continue;
            }
            needed = needed.max(template_ref(&self.templates, instance.template).min_stack);
        }
        if needed == current {
            return;
        }
        if !self.engine.is_core_running(core) {
            warn!(
                "core {} not responding, stack budget stays at {} words",
                core.0, current
            );
            return;
        }
        match self.engine.update_stack(core, priority, needed) {
            Ok(programmed) => {
                self.budgets.insert((core, priority), programmed);
                debug!(
                    "stack budget now {} words (core {}, {:?})",
                    programmed, core.0, priority
                );
            }
            Err(e) => warn!("stack budget update failed: {}", e),
        }
    }
}
