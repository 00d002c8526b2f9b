//! In-memory platform backends for hosted testing.
//!
//! [`MockAllocator`] simulates the coprocessor banks with heap buffers and
//! hands out chunks whose DSP addresses come from per-bank address ranges,
//! so tests can predict the exact addresses a loaded image gets.
//! [`MockExecutive`] records every remote call and can be scripted to fail,
//! which is how the unwind paths of the runtime are exercised.
//!
//! Both keep their state behind `RefCell` and take `&self`, matching the
//! real transports.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::{
    checked_align_up, CallMode, ChunkId, CoreId, DomainId, DspAllocator, ExecutiveEngine, MemKind,
    MemoryChunk, PlatformError, Priority, Result, ServiceKind, PRIORITY_COUNT,
};

/// Simulated DSP base address of each bank.
pub fn bank_base(kind: MemKind) -> u32 {
    match kind {
        MemKind::SdramCode => 0x4000_0000,
        MemKind::SdramData => 0x5000_0000,
        MemKind::EsramCode => 0x0010_0000,
        MemKind::EsramData => 0x0020_0000,
    }
}

struct Pool {
    base: u32,
    cursor: u32,
    capacity: u32,
}

struct AllocState {
    pools: BTreeMap<MemKind, Pool>,
    live: BTreeMap<u64, Box<[u8]>>,
    domains: BTreeMap<DomainId, CoreId>,
    next_id: u64,
    allocs: usize,
    frees: usize,
}

/// Bump allocator over simulated banks, with leak accounting.
///
/// Freed ranges are not recycled; the DSP addresses of successive
/// allocations are therefore strictly increasing per bank, which keeps
/// test expectations simple. Memory is always handed out zeroed.
pub struct MockAllocator {
    state: RefCell<AllocState>,
}

impl MockAllocator {
    pub fn new() -> Self {
        let mut pools = BTreeMap::new();
        for kind in [
            MemKind::SdramCode,
            MemKind::SdramData,
            MemKind::EsramCode,
            MemKind::EsramData,
        ] {
            let base = bank_base(kind);
            pools.insert(
                kind,
                Pool {
                    base,
                    cursor: base,
                    capacity: 4 * 1024 * 1024,
                },
            );
        }
        Self {
            state: RefCell::new(AllocState {
                pools,
                live: BTreeMap::new(),
                domains: BTreeMap::new(),
                next_id: 1,
                allocs: 0,
                frees: 0,
            }),
        }
    }

    /// Shrink one bank, to provoke allocation failures.
    pub fn with_capacity(self, kind: MemKind, bytes: u32) -> Self {
        {
            let mut state = self.state.borrow_mut();
            if let Some(pool) = state.pools.get_mut(&kind) {
                pool.capacity = bytes;
            }
        }
        self
    }

    /// Place a domain on a core (default placement is core 0).
    pub fn with_domain(self, domain: DomainId, core: CoreId) -> Self {
        self.state.borrow_mut().domains.insert(domain, core);
        self
    }

    /// Chunks currently allocated and not yet freed.
    pub fn live_chunks(&self) -> usize {
        self.state.borrow().live.len()
    }

    pub fn alloc_count(&self) -> usize {
        self.state.borrow().allocs
    }

    pub fn free_count(&self) -> usize {
        self.state.borrow().frees
    }
}

impl Default for MockAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DspAllocator for MockAllocator {
    fn alloc(
        &self,
        _domain: DomainId,
        kind: MemKind,
        size: usize,
        align: u32,
        _zero: bool,
    ) -> Result<MemoryChunk> {
        debug_assert!(align.is_power_of_two());
        let mut state = self.state.borrow_mut();
        let id = state.next_id;

        let pool = match state.pools.get_mut(&kind) {
            Some(pool) => pool,
            None => return Err(PlatformError::OutOfMemory { requested: size }),
        };
        let dsp = match checked_align_up(pool.cursor, align) {
            Some(dsp) => dsp,
            None => return Err(PlatformError::OutOfMemory { requested: size }),
        };
        let end = dsp as u64 + size as u64;
        if end > pool.base as u64 + pool.capacity as u64 {
            return Err(PlatformError::OutOfMemory { requested: size });
        }
        pool.cursor = end as u32;

        let mut backing = vec![0u8; size.max(1)].into_boxed_slice();
        let host = backing.as_mut_ptr();
        state.live.insert(id, backing);
        state.next_id += 1;
        state.allocs += 1;

        // Backing boxes never move their heap buffer while stored in the map
        Ok(unsafe { MemoryChunk::from_raw(ChunkId(id), host, dsp, size, kind) })
    }

    fn free(&self, chunk: MemoryChunk) {
        let mut state = self.state.borrow_mut();
        let removed = state.live.remove(&chunk.id().0);
        debug_assert!(removed.is_some(), "free of unknown chunk {:?}", chunk.id());
        if removed.is_some() {
            state.frees += 1;
        }
    }

    fn domain_core(&self, domain: DomainId) -> CoreId {
        self.state
            .borrow()
            .domains
            .get(&domain)
            .copied()
            .unwrap_or(CoreId(0))
    }
}

/// One recorded lifecycle dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceCall {
    pub core: CoreId,
    pub kind: ServiceKind,
    pub mode: CallMode,
    pub this: u32,
    pub entry: u32,
}

struct CoreState {
    running: bool,
    service_priority: Priority,
    stacks: [u32; PRIORITY_COUNT],
    irqs: BTreeMap<u32, u32>,
    hw_active: bool,
}

impl CoreState {
    fn new() -> Self {
        Self {
            running: true,
            service_priority: Priority::Normal,
            stacks: [0; PRIORITY_COUNT],
            irqs: BTreeMap::new(),
            hw_active: false,
        }
    }
}

struct ExecState {
    cores: BTreeMap<u8, CoreState>,
    calls: Vec<ServiceCall>,
    stack_updates: Vec<(CoreId, Priority, u32)>,
    fail_next: Option<(ServiceKind, i32)>,
    hw_enables: usize,
    hw_disables: usize,
}

/// Scriptable executive that records everything it is asked to do.
pub struct MockExecutive {
    state: RefCell<ExecState>,
}

impl MockExecutive {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(ExecState {
                cores: BTreeMap::new(),
                calls: Vec::new(),
                stack_updates: Vec::new(),
                fail_next: None,
                hw_enables: 0,
                hw_disables: 0,
            }),
        }
    }

    fn with_core<R>(&self, core: CoreId, f: impl FnOnce(&mut CoreState) -> R) -> R {
        let mut state = self.state.borrow_mut();
        f(state.cores.entry(core.0).or_insert_with(CoreState::new))
    }

    pub fn set_core_running(&self, core: CoreId, running: bool) {
        self.with_core(core, |c| c.running = running);
    }

    pub fn set_service_priority(&self, core: CoreId, priority: Priority) {
        self.with_core(core, |c| c.service_priority = priority);
    }

    /// Make the next service call of `kind` fail with `code`. One-shot.
    pub fn fail_next_service(&self, kind: ServiceKind, code: i32) {
        self.state.borrow_mut().fail_next = Some((kind, code));
    }

    /// Every dispatched lifecycle call, in order, including failed ones.
    pub fn calls(&self) -> Vec<ServiceCall> {
        self.state.borrow().calls.clone()
    }

    pub fn call_count(&self, kind: ServiceKind) -> usize {
        self.state
            .borrow()
            .calls
            .iter()
            .filter(|c| c.kind == kind)
            .count()
    }

    /// The stack budget last programmed for a band, 0 if never set.
    pub fn stack_for(&self, core: CoreId, priority: Priority) -> u32 {
        self.with_core(core, |c| c.stacks[priority.index()])
    }

    pub fn stack_updates(&self) -> Vec<(CoreId, Priority, u32)> {
        self.state.borrow().stack_updates.clone()
    }

    pub fn bound_irqs(&self, core: CoreId) -> Vec<u32> {
        self.with_core(core, |c| c.irqs.keys().copied().collect())
    }

    pub fn hardware_active(&self, core: CoreId) -> bool {
        self.with_core(core, |c| c.hw_active)
    }

    /// (enable, disable) call totals across all cores.
    pub fn hardware_toggles(&self) -> (usize, usize) {
        let state = self.state.borrow();
        (state.hw_enables, state.hw_disables)
    }
}

impl Default for MockExecutive {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutiveEngine for MockExecutive {
    fn is_core_running(&self, core: CoreId) -> bool {
        self.with_core(core, |c| c.running)
    }

    fn service_priority(&self, core: CoreId) -> Priority {
        self.with_core(core, |c| c.service_priority)
    }

    fn call_service(
        &self,
        core: CoreId,
        kind: ServiceKind,
        mode: CallMode,
        this: u32,
        entry: u32,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if !state
            .cores
            .entry(core.0)
            .or_insert_with(CoreState::new)
            .running
        {
            return Err(PlatformError::NotResponding { core });
        }
        state.calls.push(ServiceCall {
            core,
            kind,
            mode,
            this,
            entry,
        });
        if let Some((fail_kind, code)) = state.fail_next {
            if fail_kind == kind {
                state.fail_next = None;
                log::debug!("mock executive: scripted failure of {kind:?} (code {code})");
                return Err(PlatformError::ServiceFailed { code });
            }
        }
        Ok(())
    }

    fn update_stack(&self, core: CoreId, priority: Priority, words: u32) -> Result<u32> {
        let mut state = self.state.borrow_mut();
        let core_state = state.cores.entry(core.0).or_insert_with(CoreState::new);
        if !core_state.running {
            return Err(PlatformError::NotResponding { core });
        }
        core_state.stacks[priority.index()] = words;
        state.stack_updates.push((core, priority, words));
        Ok(words)
    }

    fn bind_interrupt(&self, core: CoreId, line: u32, entry: u32) -> Result<()> {
        self.with_core(core, |c| {
            if !c.running {
                return Err(PlatformError::NotResponding { core });
            }
            if c.irqs.contains_key(&line) {
                return Err(PlatformError::IrqAlreadyBound { line });
            }
            c.irqs.insert(line, entry);
            Ok(())
        })
    }

    fn unbind_interrupt(&self, core: CoreId, line: u32) {
        self.with_core(core, |c| {
            c.irqs.remove(&line);
        });
    }

    fn hardware_enable(&self, core: CoreId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.hw_enables += 1;
        state
            .cores
            .entry(core.0)
            .or_insert_with(CoreState::new)
            .hw_active = true;
        Ok(())
    }

    fn hardware_disable(&self, core: CoreId) {
        let mut state = self.state.borrow_mut();
        state.hw_disables += 1;
        state
            .cores
            .entry(core.0)
            .or_insert_with(CoreState::new)
            .hw_active = false;
    }
}
