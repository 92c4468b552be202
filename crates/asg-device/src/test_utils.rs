//! In-memory collaborators for exercising ASG contexts without a VM.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Write};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use asg_mem::HostRegion;
use asg_snapshot::{ReadBeExt, SnapshotError, WriteBeExt};

use crate::config::AsgConfig;
use crate::consumer::{ConsumerCallbacks, ConsumerHandle, ConsumerInterface, UnavailableRead};
use crate::context::{AsgCreateInfo, VirtioGpuCreateInfo, VirtioGpuInfo};
use crate::globals::{AsgGlobals, ExternalMemory};
use crate::ops::{AddressSpaceControlOps, AddressSpaceHwFuncs, RegionError};
use crate::ring::RingContext;

/// Install a `tracing` subscriber that writes through the test harness. `RUST_LOG` filters it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A configuration small enough that tests can fill blocks quickly.
///
/// 256 KiB blocks hold 32 ring storages or 4 buffers.
pub fn small_config() -> AsgConfig {
    AsgConfig {
        block_size: 256 * 1024,
        page_size: 4096,
        per_context_buffer_size: 64 * 1024,
        flush_interval: 4096,
        host_version: 1,
    }
}

/// Shared physical window made of `slot_size` slots.
#[derive(Debug)]
pub struct FakeAddressSpace {
    base: u64,
    slot_size: u64,
    slot_count: u64,
    allocated: Mutex<BTreeSet<u64>>,
}

impl FakeAddressSpace {
    pub fn new(base: u64, slot_size: u64, slot_count: u64) -> Self {
        Self {
            base,
            slot_size,
            slot_count,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn allocated_offsets(&self) -> Vec<u64> {
        self.allocated.lock().unwrap().iter().copied().collect()
    }
}

impl AddressSpaceHwFuncs for FakeAddressSpace {
    fn alloc_shared_host_region(&self, size: u64) -> Result<u64, RegionError> {
        assert!(size <= self.slot_size, "fake window only hands out single slots");
        let mut allocated = self.allocated.lock().unwrap();
        let offset = (0..self.slot_count)
            .map(|slot| slot * self.slot_size)
            .find(|offset| !allocated.contains(offset))
            .ok_or(RegionError::Exhausted { size })?;
        allocated.insert(offset);
        Ok(offset)
    }

    fn alloc_shared_host_region_fixed(&self, _size: u64, offset: u64) -> Result<(), RegionError> {
        if self.allocated.lock().unwrap().insert(offset) {
            Ok(())
        } else {
            Err(RegionError::Occupied { offset })
        }
    }

    fn free_shared_host_region(&self, offset: u64) -> Result<(), RegionError> {
        if self.allocated.lock().unwrap().remove(&offset) {
            Ok(())
        } else {
            Err(RegionError::NotAllocated { offset })
        }
    }

    fn phys_addr_start(&self) -> u64 {
        self.base
    }
}

/// Records guest mappings and hostmem unregistrations.
#[derive(Debug, Default)]
pub struct FakeControlOps {
    mappings: Mutex<BTreeMap<u64, Arc<HostRegion>>>,
    unregistered: Mutex<Vec<u64>>,
    reject_mappings: AtomicBool,
}

impl FakeControlOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `add_memory_mapping` calls fail.
    pub fn set_reject_mappings(&self, reject: bool) {
        self.reject_mappings.store(reject, Ordering::SeqCst);
    }

    pub fn mapped_gpas(&self) -> Vec<u64> {
        self.mappings.lock().unwrap().keys().copied().collect()
    }

    pub fn mapping(&self, gpa: u64) -> Option<Arc<HostRegion>> {
        self.mappings.lock().unwrap().get(&gpa).cloned()
    }

    /// Drop a mapping behind the device's back.
    pub fn forget_mapping(&self, gpa: u64) {
        self.mappings.lock().unwrap().remove(&gpa);
    }

    pub fn unregistered_hostmem_ids(&self) -> Vec<u64> {
        self.unregistered.lock().unwrap().clone()
    }

    /// Read guest memory through the recorded mappings.
    pub fn read_guest(&self, gpa: u64, dst: &mut [u8]) -> bool {
        let mappings = self.mappings.lock().unwrap();
        let Some((base, region)) = mappings.range(..=gpa).next_back() else {
            return false;
        };
        region.read(gpa - base, dst).is_ok()
    }
}

impl AddressSpaceControlOps for FakeControlOps {
    fn add_memory_mapping(&self, gpa: u64, region: Arc<HostRegion>) -> bool {
        if self.reject_mappings.load(Ordering::SeqCst) {
            return false;
        }
        let mut mappings = self.mappings.lock().unwrap();
        if mappings.contains_key(&gpa) {
            return false;
        }
        mappings.insert(gpa, region);
        true
    }

    fn remove_memory_mapping(&self, gpa: u64, size: u64) -> bool {
        let mut mappings = self.mappings.lock().unwrap();
        match mappings.get(&gpa) {
            Some(region) if region.len() == size => {
                mappings.remove(&gpa);
                true
            }
            _ => false,
        }
    }

    fn hostmem_unregister(&self, hostmem_id: u64) {
        self.unregistered.lock().unwrap().push(hostmem_id);
    }

    fn host_ptr(&self, gpa: u64) -> Option<NonNull<u8>> {
        let mappings = self.mappings.lock().unwrap();
        let (base, region) = mappings.range(..=gpa).next_back()?;
        let offset = gpa - base;
        if offset >= region.len() {
            return None;
        }
        NonNull::new(region.as_ptr().wrapping_add(offset as usize))
    }
}

/// Marker written by [`RecordingConsumer`] into a snapshot.
pub const CONSUMER_STATE_MAGIC: u32 = 0x4153_4743;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Create {
        handle: u64,
        context_id: u32,
        capset_id: u32,
        name: Option<String>,
        /// Handle the restored state was saved from.
        restored_from: Option<u64>,
    },
    Destroy(u64),
    PreSave(u64),
    Save(u64),
    PostSave(u64),
    PostLoad(u64),
    GlobalPreSave,
    GlobalPostSave,
    GlobalPreLoad,
}

/// Consumer that records every lifecycle call. In threaded mode each consumer runs a loop that
/// reports an empty ring until told to exit, like a real render thread with no work.
#[derive(Debug, Default)]
pub struct RecordingConsumer {
    threaded: bool,
    next_handle: AtomicU64,
    events: Mutex<Vec<ConsumerEvent>>,
    rings: Mutex<HashMap<u64, RingContext>>,
    callbacks: Mutex<HashMap<u64, ConsumerCallbacks>>,
    threads: Mutex<HashMap<u64, JoinHandle<Vec<UnavailableRead>>>>,
    outcomes: Mutex<HashMap<u64, Vec<UnavailableRead>>>,
}

impl RecordingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threaded() -> Self {
        Self {
            threaded: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<ConsumerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn created_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, ConsumerEvent::Create { .. }))
            .count()
    }

    pub fn ring(&self, handle: ConsumerHandle) -> Option<RingContext> {
        self.rings.lock().unwrap().get(&handle.0).cloned()
    }

    pub fn callbacks(&self, handle: ConsumerHandle) -> Option<ConsumerCallbacks> {
        self.callbacks.lock().unwrap().get(&handle.0).cloned()
    }

    /// Non-polling outcomes seen by a threaded consumer, available after it was destroyed.
    pub fn outcomes(&self, handle: ConsumerHandle) -> Option<Vec<UnavailableRead>> {
        self.outcomes.lock().unwrap().get(&handle.0).cloned()
    }

    fn record(&self, event: ConsumerEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl ConsumerInterface for RecordingConsumer {
    fn create(
        &self,
        ring: RingContext,
        load: Option<&mut dyn Read>,
        callbacks: ConsumerCallbacks,
        context_id: u32,
        capset_id: u32,
        name: Option<String>,
    ) -> asg_snapshot::Result<ConsumerHandle> {
        let restored_from = match load {
            Some(r) => {
                if r.read_be32()? != CONSUMER_STATE_MAGIC {
                    return Err(SnapshotError::Corrupt("bad consumer state marker"));
                }
                Some(r.read_be64()?)
            }
            None => None,
        };

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(ConsumerEvent::Create {
            handle,
            context_id,
            capset_id,
            name,
            restored_from,
        });
        self.rings.lock().unwrap().insert(handle, ring);
        self.callbacks
            .lock()
            .unwrap()
            .insert(handle, callbacks.clone());

        if self.threaded {
            let on_unavailable_read = Arc::clone(&callbacks.on_unavailable_read);
            let thread = thread::spawn(move || {
                let mut outcomes = Vec::new();
                loop {
                    let outcome = on_unavailable_read();
                    if outcome != UnavailableRead::KeepPolling {
                        outcomes.push(outcome);
                    }
                    if outcome == UnavailableRead::Exit {
                        return outcomes;
                    }
                }
            });
            self.threads.lock().unwrap().insert(handle, thread);
        }
        Ok(ConsumerHandle(handle))
    }

    fn destroy(&self, handle: ConsumerHandle) {
        self.record(ConsumerEvent::Destroy(handle.0));
        self.callbacks.lock().unwrap().remove(&handle.0);
        let thread = self.threads.lock().unwrap().remove(&handle.0);
        if let Some(thread) = thread {
            let outcomes = thread.join().expect("consumer thread panicked");
            self.outcomes.lock().unwrap().insert(handle.0, outcomes);
        }
    }

    fn pre_save(&self, handle: ConsumerHandle) {
        self.record(ConsumerEvent::PreSave(handle.0));
    }

    fn save(&self, handle: ConsumerHandle, w: &mut dyn Write) -> asg_snapshot::Result<()> {
        w.write_be32(CONSUMER_STATE_MAGIC)?;
        w.write_be64(handle.0)?;
        self.record(ConsumerEvent::Save(handle.0));
        Ok(())
    }

    fn post_save(&self, handle: ConsumerHandle) {
        self.record(ConsumerEvent::PostSave(handle.0));
    }

    fn post_load(&self, handle: ConsumerHandle) {
        self.record(ConsumerEvent::PostLoad(handle.0));
    }

    fn global_pre_save(&self) {
        self.record(ConsumerEvent::GlobalPreSave);
    }

    fn global_post_save(&self) {
        self.record(ConsumerEvent::GlobalPostSave);
    }

    fn global_pre_load(&self) {
        self.record(ConsumerEvent::GlobalPreLoad);
    }
}

/// Globals wired to fake collaborators.
pub struct TestHarness {
    pub globals: Arc<AsgGlobals>,
    pub hw: Arc<FakeAddressSpace>,
    pub ops: Arc<FakeControlOps>,
    pub consumer: Arc<RecordingConsumer>,
}

impl TestHarness {
    pub const WINDOW_BASE: u64 = 0x1_0000_0000;
    pub const WINDOW_SLOTS: u64 = 64;

    pub fn new() -> Self {
        Self::with(small_config(), RecordingConsumer::new())
    }

    pub fn threaded() -> Self {
        Self::with(small_config(), RecordingConsumer::threaded())
    }

    pub fn with(config: AsgConfig, consumer: RecordingConsumer) -> Self {
        init_tracing();
        let hw = Arc::new(FakeAddressSpace::new(
            Self::WINDOW_BASE,
            config.block_size,
            Self::WINDOW_SLOTS,
        ));
        let ops = Arc::new(FakeControlOps::new());
        let consumer = Arc::new(consumer);
        let globals = Arc::new(AsgGlobals::new(config, hw.clone()).expect("valid test config"));
        globals.initialize(ops.clone());
        globals.set_consumer(consumer.clone());
        Self {
            globals,
            hw,
            ops,
            consumer,
        }
    }

    /// Collaborator-owned memory big enough for one virtio-gpu context.
    pub fn external_memory(&self) -> ExternalMemory {
        self.external_memory_of(self.globals.config().combined_size())
    }

    pub fn external_memory_of(&self, size: u64) -> ExternalMemory {
        let region = HostRegion::allocate(size, self.globals.config().page_size)
            .expect("allocate external memory");
        ExternalMemory::new(Arc::new(region))
    }

    pub fn virtio_create_info(
        &self,
        handle: u32,
        external_memory: Option<ExternalMemory>,
    ) -> AsgCreateInfo {
        AsgCreateInfo {
            virtio_gpu: Some(VirtioGpuCreateInfo {
                info: VirtioGpuInfo {
                    context_id: handle + 100,
                    capset_id: 3,
                    name: Some(format!("ctx-{handle}")),
                },
                handle,
                hostmem_id: 0x1000 + u64::from(handle),
                external_memory,
            }),
            create_render_thread: false,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
