//! Process-wide block pools shared by all ASG contexts of a device.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use asg_mem::{align_up, HostRegion, SubAllocator};
use asg_snapshot::{ReadBeExt, SnapshotError, WriteBeExt};
use tracing::{debug, info, warn};

use crate::block::{Allocation, AllocationCreateInfo, Block, BlockInfo, BlockMemory, BlockPool};
use crate::config::AsgConfig;
use crate::consumer::ConsumerInterface;
use crate::error::{fatal, AbortReason, Result};
use crate::ops::{AddressSpaceControlOps, AddressSpaceHwFuncs};
use crate::ring::ASG_RING_STORAGE_SIZE_BYTES;

/// Upper bound on blocks per pool accepted from a snapshot.
const MAX_BLOCKS_PER_POOL: u64 = 4096;

/// Chunk size used when streaming block contents.
const COPY_CHUNK: usize = 64 * 1024;

/// Collaborator-owned memory backing a virtio-gpu context.
#[derive(Debug, Clone)]
pub struct ExternalMemory {
    region: Arc<HostRegion>,
}

impl ExternalMemory {
    pub fn new(region: Arc<HostRegion>) -> Self {
        Self { region }
    }

    /// # Safety
    ///
    /// See [`HostRegion::from_external`].
    pub unsafe fn from_raw(ptr: NonNull<u8>, size: usize) -> Self {
        Self::new(Arc::new(HostRegion::from_external(ptr, size)))
    }

    pub fn region(&self) -> &Arc<HostRegion> {
        &self.region
    }

    pub fn size(&self) -> u64 {
        self.region.len()
    }
}

/// Memory the embedder supplies when restoring virtio-gpu backed blocks, keyed by the
/// dedicated context handle the block was saved with.
#[derive(Debug, Clone, Default)]
pub struct LoadResources {
    pub context_external_memory: HashMap<u32, ExternalMemory>,
}

#[derive(Default)]
struct Pools {
    ring: Vec<Block>,
    buffer: Vec<Block>,
    combined: Vec<Block>,
}

impl Pools {
    fn get(&self, pool: BlockPool) -> &Vec<Block> {
        match pool {
            BlockPool::Ring => &self.ring,
            BlockPool::Buffer => &self.buffer,
            BlockPool::Combined => &self.combined,
        }
    }

    fn get_mut(&mut self, pool: BlockPool) -> &mut Vec<Block> {
        match pool {
            BlockPool::Ring => &mut self.ring,
            BlockPool::Buffer => &mut self.buffer,
            BlockPool::Combined => &mut self.combined,
        }
    }
}

/// Block pools plus the collaborators needed to map them into the guest.
///
/// All pool mutation happens under one lock; allocation calls may arrive from any device
/// thread.
pub struct AsgGlobals {
    config: AsgConfig,
    hw: Arc<dyn AddressSpaceHwFuncs>,
    control_ops: OnceLock<Arc<dyn AddressSpaceControlOps>>,
    consumer: OnceLock<Arc<dyn ConsumerInterface>>,
    pools: Mutex<Pools>,
}

impl fmt::Debug for AsgGlobals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pools = self.lock_pools();
        f.debug_struct("AsgGlobals")
            .field("config", &self.config)
            .field("initialized", &self.control_ops.get().is_some())
            .field("has_consumer", &self.consumer.get().is_some())
            .field("ring_blocks", &pools.ring.len())
            .field("buffer_blocks", &pools.buffer.len())
            .field("combined_blocks", &pools.combined.len())
            .finish()
    }
}

impl AsgGlobals {
    pub fn new(config: AsgConfig, hw: Arc<dyn AddressSpaceHwFuncs>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            hw,
            control_ops: OnceLock::new(),
            consumer: OnceLock::new(),
            pools: Mutex::new(Pools::default()),
        })
    }

    pub fn config(&self) -> &AsgConfig {
        &self.config
    }

    pub fn per_context_buffer_size(&self) -> u64 {
        self.config.per_context_buffer_size
    }

    /// Install the VM control ops. Only the first call has an effect.
    pub fn initialize(&self, ops: Arc<dyn AddressSpaceControlOps>) -> bool {
        if self.control_ops.set(ops).is_err() {
            debug!("ASG globals already initialized");
            return false;
        }
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.control_ops.get().is_some()
    }

    /// Install the consumer interface. A second call is ignored.
    pub fn set_consumer(&self, iface: Arc<dyn ConsumerInterface>) -> bool {
        if self.consumer.set(iface).is_err() {
            warn!("ASG consumer interface already set; ignoring replacement");
            return false;
        }
        true
    }

    pub fn consumer_interface(&self) -> Result<Arc<dyn ConsumerInterface>> {
        self.consumer.get().cloned().ok_or_else(|| {
            fatal(
                AbortReason::ProtocolMisuse,
                "ASG consumer interface has not been set",
            )
        })
    }

    fn control_ops(&self) -> Result<&Arc<dyn AddressSpaceControlOps>> {
        self.control_ops.get().ok_or_else(|| {
            fatal(
                AbortReason::ProtocolMisuse,
                "ASG globals used before control ops were initialized",
            )
        })
    }

    pub(crate) fn host_ptr(&self, gpa: u64) -> Option<NonNull<u8>> {
        self.control_ops.get()?.host_ptr(gpa)
    }

    fn lock_pools(&self) -> MutexGuard<'_, Pools> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn block_count(&self, pool: BlockPool) -> usize {
        self.lock_pools().get(pool).len()
    }

    pub fn live_block_count(&self, pool: BlockPool) -> usize {
        self.lock_pools()
            .get(pool)
            .iter()
            .filter(|block| !block.is_empty())
            .count()
    }

    pub fn block_info(&self, pool: BlockPool, index: usize) -> Option<BlockInfo> {
        self.lock_pools().get(pool).get(index).map(Block::info)
    }

    pub fn alloc_ring_storage(&self) -> Result<Allocation> {
        let create = AllocationCreateInfo {
            size: ASG_RING_STORAGE_SIZE_BYTES,
            ..Default::default()
        };
        self.new_allocation(&create, BlockPool::Ring)
    }

    pub fn free_ring_storage(&self, alloc: &Allocation) -> Result<()> {
        if alloc.is_view {
            return Ok(());
        }
        self.delete_allocation(alloc, BlockPool::Ring)
    }

    pub fn alloc_buffer(&self) -> Result<Allocation> {
        let create = AllocationCreateInfo {
            size: self.config.per_context_buffer_size,
            ..Default::default()
        };
        self.new_allocation(&create, BlockPool::Buffer)
    }

    pub fn free_buffer(&self, alloc: &Allocation) -> Result<()> {
        if alloc.is_view {
            return Ok(());
        }
        self.delete_allocation(alloc, BlockPool::Buffer)
    }

    /// Allocate a combined ring+buffer in a block dedicated to context `handle`, backed by
    /// `external` memory. The allocation covers the whole external region.
    pub fn alloc_ring_and_buffer_storage_dedicated(
        &self,
        handle: u32,
        hostmem_id: u64,
        external: Option<&ExternalMemory>,
    ) -> Result<Allocation> {
        if handle == 0 {
            return Err(fatal(
                AbortReason::ProtocolMisuse,
                "dedicated ASG allocation requested without a dedicated handle",
            ));
        }
        let mut create = AllocationCreateInfo {
            size: self.config.combined_size(),
            dedicated_context_handle: Some(handle),
            virtio_gpu: true,
            hostmem_id,
            ..Default::default()
        };
        if let Some(external) = external {
            if external.size() < create.size {
                return Err(fatal(
                    AbortReason::ProtocolMisuse,
                    format!(
                        "external memory of {:#x} bytes is too small for ring and buffer ({:#x})",
                        external.size(),
                        create.size
                    ),
                ));
            }
            create.size = external.size();
            create.external = Some(Arc::clone(external.region()));
        }
        self.new_allocation(&create, BlockPool::Combined)
    }

    pub fn free_ring_and_buffer(&self, alloc: &Allocation) -> Result<()> {
        self.delete_allocation(alloc, BlockPool::Combined)
    }

    /// The ring storage at the start of a combined allocation.
    pub fn alloc_ring_view_into_combined(&self, combined: &Allocation) -> Result<Allocation> {
        self.view_into_combined(combined, 0, ASG_RING_STORAGE_SIZE_BYTES)
    }

    /// The buffer that follows the ring storage in a combined allocation.
    pub fn alloc_buffer_view_into_combined(&self, combined: &Allocation) -> Result<Allocation> {
        self.view_into_combined(
            combined,
            ASG_RING_STORAGE_SIZE_BYTES,
            self.config.per_context_buffer_size,
        )
    }

    fn view_into_combined(&self, combined: &Allocation, offset: u64, size: u64) -> Result<Allocation> {
        let host = match combined.host() {
            Some(host) => Some(host.subslice(offset, size).map_err(|err| {
                fatal(
                    AbortReason::InternalConsistency,
                    format!("combined allocation cannot hold view at {offset:#x}: {err}"),
                )
            })?),
            None => None,
        };
        Ok(Allocation {
            host,
            offset_into_phys: combined.offset_into_phys + offset,
            size,
            is_view: true,
            ..combined.clone()
        })
    }

    pub(crate) fn new_allocation(
        &self,
        create: &AllocationCreateInfo,
        pool: BlockPool,
    ) -> Result<Allocation> {
        let block_size = self.config.block_size;
        if create.size > block_size {
            return Err(fatal(
                AbortReason::ProtocolMisuse,
                format!(
                    "wanted size {:#x} which is greater than block size {block_size:#x}",
                    create.size
                ),
            ));
        }

        let mut pools = self.lock_pools();
        let blocks = pools.get_mut(pool);

        for (index, block) in blocks.iter_mut().enumerate() {
            if block.is_empty() {
                self.fill_block_locked(block, create)?;
            }
            if block.dedicated_context_handle != create.dedicated_context_handle {
                continue;
            }
            let Some(memory) = block.memory.as_mut() else {
                continue;
            };
            if let Some(offset) = memory.sub_alloc.alloc(create.size) {
                return allocation_in_block(block, index, offset, create);
            }
        }

        let mut block = Block::default();
        self.fill_block_locked(&mut block, create)?;
        let offset = block
            .memory
            .as_mut()
            .and_then(|memory| memory.sub_alloc.alloc(create.size))
            .ok_or_else(|| {
                fatal(
                    AbortReason::ResourceExhausted,
                    format!(
                        "failed to allocate {:#x} bytes in a fresh {pool} block",
                        create.size
                    ),
                )
            })?;
        let index = blocks.len();
        let alloc = allocation_in_block(&block, index, offset, create)?;
        blocks.push(block);
        debug!(pool = %pool, index, "added ASG block");
        Ok(alloc)
    }

    pub(crate) fn delete_allocation(&self, alloc: &Allocation, pool: BlockPool) -> Result<()> {
        let Some(host) = alloc.host() else {
            return Ok(());
        };

        let mut pools = self.lock_pools();
        let index = alloc.block_index;
        let Some(block) = usize::try_from(index)
            .ok()
            .and_then(|index| pools.get_mut(pool).get_mut(index))
        else {
            return Err(fatal(
                AbortReason::InternalConsistency,
                format!("should be a {pool} block at index {index} but it is not found"),
            ));
        };

        if block.external {
            return self.destroy_block_locked(block);
        }

        let Some(memory) = block.memory.as_mut() else {
            return Err(fatal(
                AbortReason::InternalConsistency,
                format!("{pool} block {index} was already destroyed"),
            ));
        };
        if !Arc::ptr_eq(&memory.region, host.region()) {
            return Err(fatal(
                AbortReason::InternalConsistency,
                format!("allocation does not belong to {pool} block {index}"),
            ));
        }
        if !memory.sub_alloc.free(host.offset()) {
            return Err(fatal(
                AbortReason::InternalConsistency,
                format!(
                    "failed to free offset {:#x} in {pool} block {index} (phys {:#x})",
                    host.offset(),
                    block.offset_into_phys
                ),
            ));
        }
        if memory.sub_alloc.is_empty() {
            self.destroy_block_locked(block)?;
        }
        Ok(())
    }

    fn fill_block_locked(&self, block: &mut Block, create: &AllocationCreateInfo) -> Result<()> {
        let page_size = self.config.page_size;

        if let Some(handle) = create.dedicated_context_handle {
            if !create.virtio_gpu {
                return Err(fatal(
                    AbortReason::ProtocolMisuse,
                    "cannot use a dedicated allocation without virtio-gpu hostmem",
                ));
            }
            let Some(external) = &create.external else {
                return Err(fatal(
                    AbortReason::ProtocolMisuse,
                    "virtio-gpu dedicated allocation requires external memory",
                ));
            };
            if external.len() < create.size {
                return Err(fatal(
                    AbortReason::ProtocolMisuse,
                    format!(
                        "external memory of {:#x} bytes cannot back a {:#x} byte block",
                        external.len(),
                        create.size
                    ),
                ));
            }
            // The block holds a single allocation at offset 0, so a trailing partial page of
            // external memory still counts as a page.
            let block_size = external.len();
            *block = Block {
                memory: Some(BlockMemory {
                    region: Arc::clone(external),
                    sub_alloc: SubAllocator::new(align_up(block_size, page_size), page_size),
                }),
                buffer_size: block_size,
                offset_into_phys: 0,
                dedicated_context_handle: Some(handle),
                uses_virtio_gpu_hostmem: true,
                hostmem_id: create.hostmem_id,
                external: true,
            };
            debug!(handle, size = create.size, "filled dedicated ASG block");
            return Ok(());
        }

        if create.virtio_gpu {
            return Err(fatal(
                AbortReason::ProtocolMisuse,
                "only dedicated allocations are allowed on the virtio-gpu hostmem path",
            ));
        }

        let ops = Arc::clone(self.control_ops()?);
        let block_size = self.config.block_size;

        let offset_into_phys = if create.from_load {
            let offset = block.offset_into_phys;
            if let Err(err) = self.hw.alloc_shared_host_region_fixed(block_size, offset) {
                // The region usually survives in the address-space device's own state.
                warn!(offset, error = %err, "could not reserve fixed ASG region on load");
            }
            offset
        } else {
            self.hw
                .alloc_shared_host_region(block_size)
                .map_err(|err| {
                    fatal(
                        AbortReason::ResourceExhausted,
                        format!("failed to allocate physical window for ASG block: {err}"),
                    )
                })?
        };

        let region = HostRegion::allocate(block_size, page_size).map_err(|err| {
            fatal(
                AbortReason::ResourceExhausted,
                format!("failed to allocate ASG block backing memory: {err}"),
            )
        })?;
        let region = Arc::new(region);

        let gpa = self.hw.phys_addr_start() + offset_into_phys;
        if !ops.add_memory_mapping(gpa, Arc::clone(&region)) {
            warn!(gpa, "failed to map ASG block into guest memory");
        }

        *block = Block {
            memory: Some(BlockMemory {
                region,
                sub_alloc: SubAllocator::new(block_size, page_size),
            }),
            buffer_size: block_size,
            offset_into_phys,
            dedicated_context_handle: None,
            uses_virtio_gpu_hostmem: false,
            hostmem_id: create.hostmem_id,
            external: false,
        };
        debug!(offset_into_phys, block_size, "filled ASG block");
        Ok(())
    }

    fn destroy_block_locked(&self, block: &mut Block) -> Result<()> {
        if block.uses_virtio_gpu_hostmem {
            self.control_ops()?.hostmem_unregister(block.hostmem_id);
        } else if !block.external {
            let ops = self.control_ops()?;
            let gpa = self.hw.phys_addr_start() + block.offset_into_phys;
            if !ops.remove_memory_mapping(gpa, block.buffer_size) {
                warn!(gpa, "ASG block was not mapped into guest memory");
            }
            if let Err(err) = self.hw.free_shared_host_region(block.offset_into_phys) {
                warn!(offset = block.offset_into_phys, error = %err, "failed to release ASG physical region");
            }
        }
        debug!(
            offset_into_phys = block.offset_into_phys,
            external = block.external,
            "destroyed ASG block"
        );
        *block = Block::default();
        Ok(())
    }

    /// Destroy every block in every pool.
    pub fn clear(&self) -> Result<()> {
        let mut pools = self.lock_pools();
        self.clear_locked(&mut pools)
    }

    fn clear_locked(&self, pools: &mut Pools) -> Result<()> {
        for pool in BlockPool::ALL {
            let blocks = pools.get_mut(pool);
            for block in blocks.iter_mut().filter(|block| !block.is_empty()) {
                self.destroy_block_locked(block)?;
            }
            blocks.clear();
        }
        Ok(())
    }

    pub fn pre_save(&self) {
        if let Some(consumer) = self.consumer.get() {
            consumer.global_pre_save();
        }
    }

    pub fn save<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        let pools = self.lock_pools();
        for pool in BlockPool::ALL {
            w.write_be64(pools.get(pool).len() as u64)?;
        }
        for pool in BlockPool::ALL {
            for block in pools.get(pool) {
                save_block(w, block)?;
            }
        }
        info!(
            ring_blocks = pools.ring.len(),
            buffer_blocks = pools.buffer.len(),
            combined_blocks = pools.combined.len(),
            "saved ASG block pools"
        );
        Ok(())
    }

    pub fn post_save(&self) {
        if let Some(consumer) = self.consumer.get() {
            consumer.global_post_save();
        }
    }

    /// Replace all pools with the state written by [`AsgGlobals::save`].
    ///
    /// Internal blocks are re-mapped at their saved physical offsets. Virtio-gpu blocks are
    /// rebuilt on the external memory found in `resources` for their dedicated handle.
    pub fn load<R: Read + ?Sized>(
        &self,
        r: &mut R,
        resources: Option<&LoadResources>,
    ) -> Result<()> {
        self.clear()?;
        // The consumer may call back into the globals, so the pools stay unlocked here.
        self.consumer_interface()?.global_pre_load();

        let mut pools = self.lock_pools();
        self.clear_locked(&mut pools)?;

        let mut counts = [0u64; 3];
        for count in &mut counts {
            *count = r.read_be64()?;
            if *count > MAX_BLOCKS_PER_POOL {
                return Err(SnapshotError::Corrupt("too many ASG blocks").into());
            }
        }

        for (pool, count) in BlockPool::ALL.into_iter().zip(counts) {
            let blocks = pools.get_mut(pool);
            blocks.resize_with(count as usize, Block::default);
            for block in blocks.iter_mut() {
                self.load_block_locked(r, resources, block)?;
            }
        }
        info!(
            ring_blocks = counts[0],
            buffer_blocks = counts[1],
            combined_blocks = counts[2],
            "loaded ASG block pools"
        );
        Ok(())
    }

    fn load_block_locked<R: Read + ?Sized>(
        &self,
        r: &mut R,
        resources: Option<&LoadResources>,
        block: &mut Block,
    ) -> Result<()> {
        if !r.read_flag()? {
            *block = Block::default();
            return Ok(());
        }

        let buffer_size = r.read_be64()?;
        let offset_into_phys = r.read_be64()?;
        let dedicated_context_handle = r.read_optional_be32()?;
        let virtio_gpu = r.read_flag()?;
        let hostmem_id = r.read_be64()?;

        let mut create = AllocationCreateInfo {
            virtio_gpu,
            from_load: true,
            size: buffer_size,
            hostmem_id,
            external: None,
            dedicated_context_handle,
        };

        if virtio_gpu {
            let Some(handle) = dedicated_context_handle else {
                return Err(fatal(
                    AbortReason::InternalConsistency,
                    "virtio-gpu backed ASG block was saved without a dedicated context",
                ));
            };
            let external = resources.and_then(|res| res.context_external_memory.get(&handle));
            let Some(external) = external else {
                return Err(fatal(
                    AbortReason::InternalConsistency,
                    format!("no replacement external memory for virtio-gpu ASG context {handle}"),
                ));
            };
            create.external = Some(Arc::clone(external.region()));
        } else if buffer_size != self.config.block_size {
            return Err(SnapshotError::Corrupt("ASG block size does not match configuration").into());
        }

        block.offset_into_phys = offset_into_phys;
        self.fill_block_locked(block, &create)?;

        let Some(memory) = block.memory.as_mut() else {
            return Err(fatal(AbortReason::InternalConsistency, "filled ASG block has no memory"));
        };
        memory.sub_alloc.load(r)?;

        if !block.external {
            let mut chunk = vec![0u8; COPY_CHUNK];
            let mut offset = 0u64;
            while offset < buffer_size {
                let len = (buffer_size - offset).min(COPY_CHUNK as u64) as usize;
                r.read_exact(&mut chunk[..len])?;
                memory.region.write(offset, &chunk[..len])?;
                offset += len as u64;
            }
        }
        Ok(())
    }

    /// Resolve a descriptor read from a snapshot against the reloaded pools.
    pub fn fill_alloc_from_load(&self, alloc: &mut Allocation, pool: BlockPool) -> Result<()> {
        let pools = self.lock_pools();
        let index = alloc.block_index;
        let Some(block) = usize::try_from(index)
            .ok()
            .and_then(|index| pools.get(pool).get(index))
        else {
            return Err(fatal(
                AbortReason::InternalConsistency,
                format!("snapshot references missing {pool} block {index}"),
            ));
        };
        let Some(memory) = &block.memory else {
            return Err(fatal(
                AbortReason::InternalConsistency,
                format!("snapshot references empty {pool} block {index}"),
            ));
        };
        let host = alloc
            .offset_into_phys
            .checked_sub(block.offset_into_phys)
            .ok_or(asg_mem::HostMemoryError::OutOfRange {
                offset: alloc.offset_into_phys,
                len: alloc.size,
                size: block.buffer_size,
            })
            .and_then(|offset| memory.region.slice(offset, alloc.size))
            .map_err(|err| {
                fatal(
                    AbortReason::InternalConsistency,
                    format!("snapshot allocation does not fit {pool} block {index}: {err}"),
                )
            })?;

        alloc.host = Some(host);
        alloc.dedicated_context_handle = block.dedicated_context_handle;
        alloc.hostmem_id = block.hostmem_id;
        Ok(())
    }
}

impl Drop for AsgGlobals {
    fn drop(&mut self) {
        let pools = self.pools.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut pools = std::mem::take(pools);
        if let Err(err) = self.clear_locked(&mut pools) {
            tracing::error!(error = %err, "failed to release ASG blocks");
        }
    }
}

fn allocation_in_block(
    block: &Block,
    index: usize,
    offset: u64,
    create: &AllocationCreateInfo,
) -> Result<Allocation> {
    let Some(memory) = &block.memory else {
        return Err(fatal(AbortReason::InternalConsistency, "allocated from an empty ASG block"));
    };
    let host = memory.region.slice(offset, create.size).map_err(|err| {
        fatal(
            AbortReason::InternalConsistency,
            format!("sub-allocation at {offset:#x} escapes its block: {err}"),
        )
    })?;
    Ok(Allocation {
        host: Some(host),
        block_index: index as u64,
        offset_into_phys: block.offset_into_phys + offset,
        size: create.size,
        dedicated_context_handle: create.dedicated_context_handle,
        hostmem_id: create.hostmem_id,
        is_view: false,
    })
}

fn save_block<W: Write + ?Sized>(w: &mut W, block: &Block) -> Result<()> {
    let Some(memory) = &block.memory else {
        w.write_flag(false)?;
        return Ok(());
    };
    w.write_flag(true)?;
    w.write_be64(block.buffer_size)?;
    w.write_be64(block.offset_into_phys)?;
    w.write_optional_be32(block.dedicated_context_handle)?;
    w.write_flag(block.uses_virtio_gpu_hostmem)?;
    w.write_be64(block.hostmem_id)?;
    memory.sub_alloc.save(w)?;

    if !block.external {
        let mut chunk = vec![0u8; COPY_CHUNK];
        let mut offset = 0u64;
        while offset < block.buffer_size {
            let len = (block.buffer_size - offset).min(COPY_CHUNK as u64) as usize;
            memory.region.read(offset, &mut chunk[..len])?;
            w.write_all(&chunk[..len])?;
            offset += len as u64;
        }
    }
    Ok(())
}
