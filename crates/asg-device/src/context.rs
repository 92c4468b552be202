//! Per-guest graphics context: allocation ownership, ping handling and the consumer lifecycle.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use asg_snapshot::{ReadBeExt, WriteBeExt};
use tracing::{debug, warn};

use crate::block::{Allocation, BlockPool};
use crate::consumer::{
    ConsumerCallbacks, ConsumerCommand, ConsumerHandle, ConsumerInterface, ConsumerLink,
    UnavailableRead,
};
use crate::error::{die, fatal, AbortReason, Result};
use crate::globals::{AsgGlobals, ExternalMemory};
use crate::ping::{AsgCommand, PingInfo};
use crate::ring::{config_index, HostState, RingConfig, RingContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpaceDeviceType {
    Graphics,
    VirtioGpuGraphics,
    HostMemoryAllocator,
}

/// Identity of a virtio-gpu context, forwarded to its consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtioGpuInfo {
    pub context_id: u32,
    pub capset_id: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VirtioGpuCreateInfo {
    pub info: VirtioGpuInfo,
    /// Dedicated block handle; must be non-zero.
    pub handle: u32,
    /// Host memory id reported back to the guest on `SET_VERSION`.
    pub hostmem_id: u64,
    pub external_memory: Option<ExternalMemory>,
}

#[derive(Debug, Clone, Default)]
pub struct AsgCreateInfo {
    pub virtio_gpu: Option<VirtioGpuCreateInfo>,
    /// Start the consumer immediately instead of on the first `SET_VERSION`.
    pub create_render_thread: bool,
}

pub struct AddressSpaceGraphicsContext {
    globals: Arc<AsgGlobals>,
    consumer_interface: Arc<dyn ConsumerInterface>,
    link: Arc<ConsumerLink>,
    ring_allocation: Allocation,
    buffer_allocation: Allocation,
    combined_allocation: Allocation,
    /// Ring config as published at creation; `GET_CONFIG` restores it.
    saved_config: RingConfig,
    version: u32,
    virtio_gpu_info: Option<VirtioGpuInfo>,
    current_consumer: Option<ConsumerHandle>,
}

impl fmt::Debug for AddressSpaceGraphicsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpaceGraphicsContext")
            .field("ring", &self.ring_allocation)
            .field("buffer", &self.buffer_allocation)
            .field("version", &self.version)
            .field("virtio_gpu_info", &self.virtio_gpu_info)
            .field("consumer", &self.current_consumer)
            .finish_non_exhaustive()
    }
}

impl AddressSpaceGraphicsContext {
    pub fn new(globals: Arc<AsgGlobals>, create: AsgCreateInfo) -> Result<Self> {
        let consumer_interface = globals.consumer_interface()?;

        let (ring_allocation, buffer_allocation, combined_allocation, virtio_gpu_info) =
            match create.virtio_gpu {
                Some(virtio) => {
                    let combined = globals.alloc_ring_and_buffer_storage_dedicated(
                        virtio.handle,
                        virtio.hostmem_id,
                        virtio.external_memory.as_ref(),
                    )?;
                    let ring = globals.alloc_ring_view_into_combined(&combined)?;
                    let buffer = globals.alloc_buffer_view_into_combined(&combined)?;
                    (ring, buffer, combined, Some(virtio.info))
                }
                None => {
                    let ring = globals.alloc_ring_storage()?;
                    let buffer = globals.alloc_buffer()?;
                    (ring, buffer, Allocation::default(), None)
                }
            };

        let config = globals.config();
        let saved_config = RingConfig::initial(
            config.per_context_buffer_size as u32,
            config.flush_interval,
        );
        let version = config.host_version;
        let ring = ring_context(&ring_allocation, &buffer_allocation)?;
        ring.set_config(&saved_config);

        let mut context = Self {
            globals,
            consumer_interface,
            link: Arc::new(ConsumerLink::new(ring, false, 0)),
            ring_allocation,
            buffer_allocation,
            combined_allocation,
            saved_config,
            version,
            virtio_gpu_info,
            current_consumer: None,
        };
        if create.create_render_thread {
            context.create_consumer(None)?;
        }
        Ok(context)
    }

    pub fn device_type(&self) -> AddressSpaceDeviceType {
        if self.virtio_gpu_info.is_some() {
            AddressSpaceDeviceType::VirtioGpuGraphics
        } else {
            AddressSpaceDeviceType::Graphics
        }
    }

    pub fn ring_allocation(&self) -> &Allocation {
        &self.ring_allocation
    }

    pub fn buffer_allocation(&self) -> &Allocation {
        &self.buffer_allocation
    }

    pub fn combined_allocation(&self) -> &Allocation {
        &self.combined_allocation
    }

    pub fn ring(&self) -> &RingContext {
        self.link.ring()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn virtio_gpu_info(&self) -> Option<&VirtioGpuInfo> {
        self.virtio_gpu_info.as_ref()
    }

    pub fn consumer(&self) -> Option<ConsumerHandle> {
        self.current_consumer
    }

    pub fn is_exiting(&self) -> bool {
        self.link.is_exiting()
    }

    pub fn unavailable_read_count(&self) -> u32 {
        self.link.unavailable_read_count()
    }

    pub fn saved_config(&self) -> RingConfig {
        self.saved_config
    }

    fn consumer_callbacks(&self) -> ConsumerCallbacks {
        let link = Arc::clone(&self.link);
        let globals = Arc::clone(&self.globals);
        ConsumerCallbacks {
            on_unavailable_read: Arc::new(move || link.on_unavailable_read()),
            get_ptr: Arc::new(move |gpa| globals.host_ptr(gpa)),
        }
    }

    fn create_consumer(&mut self, load: Option<&mut dyn Read>) -> Result<()> {
        let (context_id, capset_id, name) = match &self.virtio_gpu_info {
            Some(info) => (info.context_id, info.capset_id, info.name.clone()),
            None => (0, 0, None),
        };
        let handle = self.consumer_interface.create(
            self.link.ring().clone(),
            load,
            self.consumer_callbacks(),
            context_id,
            capset_id,
            name,
        )?;
        debug!(handle = handle.0, context_id, "created ASG consumer");
        self.current_consumer = Some(handle);
        Ok(())
    }

    /// Handle one guest ping. Results are written back into `info`.
    pub fn perform(&mut self, info: &mut PingInfo) -> Result<()> {
        match AsgCommand::from_raw(info.metadata) {
            Some(AsgCommand::GetRing) => {
                info.metadata = self.ring_allocation.offset_into_phys;
                info.size = self.ring_allocation.size;
            }
            Some(AsgCommand::GetBuffer) => {
                info.metadata = self.buffer_allocation.offset_into_phys;
                info.size = self.buffer_allocation.size;
            }
            Some(AsgCommand::SetVersion) => {
                let guest_version = u32::try_from(info.size).unwrap_or(u32::MAX);
                self.version = self.version.min(guest_version);
                info.size = u64::from(self.version);
                if self.current_consumer.is_none() {
                    self.create_consumer(None)?;
                }
                if self.virtio_gpu_info.is_some() {
                    info.metadata = self.combined_allocation.hostmem_id;
                }
            }
            Some(AsgCommand::NotifyAvailable) => {
                self.link.messages().post_wakeup();
                info.metadata = 0;
            }
            Some(AsgCommand::GetConfig) => {
                self.link.ring().set_config(&self.saved_config);
                info.metadata = 0;
            }
            None => warn!(command = info.metadata, "unknown ASG ping command"),
        }
        Ok(())
    }

    /// Same entry point the consumer reaches through its callbacks.
    pub fn on_unavailable_read(&self) -> UnavailableRead {
        self.link.on_unavailable_read()
    }

    pub fn pre_save(&self) {
        if let Some(handle) = self.current_consumer {
            self.consumer_interface.pre_save(handle);
            self.link.messages().send(ConsumerCommand::PausePreSnapshot);
        }
    }

    pub fn save<W: Write>(&self, w: &mut W) -> Result<()> {
        match &self.virtio_gpu_info {
            Some(info) => {
                w.write_flag(true)?;
                w.write_be32(info.context_id)?;
                w.write_be32(info.capset_id)?;
                match &info.name {
                    Some(name) => {
                        w.write_flag(true)?;
                        w.write_string(name)?;
                    }
                    None => w.write_flag(false)?,
                }
            }
            None => w.write_flag(false)?,
        }

        w.write_be32(self.version)?;
        w.write_flag(self.link.is_exiting())?;
        w.write_be32(self.link.unavailable_read_count())?;

        self.ring_allocation.save_descriptor(w)?;
        self.buffer_allocation.save_descriptor(w)?;
        self.combined_allocation.save_descriptor(w)?;

        self.saved_config.encode(w)?;

        match self.current_consumer {
            Some(handle) => {
                w.write_flag(true)?;
                self.consumer_interface.save(handle, w)?;
            }
            None => w.write_flag(false)?,
        }
        Ok(())
    }

    pub fn post_save(&self) {
        if let Some(handle) = self.current_consumer {
            self.link.messages().send(ConsumerCommand::ResumePostSnapshot);
            self.consumer_interface.post_save(handle);
        }
    }

    /// Rebuild a context from [`AddressSpaceGraphicsContext::save`] output. The globals must
    /// already have been loaded from the same snapshot.
    pub fn load<R: Read>(globals: Arc<AsgGlobals>, r: &mut R) -> Result<Self> {
        let consumer_interface = globals.consumer_interface()?;

        let virtio_gpu_info = if r.read_flag()? {
            let context_id = r.read_be32()?;
            let capset_id = r.read_be32()?;
            let name = if r.read_flag()? {
                Some(r.read_string()?)
            } else {
                None
            };
            Some(VirtioGpuInfo {
                context_id,
                capset_id,
                name,
            })
        } else {
            None
        };

        let version = r.read_be32()?;
        let exiting = r.read_flag()?;
        let unavailable_read_count = r.read_be32()?;

        let mut ring_allocation = Allocation::load_descriptor(r)?;
        let mut buffer_allocation = Allocation::load_descriptor(r)?;
        let mut combined_allocation = Allocation::load_descriptor(r)?;

        if virtio_gpu_info.is_some() {
            globals.fill_alloc_from_load(&mut combined_allocation, BlockPool::Combined)?;
            ring_allocation = globals.alloc_ring_view_into_combined(&combined_allocation)?;
            buffer_allocation = globals.alloc_buffer_view_into_combined(&combined_allocation)?;
        } else {
            globals.fill_alloc_from_load(&mut ring_allocation, BlockPool::Ring)?;
            globals.fill_alloc_from_load(&mut buffer_allocation, BlockPool::Buffer)?;
        }

        let ring = ring_context(&ring_allocation, &buffer_allocation)?;
        let config = globals.config();
        ring.set_config_word(
            config_index::BUFFER_SIZE,
            config.per_context_buffer_size as u32,
        );
        ring.set_config_word(config_index::FLUSH_INTERVAL, config.flush_interval);

        let saved_config = RingConfig::decode(r)?;

        let mut context = Self {
            globals,
            consumer_interface,
            link: Arc::new(ConsumerLink::new(ring, exiting, unavailable_read_count)),
            ring_allocation,
            buffer_allocation,
            combined_allocation,
            saved_config,
            version,
            virtio_gpu_info,
            current_consumer: None,
        };

        if r.read_flag()? {
            let load: &mut dyn Read = r;
            context.create_consumer(Some(load))?;
            if let Some(handle) = context.current_consumer {
                context.consumer_interface.post_load(handle);
            }
        }
        Ok(context)
    }
}

impl Drop for AddressSpaceGraphicsContext {
    fn drop(&mut self) {
        if let Some(handle) = self.current_consumer.take() {
            self.link.set_exiting();
            self.link.ring().set_host_state(HostState::Exit);
            self.link.messages().send(ConsumerCommand::Exit);
            self.consumer_interface.destroy(handle);
            debug!(handle = handle.0, "destroyed ASG consumer");
        }

        let released = self
            .globals
            .free_buffer(&self.buffer_allocation)
            .and_then(|()| self.globals.free_ring_storage(&self.ring_allocation))
            .and_then(|()| self.globals.free_ring_and_buffer(&self.combined_allocation));
        if let Err(err) = released {
            die(err);
        }
    }
}

fn ring_context(ring: &Allocation, buffer: &Allocation) -> Result<RingContext> {
    let (Some(ring), Some(buffer)) = (ring.host(), buffer.host()) else {
        return Err(fatal(
            AbortReason::InternalConsistency,
            "ASG context has no ring or buffer memory",
        ));
    };
    Ok(RingContext::new(ring.clone(), buffer.clone())?)
}
