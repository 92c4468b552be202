//! Ring storage layout and typed access to the guest-shared ring header.
//!
//! The ring storage is a fixed `ASG_RING_STORAGE_SIZE_BYTES` area that both sides access
//! concurrently. The host only touches two parts of it directly: the `host_state` word of the
//! to-host control block and the ring config header. Everything else belongs to the consumer.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};

use asg_mem::{HostMemoryError, HostSlice};
use asg_snapshot::{ReadBeExt, WriteBeExt};

pub const ASG_RING_STORAGE_SIZE_BYTES: u64 = 0x2000;

/// To-host ring control block (`host_state` lives inside it).
pub const TO_HOST_CONTROL_OFFSET: u64 = 0x0000;
pub const HOST_STATE_OFFSET: u64 = TO_HOST_CONTROL_OFFSET + 0x10;

pub const TO_HOST_DATA_OFFSET: u64 = 0x0040;
pub const TO_HOST_DATA_SIZE_BYTES: u64 = 0x1000;

pub const TO_HOST_LARGE_XFER_OFFSET: u64 = TO_HOST_DATA_OFFSET + TO_HOST_DATA_SIZE_BYTES;
pub const FROM_HOST_LARGE_XFER_OFFSET: u64 = TO_HOST_LARGE_XFER_OFFSET + 0x40;

pub const RING_CONFIG_OFFSET: u64 = 0x1100;

/// Word indices inside the ring config header.
pub mod config_index {
    pub const BUFFER_SIZE: usize = 0;
    pub const FLUSH_INTERVAL: usize = 1;
    pub const HOST_CONSUMED_POS: usize = 2;
    pub const GUEST_WRITE_POS: usize = 3;
    pub const TRANSFER_MODE: usize = 4;
    pub const TRANSFER_SIZE: usize = 5;
    pub const IN_ERROR: usize = 6;

    pub const WORDS: usize = 7;
    pub const BYTES: u64 = (WORDS * 4) as u64;
}

const _: () = {
    assert!(HOST_STATE_OFFSET % 4 == 0);
    assert!(HOST_STATE_OFFSET + 4 <= TO_HOST_DATA_OFFSET);
    assert!(FROM_HOST_LARGE_XFER_OFFSET + 0x40 <= RING_CONFIG_OFFSET);
    assert!(RING_CONFIG_OFFSET % 4 == 0);
    assert!(RING_CONFIG_OFFSET + config_index::BYTES <= ASG_RING_STORAGE_SIZE_BYTES);
};

/// Host-side consumption state published to the guest.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostState {
    /// The consumer is actively draining the ring.
    CanConsume = 0,
    /// The consumer is about to sleep; the guest must ping `NOTIFY_AVAILABLE` after writing.
    NeedNotify = 1,
    /// The context is being torn down.
    Exit = 2,
}

impl HostState {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(HostState::CanConsume),
            1 => Some(HostState::NeedNotify),
            2 => Some(HostState::Exit),
            _ => None,
        }
    }
}

/// A plain snapshot of the ring config header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingConfig {
    pub buffer_size: u32,
    pub flush_interval: u32,
    pub host_consumed_pos: u32,
    pub guest_write_pos: u32,
    pub transfer_mode: u32,
    pub transfer_size: u32,
    pub in_error: u32,
}

impl RingConfig {
    /// The config every new context starts with.
    pub fn initial(buffer_size: u32, flush_interval: u32) -> Self {
        Self {
            buffer_size,
            flush_interval,
            host_consumed_pos: 0,
            guest_write_pos: 0,
            transfer_mode: 1,
            transfer_size: 0,
            in_error: 0,
        }
    }

    fn to_words(self) -> [u32; config_index::WORDS] {
        [
            self.buffer_size,
            self.flush_interval,
            self.host_consumed_pos,
            self.guest_write_pos,
            self.transfer_mode,
            self.transfer_size,
            self.in_error,
        ]
    }

    fn from_words(words: [u32; config_index::WORDS]) -> Self {
        Self {
            buffer_size: words[config_index::BUFFER_SIZE],
            flush_interval: words[config_index::FLUSH_INTERVAL],
            host_consumed_pos: words[config_index::HOST_CONSUMED_POS],
            guest_write_pos: words[config_index::GUEST_WRITE_POS],
            transfer_mode: words[config_index::TRANSFER_MODE],
            transfer_size: words[config_index::TRANSFER_SIZE],
            in_error: words[config_index::IN_ERROR],
        }
    }

    pub fn encode<W: Write + ?Sized>(&self, w: &mut W) -> asg_snapshot::Result<()> {
        for word in self.to_words() {
            w.write_be32(word)?;
        }
        Ok(())
    }

    pub fn decode<R: Read + ?Sized>(r: &mut R) -> asg_snapshot::Result<Self> {
        let mut words = [0u32; config_index::WORDS];
        for word in &mut words {
            *word = r.read_be32()?;
        }
        Ok(Self::from_words(words))
    }
}

/// The ring storage and buffer of one context, as handed to the consumer.
///
/// Cloning is cheap; all clones refer to the same shared memory.
#[derive(Debug, Clone)]
pub struct RingContext {
    ring: HostSlice,
    buffer: HostSlice,
}

impl RingContext {
    pub fn new(ring: HostSlice, buffer: HostSlice) -> Result<Self, HostMemoryError> {
        if ring.len() < ASG_RING_STORAGE_SIZE_BYTES {
            return Err(HostMemoryError::OutOfRange {
                offset: 0,
                len: ASG_RING_STORAGE_SIZE_BYTES,
                size: ring.len(),
            });
        }
        // Atomic header words must be naturally aligned in host memory.
        ring.atomic_u32(HOST_STATE_OFFSET)?;
        ring.atomic_u32(RING_CONFIG_OFFSET)?;
        Ok(Self { ring, buffer })
    }

    pub fn ring(&self) -> &HostSlice {
        &self.ring
    }

    pub fn buffer(&self) -> &HostSlice {
        &self.buffer
    }

    fn word(&self, offset: u64) -> &AtomicU32 {
        self.ring
            .atomic_u32(offset)
            .expect("ring header alignment is checked at construction")
    }

    fn config_word_ref(&self, index: usize) -> &AtomicU32 {
        assert!(
            index < config_index::WORDS,
            "ring config word {index} out of range"
        );
        self.word(RING_CONFIG_OFFSET + (index as u64) * 4)
    }

    pub fn raw_host_state(&self) -> u32 {
        self.word(HOST_STATE_OFFSET).load(Ordering::Acquire)
    }

    pub fn host_state(&self) -> Option<HostState> {
        HostState::from_raw(self.raw_host_state())
    }

    pub fn set_host_state(&self, state: HostState) {
        self.word(HOST_STATE_OFFSET)
            .store(state as u32, Ordering::Release);
    }

    /// Load config word `index`, one of the [`config_index`] constants.
    ///
    /// # Panics
    /// Panics if `index >= config_index::WORDS`.
    pub fn config_word(&self, index: usize) -> u32 {
        self.config_word_ref(index).load(Ordering::Acquire)
    }

    /// Store config word `index`, one of the [`config_index`] constants.
    ///
    /// # Panics
    /// Panics if `index >= config_index::WORDS`.
    pub fn set_config_word(&self, index: usize, value: u32) {
        self.config_word_ref(index).store(value, Ordering::Release);
    }

    pub fn config(&self) -> RingConfig {
        let mut words = [0u32; config_index::WORDS];
        for (index, word) in words.iter_mut().enumerate() {
            *word = self.config_word(index);
        }
        RingConfig::from_words(words)
    }

    pub fn set_config(&self, config: &RingConfig) {
        for (index, word) in config.to_words().into_iter().enumerate() {
            self.set_config_word(index, word);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asg_mem::HostRegion;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn ring_context() -> RingContext {
        let region = Arc::new(HostRegion::allocate(0x4000, 4096).unwrap());
        let ring = region.slice(0, ASG_RING_STORAGE_SIZE_BYTES).unwrap();
        let buffer = region.slice(ASG_RING_STORAGE_SIZE_BYTES, 0x2000).unwrap();
        RingContext::new(ring, buffer).unwrap()
    }

    #[test]
    fn config_lands_at_fixed_offsets() {
        let ctx = ring_context();
        let config = RingConfig {
            buffer_size: 0x1000,
            flush_interval: 0x200,
            host_consumed_pos: 3,
            guest_write_pos: 4,
            transfer_mode: 1,
            transfer_size: 6,
            in_error: 0,
        };
        ctx.set_config(&config);
        assert_eq!(ctx.config(), config);

        let mut raw = [0u8; 8];
        ctx.ring().read(RING_CONFIG_OFFSET, &mut raw).unwrap();
        assert_eq!(u32::from_ne_bytes(raw[0..4].try_into().unwrap()), 0x1000);
        assert_eq!(u32::from_ne_bytes(raw[4..8].try_into().unwrap()), 0x200);
    }

    #[test]
    fn host_state_is_visible_in_shared_memory() {
        let ctx = ring_context();
        assert_eq!(ctx.host_state(), Some(HostState::CanConsume));
        ctx.set_host_state(HostState::NeedNotify);

        let mut raw = [0u8; 4];
        ctx.ring().read(HOST_STATE_OFFSET, &mut raw).unwrap();
        assert_eq!(u32::from_ne_bytes(raw), 1);

        ctx.ring()
            .write(HOST_STATE_OFFSET, &7u32.to_ne_bytes())
            .unwrap();
        assert_eq!(ctx.raw_host_state(), 7);
        assert_eq!(ctx.host_state(), None);
    }

    #[test]
    fn short_ring_is_rejected() {
        let region = Arc::new(HostRegion::allocate(0x1000, 4096).unwrap());
        let ring = region.slice(0, 0x1000).unwrap();
        let buffer = region.slice(0, 0x1000).unwrap();
        assert!(matches!(
            RingContext::new(ring, buffer),
            Err(HostMemoryError::OutOfRange { .. })
        ));
    }

    #[test]
    fn config_encoding_is_seven_big_endian_words() {
        let config = RingConfig::initial(0x10000, 4096);
        let mut bytes = Vec::new();
        config.encode(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..4], &[0, 1, 0, 0]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 1]);
        assert_eq!(RingConfig::decode(&mut bytes.as_slice()).unwrap(), config);
    }

    #[test]
    #[should_panic(expected = "ring config word 7 out of range")]
    fn config_word_index_is_bounded() {
        ring_context().set_config_word(config_index::WORDS, 1);
    }
}
