//! The consumer contract and the host side of its sleep/wake handshake.

use std::fmt;
use std::io::{Read, Write};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::ring::{HostState, RingContext};

/// Bound of the per-context control channel.
pub const CONSUMER_CHANNEL_CAPACITY: usize = 4;

/// Consecutive empty reads after which the consumer blocks for a message.
pub const MAX_UNAVAILABLE_READS: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerCommand {
    Wakeup,
    Sleep,
    Exit,
    PausePreSnapshot,
    ResumePostSnapshot,
}

/// What the consumer loop should do after reporting that the ring was empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnavailableRead {
    /// Below the threshold: spin again.
    KeepPolling,
    /// Woken up by the guest: read the ring again.
    Retry,
    /// The context is going away: stop.
    Exit,
    /// A snapshot is being taken: stop touching shared memory until resumed.
    Paused,
    Resumed,
}

impl UnavailableRead {
    /// Wire value of the outcome as seen by consumer implementations.
    pub const fn as_raw(self) -> i32 {
        match self {
            UnavailableRead::KeepPolling => 0,
            UnavailableRead::Retry => 1,
            UnavailableRead::Exit => -1,
            UnavailableRead::Paused => -2,
            UnavailableRead::Resumed => -3,
        }
    }
}

/// Bounded, multi-producer control channel from the device to one consumer.
#[derive(Debug, Clone)]
pub struct ConsumerMessages {
    tx: flume::Sender<ConsumerCommand>,
    rx: flume::Receiver<ConsumerCommand>,
}

impl Default for ConsumerMessages {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerMessages {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(CONSUMER_CHANNEL_CAPACITY);
        Self { tx, rx }
    }

    /// Post `cmd`, waiting for room if the channel is full.
    pub fn send(&self, cmd: ConsumerCommand) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.tx.send(cmd);
    }

    /// Post `cmd` without waiting. Returns `false` if the channel is full.
    pub fn try_send(&self, cmd: ConsumerCommand) -> bool {
        self.tx.try_send(cmd).is_ok()
    }

    /// Post a wakeup unless one (or any other command) is already pending. A pending message
    /// wakes the consumer just as well, and coalescing keeps repeated notifications from filling
    /// the channel.
    pub fn post_wakeup(&self) -> bool {
        if !self.tx.is_empty() {
            return false;
        }
        self.try_send(ConsumerCommand::Wakeup)
    }

    /// Block until a command arrives.
    pub fn receive(&self) -> ConsumerCommand {
        self.rx.recv().unwrap_or(ConsumerCommand::Exit)
    }

    pub fn try_receive(&self) -> Option<ConsumerCommand> {
        self.rx.try_recv().ok()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// Identifies one consumer instance to its [`ConsumerInterface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerHandle(pub u64);

/// Callbacks a consumer uses to reach back into its context.
#[derive(Clone)]
pub struct ConsumerCallbacks {
    /// Report an empty ring. May block until the guest notifies or the context exits.
    pub on_unavailable_read: Arc<dyn Fn() -> UnavailableRead + Send + Sync>,
    /// Resolve a guest physical address to host memory.
    pub get_ptr: Arc<dyn Fn(u64) -> Option<NonNull<u8>> + Send + Sync>,
}

impl fmt::Debug for ConsumerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerCallbacks").finish_non_exhaustive()
    }
}

/// Factory and lifecycle hooks for the component that interprets ring contents.
///
/// Per-consumer calls are serialized by the owning context. The global hooks bracket a whole
/// device snapshot.
pub trait ConsumerInterface: Send + Sync {
    /// Start a consumer for `ring`. When `load` is set, the consumer restores the state it
    /// wrote in [`ConsumerInterface::save`] from it.
    fn create(
        &self,
        ring: RingContext,
        load: Option<&mut dyn Read>,
        callbacks: ConsumerCallbacks,
        context_id: u32,
        capset_id: u32,
        name: Option<String>,
    ) -> asg_snapshot::Result<ConsumerHandle>;

    fn destroy(&self, handle: ConsumerHandle);

    fn pre_save(&self, handle: ConsumerHandle);

    fn save(&self, handle: ConsumerHandle, w: &mut dyn Write) -> asg_snapshot::Result<()>;

    fn post_save(&self, handle: ConsumerHandle);

    fn post_load(&self, _handle: ConsumerHandle) {}

    fn global_pre_save(&self) {}

    fn global_post_save(&self) {}

    fn global_pre_load(&self) {}
}

/// Context state shared with the consumer through [`ConsumerCallbacks`].
#[derive(Debug)]
pub(crate) struct ConsumerLink {
    ring: RingContext,
    messages: ConsumerMessages,
    exiting: AtomicBool,
    unavailable_read_count: AtomicU32,
}

impl ConsumerLink {
    pub(crate) fn new(ring: RingContext, exiting: bool, unavailable_read_count: u32) -> Self {
        Self {
            ring,
            messages: ConsumerMessages::new(),
            exiting: AtomicBool::new(exiting),
            unavailable_read_count: AtomicU32::new(unavailable_read_count),
        }
    }

    pub(crate) fn ring(&self) -> &RingContext {
        &self.ring
    }

    pub(crate) fn messages(&self) -> &ConsumerMessages {
        &self.messages
    }

    pub(crate) fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub(crate) fn set_exiting(&self) {
        self.exiting.store(true, Ordering::Release);
    }

    pub(crate) fn unavailable_read_count(&self) -> u32 {
        self.unavailable_read_count.load(Ordering::Acquire)
    }

    pub(crate) fn on_unavailable_read(&self) -> UnavailableRead {
        let count = self
            .unavailable_read_count
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1);
        std::thread::yield_now();

        if count < MAX_UNAVAILABLE_READS && !self.is_exiting() {
            return UnavailableRead::KeepPolling;
        }
        self.unavailable_read_count.store(0, Ordering::Release);

        loop {
            self.ring.set_host_state(HostState::NeedNotify);
            match self.messages.receive() {
                ConsumerCommand::Wakeup => {
                    self.ring.set_host_state(HostState::CanConsume);
                    return UnavailableRead::Retry;
                }
                ConsumerCommand::Exit => {
                    self.ring.set_host_state(HostState::Exit);
                    return UnavailableRead::Exit;
                }
                ConsumerCommand::Sleep => {}
                ConsumerCommand::PausePreSnapshot => return UnavailableRead::Paused,
                ConsumerCommand::ResumePostSnapshot => return UnavailableRead::Resumed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ASG_RING_STORAGE_SIZE_BYTES;
    use asg_mem::HostRegion;
    use std::thread;

    fn link() -> ConsumerLink {
        let region = Arc::new(HostRegion::allocate(0x3000, 4096).unwrap());
        let ring = region.slice(0, ASG_RING_STORAGE_SIZE_BYTES).unwrap();
        let buffer = region.slice(ASG_RING_STORAGE_SIZE_BYTES, 0x1000).unwrap();
        ConsumerLink::new(RingContext::new(ring, buffer).unwrap(), false, 0)
    }

    #[test]
    fn outcome_codes() {
        assert_eq!(UnavailableRead::KeepPolling.as_raw(), 0);
        assert_eq!(UnavailableRead::Retry.as_raw(), 1);
        assert_eq!(UnavailableRead::Exit.as_raw(), -1);
        assert_eq!(UnavailableRead::Paused.as_raw(), -2);
        assert_eq!(UnavailableRead::Resumed.as_raw(), -3);
    }

    #[test]
    fn wakeups_are_coalesced() {
        let messages = ConsumerMessages::new();
        assert!(messages.post_wakeup());
        assert!(!messages.post_wakeup());
        assert_eq!(messages.pending(), 1);
        assert_eq!(messages.receive(), ConsumerCommand::Wakeup);
        assert!(messages.post_wakeup());
    }

    #[test]
    fn try_send_fails_when_full() {
        let messages = ConsumerMessages::new();
        for _ in 0..CONSUMER_CHANNEL_CAPACITY {
            assert!(messages.try_send(ConsumerCommand::Sleep));
        }
        assert!(!messages.try_send(ConsumerCommand::Wakeup));
        assert_eq!(messages.try_receive(), Some(ConsumerCommand::Sleep));
    }

    #[test]
    fn blocks_on_eighth_consecutive_empty_read() {
        let link = link();
        link.messages().send(ConsumerCommand::Wakeup);
        for _ in 0..MAX_UNAVAILABLE_READS - 1 {
            assert_eq!(link.on_unavailable_read(), UnavailableRead::KeepPolling);
        }
        // The pre-queued wakeup is only consumed once the threshold is reached.
        assert_eq!(link.messages().pending(), 1);
        assert_eq!(link.on_unavailable_read(), UnavailableRead::Retry);
        assert_eq!(link.unavailable_read_count(), 0);
        assert_eq!(link.ring().host_state(), Some(HostState::CanConsume));
    }

    #[test]
    fn sleep_rearms_the_wait() {
        let link = link();
        link.set_exiting();
        link.messages().send(ConsumerCommand::Sleep);
        link.messages().send(ConsumerCommand::Sleep);
        link.messages().send(ConsumerCommand::Exit);
        assert_eq!(link.on_unavailable_read(), UnavailableRead::Exit);
        assert_eq!(link.ring().host_state(), Some(HostState::Exit));
        assert_eq!(link.messages().pending(), 0);
    }

    #[test]
    fn exiting_skips_the_polling_phase() {
        let link = link();
        link.set_exiting();
        link.messages().send(ConsumerCommand::PausePreSnapshot);
        assert_eq!(link.on_unavailable_read(), UnavailableRead::Paused);
        link.messages().send(ConsumerCommand::ResumePostSnapshot);
        assert_eq!(link.on_unavailable_read(), UnavailableRead::Resumed);
    }

    #[test]
    fn exit_releases_a_blocked_consumer() {
        let link = Arc::new(link());
        link.set_exiting();

        let waiter = {
            let link = Arc::clone(&link);
            thread::spawn(move || link.on_unavailable_read())
        };
        while link.ring().host_state() != Some(HostState::NeedNotify) {
            thread::yield_now();
        }
        link.messages().send(ConsumerCommand::Exit);
        assert_eq!(waiter.join().unwrap(), UnavailableRead::Exit);
    }
}
