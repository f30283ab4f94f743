//! Host-side buffer pool for record transfers.
//!
//! Buffers are allocated once at arm time and recycled for the life of the
//! session; no allocation happens while streaming. Each buffer is owned by
//! exactly one party at a time, tracked by [`BufferState`]: the hardware
//! while it is being filled, the consumer while it is being read out.

use std::time::{Duration, Instant};

use crate::config::BackpressurePolicy;
use crate::{Error, Result};

/// How long `acquire_free` sleeps between checks while waiting for a buffer
/// to be released.
const FREE_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Available to be handed to the hardware.
    Free,
    /// The card is writing into this buffer. Nobody else may touch it.
    HardwareWriting,
    /// Filled and waiting for the consumer.
    Ready,
    /// Held by the consumer; the hardware must not reuse it until released.
    ConsumerReading,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(usize);

#[derive(Debug)]
struct Buffer {
    data: Vec<u8>,
    state: BufferState,
}

#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<Buffer>,
}

impl BufferPool {
    /// Allocates `count` buffers of `record_bytes` each, all free.
    pub fn new(count: usize, record_bytes: usize) -> BufferPool {
        assert!(count > 0 && record_bytes > 0);
        log::debug!("allocating {} buffers of {} bytes", count, record_bytes);
        let buffers = (0..count)
            .map(|_| Buffer { data: vec![0; record_bytes], state: BufferState::Free })
            .collect();
        BufferPool { buffers }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn state(&self, id: BufferId) -> BufferState {
        self.buffers[id.0].state
    }

    /// Claims a free buffer for the hardware. This is the back-pressure
    /// point of the transfer engine: with [`BackpressurePolicy::Block`] the
    /// call waits up to `timeout` for a buffer to be released and then fails
    /// with [`Error::Timeout`]; with [`BackpressurePolicy::Overrun`] it
    /// fails immediately with [`Error::Overrun`].
    pub fn acquire_free(&mut self, timeout: Duration, policy: BackpressurePolicy)
            -> Result<BufferId> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(index) = self.buffers.iter()
                    .position(|buffer| buffer.state == BufferState::Free) {
                self.buffers[index].state = BufferState::HardwareWriting;
                log::trace!("buffer {}: free -> hardware", index);
                return Ok(BufferId(index));
            }
            match policy {
                BackpressurePolicy::Overrun => {
                    log::error!("no free buffer: consumer cannot keep up");
                    return Err(Error::Overrun);
                }
                BackpressurePolicy::Block => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(FREE_POLL_INTERVAL);
                }
            }
        }
    }

    /// The writable sample view of a buffer currently owned by the hardware.
    pub fn hw_slice(&mut self, id: BufferId) -> &mut [i16] {
        let buffer = &mut self.buffers[id.0];
        assert_eq!(buffer.state, BufferState::HardwareWriting,
            "buffer {} is not owned by the hardware", id.0);
        bytemuck::cast_slice_mut(&mut buffer.data)
    }

    /// Marks a hardware-owned buffer as filled.
    pub fn mark_ready(&mut self, id: BufferId) {
        let buffer = &mut self.buffers[id.0];
        assert_eq!(buffer.state, BufferState::HardwareWriting,
            "buffer {} is not owned by the hardware", id.0);
        buffer.state = BufferState::Ready;
        log::trace!("buffer {}: hardware -> ready", id.0);
    }

    /// Returns a hardware-owned buffer to the free list without data, after
    /// a cancelled or timed-out wait.
    pub fn abort_write(&mut self, id: BufferId) {
        let buffer = &mut self.buffers[id.0];
        assert_eq!(buffer.state, BufferState::HardwareWriting,
            "buffer {} is not owned by the hardware", id.0);
        buffer.state = BufferState::Free;
        log::trace!("buffer {}: hardware -> free (aborted)", id.0);
    }

    /// Hands a ready buffer to the consumer. The hardware cannot reuse it
    /// until [`release`](BufferPool::release) is called.
    pub fn take_ready(&mut self, id: BufferId) -> &[i16] {
        let buffer = &mut self.buffers[id.0];
        assert_eq!(buffer.state, BufferState::Ready,
            "buffer {} is not ready", id.0);
        buffer.state = BufferState::ConsumerReading;
        log::trace!("buffer {}: ready -> consumer", id.0);
        bytemuck::cast_slice(&buffer.data)
    }

    /// Recycles a consumer-held (or unread ready) buffer back to free.
    pub fn release(&mut self, id: BufferId) {
        let buffer = &mut self.buffers[id.0];
        assert!(matches!(buffer.state, BufferState::ConsumerReading | BufferState::Ready),
            "buffer {} is not held by the consumer", id.0);
        buffer.state = BufferState::Free;
        log::trace!("buffer {}: consumer -> free", id.0);
    }
}
