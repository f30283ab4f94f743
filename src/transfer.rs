//! The transfer engine: drives the device through one record at a time.
//!
//! The engine is a single-threaded blocking wait loop. It owns the buffer
//! pool while armed and coordinates the two ownership hand-offs of each
//! record: free buffer to hardware before the wait, filled buffer to the
//! consumer after it. Waits are taken in bounded slices so a stop request
//! from another thread unblocks them promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::buffer::{BufferId, BufferPool};
use crate::config::{AcquisitionPlan, BackpressurePolicy};
use crate::device::{CardStatus, DeviceHandle};
use crate::{Error, Result};

/// Upper bound on one device wait, so stop requests are observed.
const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transfer set up. Configuration calls are accepted.
    Idle,
    /// Buffers are allocated and the device is configured, but not started.
    Armed,
    /// The device is producing data.
    Running,
    /// A fatal fault was detected. An explicit stop is required before the
    /// session can be armed again.
    Faulted,
}

#[derive(Debug)]
pub(crate) struct TransferEngine {
    state: SessionState,
    pool: Option<BufferPool>,
    timeout: Duration,
    policy: BackpressurePolicy,
}

impl TransferEngine {
    pub fn new() -> TransferEngine {
        TransferEngine {
            state: SessionState::Idle,
            pool: None,
            timeout: Duration::from_secs(10),
            policy: Default::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pool_mut(&mut self) -> Option<&mut BufferPool> {
        self.pool.as_mut()
    }

    /// Allocates the buffer set for `plan`. Idle -> Armed.
    pub fn arm(&mut self, plan: &AcquisitionPlan) -> Result<()> {
        match self.state {
            SessionState::Idle => (),
            SessionState::Faulted => return Err(Error::Acquisition(
                "session is faulted: call stop() before re-arming".into())),
            _ => return Err(Error::Acquisition(
                "cannot arm while a transfer is set up".into())),
        }
        self.pool = Some(BufferPool::new(plan.buffer_count(), plan.record_bytes()));
        self.timeout = plan.timeout();
        self.policy = plan.backpressure();
        self.state = SessionState::Armed;
        log::debug!("armed: {} buffers of {} bytes, timeout {:?}",
            plan.buffer_count(), plan.record_bytes(), self.timeout);
        Ok(())
    }

    /// Starts the device. Armed -> Running.
    pub fn start<D: DeviceHandle>(&mut self, device: &mut D) -> Result<()> {
        if self.state != SessionState::Armed {
            return Err(Error::Acquisition("engine is not armed".into()));
        }
        device.start()?;
        self.state = SessionState::Running;
        log::debug!("running");
        Ok(())
    }

    /// Transfers the next record into a free buffer and marks it ready.
    ///
    /// Returns `Ok(None)` if `stop` was raised while waiting. A timeout is
    /// returned to the caller without changing state: the caller may retry,
    /// but the engine never retries internally, so device faults are not
    /// masked. Overrun and underrun are fatal and leave the engine faulted.
    pub fn next_record<D: DeviceHandle>(&mut self, device: &mut D, stop: &AtomicBool)
            -> Result<Option<BufferId>> {
        if self.state != SessionState::Running {
            return Err(Error::Acquisition("engine is not running".into()));
        }
        let timeout = self.timeout;
        let policy = self.policy;
        let Some(pool) = self.pool.as_mut() else {
            return Err(Error::Acquisition("engine has no buffers".into()));
        };

        let id = match pool.acquire_free(timeout, policy) {
            Ok(id) => id,
            Err(Error::Overrun) => {
                self.state = SessionState::Faulted;
                return Err(Error::Overrun);
            }
            Err(error) => return Err(error),
        };

        let deadline = Instant::now() + timeout;
        loop {
            if stop.load(Ordering::Relaxed) {
                pool.abort_write(id);
                log::debug!("wait interrupted by stop request");
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.min(WAIT_SLICE);
            match device.wait_for_buffer(pool.hw_slice(id), slice) {
                Ok(status) => {
                    log::trace!("transfer complete, status {:?}", status);
                    if status.contains(CardStatus::OVERRUN) {
                        pool.abort_write(id);
                        self.state = SessionState::Faulted;
                        return Err(Error::Overrun);
                    }
                    if status.contains(CardStatus::UNDERRUN) {
                        pool.abort_write(id);
                        self.state = SessionState::Faulted;
                        return Err(Error::Underrun);
                    }
                    pool.mark_ready(id);
                    return Ok(Some(id));
                }
                Err(Error::Timeout) => {
                    // a stalled wait can hide a fault the card has already
                    // flagged; poll the status register before retrying
                    match device.read_status() {
                        Ok(status) if status.has_fault() => {
                            pool.abort_write(id);
                            self.state = SessionState::Faulted;
                            return Err(if status.contains(CardStatus::OVERRUN) {
                                Error::Overrun
                            } else {
                                Error::Underrun
                            });
                        }
                        Ok(_) => (),
                        Err(error) => {
                            pool.abort_write(id);
                            self.state = SessionState::Faulted;
                            return Err(error);
                        }
                    }
                    if remaining <= slice {
                        pool.abort_write(id);
                        return Err(Error::Timeout);
                    }
                }
                Err(error) => {
                    pool.abort_write(id);
                    self.state = SessionState::Faulted;
                    return Err(error);
                }
            }
        }
    }

    /// Stops the device and releases the buffers, but keeps a fault latched:
    /// Running/Armed -> Idle, Faulted -> Faulted. Used when a stream ends.
    pub fn halt<D: DeviceHandle>(&mut self, device: &mut D) {
        if self.state == SessionState::Idle {
            return;
        }
        if let Err(error) = device.stop() {
            log::error!("failed to stop device: {}", error);
        }
        self.pool = None;
        if self.state != SessionState::Faulted {
            self.state = SessionState::Idle;
        }
        log::debug!("halted, state {:?}", self.state);
    }

    /// Stops the device, releases the buffers, and clears any fault.
    /// Idempotent; this is the explicit `stop()` that recovers a faulted
    /// session.
    pub fn reset<D: DeviceHandle>(&mut self, device: &mut D) {
        self.halt(device);
        self.state = SessionState::Idle;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::AcquisitionConfig;
    use crate::sim::SimCard;

    fn armed_engine(sim: &SimCard) -> (TransferEngine, crate::sim::SimDevice) {
        let mut device = sim.open().unwrap();
        let config = AcquisitionConfig::default();
        let plan = AcquisitionPlan::new(&config).unwrap();
        let trigger = Default::default();
        device.configure(&plan, &trigger).unwrap();
        let mut engine = TransferEngine::new();
        engine.arm(&plan).unwrap();
        (engine, device)
    }

    #[test]
    fn test_state_machine_happy_path() {
        let sim = SimCard::new();
        let (mut engine, mut device) = armed_engine(&sim);
        assert_eq!(engine.state(), SessionState::Armed);
        engine.start(&mut device).unwrap();
        assert_eq!(engine.state(), SessionState::Running);

        let stop = AtomicBool::new(false);
        let id = engine.next_record(&mut device, &stop).unwrap().unwrap();
        let pool = engine.pool_mut().unwrap();
        assert_eq!(pool.state(id), crate::buffer::BufferState::Ready);
        pool.take_ready(id);
        pool.release(id);

        engine.reset(&mut device);
        assert_eq!(engine.state(), SessionState::Idle);
    }

    #[test]
    fn test_next_record_requires_running() {
        let sim = SimCard::new();
        let (mut engine, mut device) = armed_engine(&sim);
        let stop = AtomicBool::new(false);
        let result = engine.next_record(&mut device, &stop);
        assert!(matches!(result, Err(Error::Acquisition(_))));
    }

    #[test]
    fn test_stop_flag_unblocks_wait() {
        let sim = SimCard::new();
        sim.set_trace_interval(Duration::from_secs(3600));
        let (mut engine, mut device) = armed_engine(&sim);
        engine.start(&mut device).unwrap();
        let stop = AtomicBool::new(true);
        let result = engine.next_record(&mut device, &stop).unwrap();
        assert!(result.is_none());
        // the buffer claimed for the aborted wait went back to the pool
        assert!(engine.pool_mut().unwrap()
            .acquire_free(Duration::from_millis(1), Default::default())
            .is_ok());
    }

    #[test]
    fn test_overrun_faults_engine() {
        let sim = SimCard::new();
        sim.set_overrun_after(0);
        let (mut engine, mut device) = armed_engine(&sim);
        engine.start(&mut device).unwrap();
        let stop = AtomicBool::new(false);
        let result = engine.next_record(&mut device, &stop);
        assert!(matches!(result, Err(Error::Overrun)));
        assert_eq!(engine.state(), SessionState::Faulted);
        // a fault is latched across halt() and only cleared by reset()
        engine.halt(&mut device);
        assert_eq!(engine.state(), SessionState::Faulted);
        assert!(matches!(engine.arm(&AcquisitionPlan::new(
            &AcquisitionConfig::default()).unwrap()), Err(Error::Acquisition(_))));
        engine.reset(&mut device);
        assert_eq!(engine.state(), SessionState::Idle);
    }

    #[test]
    fn test_underrun_faults_engine() {
        let sim = SimCard::new();
        sim.set_underrun_after(0);
        let (mut engine, mut device) = armed_engine(&sim);
        engine.start(&mut device).unwrap();
        let stop = AtomicBool::new(false);
        let result = engine.next_record(&mut device, &stop);
        assert!(matches!(result, Err(Error::Underrun)));
        assert_eq!(engine.state(), SessionState::Faulted);
        engine.halt(&mut device);
        assert_eq!(engine.state(), SessionState::Faulted);
    }

    #[test]
    fn test_stalled_device_faults_as_underrun() {
        // the card flags UNDERRUN in its status register but never
        // completes the transfer; the status poll must catch it before
        // the wait is written off as a plain timeout
        let sim = SimCard::new();
        sim.set_stalled(true);
        let mut device = sim.open().unwrap();
        let config = AcquisitionConfig {
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let plan = AcquisitionPlan::new(&config).unwrap();
        device.configure(&plan, &Default::default()).unwrap();
        let mut engine = TransferEngine::new();
        engine.arm(&plan).unwrap();
        engine.start(&mut device).unwrap();
        let stop = AtomicBool::new(false);
        let result = engine.next_record(&mut device, &stop);
        assert!(matches!(result, Err(Error::Underrun)));
        assert_eq!(engine.state(), SessionState::Faulted);
    }

    #[test]
    fn test_wait_timeout_is_recoverable() {
        let sim = SimCard::new();
        sim.set_trace_interval(Duration::from_secs(3600));
        let mut device = sim.open().unwrap();
        let config = AcquisitionConfig {
            timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let plan = AcquisitionPlan::new(&config).unwrap();
        device.configure(&plan, &Default::default()).unwrap();
        let mut engine = TransferEngine::new();
        engine.arm(&plan).unwrap();
        engine.start(&mut device).unwrap();
        let stop = AtomicBool::new(false);
        let result = engine.next_record(&mut device, &stop);
        assert!(matches!(result, Err(Error::Timeout)));
        // recoverable: still running, caller decides whether to retry
        assert_eq!(engine.state(), SessionState::Running);
    }
}
