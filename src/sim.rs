//! A simulated digitizer for tests and demos.
//!
//! [`SimCard`] stands in for one physical card: it enforces exclusive
//! ownership the same way the vendor driver does (a second open fails while
//! a handle is alive), emulates the acquisition rate with real delays, and
//! can inject an overrun at a chosen record. Sample data is a deterministic
//! function of the physical channel index and sample position, so shape and
//! ordering tests can check exact values.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::config::{AcquisitionPlan, TriggerConfig, MAX_ADC_CODE};
use crate::device::{CardStatus, DeviceCalibration, DeviceHandle};
use crate::{Error, Result};

/// The deterministic raw code produced by the simulated card for a given
/// physical channel and sample position.
pub fn sim_code(channel: usize, sample: usize) -> i16 {
    (channel as i16 + 1) * 1000 + (sample % 997) as i16
}

#[derive(Debug)]
struct Shared {
    claimed: AtomicBool,
    configure_calls: AtomicUsize,
    start_calls: AtomicUsize,
    trace_interval_nanos: AtomicU64,
    // usize::MAX means "never"
    overrun_after: AtomicUsize,
    underrun_after: AtomicUsize,
    stalled: AtomicBool,
}

/// One simulated physical card. Cloning the handle does not clone the card;
/// all clones refer to the same device and the same exclusivity claim.
#[derive(Debug, Clone)]
pub struct SimCard {
    shared: Arc<Shared>,
}

impl SimCard {
    pub fn new() -> SimCard {
        SimCard {
            shared: Arc::new(Shared {
                claimed: AtomicBool::new(false),
                configure_calls: AtomicUsize::new(0),
                start_calls: AtomicUsize::new(0),
                trace_interval_nanos: AtomicU64::new(0),
                overrun_after: AtomicUsize::new(usize::MAX),
                underrun_after: AtomicUsize::new(usize::MAX),
                stalled: AtomicBool::new(false),
            }),
        }
    }

    /// Claims the card. Fails with [`Error::DeviceBusy`] while another
    /// [`SimDevice`] from this card is alive.
    pub fn open(&self) -> Result<SimDevice> {
        if self.shared.claimed.compare_exchange(
                false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(Error::DeviceBusy);
        }
        log::debug!("sim: card claimed");
        Ok(SimDevice {
            shared: self.shared.clone(),
            channels: Vec::new(),
            nsamples: 0,
            running: false,
            filled: 0,
            next_due: Instant::now(),
            status: CardStatus::empty(),
            closed: false,
        })
    }

    /// Emulated sampling time of one record. Zero (the default) produces
    /// records as fast as they are requested.
    pub fn set_trace_interval(&self, interval: Duration) {
        self.shared.trace_interval_nanos
            .store(interval.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Signals OVERRUN on the wait following `count` successful records.
    pub fn set_overrun_after(&self, count: usize) {
        self.shared.overrun_after.store(count, Ordering::Relaxed);
    }

    /// Signals UNDERRUN on the wait following `count` successful records.
    pub fn set_underrun_after(&self, count: usize) {
        self.shared.underrun_after.store(count, Ordering::Relaxed);
    }

    /// Stops producing data: waits time out and the status register latches
    /// UNDERRUN, as on a card whose clock or trigger source went away.
    pub fn set_stalled(&self, stalled: bool) {
        self.shared.stalled.store(stalled, Ordering::Relaxed);
    }

    /// Number of `configure` calls made on devices from this card.
    pub fn configure_calls(&self) -> usize {
        self.shared.configure_calls.load(Ordering::Relaxed)
    }

    /// Number of `start` calls made on devices from this card.
    pub fn start_calls(&self) -> usize {
        self.shared.start_calls.load(Ordering::Relaxed)
    }
}

impl Default for SimCard {
    fn default() -> Self {
        SimCard::new()
    }
}

#[derive(Debug)]
pub struct SimDevice {
    shared: Arc<Shared>,
    channels: Vec<usize>,
    nsamples: usize,
    running: bool,
    filled: usize,
    next_due: Instant,
    status: CardStatus,
    closed: bool,
}

impl SimDevice {
    fn trace_interval(&self) -> Duration {
        Duration::from_nanos(self.shared.trace_interval_nanos.load(Ordering::Relaxed))
    }
}

impl DeviceHandle for SimDevice {
    fn configure(&mut self, plan: &AcquisitionPlan, trigger: &TriggerConfig)
            -> Result<DeviceCalibration> {
        self.shared.configure_calls.fetch_add(1, Ordering::Relaxed);
        log::debug!("sim: configure {} channels, {} samples, {} Hz, trigger {:?}",
            plan.nchannels(), plan.nsamples(), plan.samplerate(), trigger.mode);
        self.channels = plan.channels().iter().map(|channel| channel.index).collect();
        self.nsamples = plan.nsamples();
        Ok(DeviceCalibration {
            scales: plan.channels().iter()
                .map(|channel| channel.fullrange_volts() / MAX_ADC_CODE as f64)
                .collect(),
            offsets: vec![0.0; plan.nchannels()],
        })
    }

    fn start(&mut self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(Error::Acquisition("sim: device is not configured".into()));
        }
        self.shared.start_calls.fetch_add(1, Ordering::Relaxed);
        self.running = true;
        self.filled = 0;
        self.status = CardStatus::empty();
        self.next_due = Instant::now() + self.trace_interval();
        log::debug!("sim: started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.running {
            log::debug!("sim: stopped after {} records", self.filled);
        }
        self.running = false;
        Ok(())
    }

    fn wait_for_buffer(&mut self, data: &mut [i16], timeout: Duration)
            -> Result<CardStatus> {
        if !self.running {
            return Err(Error::Acquisition("sim: device is not started".into()));
        }
        assert_eq!(data.len(), self.nsamples * self.channels.len());

        if self.filled >= self.shared.overrun_after.load(Ordering::Relaxed) {
            self.status = CardStatus::READY | CardStatus::OVERRUN;
            log::debug!("sim: signalling overrun at record {}", self.filled);
            return Ok(self.status);
        }
        if self.filled >= self.shared.underrun_after.load(Ordering::Relaxed) {
            self.status = CardStatus::READY | CardStatus::UNDERRUN;
            log::debug!("sim: signalling underrun at record {}", self.filled);
            return Ok(self.status);
        }
        if self.shared.stalled.load(Ordering::Relaxed) {
            self.status = CardStatus::UNDERRUN;
            std::thread::sleep(timeout);
            return Err(Error::Timeout);
        }

        // emulate the sampling time of one record
        let now = Instant::now();
        if self.next_due > now {
            let due_in = self.next_due - now;
            if due_in > timeout {
                std::thread::sleep(timeout);
                return Err(Error::Timeout);
            }
            std::thread::sleep(due_in);
        }

        for sample in 0..self.nsamples {
            for (position, &channel) in self.channels.iter().enumerate() {
                data[sample * self.channels.len() + position] = sim_code(channel, sample);
            }
        }
        self.filled += 1;
        self.next_due += self.trace_interval();
        self.status = CardStatus::READY | CardStatus::TRIGGERED;
        Ok(self.status)
    }

    fn read_status(&mut self) -> Result<CardStatus> {
        Ok(self.status)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.running = false;
            self.shared.claimed.store(false, Ordering::Release);
            log::debug!("sim: card released");
        }
        Ok(())
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
