//! The capability through which the core drives a physical card.
//!
//! All register and ioctl detail lives behind [`DeviceHandle`]; the core
//! never talks to the hardware directly. [`SimCard`](crate::SimCard)
//! provides an in-tree implementation for tests and demos.

use std::time::Duration;

use bitflags::bitflags;

use crate::config::{AcquisitionPlan, TriggerConfig};
use crate::Result;

bitflags! {
    /// Status word reported by the card alongside each transfer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CardStatus: u32 {
        /// A complete buffer is available on the host side.
        const READY     = 1<<0;
        /// The trigger event for the current record has been seen.
        const TRIGGERED = 1<<1;
        /// The card wrapped its FIFO before the host read the data out.
        const OVERRUN   = 1<<4;
        /// The host requested data the card has not produced.
        const UNDERRUN  = 1<<5;
    }
}

impl CardStatus {
    /// True if the status signals a data-loss condition that is fatal to
    /// the current run.
    pub fn has_fault(self) -> bool {
        self.intersects(CardStatus::OVERRUN | CardStatus::UNDERRUN)
    }
}

/// Raw-code-to-volts conversion for the enabled channels, read back from the
/// device at configuration time. Entries follow the configured channel order.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceCalibration {
    /// Volts per ADC code.
    pub scales: Vec<f64>,
    /// Offset in volts added after scaling.
    pub offsets: Vec<f64>,
}

impl DeviceCalibration {
    pub fn nchannels(&self) -> usize {
        self.scales.len()
    }

    /// Converts a raw code from column `channel` to volts.
    pub fn volts(&self, channel: usize, code: i16) -> f64 {
        code as f64 * self.scales[channel] + self.offsets[channel]
    }

    /// Converts volts back to the nearest raw code for column `channel`.
    pub fn code(&self, channel: usize, volts: f64) -> i16 {
        ((volts - self.offsets[channel]) / self.scales[channel]).round() as i16
    }
}

/// Exclusive handle to one physical digitizer.
///
/// Implementations wrap the vendor driver's wait primitive: a call to
/// [`wait_for_buffer`](DeviceHandle::wait_for_buffer) blocks until the
/// transfer of one record into `data` has completed, the timeout elapses
/// (`Err(Timeout)`), or a fault is detected (reported through the returned
/// status, not as an error, so the caller can decide what is fatal).
pub trait DeviceHandle {
    /// Writes channel, clock, trigger, and transfer settings to the card and
    /// reads back the resulting calibration. No acquisition is started.
    fn configure(&mut self, plan: &AcquisitionPlan, trigger: &TriggerConfig)
        -> Result<DeviceCalibration>;

    /// Starts the card and enables the trigger.
    fn start(&mut self) -> Result<()>;

    /// Stops any acquisition in progress. Idempotent.
    fn stop(&mut self) -> Result<()>;

    /// Blocks until the card has filled `data` with one complete record.
    fn wait_for_buffer(&mut self, data: &mut [i16], timeout: Duration)
        -> Result<CardStatus>;

    /// Reads the current status word without waiting.
    fn read_status(&mut self) -> Result<CardStatus>;

    /// Releases the device. Called once by the owning session.
    fn close(&mut self) -> Result<()>;
}
