//! Validation of channel, trigger, and acquisition settings.
//!
//! Nothing in this module talks to hardware. Settings are collected in plain
//! structs and checked in one place, [`AcquisitionPlan::new`]; the resulting
//! plan is an immutable snapshot consumed by the transfer engine at arm time.

use std::time::Duration;

use crate::{Error, Result};

/// Number of analog input channels on the card.
pub const NUM_CHANNELS: usize = 4;

/// Base sample clock in Hz. A requested sample rate is achievable only if it
/// divides the base clock evenly (integer clock divider).
pub const BASE_CLOCK_HZ: u64 = 30_000_000;

/// Largest ADC code of the 16-bit converter; the divisor for the
/// volts-per-code conversion.
pub const MAX_ADC_CODE: i32 = 32768;

/// Supported full-scale input ranges, in millivolts. Compared as integers to
/// avoid float equality on user input.
pub const FULLRANGES_MV: [u32; 6] = [200, 500, 1000, 2000, 5000, 10000];

/// Record lengths must be a multiple of this in every mode.
const RECORD_ALIGN: usize = 4;

/// In FIFO modes the hardware segments transfers in units of this many
/// samples; record lengths are rounded up to a multiple.
const FIFO_ALIGN: usize = 2048;

/// Number of external trigger connectors.
const NUM_EXT_TRIGGERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Termination {
    #[default]
    Ohm1M,
    Ohm50,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Edge {
    #[default]
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// Free-running: the card triggers itself as soon as it is armed.
    #[default]
    Software,
    /// Edge on one of the external trigger connectors.
    External,
    /// Level crossing on one of the input channels.
    ChannelLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Exactly one triggered record; the card is disarmed afterwards.
    #[default]
    Single,
    /// One continuous stream segmented only by buffer boundaries.
    FifoSingle,
    /// One new trigger event is required per trace.
    FifoMulti,
}

impl Mode {
    pub fn is_fifo(self) -> bool {
        !matches!(self, Mode::Single)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceCount {
    #[default]
    Unbounded,
    Count(usize),
}

impl TraceCount {
    pub fn limit(self) -> Option<usize> {
        match self {
            TraceCount::Unbounded => None,
            TraceCount::Count(count) => Some(count),
        }
    }
}

/// What the transfer engine does when no free buffer is available while the
/// hardware has more data ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressurePolicy {
    /// Wait for a buffer to be released, up to the acquisition timeout.
    /// The hardware FIFO absorbs the delay as long as its depth permits.
    #[default]
    Block,
    /// Fail immediately with [`Error::Overrun`].
    Overrun,
}

/// Validated settings of one enabled channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub index: usize,
    pub termination: Termination,
    pub fullrange_mv: u32,
}

impl ChannelConfig {
    pub fn fullrange_volts(&self) -> f64 {
        self.fullrange_mv as f64 / 1000.0
    }
}

/// Acquisition settings as supplied by the caller, prior to validation.
///
/// The three per-channel lists must have the same length; channel order here
/// determines the column order of every produced [`Record`](crate::Record).
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionConfig {
    pub channels: Vec<usize>,
    pub terminations: Vec<Termination>,
    /// Full-scale ranges in volts, one per channel.
    pub fullranges: Vec<f64>,
    /// Fraction of each record sampled before the trigger event, 0.0 to 1.0.
    pub pretrig_ratio: f64,
    /// Samples per record, per channel.
    pub nsamples: usize,
    /// Sample rate in Hz; must divide [`BASE_CLOCK_HZ`].
    pub samplerate: u64,
    pub mode: Mode,
    pub ntraces: TraceCount,
    /// Bound on every blocking wait inside the driver.
    pub timeout: Duration,
    pub backpressure: BackpressurePolicy,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        AcquisitionConfig {
            channels: vec![0],
            terminations: vec![Termination::Ohm1M],
            fullranges: vec![10.0],
            pretrig_ratio: 0.0,
            nsamples: 4096,
            samplerate: BASE_CLOCK_HZ,
            mode: Mode::Single,
            ntraces: TraceCount::Unbounded,
            timeout: Duration::from_secs(10),
            backpressure: BackpressurePolicy::Block,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TriggerConfig {
    pub mode: TriggerMode,
    pub edge: Edge,
    /// Trigger level in volts. Required for [`TriggerMode::ChannelLevel`].
    pub level: Option<f64>,
    /// Source channel for [`TriggerMode::ChannelLevel`], or the connector
    /// index for [`TriggerMode::External`] (defaults to connector 0).
    pub source: Option<usize>,
}

impl TriggerConfig {
    /// Checks mode-specific required fields, and compatibility with the
    /// acquisition plan when one is already set.
    pub fn check(&self, plan: Option<&AcquisitionPlan>) -> Result<()> {
        match self.mode {
            TriggerMode::Software => {
                if plan.is_some_and(|plan| plan.mode() == Mode::FifoMulti) {
                    return Err(Error::config(
                        "software trigger cannot drive fifo_multi: each trace \
                         requires an externally clocked trigger event"));
                }
            }
            TriggerMode::External => {
                let connector = self.source.unwrap_or(0);
                if connector >= NUM_EXT_TRIGGERS {
                    return Err(Error::config(format!(
                        "external trigger connector {} is invalid", connector)));
                }
            }
            TriggerMode::ChannelLevel => {
                let level = self.level.ok_or_else(|| Error::config(
                    "channel-level trigger requires a level"))?;
                let source = self.source.ok_or_else(|| Error::config(
                    "channel-level trigger requires a source channel"))?;
                if let Some(plan) = plan {
                    let channel = plan.channels().iter()
                        .find(|channel| channel.index == source)
                        .ok_or_else(|| Error::config(format!(
                            "trigger source channel {} is not enabled", source)))?;
                    // The trigger comparator works on ADC codes, so the level
                    // is only meaningful within the channel's input range.
                    if level.abs() >= channel.fullrange_volts() {
                        return Err(Error::config(format!(
                            "trigger level {} V is outside the ±{} V input range",
                            level, channel.fullrange_volts())));
                    }
                } else if source >= NUM_CHANNELS {
                    return Err(Error::config(format!(
                        "trigger source channel {} is invalid", source)));
                }
            }
        }
        Ok(())
    }
}

/// Immutable snapshot of one validated acquisition setup.
///
/// Created once per `set_acquisition` call and consumed by the transfer
/// engine at arm time; replacing it never affects a transfer in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionPlan {
    channels: Vec<ChannelConfig>,
    nsamples: usize,
    samplerate: u64,
    pretrig_samples: usize,
    mode: Mode,
    ntraces: TraceCount,
    timeout: Duration,
    backpressure: BackpressurePolicy,
}

impl AcquisitionPlan {
    pub fn new(config: &AcquisitionConfig) -> Result<AcquisitionPlan> {
        if config.channels.is_empty() {
            return Err(Error::config("at least one channel must be enabled"));
        }
        if config.terminations.len() != config.channels.len()
                || config.fullranges.len() != config.channels.len() {
            return Err(Error::config(format!(
                "channels, terminations and fullranges must have the same \
                 length (got {}, {}, {})",
                config.channels.len(), config.terminations.len(),
                config.fullranges.len())));
        }

        let mut seen = [false; NUM_CHANNELS];
        let mut channels = Vec::with_capacity(config.channels.len());
        for (position, &index) in config.channels.iter().enumerate() {
            if index >= NUM_CHANNELS {
                return Err(Error::config(format!(
                    "channel {} is invalid: the card has channels 0..{}",
                    index, NUM_CHANNELS)));
            }
            if seen[index] {
                return Err(Error::config(format!(
                    "channel {} is listed more than once", index)));
            }
            seen[index] = true;
            let fullrange_mv = (config.fullranges[position] * 1000.0).round() as i64;
            let fullrange_mv = FULLRANGES_MV.iter().copied()
                .find(|&valid| valid as i64 == fullrange_mv)
                .ok_or_else(|| Error::config(format!(
                    "full range {} V is unsupported; valid ranges are \
                     0.2, 0.5, 1, 2, 5 and 10 V",
                    config.fullranges[position])))?;
            channels.push(ChannelConfig {
                index,
                termination: config.terminations[position],
                fullrange_mv,
            });
        }

        if !(0.0..=1.0).contains(&config.pretrig_ratio) {
            return Err(Error::config(format!(
                "pretrigger ratio {} is outside 0.0..=1.0", config.pretrig_ratio)));
        }

        if config.nsamples == 0 || config.nsamples % RECORD_ALIGN != 0 {
            return Err(Error::config(format!(
                "record length {} is not a positive multiple of {} samples",
                config.nsamples, RECORD_ALIGN)));
        }
        if config.nsamples < 2 * RECORD_ALIGN {
            return Err(Error::config(format!(
                "record length {} is too short: at least {} samples must \
                 lie on each side of the trigger",
                config.nsamples, RECORD_ALIGN)));
        }
        let mut nsamples = config.nsamples;
        if config.mode.is_fifo() && nsamples % FIFO_ALIGN != 0 {
            nsamples = (nsamples / FIFO_ALIGN + 1) * FIFO_ALIGN;
            log::warn!("record length rounded up from {} to {} samples: \
                        FIFO transfers are segmented in units of {}",
                       config.nsamples, nsamples, FIFO_ALIGN);
        }

        if config.samplerate == 0 || BASE_CLOCK_HZ % config.samplerate != 0 {
            return Err(Error::config(format!(
                "sample rate {} Hz is not achievable: it must divide the \
                 {} Hz base clock", config.samplerate, BASE_CLOCK_HZ)));
        }

        if config.ntraces == TraceCount::Count(0) {
            return Err(Error::config("trace count must be positive"));
        }

        let record_time = Duration::from_secs_f64(
            nsamples as f64 / config.samplerate as f64);
        if record_time >= config.timeout {
            return Err(Error::config(format!(
                "timeout {:?} is shorter than the {:?} acquisition time of \
                 one record", config.timeout, record_time)));
        }

        // The posttrigger register counts in units of 4 samples and at least
        // 4 samples must lie on each side of the trigger.
        let pretrig_samples = ((nsamples as f64 * config.pretrig_ratio) as usize
            / RECORD_ALIGN * RECORD_ALIGN)
            .clamp(RECORD_ALIGN, nsamples - RECORD_ALIGN);

        Ok(AcquisitionPlan {
            channels,
            nsamples,
            samplerate: config.samplerate,
            pretrig_samples,
            mode: config.mode,
            ntraces: config.ntraces,
            timeout: config.timeout,
            backpressure: config.backpressure,
        })
    }

    /// Enabled channels in the order they were configured, which is also the
    /// column order of every produced record.
    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    pub fn nchannels(&self) -> usize {
        self.channels.len()
    }

    /// Samples per record, per channel.
    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    pub fn samplerate(&self) -> u64 {
        self.samplerate
    }

    pub fn pretrig_samples(&self) -> usize {
        self.pretrig_samples
    }

    pub fn posttrig_samples(&self) -> usize {
        self.nsamples - self.pretrig_samples
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn ntraces(&self) -> TraceCount {
        self.ntraces
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn backpressure(&self) -> BackpressurePolicy {
        self.backpressure
    }

    /// Total samples in one record across all enabled channels.
    pub fn record_samples(&self) -> usize {
        self.nsamples * self.channels.len()
    }

    /// Size of one record in bytes (two bytes per raw sample).
    pub fn record_bytes(&self) -> usize {
        self.record_samples() * 2
    }

    /// Number of host buffers allocated at arm time. Streaming needs at
    /// least two so the card can fill one while the host drains the other.
    pub fn buffer_count(&self) -> usize {
        match self.mode {
            Mode::Single => 1,
            Mode::FifoSingle | Mode::FifoMulti => 4,
        }
    }
}
