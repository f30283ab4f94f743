//! The acquisition session: a `Card` owns one device handle exclusively and
//! orchestrates configuration, arming, transfer, and teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{AcquisitionConfig, AcquisitionPlan, Mode, TriggerConfig};
use crate::device::{DeviceCalibration, DeviceHandle};
use crate::fifo::Fifo;
use crate::record::Record;
use crate::transfer::{SessionState, TransferEngine};
use crate::{Error, Result};

/// Cancellation flag for a session. Cloneable and thread-safe; raising it
/// unblocks an in-flight buffer wait and ends the current stream.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }
}

/// An acquisition session on one digitizer.
///
/// The session is a state machine: `Idle` after open, `Running` while a
/// transfer is in flight, `Faulted` after a data-loss fault until an
/// explicit [`stop`](Card::stop). Holding the device handle by value makes
/// device sharing impossible by construction; concurrent opens of the same
/// physical card are rejected by the handle itself with
/// [`Error::DeviceBusy`].
#[derive(Debug)]
pub struct Card<D: DeviceHandle> {
    device: D,
    plan: Option<AcquisitionPlan>,
    trigger: TriggerConfig,
    calibration: Option<DeviceCalibration>,
    engine: TransferEngine,
    stop: Arc<AtomicBool>,
    closed: bool,
}

impl<D: DeviceHandle> Card<D> {
    /// Takes exclusive ownership of an opened device.
    pub fn open(device: D) -> Card<D> {
        log::info!("session opened");
        Card {
            device,
            plan: None,
            trigger: TriggerConfig::default(),
            calibration: None,
            engine: TransferEngine::new(),
            stop: Arc::new(AtomicBool::new(false)),
            closed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.engine.state()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { flag: self.stop.clone() }
    }

    fn check_not_faulted(&self) -> Result<()> {
        if self.engine.state() == SessionState::Faulted {
            return Err(Error::Acquisition(
                "session is faulted: call stop() before reuse".into()));
        }
        Ok(())
    }

    /// Validates and stores a new acquisition plan, replacing any prior one.
    /// Touches no hardware; the plan is applied at arm time.
    pub fn set_acquisition(&mut self, config: &AcquisitionConfig) -> Result<()> {
        self.check_not_faulted()?;
        let plan = AcquisitionPlan::new(config)?;
        log::debug!("acquisition set: {} channels, {} samples at {} Hz, {:?}",
            plan.nchannels(), plan.nsamples(), plan.samplerate(), plan.mode());
        self.plan = Some(plan);
        self.calibration = None;
        Ok(())
    }

    /// Validates and stores the trigger settings.
    pub fn set_trigger(&mut self, trigger: TriggerConfig) -> Result<()> {
        self.check_not_faulted()?;
        trigger.check(self.plan.as_ref())?;
        log::debug!("trigger set: {:?}", trigger);
        self.trigger = trigger;
        Ok(())
    }

    /// Performs one single-shot acquisition: arms, starts, blocks until one
    /// record completes (bounded by the configured timeout), stops the card,
    /// and returns the calibrated record.
    pub fn acquire(&mut self) -> Result<Record> {
        self.check_not_faulted()?;
        let plan = self.plan.as_ref()
            .ok_or_else(|| Error::config("no acquisition configured"))?;
        if plan.mode() != Mode::Single {
            return Err(Error::config(
                "acquire() requires single mode; use fifo() for streaming"));
        }
        self.trigger.check(Some(plan))?;
        self.stop.store(false, Ordering::Relaxed);

        let calibration = self.device.configure(plan, &self.trigger)?;
        self.engine.arm(plan)?;
        self.calibration = Some(calibration);
        if let Err(error) = self.engine.start(&mut self.device) {
            self.engine.halt(&mut self.device);
            return Err(error);
        }
        log::info!("single acquisition started");

        let result = self.stream_next();
        self.engine.halt(&mut self.device);
        match result {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(Error::Acquisition("acquisition was stopped".into())),
            Err(error) => Err(error),
        }
    }

    /// Starts continuous acquisition and returns the record stream.
    ///
    /// `limit` bounds the number of records; `None` defers to the plan's
    /// trace count. The stream holds the session borrowed until it is
    /// dropped, which stops the device and releases all buffers even when
    /// consumption ends early.
    pub fn fifo(&mut self, limit: Option<usize>) -> Result<Fifo<'_, D>> {
        self.check_not_faulted()?;
        let plan = self.plan.as_ref()
            .ok_or_else(|| Error::config("no acquisition configured"))?;
        if !plan.mode().is_fifo() {
            return Err(Error::config(
                "fifo() requires a FIFO mode; use acquire() for single records"));
        }
        self.trigger.check(Some(plan))?;
        let limit = limit.or(plan.ntraces().limit());
        if plan.mode() == Mode::FifoMulti && limit.is_none() {
            return Err(Error::config(
                "fifo_multi requires a bounded trace count: every trace \
                 consumes one external trigger event"));
        }
        self.stop.store(false, Ordering::Relaxed);

        let calibration = self.device.configure(plan, &self.trigger)?;
        self.engine.arm(plan)?;
        self.calibration = Some(calibration);
        if let Err(error) = self.engine.start(&mut self.device) {
            self.engine.halt(&mut self.device);
            return Err(error);
        }
        log::info!("streaming started, limit {:?}", limit);
        Ok(Fifo::new(self, limit))
    }

    /// Stops any transfer, releases all buffers, and clears a latched fault.
    /// Safe to call in any state; idempotent.
    pub fn stop(&mut self) {
        self.engine.reset(&mut self.device);
        self.stop.store(false, Ordering::Relaxed);
    }

    /// Stops any transfer and releases the device. Also performed on drop;
    /// calling it explicitly surfaces the device's close error, if any.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.engine.reset(&mut self.device);
        log::info!("session closed");
        self.device.close()
    }

    /// Transfers and decodes the next record, or `Ok(None)` when stopped.
    pub(crate) fn stream_next(&mut self) -> Result<Option<Record>> {
        let Some(id) = self.engine.next_record(&mut self.device, &self.stop)? else {
            return Ok(None);
        };
        let (nsamples, nchannels) = match self.plan.as_ref() {
            Some(plan) => (plan.nsamples(), plan.nchannels()),
            None => return Err(Error::Acquisition("no acquisition configured".into())),
        };
        let Some(calibration) = self.calibration.as_ref() else {
            return Err(Error::Acquisition("device calibration is missing".into()));
        };
        let Some(pool) = self.engine.pool_mut() else {
            return Err(Error::Acquisition("no transfer buffers".into()));
        };
        let raw = pool.take_ready(id);
        let record = Record::decode(raw, calibration, nsamples, nchannels);
        pool.release(id);
        Ok(Some(record))
    }

    /// Ends a stream: stops the device and releases buffers, keeping a
    /// latched fault so reuse still requires an explicit stop.
    pub(crate) fn end_stream(&mut self) {
        self.engine.halt(&mut self.device);
        self.stop.store(false, Ordering::Relaxed);
    }
}

impl<D: DeviceHandle> Drop for Card<D> {
    fn drop(&mut self) {
        if let Err(error) = self.close_inner() {
            log::error!("failed to close device: {}", error);
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::config::{TraceCount, TriggerMode};
    use crate::sim::{sim_code, SimCard};

    fn fifo_config(mode: Mode) -> AcquisitionConfig {
        AcquisitionConfig {
            nsamples: 2048,
            mode,
            ..Default::default()
        }
    }

    #[test]
    fn test_acquire_shape_and_channel_order() {
        let sim = SimCard::new();
        let mut card = Card::open(sim.open().unwrap());
        card.set_acquisition(&AcquisitionConfig {
            channels: vec![2, 0],
            terminations: vec![Default::default(); 2],
            fullranges: vec![2.0, 10.0],
            nsamples: 256,
            ..Default::default()
        }).unwrap();
        let record = card.acquire().unwrap();
        assert_eq!(record.shape(), (256, 2));
        // column order matches the configured channel list, not index order
        let scale2 = 2.0 / crate::config::MAX_ADC_CODE as f64;
        let scale0 = 10.0 / crate::config::MAX_ADC_CODE as f64;
        assert_eq!(record.sample(0, 0), sim_code(2, 0) as f64 * scale2);
        assert_eq!(record.sample(0, 1), sim_code(0, 0) as f64 * scale0);
        assert_eq!(record.sample(5, 0), sim_code(2, 5) as f64 * scale2);
        assert_eq!(card.state(), SessionState::Idle);
    }

    #[test]
    fn test_acquire_requires_plan() {
        let sim = SimCard::new();
        let mut card = Card::open(sim.open().unwrap());
        assert!(matches!(card.acquire(), Err(Error::Config(_))));
    }

    #[test]
    fn test_acquire_rejects_fifo_plan() {
        let sim = SimCard::new();
        let mut card = Card::open(sim.open().unwrap());
        card.set_acquisition(&fifo_config(Mode::FifoSingle)).unwrap();
        assert!(matches!(card.acquire(), Err(Error::Config(_))));
        assert!(matches!(card.fifo(Some(1)), Ok(_)));
    }

    #[test]
    fn test_invalid_config_makes_no_hardware_call() {
        let sim = SimCard::new();
        let mut card = Card::open(sim.open().unwrap());
        let result = card.set_acquisition(&AcquisitionConfig {
            channels: vec![0, 1, 2],
            terminations: vec![Default::default(); 2],
            fullranges: vec![10.0; 3],
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(sim.configure_calls(), 0);
        assert_eq!(sim.start_calls(), 0);
    }

    #[test]
    fn test_software_trigger_rejected_for_fifo_multi() {
        let sim = SimCard::new();
        let mut card = Card::open(sim.open().unwrap());
        card.set_acquisition(&fifo_config(Mode::FifoMulti)).unwrap();
        let result = card.set_trigger(TriggerConfig {
            mode: TriggerMode::Software,
            ..Default::default()
        });
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(sim.configure_calls(), 0);
    }

    #[test]
    fn test_fifo_multi_yields_exact_trace_count() {
        let sim = SimCard::new();
        let mut card = Card::open(sim.open().unwrap());
        card.set_acquisition(&AcquisitionConfig {
            ntraces: TraceCount::Count(50),
            ..fifo_config(Mode::FifoMulti)
        }).unwrap();
        card.set_trigger(TriggerConfig {
            mode: TriggerMode::External,
            ..Default::default()
        }).unwrap();

        let mut stream = card.fifo(None).unwrap();
        let mut count = 0;
        for record in &mut stream {
            let record = record.unwrap();
            assert_eq!(record.shape(), (2048, 1));
            count += 1;
        }
        assert_eq!(count, 50);
        assert!(stream.next().is_none());
        drop(stream);
        assert_eq!(card.state(), SessionState::Idle);
    }

    #[test]
    fn test_fifo_multi_requires_bounded_traces() {
        let sim = SimCard::new();
        let mut card = Card::open(sim.open().unwrap());
        card.set_acquisition(&fifo_config(Mode::FifoMulti)).unwrap();
        card.set_trigger(TriggerConfig {
            mode: TriggerMode::External,
            ..Default::default()
        }).unwrap();
        assert!(matches!(card.fifo(None), Err(Error::Config(_))));
        assert!(card.fifo(Some(1)).is_ok());
    }

    #[test]
    fn test_early_break_releases_session() {
        let sim = SimCard::new();
        let mut card = Card::open(sim.open().unwrap());
        card.set_acquisition(&fifo_config(Mode::FifoSingle)).unwrap();
        {
            let mut stream = card.fifo(None).unwrap();
            for _ in 0..5 {
                stream.next().unwrap().unwrap();
            }
            // breaking out mid-stream; Drop must stop the device
        }
        assert_eq!(card.state(), SessionState::Idle);

        // the session is immediately reusable for a single acquisition
        card.set_acquisition(&AcquisitionConfig {
            nsamples: 256,
            ..Default::default()
        }).unwrap();
        assert_eq!(card.acquire().unwrap().shape(), (256, 1));
    }

    #[test]
    fn test_overrun_faults_session_until_stop() {
        let sim = SimCard::new();
        sim.set_overrun_after(10);
        let mut card = Card::open(sim.open().unwrap());
        card.set_acquisition(&fifo_config(Mode::FifoSingle)).unwrap();

        let mut stream = card.fifo(None).unwrap();
        for _ in 0..10 {
            assert!(stream.next().unwrap().is_ok());
        }
        assert!(matches!(stream.next(), Some(Err(Error::Overrun))));
        assert!(stream.next().is_none());
        drop(stream);
        assert_eq!(card.state(), SessionState::Faulted);

        // a faulted session rejects everything until an explicit stop
        assert!(matches!(card.acquire(), Err(Error::Acquisition(_))));
        assert!(matches!(
            card.set_acquisition(&AcquisitionConfig::default()),
            Err(Error::Acquisition(_))));

        sim.set_overrun_after(usize::MAX);
        card.stop();
        assert_eq!(card.state(), SessionState::Idle);
        card.set_acquisition(&AcquisitionConfig {
            nsamples: 256,
            ..Default::default()
        }).unwrap();
        assert!(card.acquire().is_ok());
    }

    #[test]
    fn test_stop_handle_unblocks_stream() {
        let sim = SimCard::new();
        sim.set_trace_interval(Duration::from_millis(5));
        let mut card = Card::open(sim.open().unwrap());
        card.set_acquisition(&fifo_config(Mode::FifoSingle)).unwrap();

        let handle = card.stop_handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(40));
            handle.stop();
        });

        let count = card.fifo(None).unwrap()
            .map(|record| record.unwrap())
            .count();
        stopper.join().unwrap();
        assert!(count >= 1);
        assert_eq!(card.state(), SessionState::Idle);
    }

    #[test]
    fn test_close_is_safe_in_any_state() {
        let sim = SimCard::new();
        sim.set_overrun_after(0);
        let mut card = Card::open(sim.open().unwrap());
        card.set_acquisition(&fifo_config(Mode::FifoSingle)).unwrap();
        let mut stream = card.fifo(None).unwrap();
        assert!(matches!(stream.next(), Some(Err(Error::Overrun))));
        drop(stream);
        card.close().unwrap();
        // the device was released on close
        assert!(sim.open().is_ok());
    }
}
