use std::time::{Duration, Instant};

use spectrumdaq::{AcquisitionConfig, Card, Mode, SimCard, TriggerConfig};

const NTRACES: usize = 100;

fn main() -> spectrumdaq::Result<()> {
    env_logger::init();

    let sim = SimCard::new();
    let samplerate = 30_000_000;
    let nsamples = 409_600;
    // emulate the real-time rate of the card
    sim.set_trace_interval(Duration::from_secs_f64(nsamples as f64 / samplerate as f64));

    let mut card = Card::open(sim.open()?);
    card.set_acquisition(&AcquisitionConfig {
        channels: vec![1],
        fullranges: vec![5.0],
        nsamples,
        samplerate,
        mode: Mode::FifoSingle,
        ..Default::default()
    })?;
    card.set_trigger(TriggerConfig::default())?;

    let started = Instant::now();
    let mut count = 0;
    for record in card.fifo(Some(NTRACES))? {
        let record = record?;
        count += 1;
        if count % 20 == 0 {
            println!("trace {:3}: first sample {:+.6} V", count, record.sample(0, 0));
        }
    }
    let read_time = started.elapsed().as_secs_f64();

    let sample_time = NTRACES as f64 * nsamples as f64 / samplerate as f64;
    println!("sampling time of the data: {:.3} s", sample_time);
    println!("total data reading time:   {:.3} s", read_time);
    println!("ratio of the two:          {:.4}", read_time / sample_time);
    card.close()
}
