use spectrumdaq::{AcquisitionConfig, Card, SimCard, Termination, TriggerConfig};

fn main() -> spectrumdaq::Result<()> {
    env_logger::init();

    let sim = SimCard::new();
    let mut card = Card::open(sim.open()?);
    card.set_acquisition(&AcquisitionConfig {
        channels: vec![1],
        terminations: vec![Termination::Ohm1M],
        fullranges: vec![5.0],
        nsamples: 4096,
        ..Default::default()
    })?;
    card.set_trigger(TriggerConfig::default())?;

    let record = card.acquire()?;
    let (nsamples, nchannels) = record.shape();
    println!("acquired one record of {} samples x {} channels", nsamples, nchannels);
    println!("first 8 samples of channel 0:");
    for volts in record.channel(0).take(8) {
        println!("  {:+.6} V", volts);
    }
    card.close()
}
