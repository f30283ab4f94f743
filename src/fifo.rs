//! Continuous acquisition as a lazy, consumer-paced record stream.

use crate::card::Card;
use crate::device::DeviceHandle;
use crate::record::Record;
use crate::{Error, Result};

/// Iterator over the records of one continuous acquisition.
///
/// Each call to `next` blocks until the card has filled the next buffer, so
/// the stream is paced by the consumer; records arrive strictly in
/// acquisition order. The stream is finite when a trace limit is set and
/// unbounded otherwise. Dropping it (including breaking out of a `for`
/// loop) stops the device and releases all buffers; a stream is not
/// restartable, the session must be re-armed with a new `fifo()` call.
///
/// A [`Timeout`](Error::Timeout) is yielded as an error but does not end
/// the stream: the caller may keep iterating to retry the wait. All other
/// errors are fatal and terminate the stream after being yielded once.
#[derive(Debug)]
pub struct Fifo<'a, D: DeviceHandle> {
    card: &'a mut Card<D>,
    remaining: Option<usize>,
    finished: bool,
}

impl<'a, D: DeviceHandle> Fifo<'a, D> {
    pub(crate) fn new(card: &'a mut Card<D>, limit: Option<usize>) -> Fifo<'a, D> {
        Fifo { card, remaining: limit, finished: false }
    }

    /// Number of records still to be delivered, when bounded.
    pub fn remaining(&self) -> Option<usize> {
        self.remaining
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.card.end_stream();
            log::debug!("stream finished");
        }
    }
}

impl<'a, D: DeviceHandle> Iterator for Fifo<'a, D> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.remaining == Some(0) {
            self.finish();
            return None;
        }
        match self.card.stream_next() {
            Ok(Some(record)) => {
                if let Some(remaining) = &mut self.remaining {
                    *remaining -= 1;
                }
                Some(Ok(record))
            }
            Ok(None) => {
                // stop requested; not an error
                self.finish();
                None
            }
            Err(Error::Timeout) => {
                // recoverable: the caller decides whether to keep waiting
                Some(Err(Error::Timeout))
            }
            Err(error) => {
                self.finish();
                Some(Err(error))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match (self.finished, self.remaining) {
            (true, _) => (0, Some(0)),
            (false, Some(remaining)) => (0, Some(remaining)),
            (false, None) => (0, None),
        }
    }
}

impl<'a, D: DeviceHandle> Drop for Fifo<'a, D> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::config::{AcquisitionConfig, Mode};
    use crate::sim::SimCard;
    use crate::transfer::SessionState;

    fn streaming_card(sim: &SimCard) -> Card<crate::sim::SimDevice> {
        let mut card = Card::open(sim.open().unwrap());
        card.set_acquisition(&AcquisitionConfig {
            nsamples: 2048,
            mode: Mode::FifoSingle,
            ..Default::default()
        }).unwrap();
        card
    }

    #[test]
    fn test_bounded_stream_is_exact() {
        let sim = SimCard::new();
        let mut card = streaming_card(&sim);
        let records: Vec<_> = card.fifo(Some(3)).unwrap()
            .map(|record| record.unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(card.state(), SessionState::Idle);
    }

    #[test]
    fn test_size_hint_tracks_limit() {
        let sim = SimCard::new();
        let mut card = streaming_card(&sim);
        let mut stream = card.fifo(Some(2)).unwrap();
        assert_eq!(stream.size_hint(), (0, Some(2)));
        stream.next().unwrap().unwrap();
        assert_eq!(stream.size_hint(), (0, Some(1)));
    }

    #[test]
    fn test_timeout_does_not_end_stream() {
        let sim = SimCard::new();
        sim.set_trace_interval(Duration::from_millis(80));
        let mut card = Card::open(sim.open().unwrap());
        card.set_acquisition(&AcquisitionConfig {
            nsamples: 2048,
            mode: Mode::FifoSingle,
            timeout: Duration::from_millis(30),
            ..Default::default()
        }).unwrap();

        let mut stream = card.fifo(Some(1)).unwrap();
        let mut timeouts = 0;
        let record = loop {
            match stream.next() {
                Some(Err(Error::Timeout)) => timeouts += 1,
                Some(Ok(record)) => break record,
                other => panic!("unexpected stream item: {:?}", other),
            }
        };
        assert!(timeouts >= 1);
        assert_eq!(record.shape(), (2048, 1));
    }
}
