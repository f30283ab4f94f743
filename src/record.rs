//! Calibrated sample records.

use crate::device::DeviceCalibration;

/// One complete block of samples across all enabled channels.
///
/// Stored row-major with shape `[nsamples, nchannels]`; the column order is
/// the order channels were listed in the acquisition configuration. Records
/// own their data and are immutable once decoded, so the hardware can reuse
/// the transfer buffer immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    data: Vec<f64>,
    nsamples: usize,
    nchannels: usize,
}

impl Record {
    /// Scales one raw interleaved record into volts using the per-channel
    /// calibration read back from the device.
    pub fn decode(raw: &[i16], calibration: &DeviceCalibration,
                  nsamples: usize, nchannels: usize) -> Record {
        assert_eq!(raw.len(), nsamples * nchannels);
        assert_eq!(calibration.nchannels(), nchannels);
        let mut data = Vec::with_capacity(raw.len());
        for row in raw.chunks_exact(nchannels) {
            for (channel, &code) in row.iter().enumerate() {
                data.push(calibration.volts(channel, code));
            }
        }
        Record { data, nsamples, nchannels }
    }

    /// Shape as `(nsamples, nchannels)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.nsamples, self.nchannels)
    }

    pub fn nsamples(&self) -> usize {
        self.nsamples
    }

    pub fn nchannels(&self) -> usize {
        self.nchannels
    }

    /// The voltage of sample `sample` on column `channel`.
    pub fn sample(&self, sample: usize, channel: usize) -> f64 {
        assert!(channel < self.nchannels);
        self.data[sample * self.nchannels + channel]
    }

    /// All channel values of one sample instant.
    pub fn row(&self, sample: usize) -> &[f64] {
        &self.data[sample * self.nchannels..][..self.nchannels]
    }

    /// The time series of one channel column.
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = f64> + '_ {
        assert!(channel < self.nchannels);
        self.data.iter().copied().skip(channel).step_by(self.nchannels)
    }

    /// The full record, row-major.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}
