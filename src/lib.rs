mod config;
mod device;
mod buffer;
mod record;
mod transfer;
mod card;
mod fifo;
mod sim;

#[derive(Debug)]
pub enum Error {
    /// Invalid or incompatible settings. Raised before any hardware call.
    Config(String),
    /// The device is already held by another session.
    DeviceBusy,
    /// The card wrote new data before the host released the previous buffer.
    Overrun,
    /// The host drained data faster than the card supplied it.
    Underrun,
    /// No transfer completed within the configured timeout.
    Timeout,
    /// A fatal hardware fault; the session must be stopped and re-armed.
    Acquisition(String),
    /// An error propagated from the underlying device handle.
    Device(Box<dyn std::error::Error + Sync + Send + 'static>),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Error {
        Error::Config(message.into())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Config(message) =>
                write!(f, "configuration error: {}", message),
            Self::DeviceBusy =>
                write!(f, "device is held by another session"),
            Self::Overrun =>
                write!(f, "acquisition overrun: sample data was lost"),
            Self::Underrun =>
                write!(f, "acquisition underrun: device supplied no data"),
            Self::Timeout =>
                write!(f, "no transfer completed within the timeout"),
            Self::Acquisition(message) =>
                write!(f, "acquisition error: {}", message),
            Self::Device(error) =>
                write!(f, "device error: {}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Device(ref error) => Some(error.as_ref()),
            _ => None
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Device(error.into())
    }
}

pub type Result<T> =
    core::result::Result<T, Error>;

pub use config::{
    Termination,
    Edge,
    TriggerMode,
    Mode,
    TraceCount,
    BackpressurePolicy,
    ChannelConfig,
    AcquisitionConfig,
    TriggerConfig,
    AcquisitionPlan,
    NUM_CHANNELS,
    BASE_CLOCK_HZ,
    MAX_ADC_CODE,
    FULLRANGES_MV,
};

pub use device::{
    DeviceHandle,
    DeviceCalibration,
    CardStatus,
};

pub use buffer::{
    BufferId,
    BufferState,
    BufferPool,
};

pub use record::Record;

pub use transfer::SessionState;

pub use card::{Card, StopHandle};

pub use fifo::Fifo;

pub use sim::{SimCard, SimDevice};
