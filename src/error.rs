use crate::ril::{RilError, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The peer answered with an error status.
    Ril(RilError),
    /// The request hit its deadline (after exhausting any retry policy).
    Timeout,
    /// The request was cancelled locally, or the channel went down
    /// while it was in flight.
    Cancelled,
    /// The response arrived but its body did not parse.
    Parse,
    /// A SIM I/O operation completed with a non-success status word.
    Sim { sw1: u8, sw2: u8 },
    /// A data call setup came back with this fail cause.
    CallFail(i32),
    /// No usable SIM application in the current card status.
    NoSim,
    /// The submission queue or a parcel buffer overflowed.
    Overflow,

    _Unknown,
}

impl From<RilError> for Error {
    fn from(e: RilError) -> Self {
        Error::Ril(e)
    }
}

impl Error {
    /// Folds a non-success status into an error. Callers that treat
    /// radio-not-available as an empty result check the status first.
    pub fn from_status(status: Status) -> Self {
        match status {
            Status::Ok => Error::_Unknown,
            Status::TimedOut => Error::Timeout,
            Status::Cancelled => Error::Cancelled,
            Status::Error(e) => Error::Ril(e),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
