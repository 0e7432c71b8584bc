use thiserror::Error;

/// Numeric result codes as understood by consumers that talk to the store through a C-like
/// boundary, e.g. a block device layer keeping one record per erase unit.
#[derive(strum::FromRepr, strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum ResultCode {
    Success = 0,
    ReadError = 1,
    WriteError = 2,
    NotFound = 3,
    DataCorrupt = 4,
    BadValue = 5,
    BuffTooSmall = 6,
    FlashAreaTooSmall = 7,
    OsError = 8,
    BuffNotAligned = 9,
    AlreadyExists = 10,
}

impl<T> From<&Result<T, Error>> for ResultCode {
    fn from(value: &Result<T, Error>) -> Self {
        match value {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }
}

/// Errors that can occur during store operations. Physical flash failures are never retried
/// internally, the caller decides whether to retry or to `reset()` the store.
#[derive(Error, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The partition offset has to be aligned to the erase size of the flash
    #[error("invalid partition offset")]
    InvalidPartitionOffset,

    /// The partition has to consist of two areas, each a multiple of the erase size
    #[error("invalid partition size")]
    InvalidPartitionSize,

    /// Read and write sizes of the flash have to be powers of two of at most 64 bytes
    #[error("unsupported flash geometry")]
    UnsupportedFlashGeometry,

    /// The flash returned an error on read
    #[error("flash read error")]
    ReadError,

    /// The flash returned an error on write or erase
    #[error("flash write error")]
    WriteError,

    /// No value was written for this type since the last reset, or it was removed.
    #[error("type not found")]
    NotFound,

    /// A record or master record failed its integrity check, or no valid area exists.
    #[error("data corrupt")]
    DataCorrupt,

    /// Type out of range or value longer than the maximum item size
    #[error("bad value")]
    BadValue,

    /// The provided buffer can't hold the stored value. `required` is the stored length.
    #[error("buffer too small, {required} bytes required")]
    BuffTooSmall { required: u16 },

    /// The value doesn't fit into an area, even after garbage collection.
    #[error("flash area too small")]
    FlashAreaTooSmall,
}

impl Error {
    /// Maps the error onto its numeric result code.
    pub fn code(&self) -> ResultCode {
        match self {
            Error::InvalidPartitionOffset
            | Error::InvalidPartitionSize
            | Error::UnsupportedFlashGeometry
            | Error::BadValue => ResultCode::BadValue,
            Error::ReadError => ResultCode::ReadError,
            Error::WriteError => ResultCode::WriteError,
            Error::NotFound => ResultCode::NotFound,
            Error::DataCorrupt => ResultCode::DataCorrupt,
            Error::BuffTooSmall { .. } => ResultCode::BuffTooSmall,
            Error::FlashAreaTooSmall => ResultCode::FlashAreaTooSmall,
        }
    }

    /// Physical flash errors leave the in-RAM state unreliable.
    pub(crate) fn is_flash_error(&self) -> bool {
        matches!(self, Error::ReadError | Error::WriteError)
    }
}
