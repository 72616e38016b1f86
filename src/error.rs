use std::{io, result};

use thiserror::Error;

use crate::disk::sd::SdError;
use crate::disk::DiskError;

pub type Result<T> = result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Disk(DiskError),
    #[error("device not ready")]
    NotReady,
    #[error("file not found")]
    NoFile,
    #[error("path not found")]
    NoPath,
    #[error("invalid name")]
    InvalidName,
    #[error("access denied")]
    Denied,
    #[error("file already exists")]
    Exists,
    #[error("invalid object")]
    InvalidObject,
    #[error("medium is write protected")]
    WriteProtected,
    #[error("invalid drive")]
    InvalidDrive,
    #[error("volume not mounted")]
    NotEnabled,
    #[error("no FAT filesystem found")]
    NoFilesystem,
    #[error("timeout")]
    Timeout,
    #[error("cluster chain is broken")]
    IntegrityError,
}

impl Error {
    /// Errors after which an open file handle can no longer be trusted.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Disk(_) | Self::NotReady | Self::Timeout | Self::IntegrityError
        )
    }
}

impl From<DiskError> for Error {
    fn from(e: DiskError) -> Self {
        match e {
            DiskError::NotReady | DiskError::Card(SdError::NotInitialized) => Self::NotReady,
            DiskError::WriteProtected => Self::WriteProtected,
            DiskError::Timeout | DiskError::Card(SdError::Timeout(_)) => Self::Timeout,
            e => Self::Disk(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Disk(DiskError::Io(e))
    }
}

impl From<SdError> for Error {
    fn from(e: SdError) -> Self {
        DiskError::Card(e).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::sd::Wait;

    #[test]
    fn test_disk_error_mapping() {
        crate::tests_init();

        assert!(matches!(Error::from(DiskError::NotReady), Error::NotReady));
        assert!(matches!(
            Error::from(DiskError::WriteProtected),
            Error::WriteProtected
        ));
        assert!(matches!(
            Error::from(SdError::Timeout(Wait::Initialization)),
            Error::Timeout
        ));
        assert!(matches!(
            Error::from(SdError::DataRejected(0x0B)),
            Error::Disk(DiskError::Card(SdError::DataRejected(0x0B)))
        ));
        assert!(matches!(
            Error::from(io::Error::new(io::ErrorKind::Other, "boom")),
            Error::Disk(DiskError::Io(_))
        ));
    }

    #[test]
    fn test_fatal_errors() {
        crate::tests_init();

        assert!(Error::IntegrityError.is_fatal());
        assert!(Error::Timeout.is_fatal());
        assert!(!Error::Denied.is_fatal());
        assert!(!Error::NoFile.is_fatal());
    }
}
