// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error object for the protected variable library.

use crate::counter::CounterError;
use protvar_storage::StoreError;
use thiserror::Error;

/// Protected variable store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A caller-supplied argument is invalid.
    #[error("invalid parameter")]
    InvalidParameter,
    /// The requested variable does not exist.
    #[error("variable not found")]
    NotFound,
    /// Not enough room in the variable store.
    #[error("insufficient space in the variable store")]
    OutOfResources,
    /// The store's own structure is inconsistent.
    #[error("variable store is corrupted")]
    VolumeCorrupted,
    /// Integrity verification failed. The store contents must not be
    /// trusted; there is no in-band recovery from this state.
    #[error("integrity verification failed, variable store is compromised")]
    CompromisedData,
    /// Recovery fixup has not completed for this boot.
    #[error("variable write services are not ready")]
    NotReady,
    /// The target variable is managed internally by this library.
    #[error("variable is managed internally and cannot be updated directly")]
    AccessDenied,
    /// The new variable exceeds the storage backend's record size cap.
    #[error("variable exceeds the maximum variable size")]
    BadBufferSize,
    /// The replay counter device failed; fatal to the in-flight write.
    #[error("replay counter device failure")]
    CounterDevice(#[source] CounterError),
    /// Error from the storage backend.
    #[error("storage backend error")]
    Storage(#[source] StoreError),
    /// A crypto primitive failed.
    #[error("crypto primitive failure")]
    Crypto(#[source] openssl::error::ErrorStack),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Error {
        Error::Storage(err)
    }
}

impl From<CounterError> for Error {
    fn from(err: CounterError) -> Error {
        Error::CounterDevice(err)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Error {
        Error::Crypto(err)
    }
}
