// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Abstraction over the tamper-evident monotonic counter that anchors the
//! integrity chain against replay.

use thiserror::Error;

/// The counter device failed. A missed increment desynchronizes the stored
/// digest from the device, so callers must abandon the in-flight write.
#[derive(Debug, Error)]
#[error("monotonic counter device error")]
pub struct CounterError;

/// A replay-protected monotonic counter.
///
/// The device is the anti-replay anchor: a digest bound to counter value
/// `n` can never be replayed once the device reads `n + 1`.
pub trait ReplayCounter {
    /// Read the current counter value.
    fn read(&mut self) -> Result<u32, CounterError>;

    /// Advance the counter by exactly one.
    fn increment(&mut self) -> Result<(), CounterError>;
}
