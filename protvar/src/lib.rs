// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of the protected variable store.
//!
//! This library keeps small named configuration/security records on
//! power-loss-prone persistent storage while providing confidentiality
//! (per-variable AES), integrity and authenticity (a chained HMAC over
//! every protected record plus a monotonic counter), and anti-replay (the
//! counter device). A crash at any point of the two-record write protocol
//! is classified at the next boot and repaired with metadata-only patches;
//! committed data is never lost to an interrupted write.
//!
//! The entry point is [`ProtectedStore`]: construct it over a
//! [`ContextAdapter`](protvar_storage::ContextAdapter) (the host storage
//! services), a [`ReplayCounter`] device, and the platform root key.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cache;
mod codec;
mod counter;
mod encrypt;
mod error;
mod fixup;
mod integrity;
mod reclaim;
mod store_impl;
mod update;

pub use codec::decrypt_payload;
pub use codec::encrypt_payload;
pub use codec::parse_payload;
pub use codec::CipherPayload;
pub use codec::EncryptOutcome;
pub use counter::CounterError;
pub use counter::ReplayCounter;
pub use error::Error;
pub use reclaim::ReclaimOutcome;
pub use reclaim::SpaceBudget;
pub use reclaim::SpaceUsage;
pub use store_impl::ProtectedStore;
pub use store_impl::RootKey;
pub use update::NewVariable;
pub use update::UpdateOutput;
