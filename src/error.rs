// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The crate-wide error type.
//!
//! Spec §7 distinguishes five error kinds: validation, allocation
//! failure, transient kernel failure (absorbed before it ever reaches
//! here), fatal kernel failure, and internal error. Each gets its own
//! variant so callers can match on kind instead of parsing message text.

use std::io;

use crate::alloc::policy::AllocPolicy;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invariant violation or rejected input; no state was changed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The allocator exhausted its policy ladder without placing every
    /// requested extent.
    #[error("allocation failed under policy {policy:?}: {reason}")]
    AllocFailed { policy: AllocPolicy, reason: String },

    /// A commit-time kernel operation returned a non-tolerable errno;
    /// by the time this is returned the revert path has already
    /// re-resumed whatever was suspended.
    #[error("device-mapper commit failed, reverted: {0}")]
    FatalKernel(String),

    /// A condition the validator treats as structurally impossible.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Dm(#[from] devicemapper::DmError),

    #[error(transparent)]
    Nix(#[from] nix::Error),
}

impl Error {
    pub fn validation<S: Into<String>>(msg: S) -> Error {
        Error::Validation(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Error {
        Error::Internal(msg.into())
    }
}
