//! Command-surface error taxonomy.
//!
//! Every command either succeeds or fails with one of these typed variants;
//! the front end turns them into human-readable replies. Configuration faults
//! (bad URL, bad pincode, unknown user) are rejected here synchronously and
//! never reach the check pipeline.

use crate::auth::LoginError;
use crate::monitor::AlreadyRunning;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("user is not authorized")]
    NotAuthorized,

    #[error("invalid monitor URL: {0}")]
    InvalidUrl(String),

    #[error("monitor URL is already configured")]
    DuplicateUrl,

    #[error("monitor URL not found")]
    UnknownUrl,

    #[error("invalid pincode: {0}")]
    InvalidPincode(String),

    #[error("pincode not found")]
    UnknownPincode,

    #[error(transparent)]
    Login(#[from] LoginError),

    #[error(transparent)]
    Busy(#[from] AlreadyRunning),

    #[error(transparent)]
    Store(#[from] StoreError),
}
