//! Error kinds shared across the crate, following the taxonomy in the
//! component design: store errors are transient and retryable, vendor and
//! validation errors are ordinary negative outcomes, `NoProxyAvailable`
//! is the only error a caller of `ProxyPool::take` ever sees.

use std::fmt;

/// The store is unreachable or returned a transport-level failure.
/// Always soft: callers log it and abandon the current tick or request,
/// never treat it as fatal.
#[derive(Debug)]
pub struct StoreError {
    message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        StoreError {
            message: message.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "store unavailable: {}", self.message)
    }
}
impl std::error::Error for StoreError {}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::new(err.to_string())
    }
}

/// A vendor feed failed to produce a usable proxy list this tick. Per-vendor
/// and swallowed by the fetcher loop; other vendors are unaffected.
#[derive(Debug)]
pub enum VendorError {
    Unavailable(String),
    Malformed(String),
}

impl fmt::Display for VendorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VendorError::Unavailable(e) => write!(f, "vendor unavailable: {e}"),
            VendorError::Malformed(e) => write!(f, "vendor response malformed: {e}"),
        }
    }
}
impl std::error::Error for VendorError {}

impl From<reqwest::Error> for VendorError {
    fn from(err: reqwest::Error) -> Self {
        VendorError::Unavailable(err.to_string())
    }
}

/// Returned by `ProxyPool::take` when replenishment finds nothing. The
/// caller is expected to back off; this is a normal, expected outcome, not
/// a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoProxyAvailable;

impl fmt::Display for NoProxyAvailable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "no proxy available for this channel")
    }
}
impl std::error::Error for NoProxyAvailable {}

/// A transport or protocol-level failure observed by the client façade
/// while using a leased proxy. The façade converts this into a
/// `ProxyPool::delete` call; it is never surfaced past that point.
#[derive(Debug)]
pub enum CallerProxyFailure {
    Transport(reqwest::Error),
    Forbidden,
}

impl fmt::Display for CallerProxyFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CallerProxyFailure::Transport(e) => write!(f, "request through proxy failed: {e}"),
            CallerProxyFailure::Forbidden => {
                write!(f, "proxy returned a protocol-level forbidden response")
            }
        }
    }
}
impl std::error::Error for CallerProxyFailure {}

/// Errors surfaced by the config loader, named and displayed in the style
/// of the teacher's `LoadConfigError`.
#[derive(Debug)]
pub enum LoadConfigError {
    ReadError(std::io::Error),
    ParseError(serde_yaml::Error),
}

impl fmt::Display for LoadConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadConfigError::ReadError(e) => write!(f, "cannot read configuration: {e}"),
            LoadConfigError::ParseError(e) => write!(f, "cannot parse configuration: {e}"),
        }
    }
}
impl std::error::Error for LoadConfigError {}

impl From<std::io::Error> for LoadConfigError {
    fn from(err: std::io::Error) -> Self {
        LoadConfigError::ReadError(err)
    }
}

impl From<serde_yaml::Error> for LoadConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        LoadConfigError::ParseError(err)
    }
}
