//! Error types for the Scaleway provider.

use crate::config::ConfigError;
use scaleway_rs::ScalewayError;
use thiserror::Error;

/// Errors raised by the Scaleway provider.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScalewayProviderError {
    /// Raised when the high-level configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a request asks for something the Instances API cannot do.
    #[error("unsupported request: {feature}")]
    Unsupported {
        /// Feature that was requested.
        feature: &'static str,
    },
    /// Raised when a request targets a zone other than the configured one.
    #[error("zone {requested} requested but provider is bound to {configured}")]
    ZoneMismatch {
        /// Zone named in the request.
        requested: String,
        /// Zone the provider was configured with.
        configured: String,
    },
    /// Raised when the HTTP request could not be completed.
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Target URL.
        url: String,
        /// Transport error text.
        message: String,
    },
    /// Raised when the API answers with a non-success status.
    #[error("{method} {url} returned HTTP {status}: {body}")]
    Api {
        /// HTTP method.
        method: &'static str,
        /// Target URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body returned by the API.
        body: String,
    },
    /// Raised when a response body cannot be decoded.
    #[error("unexpected response from {url}: {message}")]
    Decode {
        /// Target URL.
        url: String,
        /// Decoder error text.
        message: String,
    },
    /// Wrapper for failures reported by the `scaleway-rs` SDK.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider SDK.
        message: String,
    },
    /// Raised when the requested slot already holds another volume.
    #[error("slot {slot} on instance {instance_id} already holds volume {occupant}")]
    SlotOccupied {
        /// Instance identifier.
        instance_id: String,
        /// Requested slot.
        slot: String,
        /// Volume currently at that slot.
        occupant: String,
    },
    /// Raised when a detach targets a volume the instance does not hold.
    #[error("volume {volume_id} is not attached to instance {instance_id}")]
    VolumeNotAttached {
        /// Volume identifier.
        volume_id: String,
        /// Instance identifier.
        instance_id: String,
    },
    /// Raised when the requested size does not fit the API's byte count.
    #[error("volume size of {size_gib} GiB is too large")]
    SizeOverflow {
        /// Requested size.
        size_gib: u64,
    },
}

impl From<ScalewayError> for ScalewayProviderError {
    fn from(value: ScalewayError) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

impl From<ConfigError> for ScalewayProviderError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}
