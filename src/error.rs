//! Error taxonomy for volume lifecycle operations.

use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::device::{DeviceError, DeviceSlot};
use crate::metadata::MetadataError;
use crate::provider::{ResourceKind, TargetStatus};
use crate::types::{InstanceId, SnapshotId, VolumeId};

/// Lifecycle operation named in error messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// Volume creation.
    Create,
    /// Attachment and device resolution.
    Attach,
    /// Detachment.
    Detach,
    /// Deletion.
    Delete,
    /// Snapshot creation.
    Snapshot,
}

impl fmt::Display for Operation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Create => "create",
            Self::Attach => "attach",
            Self::Detach => "detach",
            Self::Delete => "delete",
            Self::Snapshot => "snapshot",
        })
    }
}

/// Errors raised by the lifecycle controller and device path resolver.
///
/// None of these are retried internally; retry policy belongs to the caller.
#[derive(Debug, Error)]
pub enum VolumeError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    /// Raised when an operation is invoked from the wrong lifecycle state.
    #[error("cannot {operation} a volume in state {state}")]
    InvalidState {
        /// Operation that was rejected.
        operation: Operation,
        /// Lifecycle state at the time of the call.
        state: &'static str,
    },
    /// Raised when the byte size is not a positive whole number of GiB.
    #[error("volume size of {bytes} bytes is not a positive whole number of GiB")]
    InvalidSize {
        /// Size supplied by the caller.
        bytes: u64,
    },
    /// Raised when the provider rejects or fails a request.
    #[error("provider request failed during {operation} of {resource}: {source}")]
    ProviderRequest {
        /// Operation being performed.
        operation: Operation,
        /// Volume, instance, or snapshot the request targeted.
        resource: String,
        /// Provider-specific error.
        #[source]
        source: ProviderError,
    },
    /// Raised when a create, attach, or detach wait runs out of polls.
    #[error("{kind} {id} did not become {target} after {attempts} polls")]
    ProvisioningTimeout {
        /// Resource being waited on.
        kind: ResourceKind,
        /// Resource identifier.
        id: String,
        /// Status the wait expected.
        target: TargetStatus,
        /// Polls performed.
        attempts: u32,
    },
    /// Raised when a snapshot does not complete within its poll budget.
    #[error("snapshot {snapshot_id} of volume {volume_id} did not complete after {attempts} polls")]
    SnapshotTimeout {
        /// Snapshot being waited on.
        snapshot_id: SnapshotId,
        /// Source volume.
        volume_id: VolumeId,
        /// Polls performed.
        attempts: u32,
    },
    /// Raised when the provider reports a terminal failure state while
    /// waiting.
    #[error("{kind} {id} entered failure state '{status}' during {operation}")]
    ResourceFailed {
        /// Operation being performed.
        operation: Operation,
        /// Resource being waited on.
        kind: ResourceKind,
        /// Resource identifier.
        id: String,
        /// Failure label reported by the provider.
        status: String,
    },
    /// Raised when the provider refuses a detach request.
    #[error("failed to detach volume {volume_id} from instance {instance_id} at {slot}: {source}")]
    Detach {
        /// Volume being detached.
        volume_id: VolumeId,
        /// Instance holding the attachment.
        instance_id: InstanceId,
        /// Slot the volume occupies.
        slot: DeviceSlot,
        /// Provider-specific error.
        #[source]
        source: ProviderError,
    },
    /// Raised when the instance metadata service cannot be read.
    #[error("instance metadata unavailable: {0}")]
    MetadataUnavailable(#[source] MetadataError),
    /// Raised when every candidate slot is already reserved.
    #[error("no free device slot on instance {instance_id}; reserved: {reserved:?}")]
    NoFreeSlot {
        /// Target instance.
        instance_id: InstanceId,
        /// Slots found in use.
        reserved: Vec<String>,
    },
    /// Raised when the local device diff does not isolate exactly one new
    /// device.
    #[error(
        "could not correlate volume {volume_id} attached at {slot} with a kernel device; \
         added: {added:?}, removed: {removed:?}"
    )]
    DeviceCorrelation {
        /// Volume that was attached.
        volume_id: VolumeId,
        /// Slot that was requested.
        slot: DeviceSlot,
        /// Device names that appeared.
        added: Vec<String>,
        /// Device names that disappeared.
        removed: Vec<String>,
    },
    /// Raised when the new kernel device does not resolve to exactly one
    /// existing path.
    #[error("no unique existing device path for {device}; candidates: {candidates:?}")]
    DevicePathNotFound {
        /// Kernel device name that appeared.
        device: String,
        /// Paths reported by the device-naming subsystem.
        candidates: Vec<Utf8PathBuf>,
    },
    /// Raised when local device inspection tools fail.
    #[error("local device inspection failed: {0}")]
    DeviceInspection(#[source] DeviceError),
}

impl<ProviderError> VolumeError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    pub(crate) fn provider(
        operation: Operation,
        resource: &dyn fmt::Display,
        source: ProviderError,
    ) -> Self {
        Self::ProviderRequest {
            operation,
            resource: resource.to_string(),
            source,
        }
    }
}

impl<ProviderError> From<DeviceError> for VolumeError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    fn from(value: DeviceError) -> Self {
        Self::DeviceInspection(value)
    }
}

impl<ProviderError> From<MetadataError> for VolumeError<ProviderError>
where
    ProviderError: std::error::Error + 'static,
{
    fn from(value: MetadataError) -> Self {
        Self::MetadataUnavailable(value)
    }
}
