//! Provider capability consumed by the volume lifecycle controller.
//!
//! The controller never talks to a cloud API directly. It receives a
//! [`ProviderClient`] handle at construction time and drives every mutating
//! request and status wait through it.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::device::DeviceSlot;
use crate::types::{InstanceId, SnapshotId, VolumeId, Zone};
use crate::wait::{self, PollConfig, WaitOutcome};

/// Future returned by provider and metadata operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Key-value tags applied to a new volume.
pub type Tags = BTreeMap<String, String>;

/// Parameters submitted to the provider when creating a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeSpec {
    /// Size in whole GiB.
    pub size_gib: u64,
    /// Placement zone.
    pub zone: Zone,
    /// Tags applied to the volume.
    pub tags: Tags,
    /// Whether the volume is encrypted at rest.
    pub encrypted: bool,
    /// Encryption key reference; only ever set when `encrypted` is true.
    pub key_ref: Option<String>,
}

/// Block device mappings the provider reports for an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceDescription {
    /// Raw device names as reported by the provider.
    pub device_names: Vec<String>,
}

/// Kind of provider resource a waiter polls.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ResourceKind {
    /// The volume itself.
    Volume,
    /// The attachment of a volume to an instance, keyed by volume id.
    Attachment,
    /// A point-in-time snapshot.
    Snapshot,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Volume => "volume",
            Self::Attachment => "attachment of volume",
            Self::Snapshot => "snapshot",
        })
    }
}

/// Status a waiter blocks for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TargetStatus {
    /// Volume exists and is not attached to any instance.
    Available,
    /// Volume is attached to an instance.
    Attached,
    /// Snapshot has finished copying.
    Completed,
}

impl TargetStatus {
    /// Returns `true` when `status` satisfies this target.
    #[must_use]
    pub const fn is_reached(self, status: &ResourceStatus) -> bool {
        matches!(
            (self, status),
            (Self::Available, ResourceStatus::Available)
                | (Self::Attached, ResourceStatus::Attached)
                | (Self::Completed, ResourceStatus::Completed)
        )
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Available => "available",
            Self::Attached => "attached",
            Self::Completed => "completed",
        })
    }
}

/// Status observed for a resource during a single poll.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResourceStatus {
    /// Volume is ready and detached.
    Available,
    /// Volume is attached to an instance.
    Attached,
    /// Snapshot has completed.
    Completed,
    /// Resource is transitioning; carries the provider's state label.
    Pending(String),
    /// Resource entered a terminal failure state.
    Failed(String),
    /// Provider does not (yet) know the resource.
    Missing,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => formatter.write_str("available"),
            Self::Attached => formatter.write_str("attached"),
            Self::Completed => formatter.write_str("completed"),
            Self::Pending(label) => write!(formatter, "pending ({label})"),
            Self::Failed(label) => write!(formatter, "failed ({label})"),
            Self::Missing => formatter.write_str("missing"),
        }
    }
}

/// Capability interface implemented by cloud providers.
///
/// Credentials and connection state live inside the implementing type; the
/// controller only holds a handle to it.
pub trait ProviderClient: Sync {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Submits a volume creation request and returns the assigned id.
    fn create_volume<'a>(&'a self, spec: &'a VolumeSpec)
    -> ProviderFuture<'a, VolumeId, Self::Error>;

    /// Lists the device names already mapped on `instance`.
    fn describe_instance<'a>(
        &'a self,
        instance: &'a InstanceId,
    ) -> ProviderFuture<'a, InstanceDescription, Self::Error>;

    /// Requests attachment of `volume` to `instance` at `slot`.
    fn attach_volume<'a>(
        &'a self,
        volume: &'a VolumeId,
        instance: &'a InstanceId,
        slot: &'a DeviceSlot,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Requests detachment of `volume` from `instance` at `slot`.
    fn detach_volume<'a>(
        &'a self,
        volume: &'a VolumeId,
        instance: &'a InstanceId,
        slot: &'a DeviceSlot,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Requests deletion of `volume`. Deletion completes asynchronously.
    fn delete_volume<'a>(&'a self, volume: &'a VolumeId) -> ProviderFuture<'a, (), Self::Error>;

    /// Requests a snapshot of `volume` and returns its id.
    fn create_snapshot<'a>(
        &'a self,
        volume: &'a VolumeId,
    ) -> ProviderFuture<'a, SnapshotId, Self::Error>;

    /// Reads the current status of a resource.
    fn resource_status<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
    ) -> ProviderFuture<'a, ResourceStatus, Self::Error>;

    /// Polls [`ProviderClient::resource_status`] until `target` is reached,
    /// the resource fails, or the poll budget runs out.
    fn wait_until<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
        target: TargetStatus,
        poll: PollConfig,
    ) -> ProviderFuture<'a, WaitOutcome, Self::Error> {
        Box::pin(wait::poll_until(poll, target, move || {
            self.resource_status(kind, id)
        }))
    }
}
