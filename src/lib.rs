//! Core library for managing the lifecycle of a block-storage volume from
//! inside the instance it attaches to.
//!
//! A [`VolumeController`] creates a volume through an injected
//! [`ProviderClient`], attaches it to an instance, and resolves the kernel
//! device path the guest actually sees by diffing the local block devices
//! before and after the attachment. Detach, delete, and snapshot complete the
//! lifecycle. A Scaleway implementation of the provider capability ships with
//! the crate.

pub mod command;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod metadata;
pub mod provider;
pub mod scaleway;
pub mod test_support;
pub mod types;
pub mod volume;
pub mod wait;

pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, ScalewayConfig, VolumeConfig};
pub use controller::{ControllerSettings, VolumeController};
pub use device::{
    DeviceError, DevicePathResolver, DeviceSlot, LocalDevices, ResolvedDevice, SlotPolicy,
    SystemDevices,
};
pub use error::{Operation, VolumeError};
pub use metadata::{HttpMetadataClient, MetadataError, MetadataFormat, MetadataSource};
pub use provider::{
    InstanceDescription, ProviderClient, ProviderFuture, ResourceKind, ResourceStatus, Tags,
    TargetStatus, VolumeSpec,
};
pub use scaleway::{ScalewayProvider, ScalewayProviderError};
pub use types::{InstanceId, SnapshotId, VolumeId, Zone};
pub use volume::{Attachment, BYTES_PER_GIB, Encryption, LifecycleState, Volume};
pub use wait::{PollConfig, WaitOutcome};
