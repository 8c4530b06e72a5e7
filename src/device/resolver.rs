//! Attachment and kernel device path correlation.
//!
//! The slot requested from the provider and the name the guest kernel gives
//! the new disk frequently differ (paravirtual buses rename `sdf` to `xvdf`
//! or `nvme1n1`). The resolver therefore never trusts the requested name: it
//! snapshots the visible devices before attaching, waits for the provider to
//! report the attachment, settles udev, and takes the single device that
//! appeared in between.
//!
//! Preconditions: attaches against the same instance must be serialised by
//! the caller, and no unrelated hot-plug activity may happen while a
//! resolution is in flight.

use std::collections::BTreeSet;

use camino::Utf8PathBuf;
use tracing::{debug, info, warn};

use crate::error::{Operation, VolumeError};
use crate::metadata::MetadataSource;
use crate::provider::{ProviderClient, ResourceKind, TargetStatus};
use crate::types::{InstanceId, VolumeId};
use crate::wait::PollConfig;

use super::enumerate::{render, reserved_slots, visible_devices};
use super::local::LocalDevices;
use super::slot::{DeviceSlot, SlotPolicy};

/// Slot and kernel path produced by a successful resolution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedDevice {
    /// Slot requested from the provider.
    pub slot: DeviceSlot,
    /// Kernel device name that appeared after attachment.
    pub kernel_name: String,
    /// Canonical filesystem path of the device.
    pub path: Utf8PathBuf,
}

/// Difference between two device listings.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceDiff {
    /// Names present only after attachment.
    pub added: Vec<String>,
    /// Names present only before attachment.
    pub removed: Vec<String>,
}

impl DeviceDiff {
    /// Computes the symmetric difference between `before` and `after`.
    #[must_use]
    pub fn between(before: &BTreeSet<String>, after: &BTreeSet<String>) -> Self {
        Self {
            added: after.difference(before).cloned().collect(),
            removed: before.difference(after).cloned().collect(),
        }
    }

    /// Returns the new device when exactly one appeared and none vanished.
    #[must_use]
    pub fn single_addition(&self) -> Option<&str> {
        match (self.added.as_slice(), self.removed.is_empty()) {
            ([name], true) => Some(name.as_str()),
            _ => None,
        }
    }
}

/// Picks a slot, attaches a volume, and discovers its kernel device path.
#[derive(Debug)]
pub struct DevicePathResolver<'a, P, M, L> {
    provider: &'a P,
    metadata: &'a M,
    local: &'a L,
    policy: SlotPolicy,
    attach_poll: PollConfig,
}

impl<'a, P, M, L> DevicePathResolver<'a, P, M, L>
where
    P: ProviderClient,
    M: MetadataSource,
    L: LocalDevices,
{
    /// Creates a resolver with the default slot policy and poll budget.
    #[must_use]
    pub fn new(provider: &'a P, metadata: &'a M, local: &'a L) -> Self {
        Self {
            provider,
            metadata,
            local,
            policy: SlotPolicy::default(),
            attach_poll: PollConfig::default(),
        }
    }

    /// Overrides the slot selection policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: SlotPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the budget used while waiting for the attachment.
    #[must_use]
    pub const fn with_attach_poll(mut self, poll: PollConfig) -> Self {
        self.attach_poll = poll;
        self
    }

    /// Attaches `volume` to `instance` and returns the resolved device.
    ///
    /// Once the attach request has been submitted a later failure leaves the
    /// provider-side attachment in place; the caller decides whether to
    /// detach.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::MetadataUnavailable`], [`VolumeError::NoFreeSlot`],
    /// [`VolumeError::ProviderRequest`], [`VolumeError::ProvisioningTimeout`],
    /// [`VolumeError::DeviceCorrelation`], [`VolumeError::DevicePathNotFound`],
    /// or [`VolumeError::DeviceInspection`] depending on the failing step.
    pub async fn resolve(
        &self,
        volume: &VolumeId,
        instance: &InstanceId,
    ) -> Result<ResolvedDevice, VolumeError<P::Error>> {
        let reserved = reserved_slots(self.provider, self.metadata, instance).await?;
        let slot = self
            .policy
            .select(&reserved)
            .ok_or_else(|| VolumeError::NoFreeSlot {
                instance_id: instance.clone(),
                reserved: render(&reserved),
            })?;
        debug!(%volume, %instance, %slot, "selected device slot");

        let before = visible_devices(self.local)?;

        self.provider
            .attach_volume(volume, instance, &slot)
            .await
            .map_err(|err| VolumeError::provider(Operation::Attach, volume, err))?;
        self.wait_for_attachment(volume).await?;

        self.local.settle()?;
        let after = visible_devices(self.local)?;

        let diff = DeviceDiff::between(&before, &after);
        let kernel_name = diff.single_addition().map(str::to_owned);
        let Some(kernel_name) = kernel_name else {
            warn!(%volume, %slot, added = ?diff.added, removed = ?diff.removed,
                "attached volume could not be correlated with a kernel device");
            return Err(VolumeError::DeviceCorrelation {
                volume_id: volume.clone(),
                slot,
                added: diff.added,
                removed: diff.removed,
            });
        };

        let path = self.resolve_path(&kernel_name)?;
        info!(%volume, %instance, %slot, device = %path, "resolved attached volume");
        Ok(ResolvedDevice {
            slot,
            kernel_name,
            path,
        })
    }

    async fn wait_for_attachment(&self, volume: &VolumeId) -> Result<(), VolumeError<P::Error>> {
        let outcome = self
            .provider
            .wait_until(
                ResourceKind::Attachment,
                volume.as_str(),
                TargetStatus::Attached,
                self.attach_poll,
            )
            .await
            .map_err(|err| VolumeError::provider(Operation::Attach, volume, err))?;

        outcome.require(
            Operation::Attach,
            ResourceKind::Attachment,
            volume.as_str(),
            TargetStatus::Attached,
        )
    }

    fn resolve_path(&self, kernel_name: &str) -> Result<Utf8PathBuf, VolumeError<P::Error>> {
        let candidates = self.local.resolve_device_path(kernel_name)?;
        let unique = match candidates.as_slice() {
            [path] => Some(path.clone()),
            _ => None,
        };

        if let Some(path) = unique
            && self.local.path_exists(&path)?
        {
            return Ok(path);
        }

        Err(VolumeError::DevicePathNotFound {
            device: kernel_name.to_owned(),
            candidates,
        })
    }
}
