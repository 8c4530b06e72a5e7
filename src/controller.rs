//! Volume lifecycle controller.
//!
//! A controller owns one volume and drives it through
//! `absent → created → attached → created → deleted`. Every transition takes
//! `&mut self` and awaits each provider step before returning, so callers
//! observe a sequential model. Invalid transitions fail with
//! [`VolumeError::InvalidState`] and never contact the provider.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::device::{DevicePathResolver, LocalDevices, SlotPolicy};
use crate::error::{Operation, VolumeError};
use crate::metadata::MetadataSource;
use crate::provider::{ProviderClient, ResourceKind, Tags, TargetStatus};
use crate::types::{InstanceId, SnapshotId, VolumeId, Zone};
use crate::volume::{Attachment, Encryption, LifecycleState, Volume};
use crate::wait::{PollConfig, WaitOutcome};

/// Poll budgets and slot policy used by a controller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ControllerSettings {
    /// Budget for create, attach, and detach waits.
    pub provisioning_poll: PollConfig,
    /// Budget for snapshot completion.
    pub snapshot_poll: PollConfig,
    /// Slot selection policy used on attach.
    pub slot_policy: SlotPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            provisioning_poll: PollConfig::default(),
            snapshot_poll: PollConfig::snapshot(),
            slot_policy: SlotPolicy::default(),
        }
    }
}

/// Drives a single volume through its lifecycle.
#[derive(Debug)]
pub struct VolumeController<P, M, L> {
    provider: P,
    metadata: M,
    local: L,
    settings: ControllerSettings,
    volume: Volume,
    state: LifecycleState,
    snapshots: Vec<SnapshotId>,
}

type Outcome<T, P> = Result<T, VolumeError<<P as ProviderClient>::Error>>;

impl<P, M, L> VolumeController<P, M, L>
where
    P: ProviderClient,
    M: MetadataSource,
    L: LocalDevices,
{
    /// Creates a controller for a volume of `size_bytes` with default
    /// settings. Nothing is submitted until [`Self::create`] is called.
    #[must_use]
    pub fn new(size_bytes: u64, provider: P, metadata: M, local: L) -> Self {
        Self {
            provider,
            metadata,
            local,
            settings: ControllerSettings::default(),
            volume: Volume::new(size_bytes),
            state: LifecycleState::Absent,
            snapshots: Vec::new(),
        }
    }

    /// Replaces the poll budgets and slot policy.
    #[must_use]
    pub const fn with_settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Creates the volume and waits until the provider reports it available.
    ///
    /// If the wait fails after the request was accepted the state stays
    /// absent, but the provider id is kept on [`Self::volume`]. Calling
    /// `create` again then resumes the wait on that volume instead of
    /// submitting a second one, and the retry's `zone`, `tags`, and
    /// `encryption` are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::InvalidState`] unless the state is absent,
    /// [`VolumeError::InvalidSize`] for sizes that are not a positive whole
    /// number of GiB, [`VolumeError::ProviderRequest`] when the request is
    /// rejected, and [`VolumeError::ProvisioningTimeout`] or
    /// [`VolumeError::ResourceFailed`] when the wait does not succeed.
    pub async fn create(
        &mut self,
        zone: Zone,
        tags: Tags,
        encryption: Encryption,
    ) -> Outcome<VolumeId, P> {
        if !matches!(self.state, LifecycleState::Absent) {
            return Err(self.invalid_state(Operation::Create));
        }
        let size_gib = self.volume.size_gib().ok_or(VolumeError::InvalidSize {
            bytes: self.volume.size_bytes,
        })?;
        if let Some(pending) = self.volume.id.clone() {
            return self.resume_create(pending, size_gib).await;
        }

        self.volume.zone = Some(zone.clone());
        self.volume.tags = tags;
        self.volume.encryption = encryption;
        let spec = self.volume.spec(size_gib, &zone);

        let volume_id = self
            .provider
            .create_volume(&spec)
            .await
            .map_err(|err| VolumeError::provider(Operation::Create, &zone, err))?;
        self.volume.id = Some(volume_id.clone());
        debug!(volume = %volume_id, %zone, size_gib, "volume creation submitted");

        self.wait_for_volume(Operation::Create, &volume_id).await?;

        info!(volume = %volume_id, %zone, size_gib, "volume created");
        self.state = LifecycleState::Created {
            volume_id: volume_id.clone(),
        };
        Ok(volume_id)
    }

    async fn resume_create(
        &mut self,
        volume_id: VolumeId,
        size_gib: u64,
    ) -> Outcome<VolumeId, P> {
        info!(volume = %volume_id, size_gib, "resuming wait on submitted volume");
        self.wait_for_volume(Operation::Create, &volume_id).await?;

        info!(volume = %volume_id, size_gib, "volume created");
        self.state = LifecycleState::Created {
            volume_id: volume_id.clone(),
        };
        Ok(volume_id)
    }

    /// Attaches the volume to `instance` and returns the kernel device path.
    ///
    /// On failure the state stays created. If the provider had already
    /// accepted the attach request, the provider-side attachment is left in
    /// place.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::InvalidState`] unless the volume is created and
    /// detached, or any error raised by [`DevicePathResolver::resolve`].
    pub async fn attach(&mut self, instance: &InstanceId) -> Outcome<Utf8PathBuf, P> {
        let LifecycleState::Created { volume_id: current } = &self.state else {
            return Err(self.invalid_state(Operation::Attach));
        };
        let volume_id = current.clone();

        let resolver = DevicePathResolver::new(&self.provider, &self.metadata, &self.local)
            .with_policy(self.settings.slot_policy)
            .with_attach_poll(self.settings.provisioning_poll);
        let resolved = resolver
            .resolve(&volume_id, instance)
            .await
            .inspect_err(|err| {
                warn!(volume = %volume_id, %instance, error = %err, "attach failed");
            })?;

        info!(volume = %volume_id, %instance, slot = %resolved.slot,
            device = %resolved.path, "volume attached");
        let device_path = resolved.path.clone();
        self.state = LifecycleState::Attached {
            volume_id,
            attachment: Attachment {
                instance_id: instance.clone(),
                slot: resolved.slot,
                device_path: resolved.path,
            },
        };
        Ok(device_path)
    }

    /// Detaches the volume and waits until it is available again.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::InvalidState`] unless attached,
    /// [`VolumeError::Detach`] when the provider refuses the request, and
    /// [`VolumeError::ProvisioningTimeout`] or [`VolumeError::ResourceFailed`]
    /// when the wait does not succeed. The state stays attached on error.
    pub async fn detach(&mut self) -> Outcome<(), P> {
        let LifecycleState::Attached {
            volume_id: current,
            attachment: active,
        } = &self.state
        else {
            return Err(self.invalid_state(Operation::Detach));
        };
        let volume_id = current.clone();
        let attachment = active.clone();

        self.provider
            .detach_volume(&volume_id, &attachment.instance_id, &attachment.slot)
            .await
            .map_err(|source| VolumeError::Detach {
                volume_id: volume_id.clone(),
                instance_id: attachment.instance_id.clone(),
                slot: attachment.slot,
                source,
            })?;
        self.wait_for_volume(Operation::Detach, &volume_id).await?;

        info!(volume = %volume_id, instance = %attachment.instance_id,
            slot = %attachment.slot, "volume detached");
        self.state = LifecycleState::Created { volume_id };
        Ok(())
    }

    /// Requests deletion of the volume without waiting for completion.
    ///
    /// Snapshots taken earlier are not affected.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::InvalidState`] unless the volume is created and
    /// detached, or [`VolumeError::ProviderRequest`] when the provider rejects
    /// the request; the state is unchanged on error.
    pub async fn delete(&mut self) -> Outcome<(), P> {
        let LifecycleState::Created { volume_id: current } = &self.state else {
            return Err(self.invalid_state(Operation::Delete));
        };
        let volume_id = current.clone();

        self.provider
            .delete_volume(&volume_id)
            .await
            .map_err(|err| VolumeError::provider(Operation::Delete, &volume_id, err))?;

        info!(volume = %volume_id, "volume deletion requested");
        self.state = LifecycleState::Deleted { volume_id };
        Ok(())
    }

    /// Takes a snapshot and waits for it to complete.
    ///
    /// The lifecycle state is unchanged; the id is recorded in
    /// [`Self::snapshots`].
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::InvalidState`] unless created or attached,
    /// [`VolumeError::ProviderRequest`] when the request fails,
    /// [`VolumeError::SnapshotTimeout`] when the snapshot budget runs out,
    /// and [`VolumeError::ResourceFailed`] when the snapshot fails.
    pub async fn snapshot(&mut self) -> Outcome<SnapshotId, P> {
        let volume_id = match &self.state {
            LifecycleState::Created { volume_id: current }
            | LifecycleState::Attached {
                volume_id: current, ..
            } => current.clone(),
            LifecycleState::Absent | LifecycleState::Deleted { .. } => {
                return Err(self.invalid_state(Operation::Snapshot));
            }
        };

        let snapshot_id = self
            .provider
            .create_snapshot(&volume_id)
            .await
            .map_err(|err| VolumeError::provider(Operation::Snapshot, &volume_id, err))?;
        debug!(volume = %volume_id, snapshot = %snapshot_id, "snapshot submitted");

        let outcome = self
            .provider
            .wait_until(
                ResourceKind::Snapshot,
                snapshot_id.as_str(),
                TargetStatus::Completed,
                self.settings.snapshot_poll,
            )
            .await
            .map_err(|err| VolumeError::provider(Operation::Snapshot, &snapshot_id, err))?;

        match outcome {
            WaitOutcome::Reached { attempts } => {
                info!(volume = %volume_id, snapshot = %snapshot_id, attempts,
                    "snapshot completed");
                self.snapshots.push(snapshot_id.clone());
                Ok(snapshot_id)
            }
            WaitOutcome::Failed { status, .. } => Err(VolumeError::ResourceFailed {
                operation: Operation::Snapshot,
                kind: ResourceKind::Snapshot,
                id: snapshot_id.to_string(),
                status,
            }),
            WaitOutcome::Exhausted { attempts, .. } => Err(VolumeError::SnapshotTimeout {
                snapshot_id,
                volume_id,
                attempts,
            }),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> &LifecycleState {
        &self.state
    }

    /// Volume data, including the provider id once assigned.
    #[must_use]
    pub const fn volume(&self) -> &Volume {
        &self.volume
    }

    /// Active attachment, if attached.
    #[must_use]
    pub const fn attachment(&self) -> Option<&Attachment> {
        self.state.attachment()
    }

    /// Resolved kernel device path, if attached.
    #[must_use]
    pub fn device_path(&self) -> Option<&Utf8Path> {
        self.attachment()
            .map(|attachment| attachment.device_path.as_path())
    }

    /// Snapshots taken by this controller, oldest first.
    #[must_use]
    pub fn snapshots(&self) -> &[SnapshotId] {
        &self.snapshots
    }

    /// Settings in effect.
    #[must_use]
    pub const fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Provider handle.
    #[must_use]
    pub const fn provider(&self) -> &P {
        &self.provider
    }

    async fn wait_for_volume(&self, operation: Operation, volume_id: &VolumeId) -> Outcome<(), P> {
        let outcome = self
            .provider
            .wait_until(
                ResourceKind::Volume,
                volume_id.as_str(),
                TargetStatus::Available,
                self.settings.provisioning_poll,
            )
            .await
            .map_err(|err| VolumeError::provider(operation, volume_id, err))?;

        outcome.require(
            operation,
            ResourceKind::Volume,
            volume_id.as_str(),
            TargetStatus::Available,
        )
    }

    fn invalid_state(&self, operation: Operation) -> VolumeError<P::Error> {
        debug!(%operation, state = self.state.name(), "rejected lifecycle transition");
        VolumeError::InvalidState {
            operation,
            state: self.state.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::provider::ResourceStatus;
    use crate::test_support::{
        FakeDevices, ProviderCall, ScriptedCall, ScriptedProvider, StaticMetadata,
    };
    use crate::volume::BYTES_PER_GIB;
    use rstest::{fixture, rstest};

    type Controller = VolumeController<ScriptedProvider, StaticMetadata, FakeDevices>;

    fn fast_settings() -> ControllerSettings {
        let poll = PollConfig::new(Duration::from_millis(1), 3);
        ControllerSettings {
            provisioning_poll: poll,
            snapshot_poll: poll,
            slot_policy: SlotPolicy::default(),
        }
    }

    #[fixture]
    fn provider() -> ScriptedProvider {
        ScriptedProvider::new()
    }

    fn controller(provider: &ScriptedProvider, local: FakeDevices) -> Controller {
        VolumeController::new(
            8 * BYTES_PER_GIB,
            provider.clone(),
            StaticMetadata::new(["sda1"]),
            local,
        )
        .with_settings(fast_settings())
    }

    async fn created(provider: &ScriptedProvider, local: FakeDevices) -> Controller {
        let mut controller = controller(provider, local);
        controller
            .create(Zone::from("fr-par-1"), Tags::new(), Encryption::Disabled)
            .await
            .expect("create succeeds");
        controller
    }

    #[rstest]
    #[case(0)]
    #[case(BYTES_PER_GIB - 1)]
    #[case(3 * BYTES_PER_GIB + 512)]
    #[tokio::test]
    async fn create_rejects_fractional_sizes(provider: ScriptedProvider, #[case] bytes: u64) {
        let mut controller = VolumeController::new(
            bytes,
            provider.clone(),
            StaticMetadata::new(["sda1"]),
            FakeDevices::new(),
        );

        let err = controller
            .create(Zone::from("fr-par-1"), Tags::new(), Encryption::Disabled)
            .await
            .expect_err("size is invalid");

        assert!(matches!(err, VolumeError::InvalidSize { bytes: b } if b == bytes));
        assert!(provider.calls().is_empty());
        assert_eq!(controller.state(), &LifecycleState::Absent);
    }

    #[rstest]
    #[tokio::test]
    async fn create_submits_whole_gibibytes_and_key(provider: ScriptedProvider) {
        let mut controller = controller(&provider, FakeDevices::new());
        let tags = Tags::from([(String::from("role"), String::from("scratch"))]);

        let id = controller
            .create(
                Zone::from("fr-par-2"),
                tags.clone(),
                Encryption::from_parts(true, Some(String::from("key-1"))),
            )
            .await
            .expect("create succeeds");

        assert_eq!(id.as_str(), "vol-1");
        let Some(ProviderCall::Create(spec)) = provider.calls().first().cloned() else {
            panic!("create call recorded first");
        };
        assert_eq!(spec.size_gib, 8);
        assert_eq!(spec.zone.as_str(), "fr-par-2");
        assert_eq!(spec.tags, tags);
        assert!(spec.encrypted);
        assert_eq!(spec.key_ref.as_deref(), Some("key-1"));
    }

    #[rstest]
    #[tokio::test]
    async fn create_timeout_keeps_id_but_stays_absent(provider: ScriptedProvider) {
        provider.stick_status(
            ResourceKind::Volume,
            ResourceStatus::Pending(String::from("creating")),
        );
        let mut controller = controller(&provider, FakeDevices::new());

        let err = controller
            .create(Zone::from("fr-par-1"), Tags::new(), Encryption::Disabled)
            .await
            .expect_err("volume never becomes available");

        assert!(matches!(
            err,
            VolumeError::ProvisioningTimeout { attempts: 3, .. }
        ));
        assert_eq!(controller.state(), &LifecycleState::Absent);
        assert_eq!(controller.volume().id, Some(VolumeId::from("vol-1")));
    }

    #[rstest]
    #[tokio::test]
    async fn create_retry_after_timeout_reuses_submitted_volume(provider: ScriptedProvider) {
        provider.stick_status(
            ResourceKind::Volume,
            ResourceStatus::Pending(String::from("creating")),
        );
        let mut controller = controller(&provider, FakeDevices::new());
        controller
            .create(Zone::from("fr-par-1"), Tags::new(), Encryption::Disabled)
            .await
            .expect_err("volume never becomes available");
        provider.stick_status(ResourceKind::Volume, ResourceStatus::Available);

        let id = controller
            .create(Zone::from("fr-par-1"), Tags::new(), Encryption::Disabled)
            .await
            .expect("retry completes the first volume");

        assert_eq!(id, VolumeId::from("vol-1"));
        assert_eq!(
            controller.state(),
            &LifecycleState::Created {
                volume_id: VolumeId::from("vol-1"),
            }
        );
        let creates = provider
            .calls()
            .into_iter()
            .filter(|call| matches!(call, ProviderCall::Create(_)))
            .count();
        assert_eq!(creates, 1, "no second volume is submitted");
    }

    #[rstest]
    #[tokio::test]
    async fn rejected_create_stays_absent(provider: ScriptedProvider) {
        provider.fail_next(ScriptedCall::Create);
        let mut controller = controller(&provider, FakeDevices::new());

        let err = controller
            .create(Zone::from("fr-par-1"), Tags::new(), Encryption::Disabled)
            .await
            .expect_err("provider rejects");

        assert!(matches!(
            err,
            VolumeError::ProviderRequest {
                operation: Operation::Create,
                ..
            }
        ));
        assert_eq!(controller.volume().id, None);
        assert_eq!(controller.state(), &LifecycleState::Absent);
    }

    #[rstest]
    #[tokio::test]
    async fn failed_attach_stays_created(provider: ScriptedProvider) {
        let local = FakeDevices::new().with_listing(["sda"]);
        let mut controller = created(&provider, local).await;

        let err = controller
            .attach(&InstanceId::from("i-1"))
            .await
            .expect_err("no device appears");

        assert!(matches!(err, VolumeError::DeviceCorrelation { .. }));
        assert!(matches!(controller.state(), LifecycleState::Created { .. }));
        assert_eq!(controller.attachment(), None);
    }

    #[rstest]
    #[tokio::test]
    async fn detach_failure_keeps_attachment(provider: ScriptedProvider) {
        let local = FakeDevices::new()
            .with_listing(["sda"])
            .with_listing(["sda", "sdz"])
            .with_path("sdz", "/dev/sdz");
        let mut controller = created(&provider, local).await;
        controller
            .attach(&InstanceId::from("i-1"))
            .await
            .expect("attach succeeds");
        provider.fail_next(ScriptedCall::Detach);

        let err = controller.detach().await.expect_err("provider refuses");

        assert!(matches!(err, VolumeError::Detach { .. }));
        assert!(matches!(controller.state(), LifecycleState::Attached { .. }));
        assert_eq!(controller.device_path(), Some(Utf8Path::new("/dev/sdz")));
    }

    #[rstest]
    #[tokio::test]
    async fn delete_failure_keeps_state(provider: ScriptedProvider) {
        let mut controller = created(&provider, FakeDevices::new()).await;
        provider.fail_next(ScriptedCall::Delete);

        let err = controller.delete().await.expect_err("provider refuses");

        assert!(matches!(
            err,
            VolumeError::ProviderRequest {
                operation: Operation::Delete,
                ..
            }
        ));
        assert!(matches!(controller.state(), LifecycleState::Created { .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn failed_snapshot_is_not_recorded(provider: ScriptedProvider) {
        let mut controller = created(&provider, FakeDevices::new()).await;
        provider.stick_status(
            ResourceKind::Snapshot,
            ResourceStatus::Failed(String::from("error")),
        );

        let err = controller.snapshot().await.expect_err("snapshot fails");

        assert!(matches!(err, VolumeError::ResourceFailed { .. }));
        assert!(controller.snapshots().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn snapshot_before_create_is_rejected(provider: ScriptedProvider) {
        let mut controller = controller(&provider, FakeDevices::new());

        let err = controller.snapshot().await.expect_err("nothing to snapshot");

        assert!(matches!(
            err,
            VolumeError::InvalidState {
                operation: Operation::Snapshot,
                state: "absent",
            }
        ));
        assert!(provider.calls().is_empty());
    }
}
