//! Enumeration of claimed device slots and visible kernel devices.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::error::{Operation, VolumeError};
use crate::metadata::MetadataSource;
use crate::provider::ProviderClient;
use crate::types::InstanceId;

use super::local::LocalDevices;
use super::slot::DeviceSlot;

/// Builds the set of slots already claimed on `instance`.
///
/// Boot-time names from the metadata service are read first; a metadata
/// failure means the caller is not running on the target instance and is
/// returned without consulting the provider.
///
/// # Errors
///
/// Returns [`VolumeError::MetadataUnavailable`] when the metadata service
/// cannot be read, or [`VolumeError::ProviderRequest`] when the instance
/// cannot be described.
pub async fn reserved_slots<P, M>(
    provider: &P,
    metadata: &M,
    instance: &InstanceId,
) -> Result<BTreeSet<DeviceSlot>, VolumeError<P::Error>>
where
    P: ProviderClient,
    M: MetadataSource,
{
    let mut reserved = BTreeSet::new();

    let boot_names = metadata.boot_device_names().await?;
    insert_normalised(&mut reserved, &boot_names, "metadata");

    let description = provider
        .describe_instance(instance)
        .await
        .map_err(|err| VolumeError::provider(Operation::Attach, instance, err))?;
    insert_normalised(&mut reserved, &description.device_names, "provider");

    debug!(%instance, reserved = ?render(&reserved), "collected reserved device slots");
    Ok(reserved)
}

/// Snapshot of the top-level block devices visible to the guest kernel.
///
/// # Errors
///
/// Returns [`VolumeError::DeviceInspection`] when the device list cannot be
/// read.
pub fn visible_devices<L, E>(local: &L) -> Result<BTreeSet<String>, VolumeError<E>>
where
    L: LocalDevices,
    E: std::error::Error + 'static,
{
    Ok(local.list_block_devices()?)
}

/// Renders slots in their canonical spelling for logs and errors.
#[must_use]
pub fn render(slots: &BTreeSet<DeviceSlot>) -> Vec<String> {
    slots.iter().map(ToString::to_string).collect()
}

fn insert_normalised(reserved: &mut BTreeSet<DeviceSlot>, names: &[String], source: &str) {
    for name in names {
        if let Some(slot) = DeviceSlot::normalise(name) {
            reserved.insert(slot);
        } else {
            warn!(device = %name, source, "ignoring device name outside the slot namespace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataError;
    use crate::test_support::{FakeDevices, ScriptedProvider, StaticMetadata};

    #[tokio::test]
    async fn merges_metadata_and_provider_mappings() {
        let provider = ScriptedProvider::new();
        provider.set_instance_devices(["/dev/sda1", "/dev/xvdf"]);
        let metadata = StaticMetadata::new(["sda1", "/dev/sdb", "xvdf"]);

        let reserved = reserved_slots(&provider, &metadata, &InstanceId::from("i-123"))
            .await
            .expect("both sources readable");

        assert_eq!(render(&reserved), vec!["sda", "sdb", "sdf"]);
    }

    #[tokio::test]
    async fn metadata_failure_skips_provider() {
        let provider = ScriptedProvider::new();
        let metadata = StaticMetadata::failing(MetadataError::Status {
            url: String::from("http://169.254.169.254/"),
            status: 404,
        });

        let err = reserved_slots(&provider, &metadata, &InstanceId::from("i-123"))
            .await
            .expect_err("metadata is required");

        assert!(matches!(err, VolumeError::MetadataUnavailable(_)));
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn visible_devices_reads_current_listing() {
        let devices = FakeDevices::new().with_listing(["sda", "sdb"]);
        let names: BTreeSet<String> =
            visible_devices::<_, std::io::Error>(&devices).expect("listing scripted");
        assert_eq!(names.len(), 2);
    }
}
