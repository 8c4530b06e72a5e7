//! Instance volume map reads and updates.

use std::collections::BTreeMap;

use reqwest::Method;
use tracing::{debug, warn};

use crate::device::DeviceSlot;
use crate::types::{InstanceId, VolumeId};

use super::payload::{UpdateInstanceVolumesRequest, VolumeAttachment};
use super::{ScalewayProvider, ScalewayProviderError};

const BOOT_INDEX: u32 = 0;

/// Volumes mapped on a server, keyed by slot index.
///
/// Keys that are not slot indices are kept verbatim so that rewriting the
/// map never detaches a volume it could not interpret.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(super) struct VolumeMap {
    entries: BTreeMap<u32, String>,
    unindexed: BTreeMap<String, String>,
}

impl VolumeMap {
    fn from_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut map = Self::default();
        for (key, volume_id) in entries {
            match key.parse::<u32>() {
                Ok(index) => {
                    map.entries.insert(index, volume_id.to_owned());
                }
                Err(_) => {
                    warn!(key, volume = volume_id, "keeping non-numeric volume map key as is");
                    map.unindexed.insert(key.to_owned(), volume_id.to_owned());
                }
            }
        }
        map
    }

    /// Device names for every occupied index.
    pub(super) fn device_names(&self) -> Vec<String> {
        self.entries
            .keys()
            .filter_map(|index| DeviceSlot::from_index(*index))
            .map(DeviceSlot::device_name)
            .collect()
    }

    /// Places `volume` at `slot`. Re-inserting the same volume is a no-op.
    pub(super) fn insert(
        &mut self,
        volume: &VolumeId,
        instance: &InstanceId,
        slot: DeviceSlot,
    ) -> Result<(), ScalewayProviderError> {
        let index = slot.index();
        if let Some(occupant) = self.entries.get(&index)
            && occupant != volume.as_str()
        {
            return Err(ScalewayProviderError::SlotOccupied {
                instance_id: instance.to_string(),
                slot: slot.to_string(),
                occupant: occupant.clone(),
            });
        }
        self.entries.insert(index, volume.to_string());
        Ok(())
    }

    /// Drops `volume` from the map wherever it is mapped.
    pub(super) fn remove(
        &mut self,
        volume: &VolumeId,
        instance: &InstanceId,
        slot: DeviceSlot,
    ) -> Result<(), ScalewayProviderError> {
        if let Some(key) = self
            .unindexed
            .iter()
            .find(|(_, id)| id.as_str() == volume.as_str())
            .map(|(key, _)| key.clone())
        {
            debug!(%volume, %instance, key, "volume mapped under a non-numeric key");
            self.unindexed.remove(&key);
            return Ok(());
        }
        let found = self
            .entries
            .iter()
            .find(|(_, id)| id.as_str() == volume.as_str())
            .map(|(index, _)| *index);
        let Some(index) = found else {
            return Err(ScalewayProviderError::VolumeNotAttached {
                volume_id: volume.to_string(),
                instance_id: instance.to_string(),
            });
        };
        if index != slot.index() {
            debug!(%volume, %instance, %slot, index, "volume mapped at a different index");
        }
        self.entries.remove(&index);
        Ok(())
    }

    fn to_request(&self) -> UpdateInstanceVolumesRequest {
        let indexed = self.entries.iter().map(|(index, id)| {
            (
                index.to_string(),
                VolumeAttachment {
                    id: id.clone(),
                    boot: *index == BOOT_INDEX,
                },
            )
        });
        let unindexed = self.unindexed.iter().map(|(key, id)| {
            (
                key.clone(),
                VolumeAttachment {
                    id: id.clone(),
                    boot: false,
                },
            )
        });
        UpdateInstanceVolumesRequest {
            volumes: indexed.chain(unindexed).collect(),
        }
    }
}

impl ScalewayProvider {
    /// Reads the current volume map of `instance` through `scaleway-rs`.
    pub(super) async fn volume_map(
        &self,
        instance: &InstanceId,
    ) -> Result<VolumeMap, ScalewayProviderError> {
        let server = self
            .api
            .get_instance_async(self.zone.as_str(), instance.as_str())
            .await?;
        Ok(VolumeMap::from_entries(
            server
                .volumes
                .volumes
                .iter()
                .map(|(key, volume)| (key.as_str(), volume.id.as_str())),
        ))
    }

    /// Replaces the volume map of `instance`.
    pub(super) async fn patch_volume_map(
        &self,
        instance: &InstanceId,
        map: &VolumeMap,
    ) -> Result<(), ScalewayProviderError> {
        let request = map.to_request();
        self.send(
            Method::PATCH,
            &format!("servers/{instance}"),
            Some(&request),
        )
        .await?
        .into_success()
        .map(|_| ())
    }
}
