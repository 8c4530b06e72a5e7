//! Scaleway Instances API implementation of [`ProviderClient`].
//!
//! Volumes and snapshots are managed through the Instances REST API. The
//! instance volume map is read through `scaleway-rs` and rewritten with a
//! direct `PATCH`, since the SDK does not expose volume updates. The map is
//! keyed by slot index, so slot `sda` is entry `"0"` and `sdz` is `"25"`.

mod error;
mod payload;
mod requests;
mod volume_map;

use std::sync::LazyLock;
use std::time::Duration;

use scaleway_rs::ScalewayApi;
use uuid::Uuid;

use crate::config::ScalewayConfig;
use crate::device::DeviceSlot;
use crate::provider::{
    InstanceDescription, ProviderClient, ProviderFuture, ResourceKind, ResourceStatus, VolumeSpec,
};
use crate::types::{InstanceId, SnapshotId, VolumeId, Zone};

pub use error::ScalewayProviderError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Base URL of the Scaleway Instances API.
pub const SCALEWAY_INSTANCE_API_BASE: &str = "https://api.scaleway.com/instance/v1";
const RESOURCE_NAME_PREFIX: &str = "bootvol";

static HTTP_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
});

/// Provider bound to a single Scaleway zone.
#[derive(Clone)]
pub struct ScalewayProvider {
    api: ScalewayApi,
    config: ScalewayConfig,
    zone: Zone,
    api_base: String,
}

impl ScalewayProvider {
    /// Constructs a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayProviderError::Config`] when the provided
    /// configuration fails validation.
    pub fn new(config: ScalewayConfig) -> Result<Self, ScalewayProviderError> {
        config.validate()?;
        Ok(Self {
            api: ScalewayApi::new(&config.secret_key),
            zone: Zone::new(config.default_zone.as_str()),
            config,
            api_base: SCALEWAY_INSTANCE_API_BASE.to_owned(),
        })
    }

    /// Points REST calls at a different API base URL.
    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_owned();
        self
    }

    /// Zone every request is sent to.
    #[must_use]
    pub const fn zone(&self) -> &Zone {
        &self.zone
    }

    fn ensure_zone(&self, requested: &Zone) -> Result<(), ScalewayProviderError> {
        if *requested == self.zone {
            return Ok(());
        }
        Err(ScalewayProviderError::ZoneMismatch {
            requested: requested.to_string(),
            configured: self.zone.to_string(),
        })
    }

    fn resource_name() -> String {
        format!("{RESOURCE_NAME_PREFIX}-{}", Uuid::new_v4().simple())
    }
}

impl ProviderClient for ScalewayProvider {
    type Error = ScalewayProviderError;

    fn create_volume<'a>(
        &'a self,
        spec: &'a VolumeSpec,
    ) -> ProviderFuture<'a, VolumeId, Self::Error> {
        Box::pin(async move {
            self.ensure_zone(&spec.zone)?;
            if spec.key_ref.is_some() {
                return Err(ScalewayProviderError::Unsupported {
                    feature: "customer-managed volume encryption keys",
                });
            }
            self.post_volume(spec, &Self::resource_name()).await
        })
    }

    fn describe_instance<'a>(
        &'a self,
        instance: &'a InstanceId,
    ) -> ProviderFuture<'a, InstanceDescription, Self::Error> {
        Box::pin(async move {
            let map = self.volume_map(instance).await?;
            Ok(InstanceDescription {
                device_names: map.device_names(),
            })
        })
    }

    fn attach_volume<'a>(
        &'a self,
        volume: &'a VolumeId,
        instance: &'a InstanceId,
        slot: &'a DeviceSlot,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut map = self.volume_map(instance).await?;
            map.insert(volume, instance, *slot)?;
            self.patch_volume_map(instance, &map).await
        })
    }

    fn detach_volume<'a>(
        &'a self,
        volume: &'a VolumeId,
        instance: &'a InstanceId,
        slot: &'a DeviceSlot,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut map = self.volume_map(instance).await?;
            map.remove(volume, instance, *slot)?;
            self.patch_volume_map(instance, &map).await
        })
    }

    fn delete_volume<'a>(&'a self, volume: &'a VolumeId) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move { self.delete_volume_request(volume).await })
    }

    fn create_snapshot<'a>(
        &'a self,
        volume: &'a VolumeId,
    ) -> ProviderFuture<'a, SnapshotId, Self::Error> {
        Box::pin(async move { self.post_snapshot(volume, &Self::resource_name()).await })
    }

    fn resource_status<'a>(
        &'a self,
        kind: ResourceKind,
        id: &'a str,
    ) -> ProviderFuture<'a, ResourceStatus, Self::Error> {
        Box::pin(async move {
            match kind {
                ResourceKind::Volume | ResourceKind::Attachment => self.volume_status(id).await,
                ResourceKind::Snapshot => self.snapshot_status(id).await,
            }
        })
    }
}
