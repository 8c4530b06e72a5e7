//! REST calls for volumes and snapshots.

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::provider::{ResourceStatus, VolumeSpec};
use crate::types::{SnapshotId, VolumeId};
use crate::volume::BYTES_PER_GIB;

use super::payload::{
    CreateSnapshotRequest, CreateVolumeRequest, SnapshotEnvelope, VolumeEnvelope, flatten_tags,
};
use super::{HTTP_CLIENT, ScalewayProvider, ScalewayProviderError};

/// Status and body of a completed API call.
pub(super) struct ApiResponse {
    method: &'static str,
    url: String,
    status: StatusCode,
    body: String,
}

impl ApiResponse {
    pub(super) fn into_success(self) -> Result<Self, ScalewayProviderError> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(ScalewayProviderError::Api {
            method: self.method,
            url: self.url,
            status: self.status.as_u16(),
            body: self.body,
        })
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T, ScalewayProviderError> {
        serde_json::from_str(&self.body).map_err(|err| ScalewayProviderError::Decode {
            url: self.url.clone(),
            message: err.to_string(),
        })
    }
}

impl ScalewayProvider {
    fn zone_url(&self, path: &str) -> String {
        format!("{}/zones/{}/{path}", self.api_base, self.zone)
    }

    pub(super) async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<ApiResponse, ScalewayProviderError> {
        let url = self.zone_url(path);
        let mut request = HTTP_CLIENT
            .request(method.clone(), &url)
            .header("X-Auth-Token", &self.config.secret_key);
        if let Some(payload) = body {
            request = request.json(payload);
        }

        let transport = |err: reqwest::Error| ScalewayProviderError::Transport {
            url: url.clone(),
            message: err.to_string(),
        };
        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let text = response.text().await.map_err(transport)?;
        debug!(%method, %url, status = status.as_u16(), "scaleway api call");

        Ok(ApiResponse {
            method: method_name(&method),
            url,
            status,
            body: text,
        })
    }

    pub(super) async fn post_volume(
        &self,
        spec: &VolumeSpec,
        name: &str,
    ) -> Result<VolumeId, ScalewayProviderError> {
        let size = spec
            .size_gib
            .checked_mul(BYTES_PER_GIB)
            .ok_or(ScalewayProviderError::SizeOverflow {
                size_gib: spec.size_gib,
            })?;
        let payload = CreateVolumeRequest {
            name: name.to_owned(),
            size,
            volume_type: self.config.volume_type.clone(),
            project: self.config.default_project_id.clone(),
            organization: self.config.default_organization_id.clone(),
            tags: flatten_tags(&spec.tags),
        };
        let response = self
            .send(Method::POST, "volumes", Some(&payload))
            .await?
            .into_success()?;
        let parsed: VolumeEnvelope = response.decode()?;
        Ok(VolumeId::new(parsed.volume.id))
    }

    pub(super) async fn delete_volume_request(
        &self,
        volume: &VolumeId,
    ) -> Result<(), ScalewayProviderError> {
        self.send::<()>(Method::DELETE, &format!("volumes/{volume}"), None)
            .await?
            .into_success()
            .map(|_| ())
    }

    pub(super) async fn post_snapshot(
        &self,
        volume: &VolumeId,
        name: &str,
    ) -> Result<SnapshotId, ScalewayProviderError> {
        let payload = CreateSnapshotRequest {
            name: name.to_owned(),
            volume_id: volume.to_string(),
            project: self.config.default_project_id.clone(),
            organization: self.config.default_organization_id.clone(),
        };
        let response = self
            .send(Method::POST, "snapshots", Some(&payload))
            .await?
            .into_success()?;
        let parsed: SnapshotEnvelope = response.decode()?;
        Ok(SnapshotId::new(parsed.snapshot.id))
    }

    pub(super) async fn volume_status(
        &self,
        id: &str,
    ) -> Result<ResourceStatus, ScalewayProviderError> {
        let response = self
            .send::<()>(Method::GET, &format!("volumes/{id}"), None)
            .await?;
        if response.status == StatusCode::NOT_FOUND {
            return Ok(ResourceStatus::Missing);
        }
        let parsed: VolumeEnvelope = response.into_success()?.decode()?;
        Ok(parsed.volume.status())
    }

    pub(super) async fn snapshot_status(
        &self,
        id: &str,
    ) -> Result<ResourceStatus, ScalewayProviderError> {
        let response = self
            .send::<()>(Method::GET, &format!("snapshots/{id}"), None)
            .await?;
        if response.status == StatusCode::NOT_FOUND {
            return Ok(ResourceStatus::Missing);
        }
        let parsed: SnapshotEnvelope = response.into_success()?.decode()?;
        Ok(parsed.snapshot.status())
    }
}

fn method_name(method: &Method) -> &'static str {
    match *method {
        Method::POST => "POST",
        Method::DELETE => "DELETE",
        Method::PATCH => "PATCH",
        _ => "GET",
    }
}
