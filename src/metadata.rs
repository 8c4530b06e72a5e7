//! Instance metadata access for boot-time block device mappings.
//!
//! Two layouts are understood. Scaleway serves the server configuration as
//! one JSON document whose `volumes` map is keyed by slot index (`"0"` is the
//! boot volume). EC2-style services list one entry per launch device (`ami`,
//! `root`, `ebs1`, ...), and each entry resolves to a device name. Either way
//! the names can include devices the provider API does not report yet, so
//! they are merged into the reserved slot set before choosing a new slot.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::de::IgnoredAny;
use thiserror::Error;

use crate::device::DeviceSlot;
use crate::provider::ProviderFuture;

/// Scaleway server configuration document.
pub const SCALEWAY_METADATA_URL: &str = "http://169.254.42.42/conf?format=json";
/// EC2-style boot-time block device mapping listing.
pub const EC2_METADATA_URL: &str =
    "http://169.254.169.254/latest/meta-data/block-device-mapping/";
/// Per-read timeout for metadata requests.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while reading instance metadata.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MetadataError {
    /// Raised when the endpoint cannot be reached within the timeout.
    #[error("metadata endpoint {url} unreachable: {message}")]
    Unreachable {
        /// Requested URL.
        url: String,
        /// Transport error text.
        message: String,
    },
    /// Raised when the endpoint answers with a non-success status.
    #[error("metadata endpoint {url} returned HTTP {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// Raised when a response body does not match the expected layout.
    #[error("metadata endpoint {url} returned an unreadable document: {message}")]
    Decode {
        /// Requested URL.
        url: String,
        /// Parser error text.
        message: String,
    },
}

/// Source of the boot-time device names of the current instance.
pub trait MetadataSource: Sync {
    /// Returns every device name from the instance's launch mapping.
    fn boot_device_names(&self) -> ProviderFuture<'_, Vec<String>, MetadataError>;
}

/// Layout served by the metadata endpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MetadataFormat {
    /// Scaleway `/conf` JSON with an index-keyed `volumes` map.
    #[default]
    Scaleway,
    /// EC2-style listing, one entry per line, each read from the base URL.
    Ec2,
}

impl MetadataFormat {
    /// Parses a configured format name, ignoring case and whitespace.
    #[must_use]
    pub fn from_name(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scaleway" => Some(Self::Scaleway),
            "ec2" => Some(Self::Ec2),
            _ => None,
        }
    }

    /// Configuration spelling of the format.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Scaleway => "scaleway",
            Self::Ec2 => "ec2",
        }
    }

    /// Well-known endpoint serving this format.
    #[must_use]
    pub const fn default_url(self) -> &'static str {
        match self {
            Self::Scaleway => SCALEWAY_METADATA_URL,
            Self::Ec2 => EC2_METADATA_URL,
        }
    }
}

#[derive(Deserialize)]
struct ServerConf {
    #[serde(default)]
    volumes: BTreeMap<String, IgnoredAny>,
}

/// Reads the launch mapping from an HTTP metadata service.
#[derive(Clone, Debug)]
pub struct HttpMetadataClient {
    client: reqwest::Client,
    format: MetadataFormat,
    url: String,
    timeout: Duration,
}

impl HttpMetadataClient {
    /// Creates a client for the well-known endpoint of `format`.
    #[must_use]
    pub fn new(format: MetadataFormat) -> Self {
        Self {
            client: reqwest::Client::new(),
            format,
            url: format.default_url().to_owned(),
            timeout: METADATA_TIMEOUT,
        }
    }

    /// Points the client at another endpoint. EC2-style base URLs gain a
    /// trailing slash so entry names can be appended.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        let mut endpoint = url.into().trim().to_owned();
        if self.format == MetadataFormat::Ec2 && !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        self.url = endpoint;
        self
    }

    /// Overrides the per-read timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Layout expected from the endpoint.
    #[must_use]
    pub const fn format(&self) -> MetadataFormat {
        self.format
    }

    /// URL of the first request made for each read.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, url: &str) -> Result<String, MetadataError> {
        let unreachable = |err: reqwest::Error| MetadataError::Unreachable {
            url: url.to_owned(),
            message: err.to_string(),
        };

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(unreachable)?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status {
                url: url.to_owned(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(unreachable)
    }

    async fn read_server_conf(&self) -> Result<Vec<String>, MetadataError> {
        let body = self.fetch(&self.url).await?;
        scaleway_device_names(&self.url, &body)
    }

    async fn read_mapping(&self) -> Result<Vec<String>, MetadataError> {
        let index = self.fetch(&self.url).await?;
        let mut names = Vec::new();
        for entry in index.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let url = format!("{}{entry}", self.url);
            let name = self.fetch(&url).await?;
            names.push(name.trim().to_owned());
        }
        Ok(names)
    }
}

/// Device names for the `volumes` map of a Scaleway `/conf` document. Keys
/// that are not slot indices are returned as is.
fn scaleway_device_names(url: &str, body: &str) -> Result<Vec<String>, MetadataError> {
    let conf: ServerConf = serde_json::from_str(body).map_err(|err| MetadataError::Decode {
        url: url.to_owned(),
        message: err.to_string(),
    })?;
    Ok(conf
        .volumes
        .into_keys()
        .map(|key| {
            key.parse::<u32>()
                .ok()
                .and_then(DeviceSlot::from_index)
                .map_or(key, DeviceSlot::device_name)
        })
        .collect())
}

impl Default for HttpMetadataClient {
    fn default() -> Self {
        Self::new(MetadataFormat::default())
    }
}

impl MetadataSource for HttpMetadataClient {
    fn boot_device_names(&self) -> ProviderFuture<'_, Vec<String>, MetadataError> {
        match self.format {
            MetadataFormat::Scaleway => Box::pin(self.read_server_conf()),
            MetadataFormat::Ec2 => Box::pin(self.read_mapping()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_client_reads_scaleway_conf() {
        let client = HttpMetadataClient::default();
        assert_eq!(client.format(), MetadataFormat::Scaleway);
        assert_eq!(client.url(), SCALEWAY_METADATA_URL);
    }

    #[test]
    fn ec2_url_gains_trailing_slash() {
        let client =
            HttpMetadataClient::new(MetadataFormat::Ec2).with_url("http://127.0.0.1:9/mapping");
        assert_eq!(client.url(), "http://127.0.0.1:9/mapping/");
    }

    #[test]
    fn scaleway_url_is_kept_verbatim() {
        let client = HttpMetadataClient::new(MetadataFormat::Scaleway)
            .with_url(" http://127.0.0.1:9/conf?format=json ");
        assert_eq!(client.url(), "http://127.0.0.1:9/conf?format=json");
    }

    #[rstest]
    #[case("scaleway", Some(MetadataFormat::Scaleway))]
    #[case(" EC2 ", Some(MetadataFormat::Ec2))]
    #[case("openstack", None)]
    fn format_names_parse(#[case] value: &str, #[case] expected: Option<MetadataFormat>) {
        assert_eq!(MetadataFormat::from_name(value), expected);
    }

    #[test]
    fn scaleway_volume_indices_become_device_names() {
        let body = r#"{
            "id": "srv-1",
            "volumes": {
                "0": {"id": "root-vol", "volume_type": "l_ssd"},
                "1": {"id": "data-vol", "volume_type": "b_ssd"}
            }
        }"#;
        let names = scaleway_device_names(SCALEWAY_METADATA_URL, body).expect("valid document");
        assert_eq!(names, vec!["/dev/sda", "/dev/sdb"]);
    }

    #[test]
    fn scaleway_document_without_volumes_reserves_nothing() {
        let names =
            scaleway_device_names(SCALEWAY_METADATA_URL, r#"{"id": "srv-1"}"#).expect("valid");
        assert!(names.is_empty());
    }

    #[test]
    fn malformed_scaleway_document_is_a_decode_error() {
        let err = scaleway_device_names(SCALEWAY_METADATA_URL, "ami\nroot\n")
            .expect_err("not JSON");
        assert!(matches!(
            err,
            MetadataError::Decode { ref url, .. } if url == SCALEWAY_METADATA_URL
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_reported() {
        let client = HttpMetadataClient::new(MetadataFormat::Ec2)
            .with_url("http://127.0.0.1:9/mapping/")
            .with_timeout(Duration::from_millis(200));
        let err = client
            .boot_device_names()
            .await
            .expect_err("nothing listens on the discard port");
        assert!(matches!(err, MetadataError::Unreachable { .. }));
    }
}
