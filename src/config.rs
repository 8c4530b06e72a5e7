//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::command::ProcessCommandRunner;
use crate::controller::ControllerSettings;
use crate::device::{DEFAULT_LOWEST_LETTER, SlotPolicy, SystemDevices};
use crate::metadata::{HttpMetadataClient, MetadataFormat};
use crate::wait::PollConfig;

const APP_NAME: &str = "bootvol";

/// Controller and device tooling settings layered from defaults,
/// `bootvol.toml`, and `BOOTVOL_*` environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BOOTVOL",
    discovery(
        app_name = "bootvol",
        env_var = "BOOTVOL_CONFIG_PATH",
        config_file_name = "bootvol.toml",
        dotfile_name = ".bootvol.toml",
        project_file_name = "bootvol.toml"
    )
)]
pub struct VolumeConfig {
    /// Seconds between polls while waiting for create, attach, or detach.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Polls made before a create, attach, or detach wait gives up.
    #[ortho_config(default = 60)]
    pub poll_max_attempts: u32,
    /// Seconds between polls while waiting for a snapshot.
    #[ortho_config(default = 15)]
    pub snapshot_poll_interval_secs: u64,
    /// Polls made before a snapshot wait gives up.
    #[ortho_config(default = 120)]
    pub snapshot_max_attempts: u32,
    /// Metadata layout: `scaleway` (server `/conf` document) or `ec2`
    /// (block-device mapping listing).
    #[ortho_config(default = MetadataFormat::default().name().to_owned())]
    pub metadata_format: String,
    /// Overrides the well-known endpoint of the metadata format.
    pub metadata_url: Option<String>,
    /// Per-request timeout for metadata reads, in seconds.
    #[ortho_config(default = 5)]
    pub metadata_timeout_secs: u64,
    /// Lowest slot letter eligible for new attachments.
    #[ortho_config(default = DEFAULT_LOWEST_LETTER.to_string())]
    pub lowest_slot_letter: String,
    /// Path to the `lsblk` executable.
    #[ortho_config(default = "lsblk".to_owned())]
    pub lsblk_bin: String,
    /// Path to the `udevadm` executable.
    #[ortho_config(default = "udevadm".to_owned())]
    pub udevadm_bin: String,
    /// Upper bound for `udevadm settle`, in seconds.
    #[ortho_config(default = 30)]
    pub settle_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    section: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        section: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            section,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to [{}] in {APP_NAME}.toml",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::InvalidValue(format!(
            "invalid {}: {reason}; check {} or {} in [{}]",
            self.description, self.env_var, self.toml_key, self.section
        ))
    }
}

fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(metadata.missing());
    }
    Ok(())
}

fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(metadata.invalid("must be greater than zero"));
    }
    Ok(())
}

impl VolumeConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks every value and explains how to fix the first bad one.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] for empty tool paths or a blank
    /// metadata URL override and [`ConfigError::InvalidValue`] for zero
    /// budgets, an unknown metadata format, or an unusable slot letter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive(
            self.poll_interval_secs,
            &FieldMetadata::new(
                "poll interval",
                "BOOTVOL_POLL_INTERVAL_SECS",
                "poll_interval_secs",
                APP_NAME,
            ),
        )?;
        require_positive(
            u64::from(self.poll_max_attempts),
            &FieldMetadata::new(
                "poll attempt budget",
                "BOOTVOL_POLL_MAX_ATTEMPTS",
                "poll_max_attempts",
                APP_NAME,
            ),
        )?;
        require_positive(
            self.snapshot_poll_interval_secs,
            &FieldMetadata::new(
                "snapshot poll interval",
                "BOOTVOL_SNAPSHOT_POLL_INTERVAL_SECS",
                "snapshot_poll_interval_secs",
                APP_NAME,
            ),
        )?;
        require_positive(
            u64::from(self.snapshot_max_attempts),
            &FieldMetadata::new(
                "snapshot attempt budget",
                "BOOTVOL_SNAPSHOT_MAX_ATTEMPTS",
                "snapshot_max_attempts",
                APP_NAME,
            ),
        )?;
        require_positive(
            self.metadata_timeout_secs,
            &FieldMetadata::new(
                "metadata timeout",
                "BOOTVOL_METADATA_TIMEOUT_SECS",
                "metadata_timeout_secs",
                APP_NAME,
            ),
        )?;
        require_positive(
            self.settle_timeout_secs,
            &FieldMetadata::new(
                "udevadm settle timeout",
                "BOOTVOL_SETTLE_TIMEOUT_SECS",
                "settle_timeout_secs",
                APP_NAME,
            ),
        )?;
        if let Some(url) = &self.metadata_url {
            require_field(
                url,
                &FieldMetadata::new(
                    "metadata URL",
                    "BOOTVOL_METADATA_URL",
                    "metadata_url",
                    APP_NAME,
                ),
            )?;
        }
        self.metadata_format()?;
        require_field(
            &self.lsblk_bin,
            &FieldMetadata::new("lsblk path", "BOOTVOL_LSBLK_BIN", "lsblk_bin", APP_NAME),
        )?;
        require_field(
            &self.udevadm_bin,
            &FieldMetadata::new(
                "udevadm path",
                "BOOTVOL_UDEVADM_BIN",
                "udevadm_bin",
                APP_NAME,
            ),
        )?;
        self.slot_policy().map(|_| ())
    }

    /// Budget for create, attach, and detach waits.
    #[must_use]
    pub const fn provisioning_poll(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_secs(self.poll_interval_secs),
            self.poll_max_attempts,
        )
    }

    /// Budget for snapshot completion waits.
    #[must_use]
    pub const fn snapshot_poll(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_secs(self.snapshot_poll_interval_secs),
            self.snapshot_max_attempts,
        )
    }

    /// Per-request metadata timeout.
    #[must_use]
    pub const fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    /// Metadata layout named by `metadata_format`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for names other than `scaleway`
    /// and `ec2`.
    pub fn metadata_format(&self) -> Result<MetadataFormat, ConfigError> {
        MetadataFormat::from_name(&self.metadata_format).ok_or_else(|| {
            FieldMetadata::new(
                "metadata format",
                "BOOTVOL_METADATA_FORMAT",
                "metadata_format",
                APP_NAME,
            )
            .invalid("must be scaleway or ec2")
        })
    }

    /// Slot policy built from the configured lowest letter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] unless the value is a single
    /// lowercase letter after the boot device letter.
    pub fn slot_policy(&self) -> Result<SlotPolicy, ConfigError> {
        let metadata = FieldMetadata::new(
            "lowest slot letter",
            "BOOTVOL_LOWEST_SLOT_LETTER",
            "lowest_slot_letter",
            APP_NAME,
        );
        let mut chars = self.lowest_slot_letter.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(letter), None) => SlotPolicy::new(letter)
                .ok_or_else(|| metadata.invalid("must be a lowercase letter between b and z")),
            _ => Err(metadata.invalid("must be exactly one letter")),
        }
    }

    /// Device tooling using the configured `lsblk` and `udevadm` binaries.
    #[must_use]
    pub fn system_devices(&self) -> SystemDevices<ProcessCommandRunner> {
        SystemDevices::with_process_runner()
            .with_lsblk_bin(self.lsblk_bin.trim())
            .with_udevadm_bin(self.udevadm_bin.trim())
            .with_settle_timeout(Duration::from_secs(self.settle_timeout_secs))
    }

    /// Metadata client for the configured format, endpoint, and timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] when the format is unknown.
    pub fn metadata_client(&self) -> Result<HttpMetadataClient, ConfigError> {
        let mut client =
            HttpMetadataClient::new(self.metadata_format()?).with_timeout(self.metadata_timeout());
        if let Some(url) = &self.metadata_url {
            client = client.with_url(url.as_str());
        }
        Ok(client)
    }

    /// Controller settings derived from this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn controller_settings(&self) -> Result<ControllerSettings, ConfigError> {
        self.validate()?;
        Ok(ControllerSettings {
            provisioning_poll: self.provisioning_poll(),
            snapshot_poll: self.snapshot_poll(),
            slot_policy: self.slot_policy()?,
        })
    }
}

/// Scaleway credentials and placement defaults derived from environment
/// variables and configuration files.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// Access key assigned to the Scaleway application. Not needed for API
    /// calls.
    pub access_key: Option<String>,
    /// Secret key used for authentication. This value is required.
    pub secret_key: String,
    /// Organisation identifier used by some Scaleway endpoints.
    pub default_organization_id: Option<String>,
    /// Project that owns created volumes and snapshots.
    pub default_project_id: String,
    /// Zone the provider operates in. Defaults to `fr-par-1`.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Volume type for new volumes. Defaults to `b_ssd`.
    #[ortho_config(default = "b_ssd".to_owned())]
    pub volume_type: String,
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from(APP_NAME)])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation on required fields. Error messages include
    /// guidance on how to provide missing values via environment variables or
    /// configuration files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(
            &self.secret_key,
            &FieldMetadata::new(
                "Scaleway API secret key",
                "SCW_SECRET_KEY",
                "secret_key",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_project_id,
            &FieldMetadata::new(
                "Scaleway project ID",
                "SCW_DEFAULT_PROJECT_ID",
                "default_project_id",
                "scaleway",
            ),
        )?;
        require_field(
            &self.default_zone,
            &FieldMetadata::new(
                "availability zone",
                "SCW_DEFAULT_ZONE",
                "default_zone",
                "scaleway",
            ),
        )?;
        require_field(
            &self.volume_type,
            &FieldMetadata::new("volume type", "SCW_VOLUME_TYPE", "volume_type", "scaleway"),
        )?;
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
