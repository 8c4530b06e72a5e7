//! Volume data, attachments, and lifecycle states.

use camino::Utf8PathBuf;

use crate::device::DeviceSlot;
use crate::provider::{Tags, VolumeSpec};
use crate::types::{InstanceId, VolumeId, Zone};

const GIB_SHIFT: u32 = 30;

/// Number of bytes in one GiB.
pub const BYTES_PER_GIB: u64 = 1 << GIB_SHIFT;

/// Encryption settings for a volume.
///
/// A key reference can only be expressed for an encrypted volume.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Encryption {
    /// Volume is stored unencrypted.
    #[default]
    Disabled,
    /// Volume is encrypted, optionally with a caller-supplied key.
    Enabled {
        /// Reference to the key used for encryption.
        key_ref: Option<String>,
    },
}

impl Encryption {
    /// Builds settings from a flag and optional key reference. The key is
    /// dropped when `encrypted` is false.
    #[must_use]
    pub fn from_parts(encrypted: bool, key_ref: Option<String>) -> Self {
        if encrypted {
            Self::Enabled {
                key_ref: key_ref.map(|key| key.trim().to_owned()).filter(|key| !key.is_empty()),
            }
        } else {
            Self::Disabled
        }
    }

    /// Returns `true` for encrypted volumes.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }

    /// Key reference, present only for encrypted volumes.
    #[must_use]
    pub fn key_ref(&self) -> Option<&str> {
        match self {
            Self::Enabled { key_ref } => key_ref.as_deref(),
            Self::Disabled => None,
        }
    }
}

/// Data describing the volume a controller manages.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    /// Provider-assigned identifier, absent until creation is submitted.
    pub id: Option<VolumeId>,
    /// Requested size in bytes.
    pub size_bytes: u64,
    /// Placement zone, set on creation.
    pub zone: Option<Zone>,
    /// Tags applied on creation.
    pub tags: Tags,
    /// Encryption settings applied on creation.
    pub encryption: Encryption,
}

impl Volume {
    /// Describes a volume of `size_bytes` that has not been created yet.
    #[must_use]
    pub fn new(size_bytes: u64) -> Self {
        Self {
            id: None,
            size_bytes,
            zone: None,
            tags: Tags::new(),
            encryption: Encryption::Disabled,
        }
    }

    /// Describes a volume of `size_gib` GiB. Returns `None` on overflow.
    #[must_use]
    pub fn with_size_gib(size_gib: u64) -> Option<Self> {
        size_gib.checked_mul(BYTES_PER_GIB).map(Self::new)
    }

    /// Size in whole GiB, or `None` when the byte size is zero or not a
    /// whole number of GiB.
    #[must_use]
    pub const fn size_gib(&self) -> Option<u64> {
        if self.size_bytes == 0 || self.size_bytes & (BYTES_PER_GIB - 1) != 0 {
            return None;
        }
        Some(self.size_bytes >> GIB_SHIFT)
    }

    pub(crate) fn spec(&self, size_gib: u64, zone: &Zone) -> VolumeSpec {
        VolumeSpec {
            size_gib,
            zone: zone.clone(),
            tags: self.tags.clone(),
            encrypted: self.encryption.is_enabled(),
            key_ref: self.encryption.key_ref().map(str::to_owned),
        }
    }
}

/// Attachment of the volume to a compute instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attachment {
    /// Instance the volume is attached to.
    pub instance_id: InstanceId,
    /// Provider-facing slot used for the attachment.
    pub slot: DeviceSlot,
    /// Kernel device path the guest can open.
    pub device_path: Utf8PathBuf,
}

/// Lifecycle state of a managed volume.
///
/// Per-state data lives in the variants, so an attachment only exists while
/// the volume is attached.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum LifecycleState {
    /// Nothing has been created yet.
    #[default]
    Absent,
    /// Volume exists and is detached.
    Created {
        /// Volume identifier.
        volume_id: VolumeId,
    },
    /// Volume is attached and its device path resolved.
    Attached {
        /// Volume identifier.
        volume_id: VolumeId,
        /// Active attachment.
        attachment: Attachment,
    },
    /// Deletion has been requested.
    Deleted {
        /// Volume identifier.
        volume_id: VolumeId,
    },
}

impl LifecycleState {
    /// Short name used in logs and errors.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Created { .. } => "created",
            Self::Attached { .. } => "attached",
            Self::Deleted { .. } => "deleted",
        }
    }

    /// Attachment, when the volume is attached.
    #[must_use]
    pub const fn attachment(&self) -> Option<&Attachment> {
        match self {
            Self::Attached { attachment, .. } => Some(attachment),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(8 * BYTES_PER_GIB, Some(8))]
    #[case(BYTES_PER_GIB, Some(1))]
    #[case(0, None)]
    #[case(BYTES_PER_GIB + 1, None)]
    #[case(512 * 1024 * 1024, None)]
    fn size_gib_requires_whole_gibibytes(#[case] bytes: u64, #[case] expected: Option<u64>) {
        assert_eq!(Volume::new(bytes).size_gib(), expected);
    }

    #[test]
    fn with_size_gib_rejects_overflow() {
        assert_eq!(Volume::with_size_gib(u64::MAX), None);
    }

    #[test]
    fn key_is_dropped_for_unencrypted_volumes() {
        let encryption = Encryption::from_parts(false, Some(String::from("kms-key")));
        assert_eq!(encryption, Encryption::Disabled);
        assert_eq!(encryption.key_ref(), None);
    }

    #[test]
    fn key_is_kept_for_encrypted_volumes() {
        let encryption = Encryption::from_parts(true, Some(String::from(" kms-key ")));
        assert!(encryption.is_enabled());
        assert_eq!(encryption.key_ref(), Some("kms-key"));
    }
}
