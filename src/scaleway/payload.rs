//! Request and response bodies for the Scaleway Instances API.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::provider::{ResourceStatus, Tags};

const STATE_AVAILABLE: &str = "available";
const FAILED_STATES: [&str; 2] = ["error", "invalid_data"];

#[derive(Clone, Debug, Serialize)]
pub(super) struct CreateVolumeRequest {
    pub name: String,
    pub size: u64,
    pub volume_type: String,
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub(super) struct CreateSnapshotRequest {
    pub name: String,
    pub volume_id: String,
    pub project: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct VolumeEnvelope {
    pub volume: ScalewayVolume,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct ScalewayVolume {
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub server: Option<ServerReference>,
}

/// Server a volume is attached to; only its presence is inspected.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct ServerReference {}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct SnapshotEnvelope {
    pub snapshot: ScalewaySnapshot,
}

#[derive(Clone, Debug, Deserialize)]
pub(super) struct ScalewaySnapshot {
    pub id: String,
    #[serde(default)]
    pub state: String,
}

/// Volume reference inside a server's volume map.
#[derive(Clone, Debug, Serialize)]
pub(super) struct VolumeAttachment {
    pub id: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub boot: bool,
}

/// Request body for `PATCH /servers/{id}`; the map is keyed by slot index
/// with `"0"` holding the boot volume.
#[derive(Clone, Debug, Serialize)]
pub(super) struct UpdateInstanceVolumesRequest {
    pub volumes: HashMap<String, VolumeAttachment>,
}

impl ScalewayVolume {
    /// Maps the volume state onto the provider-neutral status. A ready volume
    /// with a server reference is attached.
    pub(super) fn status(&self) -> ResourceStatus {
        if FAILED_STATES.contains(&self.state.as_str()) {
            return ResourceStatus::Failed(self.state.clone());
        }
        if self.state != STATE_AVAILABLE {
            return ResourceStatus::Pending(self.state.clone());
        }
        if self.server.is_some() {
            ResourceStatus::Attached
        } else {
            ResourceStatus::Available
        }
    }
}

impl ScalewaySnapshot {
    pub(super) fn status(&self) -> ResourceStatus {
        if FAILED_STATES.contains(&self.state.as_str()) {
            ResourceStatus::Failed(self.state.clone())
        } else if self.state == STATE_AVAILABLE {
            ResourceStatus::Completed
        } else {
            ResourceStatus::Pending(self.state.clone())
        }
    }
}

/// Scaleway tags are plain strings; pairs are flattened to `key=value`.
pub(super) fn flatten_tags(tags: &Tags) -> Vec<String> {
    tags.iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{key}={value}")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn volume(state: &str, attached: bool) -> ScalewayVolume {
        ScalewayVolume {
            id: String::from("vol-1"),
            state: state.to_owned(),
            server: attached.then_some(ServerReference {}),
        }
    }

    #[rstest]
    #[case("available", false, ResourceStatus::Available)]
    #[case("available", true, ResourceStatus::Attached)]
    #[case("hotsyncing", true, ResourceStatus::Pending(String::from("hotsyncing")))]
    #[case("error", false, ResourceStatus::Failed(String::from("error")))]
    fn volume_states_map_to_statuses(
        #[case] state: &str,
        #[case] attached: bool,
        #[case] expected: ResourceStatus,
    ) {
        assert_eq!(volume(state, attached).status(), expected);
    }

    #[rstest]
    #[case("snapshotting", ResourceStatus::Pending(String::from("snapshotting")))]
    #[case("available", ResourceStatus::Completed)]
    #[case("invalid_data", ResourceStatus::Failed(String::from("invalid_data")))]
    fn snapshot_states_map_to_statuses(#[case] state: &str, #[case] expected: ResourceStatus) {
        let snapshot = ScalewaySnapshot {
            id: String::from("snap-1"),
            state: state.to_owned(),
        };
        assert_eq!(snapshot.status(), expected);
    }

    #[test]
    fn volume_response_tolerates_missing_server() {
        let parsed: VolumeEnvelope =
            serde_json::from_str(r#"{"volume":{"id":"vol-1","state":"available","server":null}}"#)
                .expect("decode");
        assert_eq!(parsed.volume.status(), ResourceStatus::Available);
    }

    #[test]
    fn volume_attachment_serialises_without_boot_when_false() {
        let attachment = VolumeAttachment {
            id: String::from("vol-123"),
            boot: false,
        };
        let json = serde_json::to_string(&attachment).expect("serialise");
        assert!(!json.contains("boot"));
    }

    #[test]
    fn update_request_serialises_volume_map() {
        let volumes = HashMap::from([
            (
                String::from("0"),
                VolumeAttachment {
                    id: String::from("root-vol"),
                    boot: true,
                },
            ),
            (
                String::from("25"),
                VolumeAttachment {
                    id: String::from("data-vol"),
                    boot: false,
                },
            ),
        ]);
        let json = serde_json::to_string(&UpdateInstanceVolumesRequest { volumes })
            .expect("serialise");
        assert!(json.contains(r#""boot":true"#));
        assert!(json.contains(r#""25":{"id":"data-vol"}"#));
    }

    #[test]
    fn tags_flatten_to_key_value_strings() {
        let tags = Tags::from([
            (String::from("role"), String::from("scratch")),
            (String::from("bootvol"), String::new()),
        ]);
        assert_eq!(flatten_tags(&tags), vec!["bootvol", "role=scratch"]);
    }

    #[test]
    fn create_request_omits_empty_optional_fields() {
        let request = CreateVolumeRequest {
            name: String::from("bootvol-1"),
            size: 8 << 30,
            volume_type: String::from("b_ssd"),
            project: String::from("project"),
            organization: None,
            tags: Vec::new(),
        };
        let json = serde_json::to_string(&request).expect("serialise");
        assert!(!json.contains("organization"));
        assert!(!json.contains("tags"));
        assert!(json.contains(r#""size":8589934592"#));
    }
}
