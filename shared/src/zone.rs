//! Zone domain types
//!
//! A `Zone` mirrors one illumos branded or bhyve zone known to the agent.
//! `configuration` is kept as an opaque JSON document (zonecfg resources
//! vary too much by brand to model exhaustively); `provisioning`, parsed out
//! of `configuration.provisioning`, is typed because the Provisioning
//! Orchestrator drives its shape directly.

use crate::task::{Provisioner, SshCredentials, SyncFolder};
use serde::{Deserialize, Serialize};

/// Zone lifecycle state as last observed by the agent. Refreshed on every
/// zone detail read and on every task completion touching the zone (I5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneStatus {
    Configured,
    Installed,
    Ready,
    Running,
    ShuttingDown,
    Down,
    Incomplete,
}

impl ZoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneStatus::Configured => "configured",
            ZoneStatus::Installed => "installed",
            ZoneStatus::Ready => "ready",
            ZoneStatus::Running => "running",
            ZoneStatus::ShuttingDown => "shutting_down",
            ZoneStatus::Down => "down",
            ZoneStatus::Incomplete => "incomplete",
        }
    }

    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        Ok(match s {
            "configured" => ZoneStatus::Configured,
            "installed" => ZoneStatus::Installed,
            "ready" => ZoneStatus::Ready,
            "running" => ZoneStatus::Running,
            "shutting_down" => ZoneStatus::ShuttingDown,
            "down" => ZoneStatus::Down,
            "incomplete" => ZoneStatus::Incomplete,
            other => anyhow::bail!("unknown zone status: {other}"),
        })
    }
}

/// Zone brand, as reported by `zoneadm list -p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneBrand {
    Bhyve,
    Lipkg,
    Sparse,
    Other,
}

impl ZoneBrand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneBrand::Bhyve => "bhyve",
            ZoneBrand::Lipkg => "lipkg",
            ZoneBrand::Sparse => "sparse",
            ZoneBrand::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "bhyve" => ZoneBrand::Bhyve,
            "lipkg" => ZoneBrand::Lipkg,
            "sparse" => ZoneBrand::Sparse,
            _ => ZoneBrand::Other,
        }
    }
}

/// One network attachment in a provisioning spec. The interface named
/// `"control"` by convention is the one the orchestrator waits on for SSH
/// reachability (see `TaskOperation::ZoneWaitSsh`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSpec {
    pub name: String,
    pub vnic: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

impl NetworkSpec {
    pub fn is_control(&self) -> bool {
        self.name == "control"
    }
}

/// Provisioning document attached to a zone's configuration. Drives the
/// dependency chain the Provisioning Orchestrator lays down.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProvisioningSpec {
    #[serde(default)]
    pub artifact_id: Option<String>,
    #[serde(default)]
    pub recipe_id: Option<String>,
    #[serde(default)]
    pub skip_boot: bool,
    #[serde(default)]
    pub skip_recipe: bool,
    #[serde(default)]
    pub credentials: Option<SshCredentials>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    #[serde(default)]
    pub folders: Vec<SyncFolder>,
    #[serde(default)]
    pub provisioners: Vec<Provisioner>,
}

impl ProvisioningSpec {
    /// The network interface provisioning waits on for SSH reachability,
    /// falling back to an explicit `ip` field when no networks array
    /// carries a `"control"` entry.
    pub fn target_ip(&self) -> Option<&str> {
        self.networks
            .iter()
            .find(|n| n.is_control())
            .and_then(|n| n.ip.as_deref())
            .or(self.ip.as_deref())
    }
}

/// A known illumos zone, including its last-observed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub zone_id: String,
    pub host: String,
    pub brand: ZoneBrand,
    pub status: ZoneStatus,
    pub zonepath: String,
    /// Opaque zonecfg resource document; brand-specific. `provisioning` is
    /// parsed out of this document's `provisioning` key on demand (I6: it
    /// may be mutated directly by a modify endpoint without queueing a task).
    pub configuration: serde_json::Value,
    /// True once the host no longer reports this zone but the record
    /// persists for audit (I5).
    pub is_orphaned: bool,
    /// True when this record was created from an unsolicited host scan
    /// rather than an API `POST /zones`.
    pub auto_discovered: bool,
    pub last_seen: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Zone {
    /// Parse the `provisioning` key out of `configuration`, if present.
    pub fn provisioning(&self) -> anyhow::Result<Option<ProvisioningSpec>> {
        match self.configuration.get("provisioning") {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

/// A reusable provisioning template a client can reference by id instead of
/// repeating the full provisioning document on every `POST /zones`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningProfile {
    pub id: String,
    pub name: String,
    pub spec: ProvisioningSpec,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A named console automation script run via `zlogin` before SSH is
/// available (the `zone_setup` step's payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,
    pub name: String,
    pub script: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_status_round_trips() {
        for s in [
            ZoneStatus::Configured,
            ZoneStatus::Running,
            ZoneStatus::Incomplete,
            ZoneStatus::Ready,
        ] {
            assert_eq!(ZoneStatus::from_str(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn unknown_status_string_is_rejected() {
        assert!(ZoneStatus::from_str("bogus").is_err());
    }

    #[test]
    fn target_ip_prefers_control_network_over_flat_ip() {
        let spec = ProvisioningSpec {
            ip: Some("10.0.0.9".to_string()),
            networks: vec![NetworkSpec {
                name: "control".to_string(),
                vnic: "vnic0".to_string(),
                ip: Some("10.0.0.5".to_string()),
                gateway: None,
            }],
            ..Default::default()
        };
        assert_eq!(spec.target_ip(), Some("10.0.0.5"));
    }

    #[test]
    fn target_ip_falls_back_to_flat_field() {
        let spec = ProvisioningSpec {
            ip: Some("10.0.0.9".to_string()),
            ..Default::default()
        };
        assert_eq!(spec.target_ip(), Some("10.0.0.9"));
    }

    #[test]
    fn zone_parses_provisioning_from_configuration_document() {
        let zone = Zone {
            name: "vm-a".to_string(),
            zone_id: "1".to_string(),
            host: "hv01".to_string(),
            brand: ZoneBrand::Bhyve,
            status: ZoneStatus::Installed,
            zonepath: "/zones/vm-a".to_string(),
            configuration: serde_json::json!({
                "provisioning": { "artifact_id": "art-1", "recipe_id": "r-1" }
            }),
            is_orphaned: false,
            auto_discovered: false,
            last_seen: 0,
            created_at: 0,
            updated_at: 0,
        };
        let provisioning = zone.provisioning().unwrap().unwrap();
        assert_eq!(provisioning.artifact_id.as_deref(), Some("art-1"));
    }
}
