//! Domain Ports - Boundaries between the driver and the outside world
//!
//! The array is reached only through [`ManagementClient`]; fabric zoning
//! knowledge comes from an optional [`FabricTopology`]. Everything the host
//! volume manager hands in or gets back is defined here as well.

use crate::domain::model::{Instance, InstanceName, InvokeOutcome, MethodArgs};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Protocol
// =============================================================================

/// Host attachment protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Iscsi,
    Fc,
}

impl Protocol {
    /// Single-letter tag used in masking object names
    pub fn tag(&self) -> char {
        match self {
            Protocol::Iscsi => 'I',
            Protocol::Fc => 'F',
        }
    }

    /// Volume type reported back to the host connector
    pub fn driver_volume_type(&self) -> &'static str {
        match self {
            Protocol::Iscsi => "iscsi",
            Protocol::Fc => "fibre_channel",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Iscsi => write!(f, "iSCSI"),
            Protocol::Fc => write!(f, "FC"),
        }
    }
}

// =============================================================================
// Host-Facing Types
// =============================================================================

/// Volume as known to the host volume manager
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    /// Host-side volume name; becomes the array element name
    pub name: String,
    /// Size in GiB
    pub size_gb: u64,
    /// Serialized [`InstanceName`], absent before creation
    #[serde(default)]
    pub provider_location: Option<String>,
    /// Per-volume overrides (`stripe_count`, `fast_policy`, `pool`)
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

impl VolumeSpec {
    pub fn new(name: impl Into<String>, size_gb: u64) -> Self {
        Self {
            name: name.into(),
            size_gb,
            provider_location: None,
            extra_specs: BTreeMap::new(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.provider_location = Some(location.into());
        self
    }

    pub fn with_extra_spec(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_specs.insert(key.into(), value.into());
        self
    }
}

/// Where a volume lives: pool, optional FAST policy, striping
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Placement {
    pub pool: String,
    #[serde(default)]
    pub fast_policy: Option<String>,
    /// Members of a striped composite; 1 or less means a simple volume
    #[serde(default)]
    pub stripe_count: u32,
}

impl Placement {
    pub fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            fast_policy: None,
            stripe_count: 0,
        }
    }

    pub fn with_fast_policy(mut self, policy: impl Into<String>) -> Self {
        self.fast_policy = Some(policy.into());
        self
    }

    pub fn with_stripe_count(mut self, count: u32) -> Self {
        self.stripe_count = count;
        self
    }

    pub fn is_striped(&self) -> bool {
        self.stripe_count > 1
    }

    /// Tier component of masking names
    pub fn tier(&self) -> String {
        crate::array::naming::tier_name(&self.pool, self.fast_policy.as_deref())
    }
}

/// Host initiator description
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connector {
    /// Host name (may be fully qualified)
    pub host: String,
    /// iSCSI initiator name
    #[serde(default)]
    pub initiator: Option<String>,
    /// FC initiator port WWNs
    #[serde(default)]
    pub wwpns: Vec<String>,
    /// Host IP, informational only
    #[serde(default)]
    pub ip: Option<String>,
}

impl Connector {
    /// Hardware identifiers used for the given protocol
    pub fn hardware_ids(&self, protocol: Protocol) -> Vec<String> {
        match protocol {
            Protocol::Iscsi => self.initiator.iter().cloned().collect(),
            Protocol::Fc => self.wwpns.iter().map(|w| w.to_lowercase()).collect(),
        }
    }
}

/// Outcome of exposing a volume to a host
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExposureResult {
    /// Masking view the volume is visible through
    pub masking_view: String,
    /// Host LUN the volume is mapped at
    pub host_lun_id: u32,
    /// FC target port WWNs
    pub target_wwns: Vec<String>,
    /// iSCSI target names
    pub target_iqns: Vec<String>,
    /// Initiator WWN -> reachable target WWNs
    pub initiator_target_map: BTreeMap<String, Vec<String>>,
}

/// Outcome of removing a volume from a host
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UnexposeResult {
    /// The masking view was deleted (last volume left)
    pub view_removed: bool,
    /// Populated only when the view was removed, so zoning can be torn down
    pub initiator_target_map: BTreeMap<String, Vec<String>>,
}

/// Connection data returned to the host connector
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub driver_volume_type: String,
    pub data: ExposureResult,
}

/// Backend capacity report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStats {
    pub backend_name: String,
    pub vendor_name: String,
    pub driver_version: String,
    pub storage_protocol: String,
    pub total_capacity_gb: u64,
    pub free_capacity_gb: u64,
    pub reserved_percentage: u32,
    /// `array#pool#policy`, consumed by `migrate_volume`
    pub location_info: String,
}

// =============================================================================
// Management Client Port
// =============================================================================

/// Port for the array's management-object protocol
///
/// Implementations must report a missing addressed instance as
/// [`Error::InstanceNotFound`](crate::error::Error::InstanceNotFound) and
/// transport problems as `Transport`.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    /// Names of every instance of a class
    async fn enumerate_instance_names(&self, class_name: &str) -> Result<Vec<InstanceName>>;

    /// Every instance of a class with its properties
    async fn enumerate_instances(&self, class_name: &str) -> Result<Vec<Instance>>;

    /// Fetch one instance
    async fn get_instance(&self, name: &InstanceName) -> Result<Instance>;

    /// Names of instances associated with `name`
    async fn associator_names(
        &self,
        name: &InstanceName,
        assoc_class: Option<&str>,
        result_class: Option<&str>,
    ) -> Result<Vec<InstanceName>>;

    /// Instances associated with `name`
    async fn associators(
        &self,
        name: &InstanceName,
        assoc_class: Option<&str>,
        result_class: Option<&str>,
    ) -> Result<Vec<Instance>>;

    /// Names of association instances of `result_class` referring to `name`
    async fn reference_names(
        &self,
        name: &InstanceName,
        result_class: &str,
    ) -> Result<Vec<InstanceName>>;

    /// Invoke an extrinsic method on a service or element
    async fn invoke_method(
        &self,
        method: &str,
        target: &InstanceName,
        args: MethodArgs,
    ) -> Result<InvokeOutcome>;

    /// Delete an instance
    async fn delete_instance(&self, name: &InstanceName) -> Result<()>;
}

// =============================================================================
// Fabric Topology Port
// =============================================================================

/// Initiator and target ports sharing one fabric
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FabricMapping {
    pub initiator_port_wwn_list: Vec<String>,
    pub target_port_wwn_list: Vec<String>,
}

/// Port for FC fabric lookups (name server queries)
#[async_trait]
pub trait FabricTopology: Send + Sync {
    /// Group initiator and target WWNs by the fabric they are logged into
    async fn map_initiators_to_targets(
        &self,
        initiator_wwns: &[String],
        target_wwns: &[String],
    ) -> Result<BTreeMap<String, FabricMapping>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ManagementClientRef = Arc<dyn ManagementClient>;
pub type FabricTopologyRef = Arc<dyn FabricTopology>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_tags() {
        assert_eq!(Protocol::Iscsi.tag(), 'I');
        assert_eq!(Protocol::Fc.tag(), 'F');
        assert_eq!(Protocol::Fc.driver_volume_type(), "fibre_channel");
        let parsed: Protocol = serde_json::from_str("\"fc\"").unwrap();
        assert_eq!(parsed, Protocol::Fc);
    }

    #[test]
    fn test_connector_hardware_ids() {
        let connector = Connector {
            host: "compute-1.example.com".into(),
            initiator: Some("iqn.1993-08.org.debian:01:222".into()),
            wwpns: vec!["10000090FA0D6B72".into()],
            ip: None,
        };
        assert_eq!(
            connector.hardware_ids(Protocol::Iscsi),
            vec!["iqn.1993-08.org.debian:01:222".to_string()]
        );
        assert_eq!(
            connector.hardware_ids(Protocol::Fc),
            vec!["10000090fa0d6b72".to_string()]
        );
    }
}
