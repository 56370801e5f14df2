//! Entity Locator
//!
//! Finds remote entities by enumerate-then-filter, re-run on every call.
//! "Not found" is an answer (`None` or an empty list), never an error: any
//! entity may have been deleted by an external actor since the last call.
//! Only transport and protocol failures propagate.

use crate::array::naming::system_name;
use crate::domain::classes::{assoc, class};
use crate::domain::model::{Instance, InstanceName};
use crate::domain::ports::ManagementClientRef;
use crate::error::{Error, Result};
use tracing::debug;

// =============================================================================
// Located Facts
// =============================================================================

/// Layout and size of a volume, read from its instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeFacts {
    pub name: InstanceName,
    pub element_name: String,
    /// BlockSize x ConsumableBlocks
    pub size_bytes: u64,
    pub is_composite: bool,
    pub is_striped: bool,
}

impl VolumeFacts {
    pub fn from_instance(volume: &Instance) -> Self {
        let block_size = volume.u64_prop("BlockSize").unwrap_or(512);
        let blocks = volume.u64_prop("ConsumableBlocks").unwrap_or(0);
        let is_composite = volume.bool_prop("IsComposite");
        Self {
            name: volume.path.clone(),
            element_name: volume.element_name().unwrap_or_default().to_string(),
            size_bytes: block_size * blocks,
            is_composite,
            is_striped: is_composite
                && volume.u64_prop("CompositeType")
                    == Some(crate::domain::classes::composite_type::STRIPED),
        }
    }
}

/// A volume's presence in one masking view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunMapping {
    pub masking_view: InstanceName,
    pub host_lun: u32,
}

// =============================================================================
// Entity Locator
// =============================================================================

/// Stateless lookups against one array
pub struct EntityLocator {
    client: ManagementClientRef,
    array: String,
    system: String,
}

impl EntityLocator {
    pub fn new(client: ManagementClientRef, array: impl Into<String>) -> Self {
        let array = array.into();
        Self {
            client,
            system: system_name(&array),
            array,
        }
    }

    pub fn array(&self) -> &str {
        &self.array
    }

    pub fn client(&self) -> &ManagementClientRef {
        &self.client
    }

    /// Whether an instance belongs to this array
    fn on_array(&self, instance: &Instance) -> bool {
        if let Some(system) = instance.path.key("SystemName") {
            return system == self.system;
        }
        instance
            .path
            .key("InstanceID")
            .map_or(false, |id| id.starts_with(&format!("{}+", self.system)))
    }

    /// Fetch an instance, `None` when it no longer exists
    pub async fn get_existing_instance(&self, name: &InstanceName) -> Result<Option<Instance>> {
        match self.client.get_instance(name).await {
            Ok(instance) => Ok(Some(instance)),
            Err(e) if e.is_not_found() => {
                debug!("Instance {} does not exist", name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Associator names, empty when the source instance no longer exists
    pub async fn associated(
        &self,
        name: &InstanceName,
        assoc_class: &str,
        result_class: Option<&str>,
    ) -> Result<Vec<InstanceName>> {
        match self
            .client
            .associator_names(name, Some(assoc_class), result_class)
            .await
        {
            Ok(names) => Ok(names),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Associator instances, empty when the source instance no longer exists
    pub async fn associated_instances(
        &self,
        name: &InstanceName,
        assoc_class: &str,
        result_class: Option<&str>,
    ) -> Result<Vec<Instance>> {
        match self
            .client
            .associators(name, Some(assoc_class), result_class)
            .await
        {
            Ok(instances) => Ok(instances),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Array and Services
    // =========================================================================

    /// The storage system; its absence is a configuration problem
    pub async fn find_storage_system(&self) -> Result<InstanceName> {
        self.client
            .enumerate_instance_names(class::STORAGE_SYSTEM)
            .await?
            .into_iter()
            .find(|n| n.key("Name") == Some(self.system.as_str()))
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!("array {} is not managed by the provider", self.array))
            })
    }

    /// A configuration service of this array; hard precondition
    pub async fn find_service(&self, service_class: &str) -> Result<InstanceName> {
        self.client
            .enumerate_instance_names(service_class)
            .await?
            .into_iter()
            .find(|n| n.key("SystemName") == Some(self.system.as_str()))
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "{} not available on array {}",
                    service_class, self.array
                ))
            })
    }

    // =========================================================================
    // Pools and Volumes
    // =========================================================================

    pub async fn find_pool_by_name(&self, pool: &str) -> Result<Option<Instance>> {
        let found = self
            .client
            .enumerate_instances(class::STORAGE_POOL)
            .await?
            .into_iter()
            .find(|p| self.on_array(p) && p.element_name() == Some(pool));
        debug!("Pool {} on {}: found={}", pool, self.array, found.is_some());
        Ok(found)
    }

    pub async fn find_volume(&self, volume: &InstanceName) -> Result<Option<Instance>> {
        self.get_existing_instance(volume).await
    }

    /// Volume by element name, for handles lost before a create finished
    pub async fn find_volume_by_name(&self, element_name: &str) -> Result<Option<Instance>> {
        Ok(self
            .client
            .enumerate_instances(class::STORAGE_VOLUME)
            .await?
            .into_iter()
            .find(|v| self.on_array(v) && v.element_name() == Some(element_name)))
    }

    pub async fn pool_of_volume(&self, volume: &InstanceName) -> Result<Option<Instance>> {
        Ok(self
            .associated_instances(volume, assoc::ALLOCATED_FROM_POOL, Some(class::STORAGE_POOL))
            .await?
            .into_iter()
            .next())
    }

    /// Member extents of a composite volume
    pub async fn composite_members(&self, volume: &InstanceName) -> Result<Vec<Instance>> {
        self.associated_instances(volume, assoc::BASED_ON, Some(class::STORAGE_EXTENT))
            .await
    }

    // =========================================================================
    // Masking Objects
    // =========================================================================

    async fn find_named(&self, class_name: &str, name: &str) -> Result<Option<InstanceName>> {
        let found = self
            .client
            .enumerate_instances(class_name)
            .await?
            .into_iter()
            .find(|i| self.on_array(i) && i.element_name() == Some(name))
            .map(|i| i.path);
        debug!("{} {}: found={}", class_name, name, found.is_some());
        Ok(found)
    }

    pub async fn find_masking_view(&self, name: &str) -> Result<Option<InstanceName>> {
        self.find_named(class::MASKING_VIEW, name).await
    }

    pub async fn find_port_group(&self, name: &str) -> Result<Option<InstanceName>> {
        self.find_named(class::TARGET_MASKING_GROUP, name).await
    }

    pub async fn find_storage_group(&self, name: &str) -> Result<Option<InstanceName>> {
        self.find_named(class::DEVICE_MASKING_GROUP, name).await
    }

    /// Initiator group by derived name, else any group holding one of the
    /// host's hardware IDs (groups created outside this driver)
    pub async fn find_initiator_group(
        &self,
        name: &str,
        hardware_ids: &[String],
    ) -> Result<Option<InstanceName>> {
        if let Some(group) = self.find_named(class::INITIATOR_MASKING_GROUP, name).await? {
            return Ok(Some(group));
        }
        if hardware_ids.is_empty() {
            return Ok(None);
        }

        let groups = self
            .client
            .enumerate_instances(class::INITIATOR_MASKING_GROUP)
            .await?;
        for group in groups.into_iter().filter(|g| self.on_array(g)) {
            let holds = self
                .initiator_group_storage_ids(&group.path)
                .await?
                .iter()
                .any(|id| hardware_ids.iter().any(|h| h.eq_ignore_ascii_case(id)));
            if holds {
                debug!("Initiator group {} matched by hardware ID", group.path);
                return Ok(Some(group.path));
            }
        }
        Ok(None)
    }

    async fn group_of_view(
        &self,
        view: &InstanceName,
        assoc_class: &str,
        group_class: &str,
    ) -> Result<Option<InstanceName>> {
        Ok(self
            .associated(view, assoc_class, Some(group_class))
            .await?
            .into_iter()
            .next())
    }

    pub async fn storage_group_of_masking_view(&self, view: &InstanceName) -> Result<Option<InstanceName>> {
        self.group_of_view(view, assoc::ASSOCIATED_DEVICE_GROUP, class::DEVICE_MASKING_GROUP)
            .await
    }

    pub async fn initiator_group_of_masking_view(&self, view: &InstanceName) -> Result<Option<InstanceName>> {
        self.group_of_view(view, assoc::ASSOCIATED_INITIATOR_GROUP, class::INITIATOR_MASKING_GROUP)
            .await
    }

    pub async fn port_group_of_masking_view(&self, view: &InstanceName) -> Result<Option<InstanceName>> {
        self.group_of_view(view, assoc::ASSOCIATED_TARGET_GROUP, class::TARGET_MASKING_GROUP)
            .await
    }

    pub async fn masking_views_of_initiator_group(&self, group: &InstanceName) -> Result<Vec<InstanceName>> {
        self.associated(group, assoc::ASSOCIATED_INITIATOR_GROUP, Some(class::MASKING_VIEW))
            .await
    }

    /// Members of a masking group
    pub async fn members_of(&self, group: &InstanceName) -> Result<Vec<InstanceName>> {
        self.associated(group, assoc::MEMBER_OF_COLLECTION, None).await
    }

    pub async fn is_member(&self, group: &InstanceName, element: &InstanceName) -> Result<bool> {
        Ok(self.members_of(group).await?.contains(element))
    }

    pub async fn storage_groups_of_volume(&self, volume: &InstanceName) -> Result<Vec<InstanceName>> {
        self.associated(volume, assoc::MEMBER_OF_COLLECTION, Some(class::DEVICE_MASKING_GROUP))
            .await
    }

    /// Registered hardware IDs among `storage_ids`
    pub async fn storage_hardware_ids(&self, storage_ids: &[String]) -> Result<Vec<Instance>> {
        Ok(self
            .client
            .enumerate_instances(class::STORAGE_HARDWARE_ID)
            .await?
            .into_iter()
            .filter(|h| {
                h.attr("StorageID")
                    .map_or(false, |id| storage_ids.iter().any(|s| s.eq_ignore_ascii_case(id)))
            })
            .collect())
    }

    /// Storage IDs (IQNs or WWNs) held by an initiator group
    pub async fn initiator_group_storage_ids(&self, group: &InstanceName) -> Result<Vec<String>> {
        let members = self
            .associated_instances(group, assoc::MEMBER_OF_COLLECTION, Some(class::STORAGE_HARDWARE_ID))
            .await?;
        Ok(members
            .iter()
            .filter_map(|m| m.attr("StorageID").map(str::to_string))
            .collect())
    }

    /// Target port names (WWNs or IQNs) of a port group
    pub async fn target_endpoints_of_port_group(&self, group: &InstanceName) -> Result<Vec<String>> {
        let endpoints = self
            .associated_instances(group, assoc::MEMBER_OF_COLLECTION, None)
            .await?;
        Ok(endpoints
            .iter()
            .filter_map(|e| e.attr("Name").map(str::to_string))
            .collect())
    }

    /// Views the volume is visible through, with its host LUN in each
    pub async fn host_lun_mappings(&self, volume: &InstanceName) -> Result<Vec<LunMapping>> {
        let units = match self
            .client
            .reference_names(volume, class::PROTOCOL_CONTROLLER_FOR_UNIT)
            .await
        {
            Ok(units) => units,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut mappings = Vec::new();
        for unit in units {
            let Some(unit) = self.get_existing_instance(&unit).await? else {
                continue;
            };
            let Some(view) = unit.ref_prop("Antecedent") else {
                continue;
            };
            let Some(lun) = unit
                .attr("DeviceNumber")
                .and_then(|d| u32::from_str_radix(d, 16).ok())
            else {
                continue;
            };
            mappings.push(LunMapping {
                masking_view: view.clone(),
                host_lun: lun,
            });
        }
        Ok(mappings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::simulator::SimulatedArray;
    use crate::domain::classes::{group_type, method, service};
    use crate::domain::model::MethodArgs;
    use crate::domain::ports::ManagementClient;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const ARRAY: &str = "000195900551";
    const GIB: u64 = 1 << 30;

    fn setup() -> (Arc<SimulatedArray>, EntityLocator) {
        let sim = SimulatedArray::builder(ARRAY)
            .pool("gold", 100 * GIB, 0)
            .port_group("OS-PG1", &["5000097350011100"])
            .build();
        let locator = EntityLocator::new(sim.clone(), ARRAY);
        (sim, locator)
    }

    async fn create_group(sim: &SimulatedArray, name: &str, kind: u64, members: Vec<InstanceName>) -> InstanceName {
        sim.invoke_method(
            method::CREATE_GROUP,
            &sim.controller_configuration_service(),
            MethodArgs::new()
                .arg("GroupName", name)
                .arg("Type", kind)
                .arg("Members", members),
        )
        .await
        .unwrap()
        .output_ref("MaskingGroup")
        .unwrap()
        .clone()
    }

    #[tokio::test]
    async fn test_services_and_system() {
        let (_, locator) = setup();
        locator.find_storage_system().await.unwrap();
        let svc = locator.find_service(service::STORAGE_CONFIGURATION).await.unwrap();
        assert_eq!(svc.key("SystemName"), Some("SYMMETRIX+000195900551"));

        let other = EntityLocator::new(locator.client().clone(), "999999");
        assert_matches!(other.find_storage_system().await, Err(Error::InvalidConfiguration(_)));
        assert_matches!(
            other.find_service(service::REPLICATION).await,
            Err(Error::InvalidConfiguration(_))
        );
    }

    #[tokio::test]
    async fn test_not_found_is_none() {
        let (sim, locator) = setup();
        assert!(locator.find_pool_by_name("gold").await.unwrap().is_some());
        assert!(locator.find_pool_by_name("silver").await.unwrap().is_none());
        assert!(locator.find_masking_view("OS-h-gold-I-MV").await.unwrap().is_none());

        let ghost = crate::array::naming::device_key(ARRAY, class::STORAGE_VOLUME, "FFFFF");
        assert!(locator.find_volume(&ghost).await.unwrap().is_none());
        assert!(locator.members_of(&ghost).await.unwrap().is_empty());
        assert!(locator.host_lun_mappings(&ghost).await.unwrap().is_empty());

        sim.set_offline(true);
        assert_matches!(locator.find_pool_by_name("gold").await, Err(Error::Transport { .. }));
        assert_matches!(locator.find_volume(&ghost).await, Err(Error::Transport { .. }));
    }

    #[tokio::test]
    async fn test_initiator_group_by_hardware_id() {
        let (sim, locator) = setup();
        let hardware_id = sim
            .invoke_method(
                method::CREATE_HARDWARE_ID,
                &sim.service(service::HARDWARE_ID_MANAGEMENT),
                MethodArgs::new()
                    .arg("StorageID", "iqn.1993-08.org.debian:01:222")
                    .arg("IDType", 5u64),
            )
            .await
            .unwrap()
            .output_ref("HardwareID")
            .unwrap()
            .clone();
        let group = create_group(&sim, "legacy-ig", group_type::INITIATOR, vec![hardware_id]).await;

        let ids = vec!["iqn.1993-08.org.debian:01:222".to_string()];
        let found = locator.find_initiator_group("OS-host-I-IG", &ids).await.unwrap();
        assert_eq!(found, Some(group));
        assert!(locator
            .find_initiator_group("OS-host-I-IG", &["iqn.other".to_string()])
            .await
            .unwrap()
            .is_none());
        assert_eq!(locator.storage_hardware_ids(&ids).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_volume_facts_and_membership() {
        let (sim, locator) = setup();
        let volume = sim
            .invoke_method(
                method::CREATE_COMPOSITE_ELEMENT,
                &sim.service(service::ELEMENT_COMPOSITION),
                MethodArgs::new()
                    .arg("ElementName", "meta")
                    .arg("Size", 4 * GIB)
                    .arg("InPools", vec![sim.pool_name("gold")])
                    .arg("CompositeType", crate::domain::classes::composite_type::STRIPED)
                    .arg("EMCNumberOfMembers", 4u64),
            )
            .await
            .unwrap()
            .output_ref("TheElement")
            .unwrap()
            .clone();

        let instance = locator.find_volume(&volume).await.unwrap().unwrap();
        let facts = VolumeFacts::from_instance(&instance);
        assert_eq!(facts.size_bytes, 4 * GIB);
        assert!(facts.is_composite && facts.is_striped);
        assert_eq!(locator.composite_members(&volume).await.unwrap().len(), 4);
        assert_eq!(
            locator.pool_of_volume(&volume).await.unwrap().unwrap().element_name(),
            Some("gold")
        );
        assert_eq!(
            locator.find_volume_by_name("meta").await.unwrap().map(|v| v.path),
            Some(volume.clone())
        );

        let sg = create_group(&sim, "SG1", group_type::DEVICE, vec![volume.clone()]).await;
        assert!(locator.is_member(&sg, &volume).await.unwrap());
        assert_eq!(locator.storage_groups_of_volume(&volume).await.unwrap(), vec![sg.clone()]);
        assert_eq!(locator.find_storage_group("SG1").await.unwrap(), Some(sg));

        let pg = locator.find_port_group("OS-PG1").await.unwrap().unwrap();
        assert_eq!(
            locator.target_endpoints_of_port_group(&pg).await.unwrap(),
            vec!["5000097350011100".to_string()]
        );
    }
}
