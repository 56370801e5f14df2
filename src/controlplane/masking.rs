//! Masking Orchestrator
//!
//! Makes a volume visible to a host through the masking hierarchy
//! (initiator group + port group + storage group = masking view) and
//! takes it away again. Every step is create-or-reuse: objects are found
//! by derived name first and only created when absent, so re-running an
//! interrupted request converges instead of duplicating objects.

use crate::array::{EntityLocator, JobPoller, MaskingNames};
use crate::config::MaskingSettings;
use crate::controlplane::groups::GroupOps;
use crate::controlplane::tiering::TieringTracker;
use crate::domain::classes::{group_type, hardware_id_type, method, service};
use crate::domain::model::{InstanceName, MethodArgs};
use crate::domain::ports::{
    Connector, ExposureResult, FabricTopologyRef, Placement, Protocol, UnexposeResult,
};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Static inputs of the orchestrator
#[derive(Debug, Clone)]
pub struct MaskingConfig {
    /// Operator-managed port groups to choose from
    pub port_groups: Vec<String>,
    pub protocol: Protocol,
    pub settings: MaskingSettings,
}

/// Storage group of a view whose initiator and port groups are also present
struct ViewGroups {
    storage_group: InstanceName,
}

// =============================================================================
// Masking Orchestrator
// =============================================================================

pub struct MaskingOrchestrator {
    config: MaskingConfig,
    locator: Arc<EntityLocator>,
    poller: Arc<JobPoller>,
    groups: Arc<GroupOps>,
    tiering: Arc<TieringTracker>,
    fabric: Option<FabricTopologyRef>,
}

impl MaskingOrchestrator {
    pub fn new(
        config: MaskingConfig,
        locator: Arc<EntityLocator>,
        poller: Arc<JobPoller>,
        groups: Arc<GroupOps>,
        tiering: Arc<TieringTracker>,
        fabric: Option<FabricTopologyRef>,
    ) -> Self {
        Self {
            config,
            locator,
            poller,
            groups,
            tiering,
            fabric,
        }
    }

    fn hardware_ids(&self, connector: &Connector) -> Result<Vec<String>> {
        let ids = connector.hardware_ids(self.config.protocol);
        if ids.is_empty() {
            return Err(Error::ApiValidation(format!(
                "connector for {} has no {} initiators",
                connector.host, self.config.protocol
            )));
        }
        Ok(ids)
    }

    // =========================================================================
    // Expose
    // =========================================================================

    /// Make `volume` visible to the connector's host
    pub async fn expose(
        &self,
        volume: &InstanceName,
        connector: &Connector,
        placement: &Placement,
    ) -> Result<ExposureResult> {
        let hardware_ids = self.hardware_ids(connector)?;

        if let Some(existing) = self.existing_mapping(volume, &hardware_ids).await? {
            info!(
                "Volume {} already mapped to {} at LUN {}",
                volume, existing.masking_view, existing.host_lun_id
            );
            return Ok(existing);
        }

        let names = MaskingNames::derive(&connector.host, &placement.tier(), self.config.protocol);
        debug!("Masking names for {}: {:?}", connector.host, names);

        let mut view = self.locator.find_masking_view(&names.masking_view).await?;
        if let Some(existing) = view.clone() {
            match self.view_groups(&existing).await? {
                Some(groups) => {
                    self.ensure_member(&groups.storage_group, volume, placement)
                        .await?;
                }
                None if self.config.settings.rebuild_damaged_views => {
                    warn!(
                        "Masking view {} lost one of its groups, rebuilding it",
                        names.masking_view
                    );
                    self.delete_masking_view(&existing).await?;
                    view = None;
                }
                None => {
                    return Err(Error::InvalidConfiguration(format!(
                        "masking view {} is missing a group",
                        names.masking_view
                    )));
                }
            }
        }

        let view = match view {
            Some(view) => view,
            None => {
                self.create_masking_view(&names, volume, connector, &hardware_ids, placement)
                    .await?
            }
        };

        self.exposure_result(volume, &view, &hardware_ids).await
    }

    /// A mapping of `volume` through a view whose initiator group holds one
    /// of the host's hardware IDs
    async fn existing_mapping(
        &self,
        volume: &InstanceName,
        hardware_ids: &[String],
    ) -> Result<Option<ExposureResult>> {
        for mapping in self.locator.host_lun_mappings(volume).await? {
            if self
                .view_serves(&mapping.masking_view, hardware_ids)
                .await?
            {
                return self
                    .exposure_result(volume, &mapping.masking_view, hardware_ids)
                    .await
                    .map(Some);
            }
        }
        Ok(None)
    }

    async fn view_serves(&self, view: &InstanceName, hardware_ids: &[String]) -> Result<bool> {
        let Some(group) = self.locator.initiator_group_of_masking_view(view).await? else {
            return Ok(false);
        };
        Ok(self
            .locator
            .initiator_group_storage_ids(&group)
            .await?
            .iter()
            .any(|id| hardware_ids.iter().any(|h| h.eq_ignore_ascii_case(id))))
    }

    /// Groups of a view, `None` when any of them went missing
    async fn view_groups(&self, view: &InstanceName) -> Result<Option<ViewGroups>> {
        let storage_group = self.locator.storage_group_of_masking_view(view).await?;
        let initiator_group = self.locator.initiator_group_of_masking_view(view).await?;
        let port_group = self.locator.port_group_of_masking_view(view).await?;
        match (storage_group, initiator_group, port_group) {
            (Some(storage_group), Some(_), Some(_)) => Ok(Some(ViewGroups { storage_group })),
            _ => Ok(None),
        }
    }

    /// Add the volume to a storage group unless already there; under FAST
    /// it leaves the policy default group first
    async fn ensure_member(
        &self,
        group: &InstanceName,
        volume: &InstanceName,
        placement: &Placement,
    ) -> Result<()> {
        if self.locator.is_member(group, volume).await? {
            debug!("Volume {} already in {}", volume, group);
            return Ok(());
        }
        if let Some(policy) = &placement.fast_policy {
            self.tiering
                .remove_volume_from_default_storage_group(volume, policy)
                .await?;
        }
        info!("Adding volume {} to storage group {}", volume, group);
        self.groups.add_members(group, vec![volume.clone()]).await
    }

    async fn create_masking_view(
        &self,
        names: &MaskingNames,
        volume: &InstanceName,
        connector: &Connector,
        hardware_ids: &[String],
        placement: &Placement,
    ) -> Result<InstanceName> {
        let initiator_group = self
            .get_or_create_initiator_group(&names.initiator_group, hardware_ids)
            .await?;
        let port_group = self.select_port_group(&connector.host).await?;
        let storage_group = self
            .get_or_create_storage_group(&names.storage_group, volume, placement)
            .await?;

        info!(
            "Creating masking view {} for host {}",
            names.masking_view, connector.host
        );
        let outcome = self
            .groups
            .invoke_controller(
                method::CREATE_MASKING_VIEW,
                MethodArgs::new()
                    .arg("ElementName", names.masking_view.as_str())
                    .arg("InitiatorMaskingGroup", initiator_group)
                    .arg("DeviceMaskingGroup", storage_group)
                    .arg("TargetMaskingGroup", port_group),
            )
            .await?;
        self.groups
            .created_element(&outcome, "ProtocolController")
            .await
    }

    async fn get_or_create_storage_group(
        &self,
        name: &str,
        volume: &InstanceName,
        placement: &Placement,
    ) -> Result<InstanceName> {
        if let Some(group) = self.locator.find_storage_group(name).await? {
            self.ensure_member(&group, volume, placement).await?;
            return Ok(group);
        }

        if let Some(policy) = &placement.fast_policy {
            self.tiering
                .remove_volume_from_default_storage_group(volume, policy)
                .await?;
        }
        let group = self
            .groups
            .create_group(name, group_type::DEVICE, vec![volume.clone()])
            .await?;
        if let Some(policy) = &placement.fast_policy {
            self.tiering.assign_to_policy(&group, policy).await?;
        }
        Ok(group)
    }

    async fn get_or_create_initiator_group(
        &self,
        name: &str,
        hardware_ids: &[String],
    ) -> Result<InstanceName> {
        if let Some(group) = self.locator.find_initiator_group(name, hardware_ids).await? {
            return Ok(group);
        }

        let registered = self.locator.storage_hardware_ids(hardware_ids).await?;
        let mut members: Vec<InstanceName> = registered.iter().map(|h| h.path.clone()).collect();
        for id in hardware_ids {
            let known = registered.iter().any(|h| {
                h.attr("StorageID")
                    .map_or(false, |s| s.eq_ignore_ascii_case(id))
            });
            if !known {
                members.push(self.register_hardware_id(id).await?);
            }
        }

        self.groups
            .create_group(name, group_type::INITIATOR, members)
            .await
    }

    async fn register_hardware_id(&self, storage_id: &str) -> Result<InstanceName> {
        info!("Registering hardware ID {}", storage_id);
        let id_type = match self.config.protocol {
            Protocol::Iscsi => hardware_id_type::ISCSI_NAME,
            Protocol::Fc => hardware_id_type::PORT_WWN,
        };
        let service = self
            .locator
            .find_service(service::HARDWARE_ID_MANAGEMENT)
            .await?;
        let outcome = self
            .locator
            .client()
            .invoke_method(
                method::CREATE_HARDWARE_ID,
                &service,
                MethodArgs::new()
                    .arg("StorageID", storage_id)
                    .arg("IDType", id_type),
            )
            .await?;
        let outcome = self.poller.complete(method::CREATE_HARDWARE_ID, outcome).await?;
        self.groups.created_element(&outcome, "HardwareID").await
    }

    /// Port group for a host: a stable choice among the configured groups,
    /// falling back to the next configured group that exists
    async fn select_port_group(&self, host: &str) -> Result<InstanceName> {
        let candidates = &self.config.port_groups;
        if candidates.is_empty() {
            return Err(Error::InvalidConfiguration("no port groups configured".into()));
        }
        let start = stable_index(host, candidates.len());
        for offset in 0..candidates.len() {
            let name = &candidates[(start + offset) % candidates.len()];
            if let Some(group) = self.locator.find_port_group(name).await? {
                debug!("Port group {} selected for {}", name, host);
                return Ok(group);
            }
            warn!("Configured port group {} not found on array", name);
        }
        Err(Error::InvalidConfiguration(format!(
            "none of the port groups {:?} exist on array {}",
            candidates,
            self.locator.array()
        )))
    }

    async fn exposure_result(
        &self,
        volume: &InstanceName,
        view: &InstanceName,
        hardware_ids: &[String],
    ) -> Result<ExposureResult> {
        let host_lun_id = self
            .locator
            .host_lun_mappings(volume)
            .await?
            .into_iter()
            .find(|m| &m.masking_view == view)
            .map(|m| m.host_lun)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "host LUN".into(),
                name: format!("{} in {}", volume, view),
            })?;
        let masking_view = self
            .locator
            .get_existing_instance(view)
            .await?
            .and_then(|v| v.element_name().map(str::to_string))
            .unwrap_or_else(|| view.to_string());
        let targets = self.view_targets(view).await?;

        let mut result = ExposureResult {
            masking_view,
            host_lun_id,
            ..Default::default()
        };
        match self.config.protocol {
            Protocol::Fc => {
                result.initiator_target_map =
                    self.initiator_target_map(hardware_ids, &targets).await?;
                result.target_wwns = targets;
            }
            Protocol::Iscsi => result.target_iqns = targets,
        }
        Ok(result)
    }

    async fn view_targets(&self, view: &InstanceName) -> Result<Vec<String>> {
        match self.locator.port_group_of_masking_view(view).await? {
            Some(group) => self.locator.target_endpoints_of_port_group(&group).await,
            None => Ok(Vec::new()),
        }
    }

    /// Initiator -> targets, per fabric when a topology is available,
    /// otherwise every initiator to every target
    async fn initiator_target_map(
        &self,
        initiators: &[String],
        targets: &[String],
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        match &self.fabric {
            Some(fabric) => {
                let fabrics = fabric.map_initiators_to_targets(initiators, targets).await?;
                for (name, mapping) in fabrics {
                    debug!(
                        "Fabric {}: {} initiator(s), {} target(s)",
                        name,
                        mapping.initiator_port_wwn_list.len(),
                        mapping.target_port_wwn_list.len()
                    );
                    for initiator in &mapping.initiator_port_wwn_list {
                        let entry = map.entry(initiator.clone()).or_default();
                        entry.extend(mapping.target_port_wwn_list.iter().cloned());
                        entry.sort();
                        entry.dedup();
                    }
                }
            }
            None => {
                for initiator in initiators {
                    map.insert(initiator.clone(), targets.to_vec());
                }
            }
        }
        Ok(map)
    }

    // =========================================================================
    // Unexpose
    // =========================================================================

    /// Remove `volume` from the connector's host; absent views are success
    pub async fn unexpose(
        &self,
        volume: &InstanceName,
        connector: &Connector,
        placement: &Placement,
    ) -> Result<UnexposeResult> {
        let hardware_ids = self.hardware_ids(connector)?;
        let names = MaskingNames::derive(&connector.host, &placement.tier(), self.config.protocol);

        let view = match self.locator.find_masking_view(&names.masking_view).await? {
            Some(view) => Some(view),
            None => self.view_for_connector(volume, &hardware_ids).await?,
        };
        let Some(view) = view else {
            info!(
                "No masking view for {} on host {}, nothing to remove",
                volume, connector.host
            );
            return Ok(UnexposeResult::default());
        };

        let mut result = UnexposeResult::default();
        if let Some(group) = self.locator.storage_group_of_masking_view(&view).await? {
            if self.locator.is_member(&group, volume).await? {
                info!("Removing volume {} from storage group {}", volume, group);
                self.groups.remove_members(&group, vec![volume.clone()]).await?;
            }

            let empty = self.locator.members_of(&group).await?.is_empty();
            if empty && self.config.settings.cleanup_empty_groups {
                let initiator_group = self.locator.initiator_group_of_masking_view(&view).await?;
                let targets = self.view_targets(&view).await?;

                self.delete_masking_view(&view).await?;
                if let Some(policy) = &placement.fast_policy {
                    self.tiering.unassign_from_policy(&group, policy).await?;
                }
                self.groups.delete_group(&group).await?;
                result.view_removed = true;

                if self.config.protocol == Protocol::Fc {
                    result.initiator_target_map =
                        self.initiator_target_map(&hardware_ids, &targets).await?;
                }
                if let Some(initiator_group) = initiator_group {
                    self.cleanup_initiator_group(&initiator_group).await?;
                }
            }
        } else {
            warn!("Masking view {} has no storage group", view);
        }

        if let Some(policy) = &placement.fast_policy {
            if self.locator.find_volume(volume).await?.is_some() {
                self.tiering
                    .add_volume_to_default_storage_group(volume, policy)
                    .await?;
            }
        }
        Ok(result)
    }

    /// View the volume is mapped through for this host, when names changed
    async fn view_for_connector(
        &self,
        volume: &InstanceName,
        hardware_ids: &[String],
    ) -> Result<Option<InstanceName>> {
        for mapping in self.locator.host_lun_mappings(volume).await? {
            if self
                .view_serves(&mapping.masking_view, hardware_ids)
                .await?
            {
                return Ok(Some(mapping.masking_view));
            }
        }
        Ok(None)
    }

    async fn cleanup_initiator_group(&self, group: &InstanceName) -> Result<()> {
        if !self.config.settings.delete_unused_initiator_groups {
            return Ok(());
        }
        if self
            .locator
            .masking_views_of_initiator_group(group)
            .await?
            .is_empty()
        {
            info!("Initiator group {} no longer used, deleting", group);
            self.groups.delete_group(group).await?;
        }
        Ok(())
    }

    /// Delete a view, tolerating its prior disappearance
    async fn delete_masking_view(&self, view: &InstanceName) -> Result<()> {
        if self.locator.get_existing_instance(view).await?.is_none() {
            debug!("Masking view {} already gone", view);
            return Ok(());
        }
        info!("Deleting masking view {}", view);
        self.groups
            .invoke_controller(
                method::DELETE_MASKING_VIEW,
                MethodArgs::new().arg("ProtocolController", view),
            )
            .await
            .map(|_| ())
    }
}

/// Stable bucket of `key` among `len` choices
fn stable_index(key: &str, len: usize) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) % len as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{PollConfig, SimulatedArray};
    use crate::domain::classes::class;
    use crate::domain::ports::{FabricMapping, FabricTopology, ManagementClient};
    use crate::metrics::DriverMetrics;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::time::Duration;

    const ARRAY: &str = "000195900551";
    const GIB: u64 = 1 << 30;
    const IQN: &str = "iqn.1993-08.org.debian:01:222";
    const WWN1: &str = "123456789012345";
    const WWN2: &str = "123456789054321";
    const TARGETS: [&str; 2] = ["5000097350011100", "5000097350011101"];

    struct Fixture {
        sim: Arc<SimulatedArray>,
        masking: MaskingOrchestrator,
    }

    fn fixture(protocol: Protocol, settings: MaskingSettings, fabric: Option<FabricTopologyRef>) -> Fixture {
        let targets: Vec<&str> = match protocol {
            Protocol::Fc => TARGETS.to_vec(),
            Protocol::Iscsi => vec!["iqn.1992-04.com.emc:50000973f006dd80"],
        };
        let sim = SimulatedArray::builder(ARRAY)
            .pool("gold", 100 * GIB, 0)
            .port_group("OS-PG1", &targets)
            .tier_policy("GOLD1", &["gold"])
            .job_latency(1)
            .build();
        let locator = Arc::new(EntityLocator::new(sim.clone(), ARRAY));
        let poller = Arc::new(JobPoller::new(
            sim.clone(),
            PollConfig {
                interval: Duration::from_millis(1),
                timeout: Duration::from_secs(5),
            },
            Arc::new(DriverMetrics::new().unwrap()),
        ));
        let groups = Arc::new(GroupOps::new(locator.clone(), poller.clone()));
        let tiering = Arc::new(TieringTracker::new(locator.clone(), poller.clone(), groups.clone()));
        let masking = MaskingOrchestrator::new(
            MaskingConfig {
                port_groups: vec!["OS-PG1".into()],
                protocol,
                settings,
            },
            locator,
            poller,
            groups,
            tiering,
            fabric,
        );
        Fixture { sim, masking }
    }

    async fn volume(sim: &SimulatedArray, name: &str) -> InstanceName {
        sim.invoke_method(
            method::CREATE_ELEMENT_FROM_POOL,
            &sim.storage_configuration_service(),
            MethodArgs::new()
                .arg("ElementName", name)
                .arg("InPool", sim.pool_name("gold"))
                .arg("Size", GIB),
        )
        .await
        .unwrap()
        .output_ref("TheElement")
        .unwrap()
        .clone()
    }

    fn iscsi_host() -> Connector {
        Connector {
            host: "fakehost.example.com".into(),
            initiator: Some(IQN.into()),
            ..Default::default()
        }
    }

    fn fc_host() -> Connector {
        Connector {
            host: "fakehost".into(),
            wwpns: vec![WWN1.into(), WWN2.into()],
            ..Default::default()
        }
    }

    fn gold() -> Placement {
        Placement::new("gold")
    }

    #[tokio::test]
    async fn test_expose_builds_hierarchy_once() {
        let f = fixture(Protocol::Iscsi, MaskingSettings::default(), None);
        let vol = volume(&f.sim, "vol1").await;

        let first = f.masking.expose(&vol, &iscsi_host(), &gold()).await.unwrap();
        assert_eq!(first.masking_view, "OS-fakehost-gold-I-MV");
        assert_eq!(first.host_lun_id, 1);
        assert_eq!(first.target_iqns, vec!["iqn.1992-04.com.emc:50000973f006dd80".to_string()]);
        assert!(f.sim.named(class::INITIATOR_MASKING_GROUP, "OS-fakehost-I-IG").is_some());
        assert!(f.sim.named(class::DEVICE_MASKING_GROUP, "OS-fakehost-gold-I-SG").is_some());

        let again = f.masking.expose(&vol, &iscsi_host(), &gold()).await.unwrap();
        assert_eq!(again, first);
        assert_eq!(f.sim.invocations(method::CREATE_MASKING_VIEW), 1);
        assert_eq!(f.sim.invocations(method::CREATE_GROUP), 2);
        assert_eq!(f.sim.invocations(method::CREATE_HARDWARE_ID), 1);
        assert_eq!(f.sim.invocations(method::ADD_MEMBERS), 0);
    }

    #[tokio::test]
    async fn test_second_volume_reuses_view() {
        let f = fixture(Protocol::Iscsi, MaskingSettings::default(), None);
        let vol1 = volume(&f.sim, "vol1").await;
        let vol2 = volume(&f.sim, "vol2").await;

        f.masking.expose(&vol1, &iscsi_host(), &gold()).await.unwrap();
        let second = f.masking.expose(&vol2, &iscsi_host(), &gold()).await.unwrap();

        assert_eq!(second.host_lun_id, 2);
        assert_eq!(f.sim.invocations(method::CREATE_MASKING_VIEW), 1);
        assert_eq!(f.sim.invocations(method::ADD_MEMBERS), 1);
    }

    #[tokio::test]
    async fn test_fc_mapping_without_topology() {
        let f = fixture(Protocol::Fc, MaskingSettings::default(), None);
        let vol = volume(&f.sim, "vol1").await;

        let result = f.masking.expose(&vol, &fc_host(), &gold()).await.unwrap();
        assert_eq!(result.masking_view, "OS-fakehost-gold-F-MV");
        assert_eq!(result.target_wwns.len(), 2);
        assert_eq!(result.initiator_target_map.len(), 2);
        assert_eq!(result.initiator_target_map[WWN1].len(), 2);
    }

    struct SplitFabrics;

    #[async_trait]
    impl FabricTopology for SplitFabrics {
        async fn map_initiators_to_targets(
            &self,
            initiator_wwns: &[String],
            target_wwns: &[String],
        ) -> Result<BTreeMap<String, FabricMapping>> {
            let mut fabrics = BTreeMap::new();
            for (idx, (i, t)) in initiator_wwns.iter().zip(target_wwns).enumerate() {
                fabrics.insert(
                    format!("fabric{}", idx),
                    FabricMapping {
                        initiator_port_wwn_list: vec![i.clone()],
                        target_port_wwn_list: vec![t.clone()],
                    },
                );
            }
            Ok(fabrics)
        }
    }

    #[tokio::test]
    async fn test_fc_mapping_with_topology() {
        let f = fixture(Protocol::Fc, MaskingSettings::default(), Some(Arc::new(SplitFabrics)));
        let vol = volume(&f.sim, "vol1").await;

        let result = f.masking.expose(&vol, &fc_host(), &gold()).await.unwrap();
        assert_eq!(result.initiator_target_map[WWN1], vec![TARGETS[0].to_string()]);
        assert_eq!(result.initiator_target_map[WWN2], vec![TARGETS[1].to_string()]);
    }

    #[tokio::test]
    async fn test_unexpose_keeps_view_until_last_volume() {
        let f = fixture(Protocol::Fc, MaskingSettings::default(), None);
        let vol1 = volume(&f.sim, "vol1").await;
        let vol2 = volume(&f.sim, "vol2").await;
        f.masking.expose(&vol1, &fc_host(), &gold()).await.unwrap();
        f.masking.expose(&vol2, &fc_host(), &gold()).await.unwrap();

        let partial = f.masking.unexpose(&vol1, &fc_host(), &gold()).await.unwrap();
        assert!(!partial.view_removed);
        assert!(partial.initiator_target_map.is_empty());
        assert!(f.sim.named(class::MASKING_VIEW, "OS-fakehost-gold-F-MV").is_some());

        let last = f.masking.unexpose(&vol2, &fc_host(), &gold()).await.unwrap();
        assert!(last.view_removed);
        assert_eq!(last.initiator_target_map.len(), 2);
        assert!(f.sim.named(class::MASKING_VIEW, "OS-fakehost-gold-F-MV").is_none());
        assert!(f.sim.named(class::DEVICE_MASKING_GROUP, "OS-fakehost-gold-F-SG").is_none());
        // initiator groups are retained by default
        assert!(f.sim.named(class::INITIATOR_MASKING_GROUP, "OS-fakehost-F-IG").is_some());

        // a second detach is a no-op
        let again = f.masking.unexpose(&vol2, &fc_host(), &gold()).await.unwrap();
        assert_eq!(again, UnexposeResult::default());
    }

    #[tokio::test]
    async fn test_unused_initiator_group_cleanup() {
        let settings = MaskingSettings {
            delete_unused_initiator_groups: true,
            ..Default::default()
        };
        let f = fixture(Protocol::Iscsi, settings, None);
        let vol = volume(&f.sim, "vol1").await;
        f.masking.expose(&vol, &iscsi_host(), &gold()).await.unwrap();
        f.masking.unexpose(&vol, &iscsi_host(), &gold()).await.unwrap();
        assert!(f.sim.named(class::INITIATOR_MASKING_GROUP, "OS-fakehost-I-IG").is_none());
    }

    #[tokio::test]
    async fn test_view_deleted_externally() {
        let f = fixture(Protocol::Iscsi, MaskingSettings::default(), None);
        let vol = volume(&f.sim, "vol1").await;
        f.masking.expose(&vol, &iscsi_host(), &gold()).await.unwrap();

        let view = f.sim.named(class::MASKING_VIEW, "OS-fakehost-gold-I-MV").unwrap();
        f.sim.delete_instance(&view.path).await.unwrap();

        let result = f.masking.unexpose(&vol, &iscsi_host(), &gold()).await.unwrap();
        assert!(!result.view_removed);

        // exposing again recreates the view around the surviving groups
        let exposed = f.masking.expose(&vol, &iscsi_host(), &gold()).await.unwrap();
        assert_eq!(exposed.host_lun_id, 1);
        assert_eq!(f.sim.invocations(method::CREATE_MASKING_VIEW), 2);
        assert_eq!(f.sim.invocations(method::CREATE_GROUP), 2);
    }

    #[tokio::test]
    async fn test_damaged_view_is_rebuilt() {
        let f = fixture(Protocol::Iscsi, MaskingSettings::default(), None);
        let vol1 = volume(&f.sim, "vol1").await;
        let vol2 = volume(&f.sim, "vol2").await;
        f.masking.expose(&vol1, &iscsi_host(), &gold()).await.unwrap();

        let sg = f.sim.named(class::DEVICE_MASKING_GROUP, "OS-fakehost-gold-I-SG").unwrap();
        f.sim.delete_instance(&sg.path).await.unwrap();

        let result = f.masking.expose(&vol2, &iscsi_host(), &gold()).await.unwrap();
        assert_eq!(result.masking_view, "OS-fakehost-gold-I-MV");
        assert_eq!(f.sim.invocations(method::DELETE_MASKING_VIEW), 1);
        assert_eq!(f.sim.invocations(method::CREATE_MASKING_VIEW), 2);
    }

    #[tokio::test]
    async fn test_damaged_view_fails_without_rebuild() {
        let settings = MaskingSettings {
            rebuild_damaged_views: false,
            ..Default::default()
        };
        let f = fixture(Protocol::Iscsi, settings, None);
        let vol1 = volume(&f.sim, "vol1").await;
        let vol2 = volume(&f.sim, "vol2").await;
        f.masking.expose(&vol1, &iscsi_host(), &gold()).await.unwrap();

        let ig = f.sim.named(class::INITIATOR_MASKING_GROUP, "OS-fakehost-I-IG").unwrap();
        f.sim.delete_instance(&ig.path).await.unwrap();

        assert_matches!(
            f.masking.expose(&vol2, &iscsi_host(), &gold()).await,
            Err(Error::InvalidConfiguration(_))
        );
    }

    #[tokio::test]
    async fn test_missing_port_group_is_fatal() {
        let f = fixture(Protocol::Iscsi, MaskingSettings::default(), None);
        let vol = volume(&f.sim, "vol1").await;
        let pg = f.sim.named(class::TARGET_MASKING_GROUP, "OS-PG1").unwrap();
        f.sim.delete_instance(&pg.path).await.unwrap();

        assert_matches!(
            f.masking.expose(&vol, &iscsi_host(), &gold()).await,
            Err(Error::InvalidConfiguration(_))
        );
        assert_eq!(f.sim.invocations(method::CREATE_MASKING_VIEW), 0);
    }

    #[tokio::test]
    async fn test_hardware_id_and_initiator_group_deleted_externally() {
        let f = fixture(Protocol::Iscsi, MaskingSettings::default(), None);
        let vol1 = volume(&f.sim, "vol1").await;
        let vol2 = volume(&f.sim, "vol2").await;
        f.masking.expose(&vol1, &iscsi_host(), &gold()).await.unwrap();
        f.masking.unexpose(&vol1, &iscsi_host(), &gold()).await.unwrap();

        let ig = f.sim.named(class::INITIATOR_MASKING_GROUP, "OS-fakehost-I-IG").unwrap();
        f.sim.delete_instance(&ig.path).await.unwrap();
        for hardware_id in f.sim.instances_of(class::STORAGE_HARDWARE_ID) {
            f.sim.delete_instance(&hardware_id.path).await.unwrap();
        }

        f.masking.expose(&vol2, &iscsi_host(), &gold()).await.unwrap();
        assert_eq!(f.sim.invocations(method::CREATE_HARDWARE_ID), 2);
        assert!(f.sim.named(class::INITIATOR_MASKING_GROUP, "OS-fakehost-I-IG").is_some());
    }

    #[tokio::test]
    async fn test_fast_volume_moves_between_default_and_host_groups() {
        let f = fixture(Protocol::Iscsi, MaskingSettings::default(), None);
        let vol = volume(&f.sim, "vol1").await;
        let placement = gold().with_fast_policy("GOLD1");
        let default_sg = f
            .masking
            .tiering
            .add_volume_to_default_storage_group(&vol, "GOLD1")
            .await
            .unwrap();

        let result = f.masking.expose(&vol, &iscsi_host(), &placement).await.unwrap();
        assert_eq!(result.masking_view, "OS-fakehost-GOLD1-FP-I-MV");
        assert!(f.sim.members(&default_sg).is_empty());

        f.masking.unexpose(&vol, &iscsi_host(), &placement).await.unwrap();
        assert_eq!(f.sim.members(&default_sg), vec![vol]);
    }

    #[tokio::test]
    async fn test_connector_without_initiators() {
        let f = fixture(Protocol::Fc, MaskingSettings::default(), None);
        let vol = volume(&f.sim, "vol1").await;
        assert_matches!(
            f.masking.expose(&vol, &iscsi_host(), &gold()).await,
            Err(Error::ApiValidation(_))
        );
    }

    #[test]
    fn test_stable_index() {
        assert_eq!(stable_index("host-a", 3), stable_index("host-a", 3));
        assert!(stable_index("host-b", 3) < 3);
        assert_eq!(stable_index("anything", 1), 0);
    }
}
