//! Block Driver
//!
//! Host-facing volume operations. Binds the driver configuration, the
//! management client and the engines, resolves per-volume extra specs into
//! a [`Placement`] and records an outcome metric for every operation.
//!
//! Volumes are addressed by their provider location, the serialized
//! instance name persisted by the host volume manager.

use crate::array::{EntityLocator, JobPoller};
use crate::config::DriverConfig;
use crate::controlplane::groups::GroupOps;
use crate::controlplane::masking::{MaskingConfig, MaskingOrchestrator};
use crate::controlplane::provision::{CloneOptions, CreateVolume, ProvisioningEngine};
use crate::controlplane::tiering::TieringTracker;
use crate::domain::model::InstanceName;
use crate::domain::ports::{
    ConnectionInfo, Connector, FabricTopologyRef, ManagementClientRef, Placement, UnexposeResult,
    VolumeSpec, VolumeStats,
};
use crate::error::{Error, Result};
use crate::metrics::DriverMetrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Extra spec overriding the pool
pub const SPEC_POOL: &str = "pool";
/// Extra spec overriding the FAST policy
pub const SPEC_FAST_POLICY: &str = "fast_policy";
/// Extra spec requesting a striped composite
pub const SPEC_STRIPE_COUNT: &str = "stripe_count";

const VENDOR_NAME: &str = "EMC Corporation";
const NO_POLICY: &str = "None";

// =============================================================================
// Block Driver
// =============================================================================

pub struct BlockDriver {
    config: DriverConfig,
    locator: Arc<EntityLocator>,
    tiering: Arc<TieringTracker>,
    masking: MaskingOrchestrator,
    provisioning: ProvisioningEngine,
    metrics: Arc<DriverMetrics>,
}

impl BlockDriver {
    /// Wire the engines for one array
    pub fn new(
        config: DriverConfig,
        client: ManagementClientRef,
        fabric: Option<FabricTopologyRef>,
        metrics: Arc<DriverMetrics>,
    ) -> Arc<Self> {
        let locator = Arc::new(EntityLocator::new(client.clone(), config.array.clone()));
        let poller = Arc::new(JobPoller::new(client, config.poll_config(), metrics.clone()));
        let groups = Arc::new(GroupOps::new(locator.clone(), poller.clone()));
        let tiering = Arc::new(TieringTracker::new(
            locator.clone(),
            poller.clone(),
            groups.clone(),
        ));
        let masking = MaskingOrchestrator::new(
            MaskingConfig {
                port_groups: config.port_groups.clone(),
                protocol: config.protocol,
                settings: config.masking.clone(),
            },
            locator.clone(),
            poller.clone(),
            groups,
            tiering.clone(),
            fabric,
        );
        let provisioning = ProvisioningEngine::new(locator.clone(), poller, tiering.clone());

        Arc::new(Self {
            config,
            locator,
            tiering,
            masking,
            provisioning,
            metrics,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<DriverMetrics> {
        &self.metrics
    }

    fn observe<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        self.metrics.record_operation(operation, result.is_ok());
        if let Err(e) = &result {
            warn!("{} failed: {}", operation, e);
        }
        result
    }

    // =========================================================================
    // Placement and Handles
    // =========================================================================

    /// Placement from configuration, overridden by the volume's extra specs
    pub fn placement(&self, extra_specs: &BTreeMap<String, String>) -> Result<Placement> {
        let spec = |key: &str| {
            extra_specs
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        let pool = spec(SPEC_POOL).unwrap_or(self.config.pool.as_str()).to_string();
        let mut placement = Placement::new(pool);
        placement.fast_policy = match spec(SPEC_FAST_POLICY) {
            Some(policy) => Some(policy.to_string()),
            None => self.config.fast_policy.clone(),
        };
        if let Some(count) = spec(SPEC_STRIPE_COUNT) {
            placement.stripe_count = count.parse().map_err(|_| {
                Error::ApiValidation(format!("stripe_count must be a number, got {:?}", count))
            })?;
        }
        Ok(placement)
    }

    fn handle(volume: &VolumeSpec) -> Result<InstanceName> {
        let location = volume.provider_location.as_deref().ok_or_else(|| {
            Error::InvalidProviderLocation(format!("volume {} has no provider location", volume.name))
        })?;
        InstanceName::from_provider_location(location)
    }

    /// `array#pool#policy`
    fn location_info(&self) -> String {
        format!(
            "{}#{}#{}",
            self.config.array,
            self.config.pool,
            self.config.fast_policy.as_deref().unwrap_or(NO_POLICY)
        )
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// Verify that everything the configuration names exists on the array
    pub async fn check_for_setup_error(&self) -> Result<()> {
        let result = self.check_setup().await;
        self.observe("check_for_setup_error", result)
    }

    async fn check_setup(&self) -> Result<()> {
        self.locator.find_storage_system().await?;

        if self.locator.find_pool_by_name(&self.config.pool).await?.is_none() {
            return Err(Error::InvalidConfiguration(format!(
                "pool {} not found on array {}",
                self.config.pool, self.config.array
            )));
        }

        if let Some(policy) = &self.config.fast_policy {
            if !self.tiering.is_tiering_enabled().await? {
                return Err(Error::InvalidConfiguration(format!(
                    "array {} is not licensed for FAST",
                    self.config.array
                )));
            }
            if self.tiering.get_tier_policy_by_name(policy).await?.is_none() {
                return Err(Error::InvalidConfiguration(format!(
                    "FAST policy {} not found",
                    policy
                )));
            }
            if !self.tiering.is_pool_in_policy(&self.config.pool, policy).await? {
                return Err(Error::InvalidConfiguration(format!(
                    "pool {} is not part of FAST policy {}",
                    self.config.pool, policy
                )));
            }
        }

        let mut found = 0;
        for name in &self.config.port_groups {
            if self.locator.find_port_group(name).await?.is_some() {
                found += 1;
            } else {
                warn!("Configured port group {} not found", name);
            }
        }
        if found == 0 {
            return Err(Error::InvalidConfiguration(format!(
                "none of the port groups {:?} exist",
                self.config.port_groups
            )));
        }
        info!("Array {} setup verified", self.config.array);
        Ok(())
    }

    // =========================================================================
    // Volume Lifecycle
    // =========================================================================

    /// Create a volume; returns its provider location
    pub async fn create_volume(&self, volume: &VolumeSpec) -> Result<String> {
        let result = async {
            let placement = self.placement(&volume.extra_specs)?;
            let name = self
                .provisioning
                .create_volume(&CreateVolume {
                    name: volume.name.clone(),
                    size_gb: volume.size_gb,
                    placement,
                })
                .await?;
            name.to_provider_location()
        }
        .await;
        self.observe("create_volume", result)
    }

    /// Delete a volume; volumes never created or already gone are success
    pub async fn delete_volume(&self, volume: &VolumeSpec) -> Result<()> {
        let result = async {
            if volume.provider_location.is_none() {
                warn!("Volume {} has no provider location, nothing to delete", volume.name);
                return Ok(());
            }
            let handle = Self::handle(volume)?;
            let placement = self.placement(&volume.extra_specs)?;
            self.provisioning
                .delete_volume(&handle, placement.fast_policy.as_deref())
                .await
        }
        .await;
        self.observe("delete_volume", result)
    }

    pub async fn extend_volume(&self, volume: &VolumeSpec, new_size_gb: u64) -> Result<()> {
        let result = async {
            let handle = Self::handle(volume)?;
            self.provisioning.extend_volume(&handle, new_size_gb).await
        }
        .await;
        self.observe("extend_volume", result)
    }

    async fn clone_from(&self, target: &VolumeSpec, source: &VolumeSpec) -> Result<String> {
        let source_handle = Self::handle(source)?;
        let placement = self.placement(&target.extra_specs)?;
        let options = CloneOptions::from(&self.config.clone);
        let cloned = self
            .provisioning
            .clone_volume(&source_handle, &target.name, &placement, options)
            .await?;
        cloned.to_provider_location()
    }

    /// Full copy of `source`; returns the copy's provider location
    pub async fn create_cloned_volume(&self, volume: &VolumeSpec, source: &VolumeSpec) -> Result<String> {
        let result = self.clone_from(volume, source).await;
        self.observe("create_cloned_volume", result)
    }

    /// Volume from a snapshot; snapshots are full copies here
    pub async fn create_volume_from_snapshot(
        &self,
        volume: &VolumeSpec,
        snapshot: &VolumeSpec,
    ) -> Result<String> {
        let result = self.clone_from(volume, snapshot).await;
        self.observe("create_volume_from_snapshot", result)
    }

    /// Point-in-time full copy of `source`
    pub async fn create_snapshot(&self, snapshot: &VolumeSpec, source: &VolumeSpec) -> Result<String> {
        let result = self.clone_from(snapshot, source).await;
        self.observe("create_snapshot", result)
    }

    pub async fn delete_snapshot(&self, snapshot: &VolumeSpec) -> Result<()> {
        let result = async {
            if snapshot.provider_location.is_none() {
                return Ok(());
            }
            let handle = Self::handle(snapshot)?;
            let placement = self.placement(&snapshot.extra_specs)?;
            self.provisioning
                .delete_volume(&handle, placement.fast_policy.as_deref())
                .await
        }
        .await;
        self.observe("delete_snapshot", result)
    }

    // =========================================================================
    // Connections
    // =========================================================================

    pub async fn initialize_connection(
        &self,
        volume: &VolumeSpec,
        connector: &Connector,
    ) -> Result<ConnectionInfo> {
        let result = async {
            let handle = Self::handle(volume)?;
            if self.locator.find_volume(&handle).await?.is_none() {
                return Err(Error::ResourceNotFound {
                    kind: "volume".into(),
                    name: volume.name.clone(),
                });
            }
            let placement = self.placement(&volume.extra_specs)?;
            let data = self.masking.expose(&handle, connector, &placement).await?;
            info!(
                "Volume {} attached to {} at LUN {}",
                volume.name, connector.host, data.host_lun_id
            );
            Ok(ConnectionInfo {
                driver_volume_type: self.config.protocol.driver_volume_type().to_string(),
                data,
            })
        }
        .await;
        self.observe("initialize_connection", result)
    }

    pub async fn terminate_connection(
        &self,
        volume: &VolumeSpec,
        connector: &Connector,
    ) -> Result<UnexposeResult> {
        let result = async {
            let handle = Self::handle(volume)?;
            let placement = self.placement(&volume.extra_specs)?;
            self.masking.unexpose(&handle, connector, &placement).await
        }
        .await;
        self.observe("terminate_connection", result)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    /// Capacity of the configured policy, or of the pool without FAST
    pub async fn get_volume_stats(&self) -> Result<VolumeStats> {
        let result = async {
            let capacity = match &self.config.fast_policy {
                Some(policy) => self.tiering.get_capacities_for_policy(policy).await?,
                None => self.tiering.get_pool_capacities(&self.config.pool).await?,
            };
            debug!(
                "Capacity of {}: {} GiB total, {} GiB free",
                self.config.backend_name, capacity.total_gb, capacity.free_gb
            );
            Ok(VolumeStats {
                backend_name: self.config.backend_name.clone(),
                vendor_name: VENDOR_NAME.to_string(),
                driver_version: crate::VERSION.to_string(),
                storage_protocol: self.config.protocol.to_string(),
                total_capacity_gb: capacity.total_gb,
                free_capacity_gb: capacity.free_gb,
                reserved_percentage: self.config.reserved_percentage,
                location_info: self.location_info(),
            })
        }
        .await;
        self.observe("get_volume_stats", result)
    }

    // =========================================================================
    // Retype / Migrate
    // =========================================================================

    /// Move a volume between FAST policies of its pool
    ///
    /// Returns `false` when the change is not a policy move this driver
    /// can do in place (pool change, attached volume, pool outside policy).
    pub async fn retype(
        &self,
        volume: &VolumeSpec,
        new_extra_specs: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let result = self.retype_policy(volume, new_extra_specs).await;
        self.observe("retype", result)
    }

    async fn retype_policy(
        &self,
        volume: &VolumeSpec,
        new_extra_specs: &BTreeMap<String, String>,
    ) -> Result<bool> {
        let handle = Self::handle(volume)?;
        let current = self.placement(&volume.extra_specs)?;
        let wanted = self.placement(new_extra_specs)?;

        if current.pool != wanted.pool || current.stripe_count != wanted.stripe_count {
            debug!("Retype of {} changes layout or pool, not handled", volume.name);
            return Ok(false);
        }
        if current.fast_policy == wanted.fast_policy {
            return Ok(true);
        }
        if self.locator.find_volume(&handle).await?.is_none() {
            return Err(Error::ResourceNotFound {
                kind: "volume".into(),
                name: volume.name.clone(),
            });
        }
        if let Some(policy) = &wanted.fast_policy {
            if !self.tiering.is_pool_in_policy(&wanted.pool, policy).await? {
                warn!("Pool {} is not part of FAST policy {}", wanted.pool, policy);
                return Ok(false);
            }
        }
        if self.is_attached(&handle, current.fast_policy.as_deref()).await? {
            warn!("Volume {} is attached, cannot change its policy", volume.name);
            return Ok(false);
        }

        self.switch_policy(&handle, current.fast_policy.as_deref(), wanted.fast_policy.as_deref())
            .await?;
        info!(
            "Volume {} moved from policy {:?} to {:?}",
            volume.name, current.fast_policy, wanted.fast_policy
        );
        Ok(true)
    }

    /// Member of any storage group other than the policy default group
    async fn is_attached(&self, volume: &InstanceName, policy: Option<&str>) -> Result<bool> {
        let default_group = match policy {
            Some(policy) => self.tiering.get_policy_default_storage_group(policy).await?,
            None => None,
        };
        Ok(self
            .locator
            .storage_groups_of_volume(volume)
            .await?
            .iter()
            .any(|g| Some(g) != default_group.as_ref()))
    }

    async fn switch_policy(
        &self,
        volume: &InstanceName,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<()> {
        if let Some(policy) = from {
            self.tiering
                .remove_volume_from_default_storage_group(volume, policy)
                .await?;
        }
        if let Some(policy) = to {
            self.tiering
                .add_volume_to_default_storage_group(volume, policy)
                .await?;
        }
        Ok(())
    }

    /// Relocate a volume to the pool named by `location_info`
    ///
    /// Returns `false` when the target is another array, the current pool,
    /// or not a well-formed `array#pool#policy`.
    pub async fn migrate_volume(&self, volume: &VolumeSpec, location_info: &str) -> Result<bool> {
        let result = self.migrate(volume, location_info).await;
        self.observe("migrate_volume", result)
    }

    async fn migrate(&self, volume: &VolumeSpec, location_info: &str) -> Result<bool> {
        let parts: Vec<&str> = location_info.split('#').map(str::trim).collect();
        let [array, pool, policy] = parts.as_slice() else {
            warn!("Malformed location info {:?}", location_info);
            return Ok(false);
        };
        if *array != self.config.array {
            debug!("Migration to array {} is not supported", array);
            return Ok(false);
        }
        let target_policy = Some(*policy).filter(|p| !p.is_empty() && *p != NO_POLICY);

        let handle = Self::handle(volume)?;
        let current = self.placement(&volume.extra_specs)?;
        let current_pool = self
            .locator
            .pool_of_volume(&handle)
            .await?
            .and_then(|p| p.element_name().map(str::to_string));
        if current_pool.as_deref() == Some(*pool) {
            debug!("Volume {} already in pool {}", volume.name, pool);
            return Ok(false);
        }
        if let Some(policy) = target_policy {
            if !self.tiering.is_pool_in_policy(pool, policy).await? {
                warn!("Pool {} is not part of FAST policy {}", pool, policy);
                return Ok(false);
            }
        }
        if self.is_attached(&handle, current.fast_policy.as_deref()).await? {
            warn!("Volume {} is attached, cannot migrate it", volume.name);
            return Ok(false);
        }

        if let Some(policy) = current.fast_policy.as_deref() {
            self.tiering
                .remove_volume_from_default_storage_group(&handle, policy)
                .await?;
        }
        self.provisioning.migrate_volume(&handle, pool).await?;
        if let Some(policy) = target_policy {
            self.tiering
                .add_volume_to_default_storage_group(&handle, policy)
                .await?;
        }
        info!("Volume {} migrated to pool {}", volume.name, pool);
        Ok(true)
    }
}
