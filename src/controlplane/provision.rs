//! Provisioning Engine
//!
//! Volume lifecycle on the array: create (simple or striped), delete,
//! extend, full-copy clone and same-array relocation. Every call goes
//! through the job poller; remote failures surface as `ProvisioningFailed`
//! while timeouts keep their "outcome unknown" meaning.

use crate::array::{EntityLocator, JobPoller, SyncTarget, SyncWaiter, VolumeFacts};
use crate::config::CloneSettings;
use crate::controlplane::tiering::TieringTracker;
use crate::domain::classes::{
    composite_type, method, service, ELEMENT_TYPE_THIN, SYNC_OPERATION_DETACH, SYNC_TYPE_CLONE,
};
use crate::domain::model::{InstanceName, InvokeOutcome, MethodArgs};
use crate::domain::ports::Placement;
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const GIB: u64 = 1 << 30;

// =============================================================================
// Requests
// =============================================================================

/// A volume to create
#[derive(Debug, Clone)]
pub struct CreateVolume {
    pub name: String,
    pub size_gb: u64,
    pub placement: Placement,
}

/// How a clone is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloneOptions {
    /// Copy progress awaited before returning
    pub sync_percent: u8,
    /// Break the relationship once synchronized
    pub detach: bool,
}

impl From<&CloneSettings> for CloneOptions {
    fn from(settings: &CloneSettings) -> Self {
        Self {
            sync_percent: settings.sync_percent,
            detach: settings.detach,
        }
    }
}

/// Layout of a volume to create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Simple,
    Composite { kind: u64, members: u64 },
}

// =============================================================================
// Provisioning Engine
// =============================================================================

pub struct ProvisioningEngine {
    locator: Arc<EntityLocator>,
    poller: Arc<JobPoller>,
    tiering: Arc<TieringTracker>,
    sync: SyncWaiter,
}

impl ProvisioningEngine {
    pub fn new(
        locator: Arc<EntityLocator>,
        poller: Arc<JobPoller>,
        tiering: Arc<TieringTracker>,
    ) -> Self {
        let sync = SyncWaiter::new(locator.client().clone(), *poller.config());
        Self {
            locator,
            poller,
            tiering,
            sync,
        }
    }

    async fn invoke(
        &self,
        volume: &str,
        service_class: &str,
        method_name: &str,
        args: MethodArgs,
    ) -> Result<InvokeOutcome> {
        let service = self.locator.find_service(service_class).await?;
        let outcome = self
            .locator
            .client()
            .invoke_method(method_name, &service, args)
            .await?;
        self.poller
            .complete(method_name, outcome)
            .await
            .map_err(|e| provisioning_error(volume, e))
    }

    async fn require_pool(&self, pool: &str) -> Result<InstanceName> {
        self.locator
            .find_pool_by_name(pool)
            .await?
            .map(|p| p.path)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "storage pool".into(),
                name: pool.to_string(),
            })
    }

    async fn require_volume(&self, volume: &InstanceName) -> Result<VolumeFacts> {
        self.locator
            .find_volume(volume)
            .await?
            .map(|v| VolumeFacts::from_instance(&v))
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "volume".into(),
                name: volume.to_string(),
            })
    }

    /// Element output of a creating method, else the job's affected element
    async fn element_of(&self, volume: &str, outcome: &InvokeOutcome) -> Result<InstanceName> {
        if let Some(element) = outcome.output_ref("TheElement") {
            return Ok(element.clone());
        }
        if let Some(job) = outcome.job() {
            if let Some(element) = self.poller.affected_elements(job).await?.into_iter().next() {
                return Ok(element);
            }
        }
        Err(Error::ProvisioningFailed {
            volume: volume.to_string(),
            reason: "array did not report the created element".into(),
        })
    }

    async fn create_element(
        &self,
        name: &str,
        size_bytes: u64,
        pool: &InstanceName,
        layout: Layout,
    ) -> Result<InstanceName> {
        let outcome = match layout {
            Layout::Simple => {
                self.invoke(
                    name,
                    service::STORAGE_CONFIGURATION,
                    method::CREATE_ELEMENT_FROM_POOL,
                    MethodArgs::new()
                        .arg("ElementName", name)
                        .arg("ElementType", ELEMENT_TYPE_THIN)
                        .arg("InPool", pool)
                        .arg("Size", size_bytes),
                )
                .await?
            }
            Layout::Composite { kind, members } => {
                self.invoke(
                    name,
                    service::ELEMENT_COMPOSITION,
                    method::CREATE_COMPOSITE_ELEMENT,
                    MethodArgs::new()
                        .arg("ElementName", name)
                        .arg("ElementType", ELEMENT_TYPE_THIN)
                        .arg("CompositeType", kind)
                        .arg("EMCNumberOfMembers", members)
                        .arg("InPools", vec![pool.clone()])
                        .arg("Size", size_bytes),
                )
                .await?
            }
        };
        self.element_of(name, &outcome).await
    }

    // =========================================================================
    // Create / Delete
    // =========================================================================

    /// Create a volume; returns its instance name
    pub async fn create_volume(&self, request: &CreateVolume) -> Result<InstanceName> {
        let placement = &request.placement;
        if let Some(policy) = &placement.fast_policy {
            if !self.tiering.is_pool_in_policy(&placement.pool, policy).await? {
                return Err(Error::InvalidConfiguration(format!(
                    "pool {} is not part of FAST policy {}",
                    placement.pool, policy
                )));
            }
        }
        let pool = self.require_pool(&placement.pool).await?;

        let layout = if placement.is_striped() {
            Layout::Composite {
                kind: composite_type::STRIPED,
                members: u64::from(placement.stripe_count),
            }
        } else {
            Layout::Simple
        };
        info!(
            "Creating volume {} ({} GiB, {:?}) in pool {}",
            request.name, request.size_gb, layout, placement.pool
        );
        let volume = self
            .create_element(&request.name, gib_to_bytes(request.size_gb)?, &pool, layout)
            .await?;

        if let Some(policy) = &placement.fast_policy {
            self.tiering
                .add_volume_to_default_storage_group(&volume, policy)
                .await?;
        }
        Ok(volume)
    }

    /// Return a volume to its pool; an absent volume is already deleted
    pub async fn delete_volume(&self, volume: &InstanceName, fast_policy: Option<&str>) -> Result<()> {
        let Some(instance) = self.locator.find_volume(volume).await? else {
            warn!("Volume {} not found on array, treating delete as done", volume);
            return Ok(());
        };
        let element_name = instance.element_name().unwrap_or_default().to_string();

        if let Some(policy) = fast_policy {
            self.tiering
                .remove_volume_from_default_storage_group(volume, policy)
                .await?;
        }

        info!("Deleting volume {} ({})", element_name, volume);
        self.invoke(
            &element_name,
            service::STORAGE_CONFIGURATION,
            method::RETURN_TO_POOL,
            MethodArgs::new().arg("TheElements", vec![volume.clone()]),
        )
        .await
        .map(|_| ())
    }

    // =========================================================================
    // Extend
    // =========================================================================

    /// Grow a volume; layout is preserved
    pub async fn extend_volume(&self, volume: &InstanceName, new_size_gb: u64) -> Result<()> {
        let facts = self.require_volume(volume).await?;
        let new_size = gib_to_bytes(new_size_gb)?;

        if facts.is_striped {
            return Err(Error::NotExtendable {
                volume: facts.element_name,
                reason: "striped composite volumes cannot be extended".into(),
            });
        }
        if new_size <= facts.size_bytes {
            return Err(Error::NotExtendable {
                volume: facts.element_name,
                reason: format!(
                    "requested {} bytes, volume already has {}",
                    new_size, facts.size_bytes
                ),
            });
        }

        if !facts.is_composite {
            info!(
                "Extending volume {} to {} GiB",
                facts.element_name, new_size_gb
            );
            self.invoke(
                &facts.element_name,
                service::STORAGE_CONFIGURATION,
                method::CREATE_ELEMENT_FROM_POOL,
                MethodArgs::new()
                    .arg("TheElement", volume)
                    .arg("Size", new_size),
            )
            .await?;
            return Ok(());
        }

        let pool = self
            .locator
            .pool_of_volume(volume)
            .await?
            .map(|p| p.path)
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "storage pool of volume".into(),
                name: facts.element_name.clone(),
            })?;
        let append_name = format!("{}_append", facts.element_name);
        info!(
            "Extending composite {} by {} bytes through member {}",
            facts.element_name,
            new_size - facts.size_bytes,
            append_name
        );
        let member = self
            .create_element(&append_name, new_size - facts.size_bytes, &pool, Layout::Simple)
            .await?;
        self.invoke(
            &facts.element_name,
            service::ELEMENT_COMPOSITION,
            method::CREATE_COMPOSITE_ELEMENT,
            MethodArgs::new()
                .arg("TheElement", volume)
                .arg("InElements", vec![member]),
        )
        .await
        .map(|_| ())
    }

    // =========================================================================
    // Clone
    // =========================================================================

    /// Full copy of `source` into a new volume named `target_name`
    ///
    /// The target gets the source's layout and capacity. Partial failures are
    /// not rolled back; the target is left for a later delete.
    pub async fn clone_volume(
        &self,
        source: &InstanceName,
        target_name: &str,
        placement: &Placement,
        options: CloneOptions,
    ) -> Result<InstanceName> {
        let facts = self.require_volume(source).await?;
        let pool = self.require_pool(&placement.pool).await?;

        let (size, layout) = if facts.is_composite {
            let members = self.locator.composite_members(source).await?;
            let size: u64 = members
                .iter()
                .map(|m| m.u64_prop("BlockSize").unwrap_or(512) * m.u64_prop("ConsumableBlocks").unwrap_or(0))
                .sum();
            let kind = if facts.is_striped {
                composite_type::STRIPED
            } else {
                composite_type::CONCATENATED
            };
            debug!(
                "Source {} is a {}-member composite of {} bytes",
                facts.element_name,
                members.len(),
                size
            );
            // sum of member capacities, not the composite's advertised size
            let size = if members.is_empty() { facts.size_bytes } else { size };
            (
                size,
                Layout::Composite {
                    kind,
                    members: members.len().max(1) as u64,
                },
            )
        } else {
            (facts.size_bytes, Layout::Simple)
        };

        info!(
            "Cloning {} into {} ({} bytes)",
            facts.element_name, target_name, size
        );
        let target = self.create_element(target_name, size, &pool, layout).await?;

        let outcome = self
            .invoke(
                target_name,
                service::REPLICATION,
                method::CREATE_ELEMENT_REPLICA,
                MethodArgs::new()
                    .arg("ElementName", target_name)
                    .arg("SyncType", SYNC_TYPE_CLONE)
                    .arg("SourceElement", source)
                    .arg("TargetElement", &target),
            )
            .await?;

        if let Some(sync) = outcome.output_ref("Synchronization").cloned() {
            self.sync
                .wait(&sync, SyncTarget::Percent(options.sync_percent))
                .await?;
            if options.detach {
                debug!("Detaching clone {} from {}", target_name, facts.element_name);
                self.invoke(
                    target_name,
                    service::REPLICATION,
                    method::MODIFY_REPLICA_SYNCHRONIZATION,
                    MethodArgs::new()
                        .arg("Operation", SYNC_OPERATION_DETACH)
                        .arg("Synchronization", &sync),
                )
                .await?;
                self.sync.wait(&sync, SyncTarget::Detached).await?;
            }
        } else {
            warn!("Replica of {} reported no synchronization", facts.element_name);
        }

        if let Some(policy) = &placement.fast_policy {
            self.tiering
                .add_volume_to_default_storage_group(&target, policy)
                .await?;
        }
        Ok(target)
    }

    // =========================================================================
    // Migrate
    // =========================================================================

    /// Relocate a volume to another pool of the same array
    pub async fn migrate_volume(&self, volume: &InstanceName, target_pool: &str) -> Result<()> {
        let facts = self.require_volume(volume).await?;
        let pool = self.require_pool(target_pool).await?;
        info!("Relocating {} to pool {}", facts.element_name, target_pool);
        self.invoke(
            &facts.element_name,
            service::STORAGE_RELOCATION,
            method::RELOCATE_TO_POOL,
            MethodArgs::new()
                .arg("TheElements", vec![volume.clone()])
                .arg("TargetPool", pool),
        )
        .await
        .map(|_| ())
    }

    /// Facts about a volume, `None` when it no longer exists
    pub async fn volume_facts(&self, volume: &InstanceName) -> Result<Option<VolumeFacts>> {
        Ok(self
            .locator
            .find_volume(volume)
            .await?
            .map(|v| VolumeFacts::from_instance(&v)))
    }
}

fn gib_to_bytes(size_gb: u64) -> Result<u64> {
    size_gb
        .checked_mul(GIB)
        .ok_or_else(|| Error::ApiValidation(format!("size of {} GiB is out of range", size_gb)))
}

/// Remote rejections become provisioning failures; timeouts and transport
/// errors keep their meaning
fn provisioning_error(volume: &str, err: Error) -> Error {
    match err {
        Error::BackendOperationFailed {
            operation,
            code,
            description,
        } => Error::ProvisioningFailed {
            volume: volume.to_string(),
            reason: format!("{} failed with code {}: {}", operation, code, description),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{PollConfig, SimulatedArray};
    use crate::controlplane::groups::GroupOps;
    use crate::domain::classes::class;
    use crate::domain::model::{Instance, InvokeOutcome, Value};
    use crate::domain::ports::{ManagementClient, ManagementClientRef};
    use crate::metrics::DriverMetrics;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::time::Duration;

    const ARRAY: &str = "000195900551";

    /// Reports every volume at twice its block count
    struct InflatedVolumes {
        inner: Arc<SimulatedArray>,
    }

    impl InflatedVolumes {
        fn inflate(mut instance: Instance) -> Instance {
            if instance.path.is_class(class::STORAGE_VOLUME) {
                if let Some(blocks) = instance.u64_prop("ConsumableBlocks") {
                    instance = instance.with("ConsumableBlocks", Value::from(blocks * 2));
                }
            }
            instance
        }
    }

    #[async_trait]
    impl ManagementClient for InflatedVolumes {
        async fn enumerate_instance_names(&self, class_name: &str) -> Result<Vec<InstanceName>> {
            self.inner.enumerate_instance_names(class_name).await
        }

        async fn enumerate_instances(&self, class_name: &str) -> Result<Vec<Instance>> {
            let instances = self.inner.enumerate_instances(class_name).await?;
            Ok(instances.into_iter().map(Self::inflate).collect())
        }

        async fn get_instance(&self, name: &InstanceName) -> Result<Instance> {
            self.inner.get_instance(name).await.map(Self::inflate)
        }

        async fn associator_names(
            &self,
            name: &InstanceName,
            assoc_class: Option<&str>,
            result_class: Option<&str>,
        ) -> Result<Vec<InstanceName>> {
            self.inner.associator_names(name, assoc_class, result_class).await
        }

        async fn associators(
            &self,
            name: &InstanceName,
            assoc_class: Option<&str>,
            result_class: Option<&str>,
        ) -> Result<Vec<Instance>> {
            self.inner.associators(name, assoc_class, result_class).await
        }

        async fn reference_names(&self, name: &InstanceName, result_class: &str) -> Result<Vec<InstanceName>> {
            self.inner.reference_names(name, result_class).await
        }

        async fn invoke_method(&self, method: &str, target: &InstanceName, args: MethodArgs) -> Result<InvokeOutcome> {
            self.inner.invoke_method(method, target, args).await
        }

        async fn delete_instance(&self, name: &InstanceName) -> Result<()> {
            self.inner.delete_instance(name).await
        }
    }

    fn engine(sim: &Arc<SimulatedArray>) -> ProvisioningEngine {
        engine_over(sim.clone())
    }

    fn engine_over(client: ManagementClientRef) -> ProvisioningEngine {
        let locator = Arc::new(EntityLocator::new(client.clone(), ARRAY));
        let poller = Arc::new(JobPoller::new(
            client,
            PollConfig {
                interval: Duration::from_millis(1),
                timeout: Duration::from_secs(5),
            },
            Arc::new(DriverMetrics::new().unwrap()),
        ));
        let groups = Arc::new(GroupOps::new(locator.clone(), poller.clone()));
        let tiering = Arc::new(TieringTracker::new(locator.clone(), poller.clone(), groups));
        ProvisioningEngine::new(locator, poller, tiering)
    }

    fn array() -> Arc<SimulatedArray> {
        SimulatedArray::builder(ARRAY)
            .pool("gold", 100 * GIB, 0)
            .pool("silver", 100 * GIB, 0)
            .tier_policy("GOLD1", &["gold"])
            .job_latency(1)
            .sync_latency(2)
            .build()
    }

    fn request(name: &str, size_gb: u64, placement: Placement) -> CreateVolume {
        CreateVolume {
            name: name.into(),
            size_gb,
            placement,
        }
    }

    const DETACHED: CloneOptions = CloneOptions {
        sync_percent: 100,
        detach: true,
    };

    #[tokio::test]
    async fn test_create_extend_delete_scenario() {
        let sim = array();
        let engine = engine(&sim);

        let vol = engine
            .create_volume(&request("vol1", 1, Placement::new("gold")))
            .await
            .unwrap();
        let facts = engine.volume_facts(&vol).await.unwrap().unwrap();
        assert_eq!(facts.size_bytes, GIB);
        assert!(!facts.is_composite);

        engine.extend_volume(&vol, 2).await.unwrap();
        let facts = engine.volume_facts(&vol).await.unwrap().unwrap();
        assert_eq!(facts.size_bytes, 2 * GIB);

        engine.delete_volume(&vol, None).await.unwrap();
        assert!(engine.volume_facts(&vol).await.unwrap().is_none());

        // a second delete is a no-op
        engine.delete_volume(&vol, None).await.unwrap();
        assert_eq!(sim.invocations(method::RETURN_TO_POOL), 1);
    }

    #[tokio::test]
    async fn test_create_striped() {
        let sim = array();
        let engine = engine(&sim);
        let vol = engine
            .create_volume(&request("striped", 4, Placement::new("gold").with_stripe_count(4)))
            .await
            .unwrap();

        let facts = engine.volume_facts(&vol).await.unwrap().unwrap();
        assert!(facts.is_striped);
        assert_eq!(sim.invocations(method::CREATE_COMPOSITE_ELEMENT), 1);
        assert_eq!(sim.invocations(method::CREATE_ELEMENT_FROM_POOL), 0);

        assert_matches!(
            engine.extend_volume(&vol, 8).await,
            Err(Error::NotExtendable { .. })
        );
    }

    #[tokio::test]
    async fn test_extend_concatenated_appends_member() {
        let sim = array();
        let engine = engine(&sim);
        let concat = engine
            .create_element(
                "concat",
                2 * GIB,
                &sim.pool_name("gold"),
                Layout::Composite {
                    kind: composite_type::CONCATENATED,
                    members: 2,
                },
            )
            .await
            .unwrap();
        engine.extend_volume(&concat, 3).await.unwrap();

        let facts = engine.volume_facts(&concat).await.unwrap().unwrap();
        assert_eq!(facts.size_bytes, 3 * GIB);
        assert!(facts.is_composite && !facts.is_striped);
        assert!(sim.named(class::STORAGE_VOLUME, "concat_append").is_none());
    }

    #[tokio::test]
    async fn test_extend_rejects_shrink_and_missing() {
        let sim = array();
        let engine = engine(&sim);
        let vol = engine
            .create_volume(&request("vol1", 2, Placement::new("gold")))
            .await
            .unwrap();

        assert_matches!(
            engine.extend_volume(&vol, 2).await,
            Err(Error::NotExtendable { .. })
        );
        engine.delete_volume(&vol, None).await.unwrap();
        assert_matches!(
            engine.extend_volume(&vol, 4).await,
            Err(Error::ResourceNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_create_failure_carries_description() {
        let sim = array();
        sim.fail_method(method::CREATE_ELEMENT_FROM_POOL, 99, "Failure");
        let engine = engine(&sim);

        let err = engine
            .create_volume(&request("vol1", 1, Placement::new("gold")))
            .await
            .unwrap_err();
        assert_matches!(err, Error::ProvisioningFailed { ref volume, ref reason }
            if volume == "vol1" && reason.contains("Failure"));
    }

    #[tokio::test]
    async fn test_delete_failure() {
        let sim = array();
        let engine = engine(&sim);
        let vol = engine
            .create_volume(&request("vol1", 1, Placement::new("gold")))
            .await
            .unwrap();
        sim.fail_method(method::RETURN_TO_POOL, 4, "device busy");

        assert_matches!(
            engine.delete_volume(&vol, None).await,
            Err(Error::ProvisioningFailed { .. })
        );
    }

    #[tokio::test]
    async fn test_fast_volume_lands_in_default_group() {
        let sim = array();
        let engine = engine(&sim);
        let placement = Placement::new("gold").with_fast_policy("GOLD1");
        let vol = engine
            .create_volume(&request("vol1", 1, placement))
            .await
            .unwrap();

        let default_sg = sim
            .named(class::DEVICE_MASKING_GROUP, "OS_default_GOLD1_SG")
            .unwrap();
        assert_eq!(sim.members(&default_sg.path), vec![vol.clone()]);

        engine.delete_volume(&vol, Some("GOLD1")).await.unwrap();
        assert!(sim.members(&default_sg.path).is_empty());
    }

    #[tokio::test]
    async fn test_fast_pool_outside_policy() {
        let sim = array();
        let engine = engine(&sim);
        let placement = Placement::new("silver").with_fast_policy("GOLD1");
        assert_matches!(
            engine.create_volume(&request("vol1", 1, placement)).await,
            Err(Error::InvalidConfiguration(_))
        );
    }

    #[tokio::test]
    async fn test_clone_matches_source_layout() {
        let sim = array();
        let engine = engine(&sim);
        let source = engine
            .create_volume(&request("src", 4, Placement::new("gold").with_stripe_count(2)))
            .await
            .unwrap();

        let target = engine
            .clone_volume(&source, "copy", &Placement::new("gold"), DETACHED)
            .await
            .unwrap();
        let facts = engine.volume_facts(&target).await.unwrap().unwrap();
        assert_eq!(facts.size_bytes, 4 * GIB);
        assert!(facts.is_striped);
        assert_eq!(sim.invocations(method::MODIFY_REPLICA_SYNCHRONIZATION), 1);
        assert!(sim.instances_of(class::STORAGE_SYNCHRONIZED).is_empty());
    }

    #[tokio::test]
    async fn test_clone_sized_from_members_when_composite_misreports() {
        let sim = array();
        let source = engine(&sim)
            .create_volume(&request("src", 4, Placement::new("gold").with_stripe_count(2)))
            .await
            .unwrap();

        let inflated = engine_over(Arc::new(InflatedVolumes { inner: sim.clone() }));
        assert_eq!(
            inflated.volume_facts(&source).await.unwrap().unwrap().size_bytes,
            8 * GIB
        );
        let target = inflated
            .clone_volume(&source, "copy", &Placement::new("gold"), DETACHED)
            .await
            .unwrap();

        let facts = engine(&sim).volume_facts(&target).await.unwrap().unwrap();
        assert_eq!(facts.size_bytes, 4 * GIB);
        assert!(facts.is_striped);
    }

    #[tokio::test]
    async fn test_oversized_requests_rejected() {
        let sim = array();
        let engine = engine(&sim);

        assert_matches!(
            engine
                .create_volume(&request("huge", 1 << 34, Placement::new("gold")))
                .await,
            Err(Error::ApiValidation(_))
        );
        assert_eq!(sim.invocations(method::CREATE_ELEMENT_FROM_POOL), 0);

        let vol = engine
            .create_volume(&request("vol1", 1, Placement::new("gold")))
            .await
            .unwrap();
        assert_matches!(
            engine.extend_volume(&vol, u64::MAX).await,
            Err(Error::ApiValidation(_))
        );
        assert_eq!(engine.volume_facts(&vol).await.unwrap().unwrap().size_bytes, GIB);
    }

    #[tokio::test]
    async fn test_clone_without_detach_keeps_relationship() {
        let sim = array();
        let engine = engine(&sim);
        let source = engine
            .create_volume(&request("src", 1, Placement::new("gold")))
            .await
            .unwrap();
        let options = CloneOptions {
            sync_percent: 100,
            detach: false,
        };

        engine
            .clone_volume(&source, "snap", &Placement::new("gold"), options)
            .await
            .unwrap();
        assert_eq!(sim.invocations(method::MODIFY_REPLICA_SYNCHRONIZATION), 0);
        assert_eq!(sim.instances_of(class::STORAGE_SYNCHRONIZED).len(), 1);
    }

    #[tokio::test]
    async fn test_clone_failure() {
        let sim = array();
        let engine = engine(&sim);
        let source = engine
            .create_volume(&request("src", 1, Placement::new("gold")))
            .await
            .unwrap();
        sim.fail_method(method::CREATE_ELEMENT_REPLICA, 4, "replica limit");

        assert_matches!(
            engine
                .clone_volume(&source, "copy", &Placement::new("gold"), DETACHED)
                .await,
            Err(Error::ProvisioningFailed { .. })
        );
        // no rollback: the target stays for a later delete
        assert!(sim.named(class::STORAGE_VOLUME, "copy").is_some());
    }

    #[tokio::test]
    async fn test_migrate_between_pools() {
        let sim = array();
        let engine = engine(&sim);
        let vol = engine
            .create_volume(&request("vol1", 1, Placement::new("gold")))
            .await
            .unwrap();

        engine.migrate_volume(&vol, "silver").await.unwrap();
        let pool = engine.locator.pool_of_volume(&vol).await.unwrap().unwrap();
        assert_eq!(pool.element_name(), Some("silver"));

        assert_matches!(
            engine.migrate_volume(&vol, "bronze").await,
            Err(Error::ResourceNotFound { .. })
        );
    }
}
