//! Tiering and Capacity Tracker
//!
//! FAST policy bookkeeping: resolves a policy to its tiers and pools,
//! reports capacity, and keeps the per-policy default storage group that
//! holds every unattached volume under the policy.

use crate::array::naming::{default_storage_group_name, system_name};
use crate::array::{EntityLocator, JobPoller};
use crate::controlplane::groups::GroupOps;
use crate::domain::classes::{assoc, class, group_type, method, policy_operation, service};
use crate::domain::model::{Instance, InstanceName, MethodArgs};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const GIB: u64 = 1 << 30;

/// Bytes to GiB, rounded to nearest
pub fn bytes_to_gb(bytes: u64) -> u64 {
    (bytes + GIB / 2) / GIB
}

/// Capacity of a set of pools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capacity {
    pub total_gb: u64,
    pub free_gb: u64,
}

/// FAST policy and capacity lookups
pub struct TieringTracker {
    locator: Arc<EntityLocator>,
    poller: Arc<JobPoller>,
    groups: Arc<GroupOps>,
}

impl TieringTracker {
    pub fn new(locator: Arc<EntityLocator>, poller: Arc<JobPoller>, groups: Arc<GroupOps>) -> Self {
        Self {
            locator,
            poller,
            groups,
        }
    }

    // =========================================================================
    // Policy Lookup
    // =========================================================================

    /// Whether the array is licensed for tiering policies
    pub async fn is_tiering_enabled(&self) -> Result<bool> {
        let service = match self.locator.find_service(service::TIER_POLICY).await {
            Ok(service) => service,
            Err(Error::InvalidConfiguration(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let capabilities = self
            .locator
            .associated_instances(
                &service,
                assoc::ELEMENT_CAPABILITIES,
                Some(class::TIER_POLICY_CAPABILITIES),
            )
            .await?;
        Ok(capabilities
            .iter()
            .any(|c| c.bool_prop("SupportsTieringPolicies")))
    }

    pub async fn get_tier_policy_by_name(&self, policy: &str) -> Result<Option<InstanceName>> {
        let system = system_name(self.locator.array());
        Ok(self
            .locator
            .client()
            .enumerate_instances(class::TIER_POLICY_RULE)
            .await?
            .into_iter()
            .find(|rule| {
                rule.path.key("SystemName") == Some(system.as_str())
                    && rule.attr("PolicyRuleName") == Some(policy)
            })
            .map(|rule| rule.path))
    }

    async fn require_policy(&self, policy: &str) -> Result<InstanceName> {
        self.get_tier_policy_by_name(policy)
            .await?
            .ok_or_else(|| Error::InvalidConfiguration(format!("FAST policy {} not found", policy)))
    }

    /// Pools reached through the policy's tiers; tiers or rules deleted
    /// mid-walk contribute nothing
    async fn pools_of_policy(&self, rule: &InstanceName) -> Result<Vec<Instance>> {
        let tiers = self
            .locator
            .associated(rule, assoc::ASSOCIATED_TIER_POLICY, Some(class::STORAGE_TIER))
            .await?;

        let mut seen = BTreeSet::new();
        let mut pools = Vec::new();
        for tier in tiers {
            let tier_pools = self
                .locator
                .associated_instances(&tier, assoc::CONCRETE_COMPONENT, Some(class::STORAGE_POOL))
                .await?;
            if tier_pools.is_empty() {
                debug!("Tier {} has no pools or no longer exists", tier);
            }
            for pool in tier_pools {
                if seen.insert(pool.path.clone()) {
                    pools.push(pool);
                }
            }
        }
        Ok(pools)
    }

    pub async fn is_pool_in_policy(&self, pool: &str, policy: &str) -> Result<bool> {
        let Some(rule) = self.get_tier_policy_by_name(policy).await? else {
            return Ok(false);
        };
        Ok(self
            .pools_of_policy(&rule)
            .await?
            .iter()
            .any(|p| p.element_name() == Some(pool)))
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Total and free GiB over every pool of a policy; zero when the policy
    /// does not exist
    pub async fn get_capacities_for_policy(&self, policy: &str) -> Result<Capacity> {
        let Some(rule) = self.get_tier_policy_by_name(policy).await? else {
            warn!("FAST policy {} not found, reporting no capacity", policy);
            return Ok(Capacity::default());
        };

        let mut total = 0u64;
        let mut free = 0u64;
        for pool in self.pools_of_policy(&rule).await? {
            let pool_total = pool.u64_prop("TotalManagedSpace").unwrap_or(0);
            let subscribed = pool.u64_prop("EMCSubscribedCapacity").unwrap_or(0);
            total += pool_total;
            free += pool_total.saturating_sub(subscribed);
        }
        debug!("Policy {}: total {} bytes, free {} bytes", policy, total, free);
        Ok(Capacity {
            total_gb: bytes_to_gb(total),
            free_gb: bytes_to_gb(free),
        })
    }

    /// Capacity of a single pool, for arrays without FAST
    pub async fn get_pool_capacities(&self, pool: &str) -> Result<Capacity> {
        let instance = self
            .locator
            .find_pool_by_name(pool)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "pool".into(),
                name: pool.to_string(),
            })?;
        Ok(Capacity {
            total_gb: bytes_to_gb(instance.u64_prop("TotalManagedSpace").unwrap_or(0)),
            free_gb: bytes_to_gb(instance.u64_prop("RemainingManagedSpace").unwrap_or(0)),
        })
    }

    // =========================================================================
    // Policy Association
    // =========================================================================

    async fn modify_rule(&self, rule: &InstanceName, operation: u64, group: &InstanceName) -> Result<()> {
        let service = self.locator.find_service(service::TIER_POLICY).await?;
        let outcome = self
            .locator
            .client()
            .invoke_method(
                method::MODIFY_TIER_POLICY_RULE,
                &service,
                MethodArgs::new()
                    .arg("PolicyRule", rule)
                    .arg("Operation", operation)
                    .arg("InElements", vec![group.clone()]),
            )
            .await?;
        self.poller
            .complete(method::MODIFY_TIER_POLICY_RULE, outcome)
            .await
            .map(|_| ())
    }

    async fn is_associated(&self, group: &InstanceName, rule: &InstanceName) -> Result<bool> {
        let rules = self
            .locator
            .associated(group, assoc::POLICY_APPLIES_TO, Some(class::TIER_POLICY_RULE))
            .await?;
        Ok(rules.contains(rule))
    }

    /// Associate a storage group with a policy; no-op when already associated
    pub async fn assign_to_policy(&self, group: &InstanceName, policy: &str) -> Result<()> {
        let rule = self.require_policy(policy).await?;
        if self.is_associated(group, &rule).await? {
            debug!("{} already under policy {}", group, policy);
            return Ok(());
        }
        info!("Associating {} with FAST policy {}", group, policy);
        self.modify_rule(&rule, policy_operation::ADD_ELEMENTS, group).await
    }

    /// Dissociate a storage group from a policy; no-op when not associated
    pub async fn unassign_from_policy(&self, group: &InstanceName, policy: &str) -> Result<()> {
        let Some(rule) = self.get_tier_policy_by_name(policy).await? else {
            return Ok(());
        };
        if self.locator.get_existing_instance(group).await?.is_none()
            || !self.is_associated(group, &rule).await?
        {
            return Ok(());
        }
        info!("Dissociating {} from FAST policy {}", group, policy);
        self.modify_rule(&rule, policy_operation::REMOVE_ELEMENTS, group).await
    }

    // =========================================================================
    // Default Storage Group
    // =========================================================================

    pub async fn get_policy_default_storage_group(&self, policy: &str) -> Result<Option<InstanceName>> {
        self.locator
            .find_storage_group(&default_storage_group_name(policy))
            .await
    }

    /// The policy's default storage group, created and associated on first use
    pub async fn get_or_create_default_storage_group(&self, policy: &str) -> Result<InstanceName> {
        let group = match self.get_policy_default_storage_group(policy).await? {
            Some(group) => group,
            None => {
                let name = default_storage_group_name(policy);
                self.groups
                    .create_group(&name, group_type::DEVICE, Vec::new())
                    .await?
            }
        };
        self.assign_to_policy(&group, policy).await?;
        Ok(group)
    }

    pub async fn add_volume_to_default_storage_group(
        &self,
        volume: &InstanceName,
        policy: &str,
    ) -> Result<InstanceName> {
        let group = self.get_or_create_default_storage_group(policy).await?;
        if !self.locator.is_member(&group, volume).await? {
            self.groups.add_members(&group, vec![volume.clone()]).await?;
        }
        Ok(group)
    }

    /// Take a volume out of the policy's default group; returns whether it was a member
    pub async fn remove_volume_from_default_storage_group(
        &self,
        volume: &InstanceName,
        policy: &str,
    ) -> Result<bool> {
        let Some(group) = self.get_policy_default_storage_group(policy).await? else {
            return Ok(false);
        };
        if !self.locator.is_member(&group, volume).await? {
            return Ok(false);
        }
        self.groups.remove_members(&group, vec![volume.clone()]).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{PollConfig, SimulatedArray};
    use crate::domain::model::InvokeOutcome;
    use crate::domain::ports::{ManagementClient, ManagementClientRef};
    use crate::metrics::DriverMetrics;
    use async_trait::async_trait;
    use std::time::Duration;

    const ARRAY: &str = "000195900551";

    /// Deletes every tier right after the policy's tiers are listed
    struct VanishingTiers {
        inner: Arc<SimulatedArray>,
    }

    #[async_trait]
    impl ManagementClient for VanishingTiers {
        async fn enumerate_instance_names(&self, class_name: &str) -> Result<Vec<InstanceName>> {
            self.inner.enumerate_instance_names(class_name).await
        }

        async fn enumerate_instances(&self, class_name: &str) -> Result<Vec<Instance>> {
            self.inner.enumerate_instances(class_name).await
        }

        async fn get_instance(&self, name: &InstanceName) -> Result<Instance> {
            self.inner.get_instance(name).await
        }

        async fn associator_names(
            &self,
            name: &InstanceName,
            assoc_class: Option<&str>,
            result_class: Option<&str>,
        ) -> Result<Vec<InstanceName>> {
            let names = self
                .inner
                .associator_names(name, assoc_class, result_class)
                .await?;
            if assoc_class == Some(assoc::ASSOCIATED_TIER_POLICY) {
                for tier in &names {
                    self.inner.delete_instance(tier).await?;
                }
            }
            Ok(names)
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

    fn tracker(sim: &Arc<SimulatedArray>) -> TieringTracker {
        tracker_over(sim.clone())
    }

    fn tracker_over(client: ManagementClientRef) -> TieringTracker {
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
        TieringTracker::new(locator, poller, groups)
    }

    #[test]
    fn test_bytes_to_gb_rounds_to_nearest() {
        assert_eq!(bytes_to_gb(1_000_000_000_000), 931);
        assert_eq!(bytes_to_gb(500_000_000_000), 466);
        assert_eq!(bytes_to_gb(0), 0);
    }

    #[tokio::test]
    async fn test_capacities_for_policy() {
        let sim = SimulatedArray::builder(ARRAY)
            .pool("gold", 1_000_000_000_000, 500_000_000_000)
            .pool("bronze", 1 << 40, 0)
            .tier_policy("GOLD1", &["gold"])
            .build();
        let tracker = tracker(&sim);

        let capacity = tracker.get_capacities_for_policy("GOLD1").await.unwrap();
        assert_eq!(
            capacity,
            Capacity {
                total_gb: 931,
                free_gb: 466
            }
        );
        assert_eq!(
            tracker.get_capacities_for_policy("MISSING").await.unwrap(),
            Capacity::default()
        );

        let pool = tracker.get_pool_capacities("bronze").await.unwrap();
        assert_eq!(pool.total_gb, 1024);
        assert_eq!(pool.free_gb, 1024);
        assert!(tracker.is_pool_in_policy("gold", "GOLD1").await.unwrap());
        assert!(!tracker.is_pool_in_policy("bronze", "GOLD1").await.unwrap());
    }

    #[tokio::test]
    async fn test_capacities_tolerate_tier_deleted_mid_walk() {
        let sim = SimulatedArray::builder(ARRAY)
            .pool("gold", 1_000_000_000_000, 0)
            .tier_policy("GOLD1", &["gold"])
            .build();
        let tracker = tracker_over(Arc::new(VanishingTiers { inner: sim.clone() }));

        let capacity = tracker.get_capacities_for_policy("GOLD1").await.unwrap();
        assert_eq!(capacity, Capacity::default());
        assert!(sim.instances_of(class::STORAGE_TIER).is_empty());
        assert!(!tracker.is_pool_in_policy("gold", "GOLD1").await.unwrap());
    }

    #[tokio::test]
    async fn test_tiering_license() {
        let licensed = SimulatedArray::builder(ARRAY).build();
        assert!(tracker(&licensed).is_tiering_enabled().await.unwrap());

        let unlicensed = SimulatedArray::builder(ARRAY).tiering_licensed(false).build();
        assert!(!tracker(&unlicensed).is_tiering_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_default_storage_group_is_shared_and_associated_once() {
        let sim = SimulatedArray::builder(ARRAY)
            .pool("gold", 1 << 40, 0)
            .tier_policy("GOLD1", &["gold"])
            .job_latency(1)
            .build();
        let tracker = tracker(&sim);

        let first = tracker.get_or_create_default_storage_group("GOLD1").await.unwrap();
        let second = tracker.get_or_create_default_storage_group("GOLD1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(sim.invocations(method::CREATE_GROUP), 1);
        assert_eq!(sim.invocations(method::MODIFY_TIER_POLICY_RULE), 1);
        assert!(sim.named(class::DEVICE_MASKING_GROUP, "OS_default_GOLD1_SG").is_some());
    }

    #[tokio::test]
    async fn test_default_group_membership() {
        let sim = SimulatedArray::builder(ARRAY)
            .pool("gold", 1 << 40, 0)
            .tier_policy("GOLD1", &["gold"])
            .build();
        let tracker = tracker(&sim);
        let volume = sim
            .invoke_method(
                method::CREATE_ELEMENT_FROM_POOL,
                &sim.storage_configuration_service(),
                MethodArgs::new()
                    .arg("ElementName", "v1")
                    .arg("InPool", sim.pool_name("gold"))
                    .arg("Size", 1u64 << 30),
            )
            .await
            .unwrap()
            .output_ref("TheElement")
            .unwrap()
            .clone();

        let group = tracker
            .add_volume_to_default_storage_group(&volume, "GOLD1")
            .await
            .unwrap();
        tracker
            .add_volume_to_default_storage_group(&volume, "GOLD1")
            .await
            .unwrap();
        assert_eq!(sim.members(&group), vec![volume.clone()]);
        assert_eq!(sim.invocations(method::ADD_MEMBERS), 1);

        assert!(tracker
            .remove_volume_from_default_storage_group(&volume, "GOLD1")
            .await
            .unwrap());
        assert!(!tracker
            .remove_volume_from_default_storage_group(&volume, "GOLD1")
            .await
            .unwrap());
        assert!(sim.members(&group).is_empty());
    }
}
