//! Simulated Array
//!
//! In-memory object graph that speaks the management-object protocol the
//! way the array's provider does: instances keyed by [`InstanceName`],
//! associations as links between them, extrinsic methods answered with
//! concrete jobs that stay pending for a configurable number of polls.
//!
//! Used by the `--standalone` binary and as the behavioural fixture of the
//! test suite. Failure injection, external deletion (any instance can be
//! removed through [`ManagementClient::delete_instance`]) and an invocation
//! log let tests reproduce races and check idempotency.

use crate::array::naming::{device_key, group_key, system_name};
use crate::domain::classes::{
    assoc, class, composite_type, group_type, job_state, method, policy_operation, rc, service,
    sync_state, SYNC_OPERATION_DETACH,
};
use crate::domain::model::{Instance, InstanceName, InvokeOutcome, MethodArgs, Value};
use crate::domain::ports::ManagementClient;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Block size reported for every volume
pub const BLOCK_SIZE: u64 = 512;

/// Provider-side failure: return code and description
type Rejection = (u32, String);

fn reject(description: impl Into<String>) -> Rejection {
    (rc::FAILED, description.into())
}

// =============================================================================
// Simulator State
// =============================================================================

#[derive(Debug, Clone)]
struct Link {
    assoc: String,
    left: InstanceName,
    right: InstanceName,
}

#[derive(Debug, Clone)]
struct SimJob {
    pending: u32,
    error: Option<Rejection>,
}

/// A recorded `invoke_method` call
#[derive(Debug, Clone)]
pub struct Invocation {
    pub method: String,
    pub target: InstanceName,
    pub args: MethodArgs,
}

#[derive(Debug, Clone)]
struct FailureRule {
    method: String,
    element: Option<String>,
    code: u32,
    description: String,
}

#[derive(Default)]
struct SimState {
    instances: BTreeMap<InstanceName, Instance>,
    links: Vec<Link>,
    jobs: BTreeMap<InstanceName, SimJob>,
    syncs_pending: BTreeMap<InstanceName, u32>,
    failures: Vec<FailureRule>,
    invocations: Vec<Invocation>,
    next_id: u64,
    job_latency: u32,
    sync_latency: u32,
    offline: bool,
}

impl SimState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert(&mut self, instance: Instance) -> InstanceName {
        let name = instance.path.clone();
        self.instances.insert(name.clone(), instance);
        name
    }

    fn link(&mut self, assoc: &str, left: &InstanceName, right: &InstanceName) {
        let exists = self
            .links
            .iter()
            .any(|l| l.assoc == assoc && &l.left == left && &l.right == right);
        if !exists {
            self.links.push(Link {
                assoc: assoc.to_string(),
                left: left.clone(),
                right: right.clone(),
            });
        }
    }

    fn unlink(&mut self, assoc: &str, left: &InstanceName, right: &InstanceName) {
        self.links
            .retain(|l| !(l.assoc == assoc && &l.left == left && &l.right == right));
    }

    /// Other ends of every link touching `name`
    fn linked(&self, name: &InstanceName, assoc: Option<&str>) -> Vec<InstanceName> {
        let mut seen = BTreeSet::new();
        self.links
            .iter()
            .filter(|l| assoc.map_or(true, |a| l.assoc == a))
            .filter_map(|l| {
                if &l.left == name {
                    Some(l.right.clone())
                } else if &l.right == name {
                    Some(l.left.clone())
                } else {
                    None
                }
            })
            .filter(|other| seen.insert(other.clone()))
            .collect()
    }

    /// Right-hand ends of links where `name` is on the left
    fn children(&self, name: &InstanceName, assoc: &str) -> Vec<InstanceName> {
        self.links
            .iter()
            .filter(|l| l.assoc == assoc && &l.left == name)
            .map(|l| l.right.clone())
            .collect()
    }

    fn remove(&mut self, name: &InstanceName) -> bool {
        let existed = self.instances.remove(name).is_some();
        self.links.retain(|l| &l.left != name && &l.right != name);
        self.jobs.remove(name);
        self.syncs_pending.remove(name);
        existed
    }

    fn require(&self, name: Option<&InstanceName>, what: &str) -> std::result::Result<InstanceName, Rejection> {
        let name = name.ok_or_else(|| reject(format!("missing argument {}", what)))?;
        if self.instances.contains_key(name) {
            Ok(name.clone())
        } else {
            Err(reject(format!("{} {} not found", what, name)))
        }
    }

    fn new_job(&mut self, error: Option<Rejection>, affected: &[InstanceName]) -> InstanceName {
        let id = self.next_id();
        let job = InstanceName::new(class::CONCRETE_JOB).with_key("InstanceID", format!("JOB-{}", id));
        self.insert(Instance::new(job.clone()));
        self.jobs.insert(
            job.clone(),
            SimJob {
                pending: self.job_latency,
                error,
            },
        );
        for element in affected {
            self.link(assoc::AFFECTED_JOB_ELEMENT, &job, element);
        }
        job
    }

    fn volume_size(&self, volume: &InstanceName) -> u64 {
        self.instances
            .get(volume)
            .map(|v| v.u64_prop("BlockSize").unwrap_or(BLOCK_SIZE) * v.u64_prop("ConsumableBlocks").unwrap_or(0))
            .unwrap_or(0)
    }

    fn set_volume_size(&mut self, volume: &InstanceName, size: u64) {
        if let Some(v) = self.instances.get_mut(volume) {
            v.properties
                .insert("ConsumableBlocks".into(), Value::UInt(size / BLOCK_SIZE));
            v.properties
                .insert("NumberOfBlocks".into(), Value::UInt(size / BLOCK_SIZE));
        }
    }

    fn pool_of(&self, volume: &InstanceName) -> Option<InstanceName> {
        self.linked(volume, Some(assoc::ALLOCATED_FROM_POOL))
            .into_iter()
            .find(|p| p.is_class(class::STORAGE_POOL))
    }

    /// Move `delta` bytes of subscription into (positive) or out of a pool
    fn adjust_pool(&mut self, pool: &InstanceName, delta: i128) {
        if let Some(p) = self.instances.get_mut(pool) {
            let subscribed = p.u64_prop("EMCSubscribedCapacity").unwrap_or(0) as i128;
            let remaining = p.u64_prop("RemainingManagedSpace").unwrap_or(0) as i128;
            p.properties.insert(
                "EMCSubscribedCapacity".into(),
                Value::UInt((subscribed + delta).max(0) as u64),
            );
            p.properties.insert(
                "RemainingManagedSpace".into(),
                Value::UInt((remaining - delta).max(0) as u64),
            );
        }
    }

    fn new_volume(
        &mut self,
        array: &str,
        element_name: &str,
        pool: &InstanceName,
        size: u64,
        layout: Option<(u64, u64)>,
    ) -> InstanceName {
        let id = self.next_id();
        let name = device_key(array, class::STORAGE_VOLUME, &format!("{:05X}", id));
        let mut volume = Instance::new(name.clone())
            .with("ElementName", element_name)
            .with("BlockSize", BLOCK_SIZE)
            .with("ConsumableBlocks", size / BLOCK_SIZE)
            .with("NumberOfBlocks", size / BLOCK_SIZE)
            .with("IsComposite", layout.is_some());
        if let Some((kind, _)) = layout {
            volume = volume.with("CompositeType", kind);
        }
        self.insert(volume);
        self.link(assoc::ALLOCATED_FROM_POOL, pool, &name);
        self.adjust_pool(pool, size as i128);

        if let Some((_, members)) = layout {
            let members = members.max(1);
            for _ in 0..members {
                self.new_extent(array, &name, size / members);
            }
        }
        name
    }

    fn new_extent(&mut self, array: &str, volume: &InstanceName, size: u64) -> InstanceName {
        let id = self.next_id();
        let extent = device_key(array, class::STORAGE_EXTENT, &format!("{:05X}", id));
        self.insert(
            Instance::new(extent.clone())
                .with("BlockSize", BLOCK_SIZE)
                .with("ConsumableBlocks", size / BLOCK_SIZE)
                .with("NumberOfBlocks", size / BLOCK_SIZE),
        );
        self.link(assoc::BASED_ON, volume, &extent);
        extent
    }

    fn delete_volume(&mut self, volume: &InstanceName) {
        let size = self.volume_size(volume);
        if let Some(pool) = self.pool_of(volume) {
            self.adjust_pool(&pool, -(size as i128));
        }
        for extent in self.children(volume, assoc::BASED_ON) {
            self.remove(&extent);
        }
        let syncs: Vec<InstanceName> = self
            .instances
            .values()
            .filter(|i| i.path.is_class(class::STORAGE_SYNCHRONIZED))
            .filter(|i| i.properties.values().any(|v| v.as_reference() == Some(volume)))
            .map(|i| i.path.clone())
            .collect();
        for sync in syncs {
            self.remove(&sync);
        }
        self.remove(volume);
    }

    fn views_using(&self, group: &InstanceName) -> Vec<InstanceName> {
        self.linked(group, None)
            .into_iter()
            .filter(|n| n.is_class(class::MASKING_VIEW))
            .collect()
    }

    /// Recompute protocol-controller units from view -> storage group -> volume
    fn refresh_units(&mut self) {
        let mut desired = BTreeSet::new();
        let views: Vec<InstanceName> = self
            .instances
            .keys()
            .filter(|n| n.is_class(class::MASKING_VIEW))
            .cloned()
            .collect();
        for view in &views {
            for group in self.children(view, assoc::ASSOCIATED_DEVICE_GROUP) {
                for volume in self.children(&group, assoc::MEMBER_OF_COLLECTION) {
                    desired.insert((view.clone(), volume));
                }
            }
        }

        let units: Vec<Instance> = self
            .instances
            .values()
            .filter(|i| i.path.is_class(class::PROTOCOL_CONTROLLER_FOR_UNIT))
            .cloned()
            .collect();
        let mut existing = BTreeSet::new();
        for unit in units {
            let pair = (
                unit.ref_prop("Antecedent").cloned(),
                unit.ref_prop("Dependent").cloned(),
            );
            match pair {
                (Some(view), Some(volume)) if desired.contains(&(view.clone(), volume.clone())) => {
                    existing.insert((view, volume));
                }
                _ => {
                    self.remove(&unit.path);
                }
            }
        }

        for (view, volume) in desired.difference(&existing).cloned().collect::<Vec<_>>() {
            let used: BTreeSet<u64> = self
                .instances
                .values()
                .filter(|i| i.path.is_class(class::PROTOCOL_CONTROLLER_FOR_UNIT))
                .filter(|i| i.ref_prop("Antecedent") == Some(&view))
                .filter_map(|i| i.attr("DeviceNumber").and_then(|d| u64::from_str_radix(d, 16).ok()))
                .collect();
            let lun = (1..).find(|l| !used.contains(l)).unwrap_or(1);
            let unit = InstanceName::new(class::PROTOCOL_CONTROLLER_FOR_UNIT)
                .with_key("Antecedent", view.to_string())
                .with_key("Dependent", volume.to_string());
            self.insert(
                Instance::new(unit)
                    .with("Antecedent", view.clone())
                    .with("Dependent", volume.clone())
                    .with("DeviceNumber", format!("{:04X}", lun)),
            );
        }
    }

    fn matching_failure(&self, method: &str, args: &MethodArgs) -> Option<FailureRule> {
        self.failures
            .iter()
            .find(|rule| {
                rule.method == method
                    && rule
                        .element
                        .as_deref()
                        .map_or(true, |element| self.mentions(args, element))
            })
            .cloned()
    }

    fn mentions(&self, args: &MethodArgs, element: &str) -> bool {
        args.iter().any(|(_, value)| {
            value.strings().iter().any(|s| s == element)
                || value.refs().iter().any(|r| {
                    self.instances
                        .get(r)
                        .and_then(Instance::element_name)
                        .map_or(false, |n| n == element)
                })
        })
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Seeds a simulated array
pub struct SimulatedArrayBuilder {
    array: String,
    pools: Vec<(String, u64, u64)>,
    port_groups: Vec<(String, Vec<String>)>,
    policies: Vec<(String, Vec<String>)>,
    job_latency: u32,
    sync_latency: u32,
    tiering_licensed: bool,
}

impl SimulatedArrayBuilder {
    /// Add a thin pool with total and already subscribed bytes
    pub fn pool(mut self, name: &str, total_bytes: u64, subscribed_bytes: u64) -> Self {
        self.pools
            .push((name.to_string(), total_bytes, subscribed_bytes));
        self
    }

    /// Add an operator-managed port group; `iqn.` targets become iSCSI
    /// endpoints, anything else an FC port
    pub fn port_group(mut self, name: &str, targets: &[&str]) -> Self {
        self.port_groups.push((
            name.to_string(),
            targets.iter().map(|t| t.to_string()).collect(),
        ));
        self
    }

    /// Add a FAST policy spanning the named pools
    pub fn tier_policy(mut self, name: &str, pools: &[&str]) -> Self {
        self.policies.push((
            name.to_string(),
            pools.iter().map(|p| p.to_string()).collect(),
        ));
        self
    }

    /// Polls a job stays pending before reaching its final state
    pub fn job_latency(mut self, polls: u32) -> Self {
        self.job_latency = polls;
        self
    }

    /// Polls a new synchronization stays below 100%
    pub fn sync_latency(mut self, polls: u32) -> Self {
        self.sync_latency = polls;
        self
    }

    pub fn tiering_licensed(mut self, licensed: bool) -> Self {
        self.tiering_licensed = licensed;
        self
    }

    pub fn build(self) -> Arc<SimulatedArray> {
        let array = self.array;
        let system = system_name(&array);
        let mut state = SimState {
            job_latency: self.job_latency,
            sync_latency: self.sync_latency,
            ..Default::default()
        };

        let system_ref = InstanceName::new(class::STORAGE_SYSTEM)
            .with_key("CreationClassName", class::STORAGE_SYSTEM)
            .with_key("Name", system.clone());
        state.insert(Instance::new(system_ref.clone()).with("ElementName", system.clone()));

        for service_class in [
            service::STORAGE_CONFIGURATION,
            service::CONTROLLER_CONFIGURATION,
            service::ELEMENT_COMPOSITION,
            service::STORAGE_RELOCATION,
            service::REPLICATION,
            service::HARDWARE_ID_MANAGEMENT,
            service::TIER_POLICY,
        ] {
            let name = service_name(&array, service_class);
            state.insert(Instance::new(name.clone()));
            state.link(assoc::HOSTED_SERVICE, &system_ref, &name);
        }

        let capabilities = InstanceName::new(class::TIER_POLICY_CAPABILITIES)
            .with_key("InstanceID", format!("{}+TierPolicyCapabilities", system));
        state.insert(
            Instance::new(capabilities.clone())
                .with("SupportsTieringPolicies", self.tiering_licensed),
        );
        state.link(
            assoc::ELEMENT_CAPABILITIES,
            &service_name(&array, service::TIER_POLICY),
            &capabilities,
        );

        for (name, total, subscribed) in &self.pools {
            let pool = pool_name(&array, name);
            state.insert(
                Instance::new(pool.clone())
                    .with("ElementName", name.clone())
                    .with("PoolID", name.clone())
                    .with("TotalManagedSpace", *total)
                    .with("EMCSubscribedCapacity", *subscribed)
                    .with("RemainingManagedSpace", total.saturating_sub(*subscribed)),
            );
            state.link(assoc::HOSTED_SERVICE, &system_ref, &pool);
        }

        for (name, targets) in &self.port_groups {
            let group = group_key(&array, class::TARGET_MASKING_GROUP, name);
            state.insert(Instance::new(group.clone()).with("ElementName", name.clone()));
            for target in targets {
                let endpoint_class = if target.starts_with("iqn.") {
                    class::ISCSI_ENDPOINT
                } else {
                    class::FC_ENDPOINT
                };
                let endpoint = InstanceName::new(endpoint_class)
                    .with_key("CreationClassName", endpoint_class)
                    .with_key("Name", target.clone())
                    .with_key("SystemName", system.clone());
                state.insert(Instance::new(endpoint.clone()).with("Name", target.clone()));
                state.link(assoc::MEMBER_OF_COLLECTION, &group, &endpoint);
            }
        }

        for (policy, pools) in &self.policies {
            let rule = InstanceName::new(class::TIER_POLICY_RULE)
                .with_key("PolicyRuleName", policy.clone())
                .with_key("SystemName", system.clone());
            state.insert(Instance::new(rule.clone()).with("PolicyRuleName", policy.clone()));
            for (idx, pool) in pools.iter().enumerate() {
                let tier = InstanceName::new(class::STORAGE_TIER)
                    .with_key("InstanceID", format!("{}+{}+T{}", system, policy, idx));
                state.insert(Instance::new(tier.clone()).with("ElementName", format!("{}_T{}", policy, idx)));
                state.link(assoc::ASSOCIATED_TIER_POLICY, &rule, &tier);
                state.link(assoc::CONCRETE_COMPONENT, &tier, &pool_name(&array, pool));
            }
        }

        Arc::new(SimulatedArray {
            array,
            state: RwLock::new(state),
        })
    }
}

fn service_name(array: &str, service_class: &str) -> InstanceName {
    InstanceName::new(service_class)
        .with_key("CreationClassName", service_class)
        .with_key("Name", service_class)
        .with_key("SystemCreationClassName", class::STORAGE_SYSTEM)
        .with_key("SystemName", system_name(array))
}

fn pool_name(array: &str, pool: &str) -> InstanceName {
    InstanceName::new(class::STORAGE_POOL)
        .with_key("InstanceID", format!("{}+TP+{}", system_name(array), pool))
}

// =============================================================================
// Simulated Array
// =============================================================================

/// In-memory array answering management-object calls
pub struct SimulatedArray {
    array: String,
    state: RwLock<SimState>,
}

impl SimulatedArray {
    pub fn builder(array: &str) -> SimulatedArrayBuilder {
        SimulatedArrayBuilder {
            array: array.to_string(),
            pools: Vec::new(),
            port_groups: Vec::new(),
            policies: Vec::new(),
            job_latency: 0,
            sync_latency: 0,
            tiering_licensed: true,
        }
    }

    pub fn array(&self) -> &str {
        &self.array
    }

    pub fn service(&self, service_class: &str) -> InstanceName {
        service_name(&self.array, service_class)
    }

    pub fn storage_configuration_service(&self) -> InstanceName {
        self.service(service::STORAGE_CONFIGURATION)
    }

    pub fn controller_configuration_service(&self) -> InstanceName {
        self.service(service::CONTROLLER_CONFIGURATION)
    }

    pub fn replication_service(&self) -> InstanceName {
        self.service(service::REPLICATION)
    }

    pub fn pool_name(&self, pool: &str) -> InstanceName {
        pool_name(&self.array, pool)
    }

    /// Register a bare job; `error` makes it end in the Exception state
    pub fn create_job(&self, pending_polls: u32, error: Option<(u32, String)>) -> InstanceName {
        let mut state = self.state.write();
        let job = state.new_job(error, &[]);
        if let Some(entry) = state.jobs.get_mut(&job) {
            entry.pending = pending_polls;
        }
        job
    }

    pub fn set_job_latency(&self, polls: u32) {
        self.state.write().job_latency = polls;
    }

    /// Make every call of `method` fail through its job
    pub fn fail_method(&self, method: &str, code: u32, description: &str) {
        self.push_failure(method, None, code, description);
    }

    /// Make calls of `method` mentioning `element` (by name) fail
    pub fn fail_method_for(&self, method: &str, element: &str, code: u32, description: &str) {
        self.push_failure(method, Some(element.to_string()), code, description);
    }

    fn push_failure(&self, method: &str, element: Option<String>, code: u32, description: &str) {
        self.state.write().failures.push(FailureRule {
            method: method.to_string(),
            element,
            code,
            description: description.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        self.state.write().failures.clear();
    }

    /// Fail every call with a transport error
    pub fn set_offline(&self, offline: bool) {
        self.state.write().offline = offline;
    }

    /// Number of times `method` was invoked
    pub fn invocations(&self, method: &str) -> usize {
        self.state
            .read()
            .invocations
            .iter()
            .filter(|i| i.method == method)
            .count()
    }

    pub fn invocation_log(&self) -> Vec<Invocation> {
        self.state.read().invocations.clone()
    }

    /// Every instance of a class, without going through the client port
    pub fn instances_of(&self, class_name: &str) -> Vec<Instance> {
        self.state
            .read()
            .instances
            .values()
            .filter(|i| i.path.is_class(class_name))
            .cloned()
            .collect()
    }

    /// Instance of `class_name` with the given element name
    pub fn named(&self, class_name: &str, element_name: &str) -> Option<Instance> {
        self.instances_of(class_name)
            .into_iter()
            .find(|i| i.element_name() == Some(element_name))
    }

    /// Members of a group
    pub fn members(&self, group: &InstanceName) -> Vec<InstanceName> {
        self.state.read().children(group, assoc::MEMBER_OF_COLLECTION)
    }

    fn check_online(&self, state: &SimState, operation: &str) -> Result<()> {
        if state.offline {
            return Err(Error::Transport {
                operation: operation.to_string(),
                reason: "array unreachable".into(),
            });
        }
        Ok(())
    }

    fn not_found(name: &InstanceName) -> Error {
        Error::InstanceNotFound {
            class: name.class_name.clone(),
            key: name.to_string(),
        }
    }

    // =========================================================================
    // Extrinsic Methods
    // =========================================================================

    fn dispatch(
        &self,
        state: &mut SimState,
        method_name: &str,
        args: &MethodArgs,
    ) -> std::result::Result<(InvokeOutcome, Vec<InstanceName>), Rejection> {
        let array = self.array.as_str();
        match method_name {
            method::CREATE_ELEMENT_FROM_POOL => {
                let size = args.u64("Size").ok_or_else(|| reject("missing Size"))?;
                if let Some(element) = args.reference("TheElement") {
                    let element = state.require(Some(element), "TheElement")?;
                    let current = state.volume_size(&element);
                    if size < current {
                        return Err(reject("volume cannot be shrunk"));
                    }
                    state.set_volume_size(&element, size);
                    if let Some(pool) = state.pool_of(&element) {
                        state.adjust_pool(&pool, size as i128 - current as i128);
                    }
                    let outcome = InvokeOutcome::completed().with_output("TheElement", element.clone());
                    return Ok((outcome, vec![element]));
                }
                let name = args.str("ElementName").ok_or_else(|| reject("missing ElementName"))?;
                let pool = state.require(args.reference("InPool"), "InPool")?;
                let volume = state.new_volume(array, name, &pool, size, None);
                let outcome = InvokeOutcome::completed().with_output("TheElement", volume.clone());
                Ok((outcome, vec![volume]))
            }

            method::CREATE_COMPOSITE_ELEMENT => {
                if let Some(element) = args.reference("TheElement") {
                    let element = state.require(Some(element), "TheElement")?;
                    let members = args.refs("InElements");
                    if members.is_empty() {
                        return Err(reject("missing InElements"));
                    }
                    let is_composite = state
                        .instances
                        .get(&element)
                        .map_or(false, |v| v.bool_prop("IsComposite"));
                    if !is_composite {
                        let base = state.volume_size(&element);
                        state.new_extent(array, &element, base);
                        if let Some(v) = state.instances.get_mut(&element) {
                            v.properties.insert("IsComposite".into(), Value::Bool(true));
                            v.properties.insert(
                                "CompositeType".into(),
                                Value::UInt(composite_type::CONCATENATED),
                            );
                        }
                    }
                    let mut total = state.volume_size(&element);
                    for member in &members {
                        let member = state.require(Some(member), "InElements")?;
                        let size = state.volume_size(&member);
                        // the member's subscription moves to the composite
                        state.remove(&member);
                        state.new_extent(array, &element, size);
                        total += size;
                    }
                    state.set_volume_size(&element, total);
                    let outcome = InvokeOutcome::completed().with_output("TheElement", element.clone());
                    return Ok((outcome, vec![element]));
                }

                let name = args.str("ElementName").ok_or_else(|| reject("missing ElementName"))?;
                let size = args.u64("Size").ok_or_else(|| reject("missing Size"))?;
                let pool = args
                    .refs("InPools")
                    .into_iter()
                    .next()
                    .or_else(|| args.reference("InPool").cloned());
                let pool = state.require(pool.as_ref(), "InPools")?;
                let kind = args.u64("CompositeType").unwrap_or(composite_type::STRIPED);
                let members = args.u64("EMCNumberOfMembers").unwrap_or(1);
                let volume = state.new_volume(array, name, &pool, size, Some((kind, members)));
                let outcome = InvokeOutcome::completed().with_output("TheElement", volume.clone());
                Ok((outcome, vec![volume]))
            }

            method::RETURN_TO_POOL => {
                let elements = args.refs("TheElements");
                if elements.is_empty() {
                    return Err(reject("missing TheElements"));
                }
                for element in &elements {
                    let element = state.require(Some(element), "TheElements")?;
                    state.delete_volume(&element);
                }
                Ok((InvokeOutcome::completed(), Vec::new()))
            }

            method::CREATE_GROUP => {
                let group_name = args.str("GroupName").ok_or_else(|| reject("missing GroupName"))?;
                let group_class = match args.u64("Type") {
                    Some(group_type::INITIATOR) => class::INITIATOR_MASKING_GROUP,
                    Some(group_type::TARGET) => class::TARGET_MASKING_GROUP,
                    Some(group_type::DEVICE) => class::DEVICE_MASKING_GROUP,
                    other => return Err(reject(format!("unsupported group type {:?}", other))),
                };
                let group = group_key(array, group_class, group_name);
                if state.instances.contains_key(&group) {
                    return Err(reject(format!("group {} already exists", group_name)));
                }
                let members = args.refs("Members");
                for member in &members {
                    state.require(Some(member), "Members")?;
                }
                state.insert(Instance::new(group.clone()).with("ElementName", group_name));
                for member in &members {
                    state.link(assoc::MEMBER_OF_COLLECTION, &group, member);
                }
                let outcome = InvokeOutcome::completed().with_output("MaskingGroup", group.clone());
                Ok((outcome, vec![group]))
            }

            method::DELETE_GROUP => {
                let group = state.require(args.reference("MaskingGroup"), "MaskingGroup")?;
                if !state.views_using(&group).is_empty() {
                    return Err((rc::IN_USE, format!("group {} is part of a masking view", group)));
                }
                let force = args.get("Force").and_then(Value::as_bool).unwrap_or(false);
                if !force && !state.children(&group, assoc::MEMBER_OF_COLLECTION).is_empty() {
                    return Err((rc::IN_USE, format!("group {} is not empty", group)));
                }
                state.remove(&group);
                Ok((InvokeOutcome::completed(), Vec::new()))
            }

            method::ADD_MEMBERS | method::REMOVE_MEMBERS => {
                let group = state.require(args.reference("MaskingGroup"), "MaskingGroup")?;
                let members = args.refs("Members");
                for member in &members {
                    if method_name == method::ADD_MEMBERS {
                        state.require(Some(member), "Members")?;
                        state.link(assoc::MEMBER_OF_COLLECTION, &group, member);
                    } else {
                        state.unlink(assoc::MEMBER_OF_COLLECTION, &group, member);
                    }
                }
                Ok((InvokeOutcome::completed(), vec![group]))
            }

            method::CREATE_MASKING_VIEW => {
                let view_name = args.str("ElementName").ok_or_else(|| reject("missing ElementName"))?;
                let initiators = state.require(args.reference("InitiatorMaskingGroup"), "InitiatorMaskingGroup")?;
                let devices = state.require(args.reference("DeviceMaskingGroup"), "DeviceMaskingGroup")?;
                let targets = state.require(args.reference("TargetMaskingGroup"), "TargetMaskingGroup")?;
                let view = group_key(array, class::MASKING_VIEW, view_name);
                if state.instances.contains_key(&view) {
                    return Err(reject(format!("masking view {} already exists", view_name)));
                }
                state.insert(Instance::new(view.clone()).with("ElementName", view_name));
                state.link(assoc::ASSOCIATED_INITIATOR_GROUP, &view, &initiators);
                state.link(assoc::ASSOCIATED_DEVICE_GROUP, &view, &devices);
                state.link(assoc::ASSOCIATED_TARGET_GROUP, &view, &targets);
                let outcome = InvokeOutcome::completed().with_output("ProtocolController", view.clone());
                Ok((outcome, vec![view]))
            }

            method::DELETE_MASKING_VIEW => {
                let view = state.require(args.reference("ProtocolController"), "ProtocolController")?;
                state.remove(&view);
                Ok((InvokeOutcome::completed(), Vec::new()))
            }

            method::CREATE_HARDWARE_ID => {
                let storage_id = args.str("StorageID").ok_or_else(|| reject("missing StorageID"))?;
                let id_type = args.u64("IDType").unwrap_or(0);
                let hardware_id = InstanceName::new(class::STORAGE_HARDWARE_ID)
                    .with_key("InstanceID", storage_id);
                state.insert(
                    Instance::new(hardware_id.clone())
                        .with("StorageID", storage_id)
                        .with("IDType", id_type),
                );
                let outcome = InvokeOutcome::completed().with_output("HardwareID", hardware_id);
                Ok((outcome, Vec::new()))
            }

            method::CREATE_ELEMENT_REPLICA => {
                let source = state.require(args.reference("SourceElement"), "SourceElement")?;
                let target = match args.reference("TargetElement") {
                    Some(target) => state.require(Some(target), "TargetElement")?,
                    None => {
                        let name = args.str("ElementName").ok_or_else(|| reject("missing ElementName"))?;
                        let pool = state
                            .pool_of(&source)
                            .ok_or_else(|| reject("source volume has no pool"))?;
                        let size = state.volume_size(&source);
                        state.new_volume(array, name, &pool, size, None)
                    }
                };
                let sync = InstanceName::new(class::STORAGE_SYNCHRONIZED)
                    .with_key("SystemElement", source.to_string())
                    .with_key("SyncedElement", target.to_string());
                let pending = state.sync_latency;
                state.insert(
                    Instance::new(sync.clone())
                        .with("SystemElement", source.clone())
                        .with("SyncedElement", target.clone())
                        .with("SyncState", sync_state::SYNCHRONIZED)
                        .with("PercentSynced", 100u64),
                );
                if pending > 0 {
                    state.syncs_pending.insert(sync.clone(), pending);
                }
                let outcome = InvokeOutcome::completed()
                    .with_output("TargetElement", target.clone())
                    .with_output("Synchronization", sync);
                Ok((outcome, vec![target]))
            }

            method::MODIFY_REPLICA_SYNCHRONIZATION => {
                let sync = state.require(args.reference("Synchronization"), "Synchronization")?;
                if args.u64("Operation") != Some(SYNC_OPERATION_DETACH) {
                    return Err(reject("unsupported synchronization operation"));
                }
                state.remove(&sync);
                Ok((InvokeOutcome::completed(), Vec::new()))
            }

            method::MODIFY_TIER_POLICY_RULE => {
                let rule = state.require(args.reference("PolicyRule"), "PolicyRule")?;
                let elements = args.refs("InElements");
                match args.u64("Operation") {
                    Some(policy_operation::ADD_ELEMENTS) => {
                        for element in &elements {
                            state.require(Some(element), "InElements")?;
                            state.link(assoc::POLICY_APPLIES_TO, &rule, element);
                        }
                    }
                    Some(policy_operation::REMOVE_ELEMENTS) => {
                        for element in &elements {
                            state.unlink(assoc::POLICY_APPLIES_TO, &rule, element);
                        }
                    }
                    other => return Err(reject(format!("unsupported policy operation {:?}", other))),
                }
                Ok((InvokeOutcome::completed(), Vec::new()))
            }

            method::RELOCATE_TO_POOL => {
                let target_pool = state.require(args.reference("TargetPool"), "TargetPool")?;
                for element in args.refs("TheElements") {
                    let element = state.require(Some(&element), "TheElements")?;
                    let size = state.volume_size(&element) as i128;
                    if let Some(pool) = state.pool_of(&element) {
                        state.adjust_pool(&pool, -size);
                        state.unlink(assoc::ALLOCATED_FROM_POOL, &pool, &element);
                    }
                    state.link(assoc::ALLOCATED_FROM_POOL, &target_pool, &element);
                    state.adjust_pool(&target_pool, size);
                }
                Ok((InvokeOutcome::completed(), Vec::new()))
            }

            other => Err(reject(format!("unsupported method {}", other))),
        }
    }
}

// =============================================================================
// Management Client Implementation
// =============================================================================

#[async_trait]
impl ManagementClient for SimulatedArray {
    async fn enumerate_instance_names(&self, class_name: &str) -> Result<Vec<InstanceName>> {
        let state = self.state.read();
        self.check_online(&state, "EnumerateInstanceNames")?;
        Ok(state
            .instances
            .keys()
            .filter(|n| n.is_class(class_name))
            .cloned()
            .collect())
    }

    async fn enumerate_instances(&self, class_name: &str) -> Result<Vec<Instance>> {
        let state = self.state.read();
        self.check_online(&state, "EnumerateInstances")?;
        Ok(state
            .instances
            .values()
            .filter(|i| i.path.is_class(class_name))
            .cloned()
            .collect())
    }

    async fn get_instance(&self, name: &InstanceName) -> Result<Instance> {
        let mut state = self.state.write();
        self.check_online(&state, "GetInstance")?;
        let SimState {
            instances,
            jobs,
            syncs_pending,
            ..
        } = &mut *state;

        let instance = instances.get_mut(name).ok_or_else(|| Self::not_found(name))?;

        if let Some(job) = jobs.get_mut(name) {
            let mut snapshot = instance.clone();
            if job.pending > 0 {
                job.pending -= 1;
                snapshot = snapshot.with("JobState", job_state::RUNNING);
            } else if let Some((code, description)) = &job.error {
                snapshot = snapshot
                    .with("JobState", job_state::EXCEPTION)
                    .with("ErrorCode", u64::from(*code))
                    .with("ErrorDescription", description.clone());
            } else {
                snapshot = snapshot
                    .with("JobState", job_state::COMPLETED)
                    .with("ErrorCode", 0u64);
            }
            return Ok(snapshot);
        }

        if let Some(pending) = syncs_pending.get_mut(name) {
            let mut snapshot = instance.clone();
            if *pending > 0 {
                *pending -= 1;
                snapshot = snapshot.with("PercentSynced", 50u64);
            }
            return Ok(snapshot);
        }

        Ok(instance.clone())
    }

    async fn associator_names(
        &self,
        name: &InstanceName,
        assoc_class: Option<&str>,
        result_class: Option<&str>,
    ) -> Result<Vec<InstanceName>> {
        let state = self.state.read();
        self.check_online(&state, "AssociatorNames")?;
        if !state.instances.contains_key(name) {
            return Err(Self::not_found(name));
        }
        Ok(state
            .linked(name, assoc_class)
            .into_iter()
            .filter(|n| result_class.map_or(true, |c| n.is_class(c)))
            .filter(|n| state.instances.contains_key(n))
            .collect())
    }

    async fn associators(
        &self,
        name: &InstanceName,
        assoc_class: Option<&str>,
        result_class: Option<&str>,
    ) -> Result<Vec<Instance>> {
        let names = self.associator_names(name, assoc_class, result_class).await?;
        let state = self.state.read();
        Ok(names
            .iter()
            .filter_map(|n| state.instances.get(n).cloned())
            .collect())
    }

    async fn reference_names(
        &self,
        name: &InstanceName,
        result_class: &str,
    ) -> Result<Vec<InstanceName>> {
        let state = self.state.read();
        self.check_online(&state, "ReferenceNames")?;
        if !state.instances.contains_key(name) {
            return Err(Self::not_found(name));
        }
        Ok(state
            .instances
            .values()
            .filter(|i| i.path.is_class(result_class))
            .filter(|i| i.properties.values().any(|v| v.as_reference() == Some(name)))
            .map(|i| i.path.clone())
            .collect())
    }

    async fn invoke_method(
        &self,
        method_name: &str,
        target: &InstanceName,
        args: MethodArgs,
    ) -> Result<InvokeOutcome> {
        let mut state = self.state.write();
        self.check_online(&state, method_name)?;
        if !state.instances.contains_key(target) {
            return Err(Self::not_found(target));
        }
        state.invocations.push(Invocation {
            method: method_name.to_string(),
            target: target.clone(),
            args: args.clone(),
        });
        debug!("Simulated array {} invoked {} on {}", self.array, method_name, target);

        if let Some(rule) = state.matching_failure(method_name, &args) {
            let job = state.new_job(Some((rule.code, rule.description)), &[]);
            return Ok(InvokeOutcome::job_started(job));
        }

        match self.dispatch(&mut state, method_name, &args) {
            Ok((outcome, affected)) => {
                state.refresh_units();
                if method_name == method::CREATE_HARDWARE_ID {
                    return Ok(outcome);
                }
                let job = state.new_job(None, &affected);
                Ok(InvokeOutcome {
                    return_code: rc::JOB_STARTED,
                    ..outcome
                }
                .with_output("Job", job))
            }
            Err((code, description)) => Ok(InvokeOutcome::completed()
                .with_return_code(code)
                .with_output("Description", description)),
        }
    }

    async fn delete_instance(&self, name: &InstanceName) -> Result<()> {
        let mut state = self.state.write();
        self.check_online(&state, "DeleteInstance")?;
        if !state.remove(name) {
            return Err(Self::not_found(name));
        }
        state.refresh_units();
        Ok(())
    }
}
