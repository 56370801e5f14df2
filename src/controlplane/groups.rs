//! Masking Group Operations
//!
//! Create, populate and delete masking groups through the controller
//! configuration service, each call settled by the job poller. Shared by the
//! masking orchestrator and the tiering tracker.

use crate::array::{EntityLocator, JobPoller};
use crate::domain::classes::{method, service};
use crate::domain::model::{InstanceName, InvokeOutcome, MethodArgs};
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Masking group operations on one array
pub struct GroupOps {
    locator: Arc<EntityLocator>,
    poller: Arc<JobPoller>,
}

impl GroupOps {
    pub fn new(locator: Arc<EntityLocator>, poller: Arc<JobPoller>) -> Self {
        Self { locator, poller }
    }

    /// Invoke a controller configuration method and settle its job
    pub async fn invoke_controller(&self, method_name: &str, args: MethodArgs) -> Result<InvokeOutcome> {
        let controller = self
            .locator
            .find_service(service::CONTROLLER_CONFIGURATION)
            .await?;
        let outcome = self
            .locator
            .client()
            .invoke_method(method_name, &controller, args)
            .await?;
        self.poller.complete(method_name, outcome).await
    }

    /// Created object from a method's output, else from the job's affected elements
    pub async fn created_element(&self, outcome: &InvokeOutcome, output: &str) -> Result<InstanceName> {
        if let Some(element) = outcome.output_ref(output) {
            return Ok(element.clone());
        }
        if let Some(job) = outcome.job() {
            if let Some(element) = self.poller.affected_elements(job).await?.into_iter().next() {
                return Ok(element);
            }
        }
        Err(Error::Internal(format!("operation returned no {}", output)))
    }

    /// Create a group of the given type with initial members
    pub async fn create_group(
        &self,
        name: &str,
        group_type: u64,
        members: Vec<InstanceName>,
    ) -> Result<InstanceName> {
        info!("Creating masking group {} (type {})", name, group_type);
        let outcome = self
            .invoke_controller(
                method::CREATE_GROUP,
                MethodArgs::new()
                    .arg("GroupName", name)
                    .arg("Type", group_type)
                    .arg("Members", members),
            )
            .await?;
        self.created_element(&outcome, "MaskingGroup").await
    }

    pub async fn add_members(&self, group: &InstanceName, members: Vec<InstanceName>) -> Result<()> {
        debug!("Adding {} member(s) to {}", members.len(), group);
        self.invoke_controller(
            method::ADD_MEMBERS,
            MethodArgs::new()
                .arg("MaskingGroup", group)
                .arg("Members", members),
        )
        .await
        .map(|_| ())
    }

    pub async fn remove_members(&self, group: &InstanceName, members: Vec<InstanceName>) -> Result<()> {
        debug!("Removing {} member(s) from {}", members.len(), group);
        self.invoke_controller(
            method::REMOVE_MEMBERS,
            MethodArgs::new()
                .arg("MaskingGroup", group)
                .arg("Members", members),
        )
        .await
        .map(|_| ())
    }

    /// Delete a group, tolerating its prior disappearance
    pub async fn delete_group(&self, group: &InstanceName) -> Result<()> {
        if self.locator.get_existing_instance(group).await?.is_none() {
            debug!("Group {} already gone", group);
            return Ok(());
        }
        info!("Deleting masking group {}", group);
        self.invoke_controller(
            method::DELETE_GROUP,
            MethodArgs::new().arg("MaskingGroup", group).arg("Force", true),
        )
        .await
        .map(|_| ())
    }
}
