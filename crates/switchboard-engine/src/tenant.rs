//! Owner-scoped access to the orchestrator.
//!
//! Every instance-addressed call first checks that the instance belongs to
//! the view's owner; a foreign instance yields `Forbidden` and nothing is
//! touched.

use tracing::warn;

use switchboard_core::ids::{ContactId, InstanceId, OwnerId};
use switchboard_store::contacts::ContactRow;
use switchboard_store::instances::InstanceRow;
use switchboard_store::messages::MessageRow;
use switchboard_store::stats::OwnerStats;

use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct TenantView {
    orchestrator: Orchestrator,
    owner_id: OwnerId,
}

impl TenantView {
    pub(crate) fn new(orchestrator: Orchestrator, owner_id: OwnerId) -> Self {
        Self {
            orchestrator,
            owner_id,
        }
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    fn authorize(&self, instance_id: &InstanceId) -> Result<InstanceRow, OrchestratorError> {
        let row = self.orchestrator.status(instance_id)?;
        if row.owner_id != self.owner_id {
            warn!(instance_id = %instance_id, owner_id = %self.owner_id, "cross-tenant access refused");
            return Err(OrchestratorError::Forbidden(instance_id.clone()));
        }
        Ok(row)
    }

    pub fn create_instance(&self, name: &str) -> Result<InstanceRow, OrchestratorError> {
        self.orchestrator.create_instance(&self.owner_id, name)
    }

    pub fn list_instances(&self) -> Result<Vec<InstanceRow>, OrchestratorError> {
        self.orchestrator.list_instances(&self.owner_id)
    }

    pub fn status(&self, instance_id: &InstanceId) -> Result<InstanceRow, OrchestratorError> {
        self.authorize(instance_id)
    }

    pub fn is_live(&self, instance_id: &InstanceId) -> Result<bool, OrchestratorError> {
        self.authorize(instance_id)?;
        Ok(self.orchestrator.is_live(instance_id))
    }

    pub async fn start(&self, instance_id: &InstanceId) -> Result<(), OrchestratorError> {
        self.authorize(instance_id)?;
        self.orchestrator.start(instance_id).await
    }

    pub async fn stop(&self, instance_id: &InstanceId) -> Result<(), OrchestratorError> {
        self.authorize(instance_id)?;
        self.orchestrator.stop(instance_id).await
    }

    pub async fn logout(&self, instance_id: &InstanceId) -> Result<(), OrchestratorError> {
        self.authorize(instance_id)?;
        self.orchestrator.logout(instance_id).await
    }

    pub async fn delete(&self, instance_id: &InstanceId) -> Result<(), OrchestratorError> {
        self.authorize(instance_id)?;
        self.orchestrator.delete(instance_id).await
    }

    pub async fn send(
        &self,
        instance_id: &InstanceId,
        contact_id: &ContactId,
        content: &str,
    ) -> Result<MessageRow, OrchestratorError> {
        self.authorize(instance_id)?;
        self.orchestrator.send(instance_id, contact_id, content).await
    }

    pub async fn send_to_address(
        &self,
        instance_id: &InstanceId,
        address: &str,
        content: &str,
    ) -> Result<MessageRow, OrchestratorError> {
        self.authorize(instance_id)?;
        self.orchestrator
            .send_to_address(instance_id, address, content)
            .await
    }

    pub fn list_contacts(&self, instance_id: &InstanceId) -> Result<Vec<ContactRow>, OrchestratorError> {
        self.authorize(instance_id)?;
        self.orchestrator.list_contacts(instance_id)
    }

    pub fn list_messages(
        &self,
        instance_id: &InstanceId,
        contact_id: Option<&ContactId>,
        limit: u32,
    ) -> Result<Vec<MessageRow>, OrchestratorError> {
        self.authorize(instance_id)?;
        self.orchestrator.list_messages(instance_id, contact_id, limit)
    }

    pub fn stats(&self) -> Result<OwnerStats, OrchestratorError> {
        self.orchestrator.stats(&self.owner_id)
    }
}
