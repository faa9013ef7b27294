use std::collections::HashMap;

use tokio::sync::RwLock;

use fundflow_core::domain::workflow::{Workflow, WorkflowId};

use super::{RepositoryError, WorkflowRepository};

#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    workflows: RwLock<HashMap<String, Workflow>>,
}

impl InMemoryWorkflowRepository {
    pub fn with_workflows(workflows: impl IntoIterator<Item = Workflow>) -> Self {
        Self {
            workflows: RwLock::new(
                workflows.into_iter().map(|workflow| (workflow.id.0.clone(), workflow)).collect(),
            ),
        }
    }
}

#[async_trait::async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<Workflow>, RepositoryError> {
        let workflows = self.workflows.read().await;
        Ok(workflows.get(&id.0).cloned())
    }

    async fn list_active(&self) -> Result<Vec<Workflow>, RepositoryError> {
        let workflows = self.workflows.read().await;
        let mut active: Vec<Workflow> =
            workflows.values().filter(|workflow| workflow.active).cloned().collect();
        active.sort_by(|left, right| left.id.0.cmp(&right.id.0));
        Ok(active)
    }

    async fn save(&self, workflow: Workflow) -> Result<(), RepositoryError> {
        let mut workflows = self.workflows.write().await;
        workflows.insert(workflow.id.0.clone(), workflow);
        Ok(())
    }
}
