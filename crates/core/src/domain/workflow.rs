use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::tenant::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowDefinitionId(pub String);

impl fmt::Display for WorkflowDefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which business process a definition drives. Status derivation keys off
/// the installation and payment tags.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkflowType {
    Installation,
    Payment,
    Custom(String),
}

impl WorkflowType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Installation => "installation",
            Self::Payment => "payment",
            Self::Custom(tag) => tag,
        }
    }
}

impl From<String> for WorkflowType {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "installation" => Self::Installation,
            "payment" => Self::Payment,
            _ => Self::Custom(value),
        }
    }
}

impl From<WorkflowType> for String {
    fn from(value: WorkflowType) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Start,
    Task,
    Decision,
    End,
}

/// Side effects a stage declares. The engine only reports them; delivery
/// belongs to a [`crate::collaborators::StageActionExecutor`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageAction {
    Notify { recipients: Vec<String>, template: String },
    Webhook { url: String },
    Email { to: Vec<String>, subject: String },
    Assign { role: Option<String>, user: Option<String> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub name: String,
    pub kind: StageKind,
    #[serde(default)]
    pub assigned_role: Option<String>,
    #[serde(default)]
    pub assigned_user: Option<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub next_stages: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub actions: Vec<StageAction>,
}

impl Stage {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            assigned_role: None,
            assigned_user: None,
            required_fields: Vec::new(),
            next_stages: Vec::new(),
            timeout_secs: None,
            actions: Vec::new(),
        }
    }

    pub fn then<I, S>(mut self, next: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next_stages.extend(next.into_iter().map(Into::into));
        self
    }

    pub fn requires<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn with_action(mut self, action: StageAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn assigned_to_role(mut self, role: impl Into<String>) -> Self {
        self.assigned_role = Some(role.into());
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowRules {
    /// Permit jumping to any stage reachable from the current one, not just
    /// its direct successors.
    pub allow_skip_stages: bool,
    /// Permit returning to a stage already present in the history.
    pub allow_backward: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Active,
    Inactive,
}

impl DefinitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowDefinitionId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub workflow_type: WorkflowType,
    pub stages: Vec<Stage>,
    pub rules: WorkflowRules,
    pub status: DefinitionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.id == stage_id)
    }

    pub fn start_stage(&self) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.kind == StageKind::Start)
    }

    /// Zero-based index of the stage in declaration order.
    pub fn stage_position(&self, stage_id: &str) -> Option<usize> {
        self.stages.iter().position(|stage| stage.id == stage_id)
    }

    pub fn is_end_stage(&self, stage_id: &str) -> bool {
        self.stage(stage_id).is_some_and(|stage| stage.kind == StageKind::End)
    }

    pub fn is_active(&self) -> bool {
        self.status == DefinitionStatus::Active
    }
}

/// Input for creating a definition; ids, ownership and timestamps are assigned
/// by the service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub workflow_type: WorkflowType,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub rules: WorkflowRules,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub workflow_type: Option<WorkflowType>,
    pub stages: Option<Vec<Stage>>,
    pub rules: Option<WorkflowRules>,
}

impl DefinitionPatch {
    pub fn apply_to(self, definition: &mut WorkflowDefinition, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            definition.name = name;
        }
        if let Some(description) = self.description {
            definition.description = Some(description);
        }
        if let Some(workflow_type) = self.workflow_type {
            definition.workflow_type = workflow_type;
        }
        if let Some(stages) = self.stages {
            definition.stages = stages;
        }
        if let Some(rules) = self.rules {
            definition.rules = rules;
        }
        definition.updated_at = now;
    }

    pub fn renames(&self, definition: &WorkflowDefinition) -> bool {
        self.name.as_ref().is_some_and(|name| name != &definition.name)
    }
}
