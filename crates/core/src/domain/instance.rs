use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::payload::Payload;
use crate::domain::tenant::TenantId;
use crate::domain::workflow::WorkflowDefinitionId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowInstanceId(pub String);

impl fmt::Display for WorkflowInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self { entity_type: entity_type.into(), entity_id: entity_id.into() }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    InProgress,
    Completed,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    pub stage_id: String,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub metadata: Payload,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: WorkflowInstanceId,
    pub tenant_id: TenantId,
    pub definition_id: WorkflowDefinitionId,
    pub entity: EntityRef,
    pub current_stage: String,
    pub status: InstanceStatus,
    pub history: Vec<StageHistoryEntry>,
    pub assignee: Option<String>,
    /// Stage data keyed by stage id.
    pub data: Payload,
    /// Bumped on every appended history entry; used for optimistic writes.
    pub version: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn last_entry(&self) -> Option<&StageHistoryEntry> {
        self.history.last()
    }

    /// `current_stage` must mirror the newest history entry.
    pub fn is_consistent(&self) -> bool {
        self.last_entry().is_some_and(|entry| entry.stage_id == self.current_stage)
            && self.version as usize == self.history.len()
    }

    pub fn has_visited(&self, stage_id: &str) -> bool {
        self.history.iter().any(|entry| entry.stage_id == stage_id)
    }

    /// Whether any transition beyond the opening entry has been recorded.
    pub fn has_progressed(&self) -> bool {
        self.history.len() > 1
    }
}
