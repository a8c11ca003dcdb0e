use serde::{Deserialize, Serialize};

use crate::domain::instance::{EntityRef, StageHistoryEntry, WorkflowInstance};
use crate::domain::payload::Payload;
use crate::domain::workflow::StageAction;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub entity: EntityRef,
    pub actor: String,
    pub assignee: Option<String>,
    pub notes: Option<String>,
    pub initial_data: Payload,
}

impl StartRequest {
    pub fn new(entity: EntityRef, actor: impl Into<String>) -> Self {
        Self {
            entity,
            actor: actor.into(),
            assignee: None,
            notes: None,
            initial_data: Payload::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdvanceRequest {
    pub target_stage: String,
    pub actor: String,
    pub notes: Option<String>,
    pub stage_data: Payload,
}

impl AdvanceRequest {
    pub fn new(target_stage: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            target_stage: target_stage.into(),
            actor: actor.into(),
            notes: None,
            stage_data: Payload::new(),
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_data(mut self, stage_data: Payload) -> Self {
        self.stage_data = stage_data;
        self
    }
}

/// Why a requested stage transition was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionRejection {
    UnknownStage,
    NotADirectSuccessor,
    Unreachable,
}

impl TransitionRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownStage => "target stage does not exist in the definition",
            Self::NotADirectSuccessor => "target stage is not a next stage of the current stage",
            Self::Unreachable => "target stage is not reachable from the current stage",
        }
    }
}

/// The instance as it should be persisted after a transition, with the entry
/// that was appended and the actions the entered stage declares.
#[derive(Clone, Debug, PartialEq)]
pub struct TransitionOutcome {
    pub from: Option<String>,
    pub to: String,
    pub instance: WorkflowInstance,
    pub entry: StageHistoryEntry,
    pub actions: Vec<StageAction>,
}

impl TransitionOutcome {
    pub fn completed(&self) -> bool {
        self.instance.status == crate::domain::instance::InstanceStatus::Completed
    }
}
