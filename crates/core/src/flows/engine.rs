use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::instance::{
    InstanceStatus, StageHistoryEntry, WorkflowInstance, WorkflowInstanceId,
};
use crate::domain::payload::{Payload, PayloadValue};
use crate::domain::workflow::{Stage, WorkflowDefinition, WorkflowDefinitionId};
use crate::flows::states::{AdvanceRequest, StartRequest, TransitionOutcome, TransitionRejection};
use crate::flows::validation::{validate_stages, StructureViolation};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("invalid workflow structure: {}", describe_violations(.violations))]
    InvalidStructure { violations: Vec<StructureViolation> },
    #[error("no active workflow definition `{definition_id}`")]
    WorkflowNotFound { definition_id: WorkflowDefinitionId },
    #[error("workflow definition `{definition_id}` has no start stage")]
    NoStartStage { definition_id: WorkflowDefinitionId },
    #[error("instance `{instance_id}` is {} and accepts no further transitions", .status.as_str())]
    InstanceTerminal { instance_id: WorkflowInstanceId, status: InstanceStatus },
    #[error("invalid transition from `{from}` to `{to}`: {}", .reason.as_str())]
    InvalidTransition { from: String, to: String, reason: TransitionRejection },
    #[error("stage `{stage_id}` is missing required fields: {missing_fields:?}")]
    MissingRequiredFields { stage_id: String, missing_fields: Vec<String> },
    #[error("instance `{instance_id}` belongs to definition `{actual}`, not `{expected}`")]
    DefinitionMismatch {
        instance_id: WorkflowInstanceId,
        expected: WorkflowDefinitionId,
        actual: WorkflowDefinitionId,
    },
}

fn describe_violations(violations: &[StructureViolation]) -> String {
    violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Rejects a stage list that breaks any structural invariant.
pub fn ensure_valid_structure(stages: &[Stage]) -> Result<(), WorkflowError> {
    validate_stages(stages).map_err(|violations| WorkflowError::InvalidStructure { violations })
}

/// Pure state machine over workflow definitions and instances. It never
/// persists anything; callers store the returned instance.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkflowEngine;

impl WorkflowEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn start(
        &self,
        definition: &WorkflowDefinition,
        instance_id: WorkflowInstanceId,
        request: StartRequest,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        if !definition.is_active() {
            return Err(WorkflowError::WorkflowNotFound { definition_id: definition.id.clone() });
        }

        let start = definition
            .start_stage()
            .ok_or_else(|| WorkflowError::NoStartStage { definition_id: definition.id.clone() })?;
        ensure_required_fields(start, &request.initial_data)?;

        let entry = StageHistoryEntry {
            stage_id: start.id.clone(),
            actor: request.actor,
            occurred_at: now,
            notes: request.notes,
            metadata: request.initial_data.clone(),
        };

        let mut data = Payload::new();
        merge_stage_data(&mut data, &start.id, request.initial_data);

        let instance = WorkflowInstance {
            id: instance_id,
            tenant_id: definition.tenant_id.clone(),
            definition_id: definition.id.clone(),
            entity: request.entity,
            current_stage: start.id.clone(),
            status: InstanceStatus::InProgress,
            history: vec![entry.clone()],
            assignee: request.assignee,
            data,
            version: 1,
            started_at: now,
            updated_at: now,
            completed_at: None,
        };

        Ok(TransitionOutcome {
            from: None,
            to: start.id.clone(),
            instance,
            entry,
            actions: start.actions.clone(),
        })
    }

    pub fn advance(
        &self,
        definition: &WorkflowDefinition,
        instance: &WorkflowInstance,
        request: AdvanceRequest,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        if instance.definition_id != definition.id {
            return Err(WorkflowError::DefinitionMismatch {
                instance_id: instance.id.clone(),
                expected: definition.id.clone(),
                actual: instance.definition_id.clone(),
            });
        }
        if instance.status.is_terminal() {
            return Err(WorkflowError::InstanceTerminal {
                instance_id: instance.id.clone(),
                status: instance.status,
            });
        }

        let target = self.check_transition(definition, instance, &request.target_stage)?;
        ensure_required_fields(target, &request.stage_data)?;

        let entry = StageHistoryEntry {
            stage_id: target.id.clone(),
            actor: request.actor,
            occurred_at: now,
            notes: request.notes,
            metadata: request.stage_data.clone(),
        };

        let mut next = instance.clone();
        next.history.push(entry.clone());
        next.current_stage = target.id.clone();
        next.version += 1;
        next.updated_at = now;
        merge_stage_data(&mut next.data, &target.id, request.stage_data);
        if definition.is_end_stage(&target.id) {
            next.status = InstanceStatus::Completed;
            next.completed_at = Some(now);
        }

        Ok(TransitionOutcome {
            from: Some(instance.current_stage.clone()),
            to: target.id.clone(),
            instance: next,
            entry,
            actions: target.actions.clone(),
        })
    }

    /// Closes the instance. The appended entry repeats the current stage so the
    /// history still ends on `current_stage`.
    pub fn cancel(
        &self,
        instance: &WorkflowInstance,
        actor: impl Into<String>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, WorkflowError> {
        if instance.status.is_terminal() {
            return Err(WorkflowError::InstanceTerminal {
                instance_id: instance.id.clone(),
                status: instance.status,
            });
        }

        let mut metadata = Payload::new();
        metadata.insert("event".to_string(), PayloadValue::from("cancelled"));
        let entry = StageHistoryEntry {
            stage_id: instance.current_stage.clone(),
            actor: actor.into(),
            occurred_at: now,
            notes: reason,
            metadata,
        };

        let mut next = instance.clone();
        next.history.push(entry.clone());
        next.status = InstanceStatus::Cancelled;
        next.version += 1;
        next.updated_at = now;

        Ok(TransitionOutcome {
            from: Some(instance.current_stage.clone()),
            to: instance.current_stage.clone(),
            instance: next,
            entry,
            actions: Vec::new(),
        })
    }

    /// Resolves `target` against the definition and the instance's position,
    /// honouring the definition's skip and backward rules.
    pub fn check_transition<'d>(
        &self,
        definition: &'d WorkflowDefinition,
        instance: &WorkflowInstance,
        target: &str,
    ) -> Result<&'d Stage, WorkflowError> {
        let reject = |reason| WorkflowError::InvalidTransition {
            from: instance.current_stage.clone(),
            to: target.to_string(),
            reason,
        };

        let target_stage =
            definition.stage(target).ok_or_else(|| reject(TransitionRejection::UnknownStage))?;
        let current = definition
            .stage(&instance.current_stage)
            .ok_or_else(|| reject(TransitionRejection::Unreachable))?;

        if current.next_stages.iter().any(|next| next == target) {
            return Ok(target_stage);
        }
        if definition.rules.allow_backward && instance.has_visited(target) {
            return Ok(target_stage);
        }
        if definition.rules.allow_skip_stages {
            if reachable_from(definition, &current.id).contains(target) {
                return Ok(target_stage);
            }
            return Err(reject(TransitionRejection::Unreachable));
        }

        Err(reject(TransitionRejection::NotADirectSuccessor))
    }
}

/// Every stage reachable from `origin` by following `next_stages` edges.
/// `origin` itself is only included when a cycle leads back to it.
pub fn reachable_from<'d>(definition: &'d WorkflowDefinition, origin: &str) -> BTreeSet<&'d str> {
    let mut reached = BTreeSet::new();
    let mut queue = VecDeque::new();
    if let Some(stage) = definition.stage(origin) {
        queue.extend(stage.next_stages.iter().map(String::as_str));
    }

    while let Some(stage_id) = queue.pop_front() {
        let Some(stage) = definition.stage(stage_id) else {
            continue;
        };
        if reached.insert(stage.id.as_str()) {
            queue.extend(stage.next_stages.iter().map(String::as_str));
        }
    }

    reached
}

fn ensure_required_fields(stage: &Stage, supplied: &Payload) -> Result<(), WorkflowError> {
    let missing_fields: Vec<String> = stage
        .required_fields
        .iter()
        .filter(|field| !supplied.get(field.as_str()).is_some_and(PayloadValue::is_present))
        .cloned()
        .collect();

    if missing_fields.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::MissingRequiredFields { stage_id: stage.id.clone(), missing_fields })
    }
}

fn merge_stage_data(data: &mut Payload, stage_id: &str, stage_data: Payload) {
    if stage_data.is_empty() {
        return;
    }
    match data.get_mut(stage_id) {
        Some(PayloadValue::Map(existing)) => existing.extend(stage_data),
        _ => {
            data.insert(stage_id.to_string(), PayloadValue::Map(stage_data));
        }
    }
}
