use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::workflow::{Stage, StageKind};

/// One concrete reason a stage graph cannot be used as a state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum StructureViolation {
    MissingStartStage,
    MultipleStartStages { stage_ids: Vec<String> },
    MissingEndStage,
    EmptyStageId { position: usize },
    DuplicateStageId { stage_id: String },
    DanglingNextStage { stage_id: String, target: String },
}

impl fmt::Display for StructureViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingStartStage => f.write_str("no stage of kind `start`"),
            Self::MultipleStartStages { stage_ids } => {
                write!(f, "more than one `start` stage: {}", stage_ids.join(", "))
            }
            Self::MissingEndStage => f.write_str("no stage of kind `end`"),
            Self::EmptyStageId { position } => write!(f, "stage #{position} has an empty id"),
            Self::DuplicateStageId { stage_id } => {
                write!(f, "stage id `{stage_id}` is declared more than once")
            }
            Self::DanglingNextStage { stage_id, target } => {
                write!(f, "stage `{stage_id}` lists unknown next stage `{target}`")
            }
        }
    }
}

/// Checks every structural invariant and reports all violations at once.
pub fn validate_stages(stages: &[Stage]) -> Result<(), Vec<StructureViolation>> {
    let mut violations = Vec::new();

    let start_ids: Vec<String> = stages
        .iter()
        .filter(|stage| stage.kind == StageKind::Start)
        .map(|stage| stage.id.clone())
        .collect();
    match start_ids.len() {
        0 => violations.push(StructureViolation::MissingStartStage),
        1 => {}
        _ => violations.push(StructureViolation::MultipleStartStages { stage_ids: start_ids }),
    }

    if !stages.iter().any(|stage| stage.kind == StageKind::End) {
        violations.push(StructureViolation::MissingEndStage);
    }

    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for (position, stage) in stages.iter().enumerate() {
        if stage.id.trim().is_empty() {
            violations.push(StructureViolation::EmptyStageId { position });
            continue;
        }
        if !seen.insert(stage.id.as_str()) && reported.insert(stage.id.as_str()) {
            violations.push(StructureViolation::DuplicateStageId { stage_id: stage.id.clone() });
        }
    }

    for stage in stages {
        for target in &stage.next_stages {
            if !seen.contains(target.as_str()) {
                violations.push(StructureViolation::DanglingNextStage {
                    stage_id: stage.id.clone(),
                    target: target.clone(),
                });
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}
