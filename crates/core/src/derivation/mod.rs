//! Status values computed on demand from an entity and its workflow
//! instances. Nothing here is stored or cached; every function is pure.

pub mod bulk;

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::entity::EntitySnapshot;
use crate::domain::instance::{EntityRef, InstanceStatus, WorkflowInstance};
use crate::domain::workflow::{WorkflowDefinition, WorkflowType};

pub use bulk::bulk_status;

/// An instance paired with the definition it runs, which derivation needs for
/// stage ordering and end-stage lookups.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackedWorkflow {
    pub instance: WorkflowInstance,
    pub definition: Arc<WorkflowDefinition>,
}

impl TrackedWorkflow {
    pub fn new(instance: WorkflowInstance, definition: Arc<WorkflowDefinition>) -> Self {
        Self { instance, definition }
    }

    pub fn workflow_type(&self) -> &WorkflowType {
        &self.definition.workflow_type
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl InstallationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Partial,
    Paid,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Pending,
    InServiceSetup,
    Installed,
    Active,
    Cancelled,
}

impl VehicleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InServiceSetup => "in_service_setup",
            Self::Installed => "installed",
            Self::Active => "active",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStatus {
    pub entity: EntityRef,
    pub installation: InstallationStatus,
    pub payment: PaymentStatus,
    pub vehicle: VehicleStatus,
    pub installation_progress: u8,
    pub payment_progress: u8,
}

/// Picks the instance of `workflow_type` that speaks for the entity: the most
/// recently started one that is not cancelled, else the most recent cancelled
/// one. Ties on start time fall back to instance id so the choice is stable.
pub fn select_workflow<'w>(
    entity: &EntityRef,
    workflows: &'w [TrackedWorkflow],
    workflow_type: &WorkflowType,
) -> Option<&'w TrackedWorkflow> {
    workflows
        .iter()
        .filter(|tracked| &tracked.instance.entity == entity)
        .filter(|tracked| tracked.workflow_type() == workflow_type)
        .max_by(|left, right| {
            let rank = |tracked: &TrackedWorkflow| {
                (
                    tracked.instance.status != InstanceStatus::Cancelled,
                    tracked.instance.started_at,
                    tracked.instance.id.0.clone(),
                )
            };
            rank(left).cmp(&rank(right))
        })
}

pub fn installation_status(
    entity: &EntitySnapshot,
    workflows: &[TrackedWorkflow],
) -> InstallationStatus {
    let Some(tracked) = select_workflow(&entity.entity, workflows, &WorkflowType::Installation)
    else {
        return InstallationStatus::Pending;
    };

    match tracked.instance.status {
        InstanceStatus::Completed => InstallationStatus::Completed,
        InstanceStatus::Cancelled => InstallationStatus::Cancelled,
        InstanceStatus::InProgress if tracked.instance.has_progressed() => {
            InstallationStatus::InProgress
        }
        InstanceStatus::InProgress => InstallationStatus::Pending,
    }
}

/// `paid` when the payment workflow completed or the full positive total has
/// been received (no tolerance, over-payment counts); `partial` when something
/// but not everything was received; `cancelled` when the payment workflow was
/// cancelled before any money arrived; otherwise `pending`.
pub fn payment_status(entity: &EntitySnapshot, workflows: &[TrackedWorkflow]) -> PaymentStatus {
    let workflow_status = select_workflow(&entity.entity, workflows, &WorkflowType::Payment)
        .map(|tracked| tracked.instance.status);

    if workflow_status == Some(InstanceStatus::Completed) {
        return PaymentStatus::Paid;
    }
    if entity.total_amount > Decimal::ZERO && entity.paid_amount >= entity.total_amount {
        return PaymentStatus::Paid;
    }
    if entity.paid_amount > Decimal::ZERO {
        return PaymentStatus::Partial;
    }
    if workflow_status == Some(InstanceStatus::Cancelled) {
        return PaymentStatus::Cancelled;
    }
    PaymentStatus::Pending
}

pub fn vehicle_status(installation: InstallationStatus, payment: PaymentStatus) -> VehicleStatus {
    match (installation, payment) {
        (InstallationStatus::Cancelled, _) => VehicleStatus::Cancelled,
        (InstallationStatus::Completed, PaymentStatus::Paid) => VehicleStatus::Active,
        (InstallationStatus::Completed, _) => VehicleStatus::Installed,
        (InstallationStatus::InProgress, _) => VehicleStatus::InServiceSetup,
        (InstallationStatus::Pending, _) => VehicleStatus::Pending,
    }
}

/// Percentage of the definition's stage ordering the instance has covered,
/// rounded half up. Exactly 100 only once the instance is completed; 0 when
/// there is no instance or its stage is unknown.
pub fn workflow_progress(tracked: Option<&TrackedWorkflow>) -> u8 {
    let Some(tracked) = tracked else {
        return 0;
    };
    if tracked.instance.status == InstanceStatus::Completed {
        return 100;
    }

    let total = tracked.definition.stages.len();
    let Some(position) = tracked.definition.stage_position(&tracked.instance.current_stage) else {
        return 0;
    };
    if total == 0 {
        return 0;
    }

    let percent = (position * 100 + total / 2) / total;
    percent.min(99) as u8
}

pub fn entity_status(entity: &EntitySnapshot, workflows: &[TrackedWorkflow]) -> EntityStatus {
    let installation = installation_status(entity, workflows);
    let payment = payment_status(entity, workflows);

    EntityStatus {
        entity: entity.entity.clone(),
        installation,
        payment,
        vehicle: vehicle_status(installation, payment),
        installation_progress: workflow_progress(select_workflow(
            &entity.entity,
            workflows,
            &WorkflowType::Installation,
        )),
        payment_progress: workflow_progress(select_workflow(
            &entity.entity,
            workflows,
            &WorkflowType::Payment,
        )),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use crate::domain::instance::{EntityRef, WorkflowInstanceId};
    use crate::domain::tenant::TenantId;
    use crate::domain::workflow::{
        DefinitionStatus, Stage, StageKind, WorkflowDefinition, WorkflowDefinitionId,
        WorkflowRules, WorkflowType,
    };
    use crate::flows::{AdvanceRequest, StartRequest, WorkflowEngine};

    use super::TrackedWorkflow;

    pub fn definition(workflow_type: WorkflowType, stage_ids: &[&str]) -> Arc<WorkflowDefinition> {
        let at = Utc.with_ymd_and_hms(2026, 1, 5, 8, 0, 0).single().expect("valid timestamp");
        let last = stage_ids.len() - 1;
        let stages = stage_ids
            .iter()
            .enumerate()
            .map(|(index, id)| {
                let kind = match index {
                    0 => StageKind::Start,
                    index if index == last => StageKind::End,
                    _ => StageKind::Task,
                };
                let stage = Stage::new(*id, *id, kind);
                match stage_ids.get(index + 1) {
                    Some(next) => stage.then([*next]),
                    None => stage,
                }
            })
            .collect();

        Arc::new(WorkflowDefinition {
            id: WorkflowDefinitionId(format!("wf-{}", workflow_type.as_str())),
            tenant_id: TenantId::from("demo"),
            name: workflow_type.as_str().to_string(),
            description: None,
            workflow_type,
            stages,
            rules: WorkflowRules::default(),
            status: DefinitionStatus::Active,
            created_at: at,
            updated_at: at,
        })
    }

    pub fn installation() -> Arc<WorkflowDefinition> {
        definition(
            WorkflowType::Installation,
            &["order_confirmed", "start_installation", "quality_checked", "delivered"],
        )
    }

    pub fn payment() -> Arc<WorkflowDefinition> {
        definition(WorkflowType::Payment, &["invoiced", "collecting", "settled"])
    }

    /// Starts an instance for `entity_id` and advances it `steps` times along
    /// the linear stage list.
    pub fn tracked(
        definition: &Arc<WorkflowDefinition>,
        entity_id: &str,
        steps: usize,
        started_offset_minutes: i64,
    ) -> TrackedWorkflow {
        let engine = WorkflowEngine::new();
        let at = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).single().expect("valid timestamp")
            + Duration::minutes(started_offset_minutes);
        let mut instance = engine
            .start(
                definition,
                WorkflowInstanceId(format!("{}-{entity_id}-{started_offset_minutes}", definition.id)),
                StartRequest::new(EntityRef::new("vehicle", entity_id), "tester"),
                at,
            )
            .expect("start fixture")
            .instance;
        for stage in definition.stages.iter().skip(1).take(steps) {
            instance = engine
                .advance(definition, &instance, AdvanceRequest::new(stage.id.clone(), "tester"), at)
                .expect("advance fixture")
                .instance;
        }
        TrackedWorkflow::new(instance, Arc::clone(definition))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use crate::domain::entity::EntitySnapshot;
    use crate::domain::instance::EntityRef;
    use crate::flows::WorkflowEngine;

    use super::fixtures::{installation, payment, tracked};
    use super::{
        entity_status, installation_status, payment_status, vehicle_status, workflow_progress,
        InstallationStatus, PaymentStatus, VehicleStatus,
    };

    fn vehicle(total: i64, paid: i64) -> EntitySnapshot {
        EntitySnapshot::new(
            EntityRef::new("vehicle", "V1"),
            Decimal::new(total, 2),
            Decimal::new(paid, 2),
        )
    }

    #[test]
    fn installation_is_pending_until_progress_is_recorded() {
        let definition = installation();
        let entity = vehicle(0, 0);

        assert_eq!(installation_status(&entity, &[]), InstallationStatus::Pending);
        assert_eq!(
            installation_status(&entity, &[tracked(&definition, "V1", 0, 0)]),
            InstallationStatus::Pending
        );
        assert_eq!(
            installation_status(&entity, &[tracked(&definition, "V1", 1, 0)]),
            InstallationStatus::InProgress
        );
        assert_eq!(
            installation_status(&entity, &[tracked(&definition, "V1", 3, 0)]),
            InstallationStatus::Completed
        );
    }

    #[test]
    fn installation_ignores_other_entities_and_payment_workflows() {
        let entity = vehicle(10_000, 10_000);
        let workflows = [tracked(&installation(), "V2", 3, 0), tracked(&payment(), "V1", 2, 0)];

        assert_eq!(installation_status(&entity, &workflows), InstallationStatus::Pending);
        assert_eq!(payment_status(&entity, &workflows), PaymentStatus::Paid);
    }

    #[test]
    fn newest_live_installation_wins_over_cancelled_attempts() {
        let definition = installation();
        let entity = vehicle(0, 0);
        let old = tracked(&definition, "V1", 1, 0);
        let cancelled = WorkflowEngine::new()
            .cancel(&tracked(&definition, "V1", 2, 30).instance, "ops", None, Utc::now())
            .expect("cancel")
            .instance;
        let cancelled = super::TrackedWorkflow::new(cancelled, definition.clone());

        assert_eq!(
            installation_status(&entity, &[cancelled.clone(), old]),
            InstallationStatus::InProgress
        );
        assert_eq!(installation_status(&entity, &[cancelled]), InstallationStatus::Cancelled);
    }

    #[test]
    fn payment_without_workflow_defaults_to_pending() {
        assert_eq!(payment_status(&vehicle(50_000, 0), &[]), PaymentStatus::Pending);
        assert_eq!(payment_status(&vehicle(0, 0), &[]), PaymentStatus::Pending);
    }

    #[test]
    fn partial_payment_boundaries() {
        // paid strictly between zero and the total
        assert_eq!(payment_status(&vehicle(50_000, 1), &[]), PaymentStatus::Partial);
        assert_eq!(payment_status(&vehicle(50_000, 49_999), &[]), PaymentStatus::Partial);
        // exact total and over-payment are both paid, with no tolerance
        assert_eq!(payment_status(&vehicle(50_000, 50_000), &[]), PaymentStatus::Paid);
        assert_eq!(payment_status(&vehicle(50_000, 50_001), &[]), PaymentStatus::Paid);
        // money received against a zero total is still only partial
        assert_eq!(payment_status(&vehicle(0, 100), &[]), PaymentStatus::Partial);
    }

    #[test]
    fn completed_payment_workflow_means_paid_regardless_of_amounts() {
        let workflows = [tracked(&payment(), "V1", 2, 0)];
        assert_eq!(payment_status(&vehicle(50_000, 0), &workflows), PaymentStatus::Paid);
    }

    #[test]
    fn cancelled_payment_workflow_without_money_is_cancelled() {
        let definition = payment();
        let cancelled = WorkflowEngine::new()
            .cancel(&tracked(&definition, "V1", 1, 0).instance, "ops", None, Utc::now())
            .expect("cancel")
            .instance;
        let workflows = [super::TrackedWorkflow::new(cancelled, definition)];

        assert_eq!(payment_status(&vehicle(50_000, 0), &workflows), PaymentStatus::Cancelled);
        assert_eq!(payment_status(&vehicle(50_000, 10), &workflows), PaymentStatus::Partial);
    }

    #[test]
    fn vehicle_status_combines_installation_and_payment() {
        use InstallationStatus as I;
        use PaymentStatus as P;

        assert_eq!(vehicle_status(I::Completed, P::Paid), VehicleStatus::Active);
        assert_eq!(vehicle_status(I::Completed, P::Partial), VehicleStatus::Installed);
        assert_eq!(vehicle_status(I::InProgress, P::Paid), VehicleStatus::InServiceSetup);
        assert_eq!(vehicle_status(I::Pending, P::Pending), VehicleStatus::Pending);
        assert_eq!(vehicle_status(I::Cancelled, P::Paid), VehicleStatus::Cancelled);
    }

    #[test]
    fn progress_tracks_stage_position_and_completion() {
        let definition = installation();

        assert_eq!(workflow_progress(None), 0);
        assert_eq!(workflow_progress(Some(&tracked(&definition, "V1", 0, 0))), 0);
        assert_eq!(workflow_progress(Some(&tracked(&definition, "V1", 1, 0))), 25);
        assert_eq!(workflow_progress(Some(&tracked(&definition, "V1", 2, 0))), 50);
        assert_eq!(workflow_progress(Some(&tracked(&definition, "V1", 3, 0))), 100);
    }

    #[test]
    fn progress_rounds_to_nearest_percent() {
        let definition = payment();
        // one of three stages covered: 33.3 -> 33
        assert_eq!(workflow_progress(Some(&tracked(&definition, "V1", 1, 0))), 33);

        let six = super::fixtures::definition(
            crate::domain::workflow::WorkflowType::Custom("audit".to_string()),
            &["a", "b", "c", "d", "e", "f"],
        );
        // 4/6 = 66.7 -> 67
        assert_eq!(workflow_progress(Some(&tracked(&six, "V1", 4, 0))), 67);
    }

    #[test]
    fn derivation_is_deterministic() {
        let workflows = [tracked(&installation(), "V1", 3, 0), tracked(&payment(), "V1", 1, 0)];
        let entity = vehicle(50_000, 20_000);

        let first = entity_status(&entity, &workflows);
        let second = entity_status(&entity, &workflows);

        assert_eq!(first, second);
        assert_eq!(first.installation, InstallationStatus::Completed);
        assert_eq!(first.payment, PaymentStatus::Partial);
        assert_eq!(first.vehicle, VehicleStatus::Installed);
        assert_eq!(first.installation_progress, 100);
        assert_eq!(first.payment_progress, 33);
    }
}
