use std::collections::HashMap;

use crate::derivation::{entity_status, EntityStatus, TrackedWorkflow};
use crate::domain::entity::EntitySnapshot;
use crate::domain::instance::EntityRef;

/// Derives status for many entities from one pre-fetched batch of workflow
/// instances. Results follow the order of `entities`; instances belonging to
/// entities not in the list are ignored.
pub fn bulk_status(entities: &[EntitySnapshot], workflows: Vec<TrackedWorkflow>) -> Vec<EntityStatus> {
    let mut grouped: HashMap<EntityRef, Vec<TrackedWorkflow>> = HashMap::new();
    for tracked in workflows {
        grouped.entry(tracked.instance.entity.clone()).or_default().push(tracked);
    }

    entities
        .iter()
        .map(|entity| {
            let group = grouped.get(&entity.entity).map(Vec::as_slice).unwrap_or(&[]);
            entity_status(entity, group)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use crate::derivation::fixtures::{installation, payment, tracked};
    use crate::derivation::{entity_status, TrackedWorkflow};
    use crate::domain::entity::EntitySnapshot;
    use crate::domain::instance::EntityRef;

    use super::bulk_status;

    #[test]
    fn empty_input_yields_empty_output() {
        assert!(bulk_status(&[], Vec::new()).is_empty());
        assert!(bulk_status(&[], vec![tracked(&installation(), "V1", 1, 0)]).is_empty());
    }

    #[test]
    fn bulk_matches_single_entity_derivation() {
        let installation = installation();
        let payment = payment();
        let entities: Vec<EntitySnapshot> = (1..=6)
            .map(|n| {
                EntitySnapshot::new(
                    EntityRef::new("vehicle", format!("V{n}")),
                    Decimal::new(10_000, 2),
                    Decimal::new(2_500 * (n - 1), 2),
                )
            })
            .collect();

        let mut workflows: Vec<TrackedWorkflow> = Vec::new();
        for n in 1..=6_usize {
            let id = format!("V{n}");
            workflows.push(tracked(&installation, &id, n % 4, 0));
            if n % 2 == 0 {
                workflows.push(tracked(&payment, &id, n % 3, 0));
            }
        }
        workflows.push(tracked(&installation, "V-unlisted", 2, 0));

        let bulk = bulk_status(&entities, workflows.clone());

        assert_eq!(bulk.len(), entities.len());
        for (entity, derived) in entities.iter().zip(&bulk) {
            assert_eq!(derived, &entity_status(entity, &workflows));
        }
    }
}
