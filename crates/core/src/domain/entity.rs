use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::instance::EntityRef;

/// The intrinsic fields of a business entity that status derivation reads.
/// Callers fetch these themselves; the core never queries entities.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity: EntityRef,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
}

impl EntitySnapshot {
    pub fn new(entity: EntityRef, total_amount: Decimal, paid_amount: Decimal) -> Self {
        Self { entity, total_amount, paid_amount }
    }

    pub fn unpriced(entity: EntityRef) -> Self {
        Self::new(entity, Decimal::ZERO, Decimal::ZERO)
    }
}
