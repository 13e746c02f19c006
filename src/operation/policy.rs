//! Autonomy policy: may an operation run without asking?

use super::{ChatMode, OperationRiskKind};

/// Decide whether `risk` auto-executes under `mode`.
///
/// `local` is always authorized. Otherwise the risk rank must not exceed the
/// mode's ceiling, and mode `none` has no ceiling at all.
pub fn authorize(mode: ChatMode, risk: OperationRiskKind) -> bool {
    if risk == OperationRiskKind::Local {
        return true;
    }
    mode.ceiling().is_some_and(|ceiling| risk.rank() <= ceiling)
}
