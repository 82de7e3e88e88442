//! Anti-rollback decision shared by every store backend.
//!
//! Backends own the indivisible read-compare-write; this module owns the
//! comparison so all of them agree on it.

use crate::core::error::RegistryError;

pub fn scope_key(tenant_id: &str, model_id: &str) -> String {
    format!("{}:{}", tenant_id, model_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bump {
    /// `incoming == current`: nothing to write.
    Unchanged(u64),
    /// `incoming > current`: persist the new maximum.
    Advance(u64),
}

impl Bump {
    pub fn committed(&self) -> u64 {
        match self {
            Bump::Unchanged(v) | Bump::Advance(v) => *v,
        }
    }
}

/// Compare `incoming` against the persisted maximum (`None` reads as 0).
pub fn decide(scope_key: &str, current: Option<u64>, incoming: u64) -> Result<Bump, RegistryError> {
    let current = current.unwrap_or(0);
    if incoming < current {
        tracing::warn!(scope_key, incoming, current, "anti-rollback violation");
        return Err(RegistryError::AntiRollbackViolation {
            scope_key: scope_key.to_string(),
            incoming,
            current,
        });
    }
    if incoming == current {
        return Ok(Bump::Unchanged(current));
    }
    Ok(Bump::Advance(incoming))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_is_rejected_equal_is_noop_higher_advances() {
        assert!(matches!(
            decide("t:m", Some(2), 1),
            Err(RegistryError::AntiRollbackViolation { incoming: 1, current: 2, .. })
        ));
        assert_eq!(decide("t:m", Some(2), 2).unwrap(), Bump::Unchanged(2));
        assert_eq!(decide("t:m", Some(2), 3).unwrap(), Bump::Advance(3));
    }

    #[test]
    fn absent_state_starts_at_zero() {
        assert_eq!(decide("t:m", None, 0).unwrap(), Bump::Unchanged(0));
        assert_eq!(decide("t:m", None, 1).unwrap().committed(), 1);
    }

    #[test]
    fn scope_key_joins_tenant_and_model() {
        assert_eq!(scope_key("tenant-a", "model-1"), "tenant-a:model-1");
    }
}
