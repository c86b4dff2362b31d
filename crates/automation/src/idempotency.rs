use serde::{Deserialize, Serialize};

use stockflow_core::{ExecutionId, RuleId};

/// Key under which a mutating step stores its result:
/// `{execution_id}_{rule_id|manual}_{action_type}`.
///
/// Stable across retries of the same step, distinct across rules and
/// executions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub const MANUAL: &'static str = "manual";

    pub fn new(execution_id: ExecutionId, rule_id: Option<RuleId>, action_type: &str) -> Self {
        let scope = rule_id.map_or_else(|| Self::MANUAL.to_string(), |r| r.to_string());
        Self(format!("{execution_id}_{scope}_{action_type}"))
    }

    /// Wrap a key read back from storage.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
