//! Database health signals consulted before running health-sensitive workers.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::jobs::HealthScope;

/// One indicator's verdict for a schema/table scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSignal {
    /// Indicator that produced the signal (e.g. `autovacuum_active_on_table`)
    pub indicator: String,
    /// Whether workers touching this scope should back off
    pub stop: bool,
    pub reason: Option<String>,
    pub schema: String,
    pub tables: Vec<String>,
}

impl HealthSignal {
    pub fn ok(indicator: impl Into<String>, scope: &HealthScope) -> Self {
        Self {
            indicator: indicator.into(),
            stop: false,
            reason: None,
            schema: scope.schema.clone(),
            tables: scope.tables.clone(),
        }
    }

    pub fn stop(indicator: impl Into<String>, reason: impl Into<String>, scope: &HealthScope) -> Self {
        Self {
            indicator: indicator.into(),
            stop: true,
            reason: Some(reason.into()),
            schema: scope.schema.clone(),
            tables: scope.tables.clone(),
        }
    }
}

/// Evaluates database health for a scope.
#[async_trait]
pub trait HealthEvaluator: Send + Sync {
    async fn evaluate(&self, scope: &HealthScope) -> Result<Vec<HealthSignal>>;
}

#[derive(Debug, Clone)]
struct Condition {
    indicator: String,
    reason: String,
    schema: Option<String>,
}

/// In-memory evaluator for testing and development.
///
/// Healthy until a stop condition is raised; conditions may be limited to a schema.
#[derive(Debug, Default)]
pub struct InMemoryHealthEvaluator {
    conditions: RwLock<Vec<Condition>>,
    evaluations: RwLock<Vec<HealthScope>>,
}

impl InMemoryHealthEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise a stop condition for every schema.
    pub fn raise(&self, indicator: impl Into<String>, reason: impl Into<String>) {
        self.conditions.write().push(Condition {
            indicator: indicator.into(),
            reason: reason.into(),
            schema: None,
        });
    }

    /// Raise a stop condition for one schema.
    pub fn raise_for_schema(
        &self,
        schema: impl Into<String>,
        indicator: impl Into<String>,
        reason: impl Into<String>,
    ) {
        self.conditions.write().push(Condition {
            indicator: indicator.into(),
            reason: reason.into(),
            schema: Some(schema.into()),
        });
    }

    pub fn clear(&self) {
        self.conditions.write().clear();
    }

    /// Scopes evaluated so far, oldest first.
    pub fn evaluations(&self) -> Vec<HealthScope> {
        self.evaluations.read().clone()
    }
}

#[async_trait]
impl HealthEvaluator for InMemoryHealthEvaluator {
    async fn evaluate(&self, scope: &HealthScope) -> Result<Vec<HealthSignal>> {
        self.evaluations.write().push(scope.clone());

        let conditions = self.conditions.read();
        if conditions.is_empty() {
            return Ok(vec![HealthSignal::ok("in_memory", scope)]);
        }

        Ok(conditions
            .iter()
            .map(|c| {
                let applies = c.schema.as_deref().map_or(true, |s| s == scope.schema);
                if applies {
                    HealthSignal::stop(c.indicator.clone(), c.reason.clone(), scope)
                } else {
                    HealthSignal::ok(c.indicator.clone(), scope)
                }
            })
            .collect())
    }
}
