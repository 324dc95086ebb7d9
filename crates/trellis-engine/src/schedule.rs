//! Declarative schedules and the scheduler service
//!
//! A schedule names a workflow input value, a cadence and a retry budget;
//! scheduling upserts the manifest row keyed by the user-supplied external
//! id, so declarations are idempotent at startup. Nested declarations
//! (`then_include`) produce dependent manifests that fire after each parent
//! success.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use trellis_core::bus::WorkflowBus;
use trellis_core::model::{Manifest, ManifestGroup, ScheduleType};
use trellis_storage::DataContext;

use crate::error::EngineError;

/// Name of the group manifests join when none is named
pub const DEFAULT_GROUP: &str = "default";

/// Parse a cron expression, accepting the classic five-field form by
/// seeding a zero seconds field.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, EngineError> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| EngineError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Next fire time strictly after the anchor.
pub fn next_fire_after(
    schedule: &cron::Schedule,
    anchor: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule.after(&anchor).next()
}

/// Cadence of a scheduled workflow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cadence {
    /// Persisted but never due via the manager
    None,
    Cron(String),
    Interval(Duration),
    OnDemand,
    /// Due after each new success of the parent manifest
    DependsOn(i64),
}

impl Cadence {
    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            Self::None => ScheduleType::None,
            Self::Cron(_) => ScheduleType::Cron,
            Self::Interval(_) => ScheduleType::Interval,
            Self::OnDemand => ScheduleType::OnDemand,
            Self::DependsOn(_) => ScheduleType::Dependent,
        }
    }
}

/// One schedule declaration for a workflow input type `I`
#[derive(Debug, Clone)]
pub struct ScheduleRequest<I> {
    pub external_id: String,
    pub input: I,
    pub cadence: Cadence,
    pub max_retries: i32,
    pub group: Option<String>,
    pub enabled: bool,
}

impl<I> ScheduleRequest<I> {
    pub fn new(external_id: impl Into<String>, input: I) -> Self {
        Self {
            external_id: external_id.into(),
            input,
            cadence: Cadence::OnDemand,
            max_retries: 3,
            group: None,
            enabled: true,
        }
    }

    pub fn cron(mut self, expression: impl Into<String>) -> Self {
        self.cadence = Cadence::Cron(expression.into());
        self
    }

    pub fn interval(mut self, period: Duration) -> Self {
        self.cadence = Cadence::Interval(period);
        self
    }

    pub fn on_demand(mut self) -> Self {
        self.cadence = Cadence::OnDemand;
        self
    }

    pub fn depends_on(mut self, parent_manifest_id: i64) -> Self {
        self.cadence = Cadence::DependsOn(parent_manifest_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Creates and maintains manifests from schedule declarations
#[derive(Clone)]
pub struct Scheduler {
    ctx: Arc<dyn DataContext>,
    bus: Arc<WorkflowBus>,
}

impl Scheduler {
    pub fn new(ctx: Arc<dyn DataContext>, bus: Arc<WorkflowBus>) -> Self {
        Self { ctx, bus }
    }

    /// Upsert a manifest from a declaration.
    pub async fn schedule<I: Serialize + 'static>(
        &self,
        request: ScheduleRequest<I>,
    ) -> Result<Manifest, EngineError> {
        let descriptor = self
            .bus
            .descriptor_for_input::<I>()
            .cloned()
            .ok_or_else(|| {
                EngineError::UnknownInput(trellis_core::memory::slot_name::<I>().to_string())
            })?;

        let (cron_expression, interval_seconds, depends_on_manifest_id) =
            self.validate_cadence(&request.cadence, &request.external_id).await?;

        let group = self
            .ctx
            .get_or_create_group(request.group.as_deref().unwrap_or(DEFAULT_GROUP))
            .await?;

        let properties = serde_json::to_value(&request.input)
            .map_err(|e| EngineError::Core(trellis_core::CoreError::Serialization(e)))?;

        let manifest = self
            .ctx
            .upsert_manifest(Manifest {
                id: 0,
                external_id: request.external_id,
                name: descriptor.workflow_name,
                full_name: descriptor.full_name,
                property_type: descriptor.input_type_name,
                properties,
                schedule_type: request.cadence.schedule_type(),
                cron_expression,
                interval_seconds,
                max_retries: request.max_retries,
                is_enabled: request.enabled,
                last_successful_run: None,
                depends_on_manifest_id,
                manifest_group_id: group.id,
                created_at: Utc::now(),
            })
            .await?;

        info!(
            external_id = %manifest.external_id,
            workflow = %manifest.name,
            schedule = %manifest.schedule_type,
            "scheduled manifest"
        );
        Ok(manifest)
    }

    /// Create many manifests at once; stops on the first invalid declaration.
    pub async fn schedule_many<I: Serialize + 'static>(
        &self,
        requests: Vec<ScheduleRequest<I>>,
    ) -> Result<Vec<Manifest>, EngineError> {
        let mut manifests = Vec::with_capacity(requests.len());
        for request in requests {
            manifests.push(self.schedule(request).await?);
        }
        Ok(manifests)
    }

    /// Declare a dependent manifest firing after each success of `parent`.
    pub async fn then_include<I: Serialize + 'static>(
        &self,
        parent: &Manifest,
        external_id: impl Into<String>,
        input: I,
    ) -> Result<Manifest, EngineError> {
        let request = ScheduleRequest::new(external_id, input).depends_on(parent.id);
        self.schedule(request).await
    }

    /// Configure a group's dispatch envelope (priority, concurrency cap).
    pub async fn configure_group(&self, group: ManifestGroup) -> Result<ManifestGroup, EngineError> {
        Ok(self.ctx.save_group(group).await?)
    }

    async fn validate_cadence(
        &self,
        cadence: &Cadence,
        external_id: &str,
    ) -> Result<(Option<String>, Option<i64>, Option<i64>), EngineError> {
        match cadence {
            Cadence::None | Cadence::OnDemand => Ok((None, None, None)),
            Cadence::Cron(expression) => {
                parse_cron(expression)?;
                Ok((Some(expression.clone()), None, None))
            }
            Cadence::Interval(period) => {
                if period.is_zero() {
                    return Err(EngineError::InvalidInterval);
                }
                Ok((None, Some(period.as_secs() as i64), None))
            }
            Cadence::DependsOn(parent_id) => {
                self.assert_acyclic(*parent_id, external_id).await?;
                Ok((None, None, Some(*parent_id)))
            }
        }
    }

    /// Walk the parent chain; finding the manifest being declared (or an
    /// over-deep chain) is a cycle.
    async fn assert_acyclic(&self, parent_id: i64, external_id: &str) -> Result<(), EngineError> {
        let mut cursor = Some(parent_id);
        let mut depth = 0;
        while let Some(id) = cursor {
            if depth > 64 {
                return Err(EngineError::DependencyCycle(external_id.to_string()));
            }
            let manifest = self.ctx.get_manifest(id).await?;
            if manifest.external_id == external_id {
                return Err(EngineError::DependencyCycle(external_id.to_string()));
            }
            cursor = manifest.depends_on_manifest_id;
            depth += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expressions_are_accepted() {
        let schedule = parse_cron("* * * * *").unwrap();
        let anchor = Utc::now();
        let next = next_fire_after(&schedule, anchor).unwrap();
        assert!(next > anchor);
        assert!(next - anchor <= chrono::Duration::seconds(61));
    }

    #[test]
    fn six_field_expressions_pass_through() {
        assert!(parse_cron("0 30 9 * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn cadence_maps_to_schedule_types() {
        assert_eq!(Cadence::None.schedule_type(), ScheduleType::None);
        assert_eq!(
            Cadence::Cron("* * * * *".into()).schedule_type(),
            ScheduleType::Cron
        );
        assert_eq!(
            Cadence::Interval(Duration::from_secs(60)).schedule_type(),
            ScheduleType::Interval
        );
        assert_eq!(Cadence::OnDemand.schedule_type(), ScheduleType::OnDemand);
        assert_eq!(Cadence::DependsOn(1).schedule_type(), ScheduleType::Dependent);
    }

    #[test]
    fn request_builder_defaults() {
        let request = ScheduleRequest::new("daily-x", 1u8);
        assert_eq!(request.max_retries, 3);
        assert!(request.enabled);
        assert!(request.group.is_none());
        assert_eq!(request.cadence, Cadence::OnDemand);
    }
}
