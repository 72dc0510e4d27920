//! Derives the Search status from the outcomes of one reconciliation pass.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::apply::ApplyOutcome;
use crate::builders::Component;
use crate::crds::search::{Condition, ConditionStatus, ConditionType, SearchStatus};
use crate::error::ErrorKind;
use crate::normalize::{DatabaseSource, NormalizedSpec};
use crate::resources::ManagedResource;

pub const HEALTHY: &str = "healthy";
pub const DEGRADED: &str = "degraded";
pub const DUPLICATE_SEARCH: &str = "DuplicateSearch";

/// RFC 3339 with whole seconds, as the API server renders times.
pub fn timestamp(now: OffsetDateTime) -> String {
    let now = now.replace_nanosecond(0).unwrap_or(now);
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// Condition list seeded from the previous status so transition times are
/// carried over for conditions whose status did not change.
pub struct ConditionSet {
    conditions: Vec<Condition>,
    now: String,
}

impl ConditionSet {
    pub fn new(previous: Option<&SearchStatus>, now: OffsetDateTime) -> Self {
        Self {
            conditions: previous.map(|s| s.conditions.clone()).unwrap_or_default(),
            now: timestamp(now),
        }
    }

    /// Add or replace the condition of `type_`.
    pub fn set(
        &mut self,
        type_: ConditionType,
        status: impl Into<ConditionStatus>,
        reason: &str,
        message: impl Into<String>,
    ) -> &mut Self {
        let status = status.into();
        let message = message.into();
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = self.now.clone();
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message;
            }
            None => self.conditions.push(Condition {
                type_,
                status,
                last_transition_time: self.now.clone(),
                reason: reason.to_string(),
                message,
            }),
        }
        self
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

fn label(component: Option<Component>) -> String {
    component.map_or_else(|| "shared".to_string(), |c| c.to_string())
}

fn db_in_use(spec: &NormalizedSpec) -> String {
    spec.db_secret_name().to_string()
}

/// Class and size of the database volume. The claim template of the stored
/// StatefulSet wins over the requested size, since resizes are refused.
fn storage_in_use(spec: &NormalizedSpec, outcomes: &[ApplyOutcome]) -> String {
    let DatabaseSource::BuiltIn {
        storage_class,
        size,
        ..
    } = &spec.db
    else {
        return "none".to_string();
    };
    let claim = outcomes
        .iter()
        .filter(|o| o.component == Some(Component::Database))
        .find_map(|o| match &o.observed {
            Some(ManagedResource::StatefulSet(sts)) => sts
                .spec
                .as_ref()?
                .volume_claim_templates
                .as_ref()?
                .first()?
                .spec
                .clone(),
            _ => None,
        });
    match claim {
        Some(claim) => {
            let stored = claim
                .resources
                .and_then(|r| r.requests)
                .and_then(|r| r.get("storage").cloned())
                .unwrap_or_else(|| size.clone());
            format!(
                "{}:{}",
                claim.storage_class_name.as_deref().unwrap_or("default"),
                stored.0
            )
        }
        None => format!(
            "{}:{}",
            storage_class.as_deref().unwrap_or("default"),
            size.0
        ),
    }
}

/// Status after a full pass over every enabled component.
pub fn aggregate(
    previous: Option<&SearchStatus>,
    outcomes: &[ApplyOutcome],
    spec: &NormalizedSpec,
    generation: Option<i64>,
    now: OffsetDateTime,
) -> SearchStatus {
    let failures: Vec<&ApplyOutcome> = outcomes.iter().filter(|o| o.result.is_err()).collect();

    let mut not_ready = Vec::new();
    for o in outcomes {
        if let Some(r) = o.readiness().filter(|r| !r.is_ready()) {
            not_ready.push(format!("{} {}/{}", label(o.component), r.available, r.desired));
        }
    }
    let ready = failures.is_empty() && not_ready.is_empty();
    let changed = outcomes.iter().any(ApplyOutcome::is_write);

    let mut conditions = ConditionSet::new(previous, now);
    if ready {
        conditions.set(
            ConditionType::Available,
            true,
            "AllComponentsReady",
            "all search components are available",
        );
    } else if !failures.is_empty() {
        conditions.set(
            ConditionType::Available,
            false,
            "ReconcileFailed",
            "one or more components could not be reconciled",
        );
    } else {
        conditions.set(
            ConditionType::Available,
            false,
            "ComponentsNotReady",
            format!("waiting for {}", not_ready.join(", ")),
        );
    }

    if changed {
        conditions.set(
            ConditionType::Progressing,
            true,
            "ResourcesUpdated",
            "child resources were created or updated",
        );
    } else if !not_ready.is_empty() {
        conditions.set(
            ConditionType::Progressing,
            true,
            "RollingOut",
            format!("waiting for {}", not_ready.join(", ")),
        );
    } else {
        conditions.set(
            ConditionType::Progressing,
            false,
            "Stable",
            "no changes applied",
        );
    }

    match failures.first() {
        Some(first) => {
            let reason = first
                .error_kind()
                .unwrap_or(ErrorKind::Transient)
                .to_string();
            let message = failures
                .iter()
                .filter_map(|o| {
                    let err = o.result.as_ref().err()?;
                    Some(format!("{}: {err}", label(o.component)))
                })
                .collect::<Vec<_>>()
                .join("; ");
            conditions.set(ConditionType::Degraded, true, &reason, message);
        }
        None => {
            conditions.set(ConditionType::Degraded, false, "NoErrors", "");
        }
    }

    SearchStatus {
        search_health: Some(if ready { HEALTHY } else { DEGRADED }.to_string()),
        db_in_use: Some(db_in_use(spec)),
        storage_in_use: Some(storage_in_use(spec, outcomes)),
        observed_generation: generation,
        conditions: conditions.build(),
    }
}

/// Status of a pass that stopped before applying anything. Conditions report
/// `reason`; the database and storage last reported are kept.
pub fn blocked(
    previous: Option<&SearchStatus>,
    reason: &str,
    message: impl Into<String>,
    generation: Option<i64>,
    now: OffsetDateTime,
) -> SearchStatus {
    let message = message.into();
    let mut conditions = ConditionSet::new(previous, now);
    conditions
        .set(ConditionType::Available, false, reason, message.clone())
        .set(ConditionType::Progressing, false, reason, "")
        .set(ConditionType::Degraded, true, reason, message);
    SearchStatus {
        search_health: Some(DEGRADED.to_string()),
        db_in_use: previous.and_then(|s| s.db_in_use.clone()),
        storage_in_use: previous.and_then(|s| s.storage_in_use.clone()),
        observed_generation: generation,
        conditions: conditions.build(),
    }
}

/// Status of a Search that lost the per-namespace ownership tie-break.
pub fn duplicate(
    previous: Option<&SearchStatus>,
    owner: &str,
    generation: Option<i64>,
    now: OffsetDateTime,
) -> SearchStatus {
    let message = format!("Search {owner} already manages this namespace");
    SearchStatus {
        db_in_use: None,
        storage_in_use: None,
        ..blocked(previous, DUPLICATE_SEARCH, message, generation, now)
    }
}
