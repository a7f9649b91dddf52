//! Subject code → LMS assignment resolution.
//!
//! Lookup order: process cache, `subject_mappings`, the static `SUBJECT_ASSIGNMENT_MAPPING`
//! table, then discovery through the LMS with the service credential. Discovered mappings are
//! persisted so the next process finds them in the database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use sqlx::PgPool;
use thiserror::Error;

use crate::core::config::Settings;
use crate::core::security::SecretToken;
use crate::core::time::primitive_now_utc;
use crate::db::models::SubjectMapping;
use crate::repositories::subject_mappings::{self, UpsertMapping};
use crate::services::lms::{CallContext, DiscoveredAssignment, ExternalFailure, LmsGateway};

pub(crate) const SOURCE_DISCOVERY: &str = "lms_discovery";
pub(crate) const SOURCE_MANUAL: &str = "manual";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MappingSource {
    Database,
    Config,
    Discovery,
}

impl MappingSource {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Config => "config",
            Self::Discovery => "discovery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResolvedMapping {
    pub(crate) assignment_id: i64,
    pub(crate) source: MappingSource,
}

#[derive(Debug, Error)]
pub(crate) enum MappingError {
    #[error("no LMS assignment is mapped to subject {0}")]
    Unmapped(String),
    #[error("assignment discovery failed: {0}")]
    Discovery(#[from] ExternalFailure),
    #[error("mapping store error: {0}")]
    Database(#[from] sqlx::Error),
}

impl MappingError {
    /// The classification a submission attempt records for this lookup failure.
    pub(crate) fn as_external(&self) -> ExternalFailure {
        match self {
            Self::Unmapped(_) => ExternalFailure::permanent("unmapped_subject"),
            Self::Discovery(failure) => failure.clone(),
            Self::Database(_) => ExternalFailure::transient("mapping_store_unavailable"),
        }
    }
}

const CACHE_CAPACITY: u64 = 10_000;

fn mapping_cache(ttl: Duration) -> Cache<String, ResolvedMapping> {
    Cache::builder().max_capacity(CACHE_CAPACITY).time_to_live(ttl).build()
}

pub(crate) struct AssignmentMapper {
    pool: PgPool,
    lms: Arc<dyn LmsGateway>,
    service_token: Option<SecretToken>,
    fallback: HashMap<String, i64>,
    cache: Cache<String, ResolvedMapping>,
}

impl AssignmentMapper {
    pub(crate) fn from_settings(settings: &Settings, pool: PgPool, lms: Arc<dyn LmsGateway>) -> Self {
        let service_token = Some(SecretToken::new(settings.lms().service_token.clone()))
            .filter(|token| !token.is_empty());

        Self {
            pool,
            lms,
            service_token,
            fallback: settings.mapping().fallback.clone(),
            cache: mapping_cache(Duration::from_secs(settings.mapping().cache_ttl_seconds)),
        }
    }

    pub(crate) async fn lookup(&self, subject_code: &str) -> Result<ResolvedMapping, MappingError> {
        let code = normalize(subject_code);

        if let Some(hit) = self.cache.get(&code).await {
            return Ok(hit);
        }

        let resolved = self.resolve_uncached(&code).await?;
        self.cache.insert(code.clone(), resolved).await;
        tracing::debug!(
            subject_code = %code,
            assignment_id = resolved.assignment_id,
            source = resolved.source.as_str(),
            "Resolved subject mapping"
        );
        Ok(resolved)
    }

    async fn resolve_uncached(&self, code: &str) -> Result<ResolvedMapping, MappingError> {
        if let Some(row) = subject_mappings::find_active(&self.pool, code).await? {
            return Ok(ResolvedMapping {
                assignment_id: row.lms_assignment_id,
                source: MappingSource::Database,
            });
        }

        if let Some(assignment_id) = self.fallback.get(code) {
            return Ok(ResolvedMapping { assignment_id: *assignment_id, source: MappingSource::Config });
        }

        let Some(token) = self.service_token.clone() else {
            return Err(MappingError::Unmapped(code.to_string()));
        };

        let assignments = self.lms.list_assignments(&CallContext::service(token)).await?;
        let Some(found) = match_assignment(code, &assignments) else {
            tracing::warn!(subject_code = %code, "No LMS assignment matches subject code");
            return Err(MappingError::Unmapped(code.to_string()));
        };

        subject_mappings::upsert(
            &self.pool,
            UpsertMapping {
                subject_code: code,
                lms_course_id: Some(found.course_id),
                lms_assignment_id: found.assignment_id,
                assignment_name: Some(&found.name),
                source: SOURCE_DISCOVERY,
                is_active: true,
                now: primitive_now_utc(),
            },
        )
        .await?;

        tracing::info!(
            subject_code = %code,
            course_id = found.course_id,
            assignment_id = found.assignment_id,
            "Discovered subject mapping from the LMS"
        );
        Ok(ResolvedMapping { assignment_id: found.assignment_id, source: MappingSource::Discovery })
    }

    pub(crate) async fn invalidate(&self, subject_code: &str) -> bool {
        self.cache.remove(&normalize(subject_code)).await.is_some()
    }

    pub(crate) async fn list(&self) -> Result<Vec<SubjectMapping>, MappingError> {
        Ok(subject_mappings::list(&self.pool).await?)
    }

    /// Writes a staff-maintained mapping and drops any cached resolution for it.
    pub(crate) async fn upsert(
        &self,
        subject_code: &str,
        lms_course_id: Option<i64>,
        lms_assignment_id: i64,
        assignment_name: Option<&str>,
        is_active: bool,
    ) -> Result<SubjectMapping, MappingError> {
        let code = normalize(subject_code);
        let mapping = subject_mappings::upsert(
            &self.pool,
            UpsertMapping {
                subject_code: &code,
                lms_course_id,
                lms_assignment_id,
                assignment_name,
                source: SOURCE_MANUAL,
                is_active,
                now: primitive_now_utc(),
            },
        )
        .await?;

        self.invalidate(&code).await;
        tracing::info!(subject_code = %code, lms_assignment_id, is_active, "Subject mapping saved");
        Ok(mapping)
    }
}

fn normalize(subject_code: &str) -> String {
    subject_code.trim().to_ascii_uppercase()
}

/// First assignment in a course whose shortname contains the code, or whose own name does.
fn match_assignment<'a>(
    code: &str,
    assignments: &'a [DiscoveredAssignment],
) -> Option<&'a DiscoveredAssignment> {
    assignments.iter().find(|assignment| {
        assignment.course_shortname.to_ascii_uppercase().contains(code)
            || assignment.name.to_ascii_uppercase().contains(code)
    })
}
