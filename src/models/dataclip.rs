use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RecordError;
use crate::models::QueryResult;

/// A stored SQL query plus its description, addressed externally by slug.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataclip {
    pub id: i64,
    pub token: String,
    pub slug: String,
    pub description: String,
    pub raw_query: String,
    pub created_at: String,
    pub updated_at: String,

    // Per-instance state, never persisted.
    #[serde(skip)]
    pub(crate) result: Option<Arc<QueryResult>>,
    #[serde(skip)]
    pub(crate) cached: Option<bool>,
    #[serde(skip)]
    pub(crate) errors: Vec<RecordError>,
}

impl Dataclip {
    pub(crate) fn from_parts(
        id: i64,
        token: String,
        slug: String,
        description: String,
        raw_query: String,
        created_at: String,
        updated_at: String,
    ) -> Self {
        Self {
            id,
            token,
            slug,
            description,
            raw_query,
            created_at,
            updated_at,
            result: None,
            cached: None,
            errors: Vec::new(),
        }
    }

    /// The external path component.
    pub fn to_param(&self) -> &str {
        &self.slug
    }

    /// First line of the description.
    pub fn title(&self) -> &str {
        self.description.split('\n').next().unwrap_or_default()
    }

    /// Everything after the first line of the description, without trailing
    /// blank lines.
    pub fn description_without_title(&self) -> &str {
        self.description
            .split_once('\n')
            .map(|(_, rest)| rest.trim_end_matches('\n'))
            .unwrap_or_default()
    }

    /// Key under which this dataclip's result is cached.
    ///
    /// Derived from identity and last write time only, so two dataclips with
    /// identical SQL never share an entry.
    pub fn cache_key(&self) -> String {
        format!("dataclips/{}-{}", self.slug, self.updated_at)
    }

    /// Memoized result, if the runner has produced one for this instance.
    pub fn result(&self) -> Option<&QueryResult> {
        self.result.as_deref()
    }

    pub fn total_rows(&self) -> Option<usize> {
        self.result().map(QueryResult::total_rows)
    }

    pub fn errors(&self) -> &[RecordError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn validate(&self) -> Vec<RecordError> {
        blank_fields(&self.description, &self.raw_query)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    /// Drop memoized state after a write so the next read recomputes.
    pub(crate) fn reset_memo(&mut self) {
        self.result = None;
        self.cached = None;
    }
}

/// Input for creating a dataclip.
///
/// `token` and `slug` may be supplied up front (fixtures, imports); otherwise
/// they are generated right before the insert.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDataclip {
    pub description: String,
    pub raw_query: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
}

impl NewDataclip {
    pub fn new(description: impl Into<String>, raw_query: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            raw_query: raw_query.into(),
            token: None,
            slug: None,
        }
    }

    /// Fill in whichever of `token` and `slug` is still unset, each from its
    /// own random UUID. Blank values count as unset.
    pub fn assign_identity(&mut self) {
        if is_blank(&self.token) {
            self.token = Some(uuid::Uuid::new_v4().to_string());
        }
        if is_blank(&self.slug) {
            self.slug = Some(uuid::Uuid::new_v4().to_string());
        }
    }

    pub fn validate(&self) -> Vec<RecordError> {
        blank_fields(&self.description, &self.raw_query)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDataclip {
    pub slug: String,
    pub description: Option<String>,
    pub raw_query: Option<String>,
}

impl UpdateDataclip {
    pub fn apply(&self, clip: &mut Dataclip) {
        if let Some(ref description) = self.description {
            clip.description = description.clone();
        }
        if let Some(ref raw_query) = self.raw_query {
            clip.raw_query = raw_query.clone();
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn blank_fields(description: &str, raw_query: &str) -> Vec<RecordError> {
    let mut errors = Vec::new();
    if description.trim().is_empty() {
        errors.push(RecordError::Blank("description"));
    }
    if raw_query.trim().is_empty() {
        errors.push(RecordError::Blank("raw_query"));
    }
    errors
}
