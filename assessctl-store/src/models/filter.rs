//! List filters for `AssessmentStateStore::list_assessments`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AssessmentState, Pagination};

/// Column a listing is ordered by
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    UpdatedAt,
    Priority,
}

impl SortField {
    /// SQL column name. Never caller text, so safe to splice into a query.
    pub fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Priority => "priority",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Conjunctive filter; unset fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssessmentFilter {
    pub states: Vec<AssessmentState>,
    pub assessment_id: Option<String>,
    pub target: Option<String>,
    pub assessment_type: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub sort: SortField,
    pub direction: SortDirection,
    pub page: Pagination,
}

impl AssessmentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_state(mut self, state: AssessmentState) -> Self {
        if !self.states.contains(&state) {
            self.states.push(state);
        }
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.assessment_id = Some(id.into());
        self
    }

    pub fn for_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn of_type(mut self, assessment_type: impl Into<String>) -> Self {
        self.assessment_type = Some(assessment_type.into());
        self
    }

    pub fn created_between(
        mut self,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_after = after;
        self.created_before = before;
        self
    }

    pub fn sorted_by(mut self, sort: SortField, direction: SortDirection) -> Self {
        self.sort = sort;
        self.direction = direction;
        self
    }

    pub fn paginate(mut self, page: Pagination) -> Self {
        self.page = page;
        self
    }
}
