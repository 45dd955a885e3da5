//! Contracts consumed from the hosting content system.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PageId;

/// The hosting system's view of a page an experiment can target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    /// Page identifier.
    pub id: PageId,
    /// Content type label used to filter goal types.
    pub page_type: String,
    /// Whether the page is published.
    pub is_live: bool,
    /// Whether a pending revision exists on top of the published content.
    pub has_unpublished_changes: bool,
    /// Latest revision, served to the treatment group.
    #[serde(default)]
    pub latest_revision: Option<i64>,
}

/// Display metadata for a registered goal event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalType {
    /// Label shown to editors.
    pub display_name: String,
    /// Page types the event can fire on. Empty means any page type.
    #[serde(default)]
    pub page_types: Vec<String>,
}

impl GoalType {
    /// Whether the event can be triggered on pages of `page_type`.
    pub fn is_triggerable_on(&self, page_type: &str) -> bool {
        self.page_types.is_empty() || self.page_types.iter().any(|t| t == page_type)
    }
}

/// Registry of goal event types known to the hosting system.
pub trait GoalRegistry: Send + Sync {
    /// Looks up a goal type by slug.
    fn goal(&self, slug: &str) -> Option<GoalType>;

    /// Whether `slug` is registered and can fire on `page_type`.
    fn is_triggerable_on(&self, slug: &str, page_type: &str) -> bool {
        self.goal(slug)
            .map(|goal| goal.is_triggerable_on(page_type))
            .unwrap_or(false)
    }
}

/// In-memory goal registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticGoalRegistry {
    goals: BTreeMap<String, GoalType>,
}

impl StaticGoalRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a goal type under `slug`, replacing any previous entry.
    pub fn with_goal(mut self, slug: impl Into<String>, goal: GoalType) -> Self {
        self.goals.insert(slug.into(), goal);
        self
    }

    /// Registered slugs in sorted order.
    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.goals.keys().map(String::as_str)
    }
}

impl GoalRegistry for StaticGoalRegistry {
    fn goal(&self, slug: &str) -> Option<GoalType> {
        self.goals.get(slug).cloned()
    }
}
