//! Core data types for `beads_core`.
//!
//! This module defines the persistent entities and their enums:
//! - `Issue` - the primary work item
//! - `Status` / `IssueType` / `Priority` - classification
//! - `Dependency` / `DependencyType` - edges of the issue graph
//! - `Comment` / `Event` - attached records
//!
//! Blocking semantics live in [`crate::graph`]; this module only carries the
//! per-type classification (which edge types affect readiness, which
//! participate in cycle checks, and how blocking propagates).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

#[allow(clippy::trivially_copy_pass_by_ref)]
const fn is_false(b: &bool) -> bool {
    !*b
}

/// Issue lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Open,
    InProgress,
    Blocked,
    Deferred,
    Closed,
    Tombstone,
    Pinned,
}

impl Status {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Deferred => "deferred",
            Self::Closed => "closed",
            Self::Tombstone => "tombstone",
            Self::Pinned => "pinned",
        }
    }

    /// Terminal states never return to the ready queue.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Tombstone)
    }

    /// Active states participate in the ready queue.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Open | Self::InProgress)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "deferred" => Ok(Self::Deferred),
            "closed" => Ok(Self::Closed),
            "tombstone" => Ok(Self::Tombstone),
            "pinned" => Ok(Self::Pinned),
            other => Err(Error::validation("status", format!("unknown status '{other}'"))),
        }
    }
}

/// Issue priority, 0 (critical) through 4 (backlog).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const CRITICAL: Self = Self(0);
    pub const HIGH: Self = Self(1);
    pub const MEDIUM: Self = Self(2);
    pub const LOW: Self = Self(3);
    pub const BACKLOG: Self = Self(4);

    /// Validate and wrap a raw priority value.
    pub fn new(value: i32) -> Result<Self, Error> {
        if (0..=4).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::validation(
                "priority",
                format!("must be 0-4, got {value}"),
            ))
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_uppercase();
        let digits = s.strip_prefix('P').unwrap_or(&s);
        let value: i32 = digits
            .parse()
            .map_err(|_| Error::validation("priority", format!("not a number: '{s}'")))?;
        Self::new(value)
    }
}

/// Issue type category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    #[default]
    Task,
    Bug,
    Feature,
    Epic,
    Chore,
    Docs,
    Question,
}

impl IssueType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Epic => "epic",
            Self::Chore => "chore",
            Self::Docs => "docs",
            Self::Question => "question",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "task" => Ok(Self::Task),
            "bug" => Ok(Self::Bug),
            "feature" => Ok(Self::Feature),
            "epic" => Ok(Self::Epic),
            "chore" => Ok(Self::Chore),
            "docs" => Ok(Self::Docs),
            "question" => Ok(Self::Question),
            other => Err(Error::validation(
                "issue_type",
                format!("unknown type '{other}'"),
            )),
        }
    }
}

/// Gate controlling when a `waits-for` edge releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitGate {
    /// Blocked until every child of the blocker is closed.
    #[default]
    AllChildren,
    /// Blocked until at least one child of the blocker is closed.
    AnyChildren,
}

impl WaitGate {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AllChildren => "all-children",
            Self::AnyChildren => "any-children",
        }
    }

    /// Parse a gate value; unknown strings fall back to the default.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "any-children" => Self::AnyChildren,
            _ => Self::AllChildren,
        }
    }
}

/// How a blocking edge type behaves once its blocker is found blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockingBehavior {
    /// Whether a blocked state flows transitively through this edge type
    /// during phase-2 propagation.
    pub propagates_through: bool,
}

/// Dependency relationship type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyType {
    Blocks,
    ParentChild,
    ConditionalBlocks,
    WaitsFor,
    Related,
    DiscoveredFrom,
    RepliesTo,
    RelatesTo,
    Duplicates,
    Supersedes,
    CausedBy,
}

impl DependencyType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::ParentChild => "parent-child",
            Self::ConditionalBlocks => "conditional-blocks",
            Self::WaitsFor => "waits-for",
            Self::Related => "related",
            Self::DiscoveredFrom => "discovered-from",
            Self::RepliesTo => "replies-to",
            Self::RelatesTo => "relates-to",
            Self::Duplicates => "duplicates",
            Self::Supersedes => "supersedes",
            Self::CausedBy => "caused-by",
        }
    }

    /// Whether edges of this type can keep the dependent out of the ready
    /// queue.
    #[must_use]
    pub const fn affects_ready(&self) -> bool {
        matches!(
            self,
            Self::Blocks | Self::ParentChild | Self::ConditionalBlocks | Self::WaitsFor
        )
    }

    /// Whether edges of this type participate in cycle detection. Coincides
    /// with the blocking set.
    #[must_use]
    pub const fn cycle_relevant(&self) -> bool {
        self.affects_ready()
    }

    /// Behavior record for the blocking subset; `None` for non-blocking
    /// types.
    #[must_use]
    pub const fn blocking_behavior(&self) -> Option<BlockingBehavior> {
        match self {
            Self::ParentChild => Some(BlockingBehavior {
                propagates_through: true,
            }),
            Self::Blocks | Self::ConditionalBlocks | Self::WaitsFor => Some(BlockingBehavior {
                propagates_through: false,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for DependencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DependencyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blocks" => Ok(Self::Blocks),
            "parent-child" => Ok(Self::ParentChild),
            "conditional-blocks" => Ok(Self::ConditionalBlocks),
            "waits-for" => Ok(Self::WaitsFor),
            "related" => Ok(Self::Related),
            "discovered-from" => Ok(Self::DiscoveredFrom),
            "replies-to" => Ok(Self::RepliesTo),
            "relates-to" => Ok(Self::RelatesTo),
            "duplicates" => Ok(Self::Duplicates),
            "supersedes" => Ok(Self::Supersedes),
            "caused-by" => Ok(Self::CausedBy),
            other => Err(Error::validation(
                "dependency_type",
                format!("unknown dependency type '{other}'"),
            )),
        }
    }
}

/// Audit event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Created,
    Updated,
    StatusChanged,
    PriorityChanged,
    AssigneeChanged,
    Commented,
    Closed,
    Reopened,
    DependencyAdded,
    DependencyRemoved,
    LabelAdded,
    LabelRemoved,
    Deleted,
    Imported,
    Other(String),
}

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::StatusChanged => "status_changed",
            Self::PriorityChanged => "priority_changed",
            Self::AssigneeChanged => "assignee_changed",
            Self::Commented => "commented",
            Self::Closed => "closed",
            Self::Reopened => "reopened",
            Self::DependencyAdded => "dependency_added",
            Self::DependencyRemoved => "dependency_removed",
            Self::LabelAdded => "label_added",
            Self::LabelRemoved => "label_removed",
            Self::Deleted => "deleted",
            Self::Imported => "imported",
            Self::Other(value) => value,
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        match value {
            "created" => Self::Created,
            "updated" => Self::Updated,
            "status_changed" => Self::StatusChanged,
            "priority_changed" => Self::PriorityChanged,
            "assignee_changed" => Self::AssigneeChanged,
            "commented" => Self::Commented,
            "closed" => Self::Closed,
            "reopened" => Self::Reopened,
            "dependency_added" => Self::DependencyAdded,
            "dependency_removed" => Self::DependencyRemoved,
            "label_added" => Self::LabelAdded,
            "label_removed" => Self::LabelRemoved,
            "deleted" => Self::Deleted,
            "imported" => Self::Imported,
            other => Self::Other(other.to_string()),
        }
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::from(value.as_str()))
    }
}

/// The primary issue entity.
///
/// Serialization matches the JSONL stream contract: optional fields are
/// omitted when at their default, timestamps render as RFC 3339 UTC, and the
/// content hash never enters the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    /// Unique ID (`<prefix>-<base36>`, optionally with a dotted child path).
    pub id: String,

    /// Deterministic digest of content fields; derived, never exported.
    #[serde(skip)]
    pub content_hash: Option<String>,

    /// Title (1-500 chars).
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub design: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_criteria: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default)]
    pub status: Status,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub issue_type: IssueType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_by_session: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer_until: Option<DateTime<Utc>>,

    /// External reference (e.g. `jira:PROJ-123`); globally unique when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_system: Option<String>,

    // Tombstone fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_reason: Option<String>,
    /// Issue type before tombstoning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_type: Option<String>,

    // Messaging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ephemeral: bool,

    // Flags
    #[serde(default, skip_serializing_if = "is_false")]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_template: bool,

    // Relations carried on the stream record
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<Comment>,
}

impl Default for Issue {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            content_hash: None,
            title: String::new(),
            description: None,
            design: None,
            acceptance_criteria: None,
            notes: None,
            status: Status::default(),
            priority: Priority::default(),
            issue_type: IssueType::default(),
            assignee: None,
            owner: None,
            estimated_minutes: None,
            created_by: None,
            created_at: now,
            updated_at: now,
            closed_at: None,
            close_reason: None,
            closed_by_session: None,
            due_at: None,
            defer_until: None,
            external_ref: None,
            source_system: None,
            deleted_at: None,
            deleted_by: None,
            delete_reason: None,
            original_type: None,
            sender: None,
            ephemeral: false,
            pinned: false,
            is_template: false,
            labels: Vec::new(),
            dependencies: Vec::new(),
            comments: Vec::new(),
        }
    }
}

impl Issue {
    /// Compute the canonical content hash for this issue.
    ///
    /// Delegates to [`crate::util::hash::content_hash`].
    #[must_use]
    pub fn compute_content_hash(&self) -> String {
        crate::util::hash::content_hash(self)
    }

    /// Readiness as far as the row itself can tell; the blocked cache is
    /// consulted separately by the graph engine.
    #[must_use]
    pub fn is_ready_candidate(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active()
            && !self.pinned
            && !self.ephemeral
            && self.defer_until.map_or(true, |t| t <= now)
    }
}

/// Directed edge between two issues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dependency {
    /// The dependent issue (edge source).
    pub issue_id: String,

    /// The issue depended on (edge target). May be an `external:` reference,
    /// in which case the edge is allowed to dangle.
    pub depends_on_id: String,

    #[serde(rename = "type")]
    pub dep_type: DependencyType,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    /// JSON-encoded attributes; holds the `waits-for` gate under `"gate"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

impl Dependency {
    /// Construct a bare edge with the current timestamp.
    #[must_use]
    pub fn new(issue_id: &str, depends_on_id: &str, dep_type: DependencyType) -> Self {
        Self {
            issue_id: issue_id.to_string(),
            depends_on_id: depends_on_id.to_string(),
            dep_type,
            created_at: Utc::now(),
            created_by: None,
            metadata: None,
            thread_id: None,
        }
    }

    /// Whether this edge points at an external capability rather than a
    /// local issue.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.depends_on_id.starts_with("external:")
    }

    /// Gate for `waits-for` edges, read from the metadata JSON.
    #[must_use]
    pub fn wait_gate(&self) -> WaitGate {
        let Some(meta) = self.metadata.as_deref() else {
            return WaitGate::default();
        };
        serde_json::from_str::<serde_json::Value>(meta)
            .ok()
            .and_then(|v| v.get("gate").and_then(|g| g.as_str().map(WaitGate::parse)))
            .unwrap_or_default()
    }
}

/// A comment attached to an issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub id: i64,
    pub issue_id: String,
    pub author: String,
    #[serde(rename = "text")]
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// An entry in the append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: i64,
    pub issue_id: String,
    pub event_type: EventType,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Epic rollup: child completion counts and close-eligibility.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpicStatus {
    pub epic: Issue,
    pub total_children: usize,
    pub closed_children: usize,
    pub eligible_for_close: bool,
}

/// A node of the dependency tree built by the graph engine.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DependencyNode {
    pub issue: Issue,
    pub depth: usize,
    /// Edge type that led into this node; `None` at the root.
    pub incoming_type: Option<DependencyType>,
    pub children: Vec<DependencyNode>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_issue() -> Issue {
        Issue {
            id: "bd-ab1".to_string(),
            title: "Sample".to_string(),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            updated_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            ..Issue::default()
        }
    }

    #[test]
    fn status_classification() {
        assert!(Status::Open.is_active());
        assert!(Status::InProgress.is_active());
        assert!(!Status::Blocked.is_active());
        assert!(Status::Closed.is_terminal());
        assert!(Status::Tombstone.is_terminal());
        assert!(!Status::Deferred.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            Status::Open,
            Status::InProgress,
            Status::Blocked,
            Status::Deferred,
            Status::Closed,
            Status::Tombstone,
            Status::Pinned,
        ] {
            assert_eq!(Status::from_str(status.as_str()).unwrap(), status);
        }
        assert!(Status::from_str("bogus").is_err());
    }

    #[test]
    fn priority_bounds() {
        assert!(Priority::new(0).is_ok());
        assert!(Priority::new(4).is_ok());
        assert!(Priority::new(-1).is_err());
        assert!(Priority::new(5).is_err());
        assert_eq!(Priority::from_str("P1").unwrap(), Priority::HIGH);
        assert_eq!(Priority::from_str("3").unwrap(), Priority::LOW);
        assert!(Priority::from_str("P9").is_err());
    }

    #[test]
    fn dependency_type_blocking_classification() {
        for t in [
            DependencyType::Blocks,
            DependencyType::ParentChild,
            DependencyType::ConditionalBlocks,
            DependencyType::WaitsFor,
        ] {
            assert!(t.affects_ready(), "{t} should affect ready");
            assert!(t.cycle_relevant(), "{t} should be cycle-relevant");
            assert!(t.blocking_behavior().is_some());
        }
        for t in [
            DependencyType::Related,
            DependencyType::DiscoveredFrom,
            DependencyType::RepliesTo,
            DependencyType::RelatesTo,
            DependencyType::Duplicates,
            DependencyType::Supersedes,
            DependencyType::CausedBy,
        ] {
            assert!(!t.affects_ready(), "{t} should not affect ready");
            assert!(t.blocking_behavior().is_none());
        }
    }

    #[test]
    fn only_parent_child_propagates() {
        assert!(
            DependencyType::ParentChild
                .blocking_behavior()
                .unwrap()
                .propagates_through
        );
        assert!(
            !DependencyType::Blocks
                .blocking_behavior()
                .unwrap()
                .propagates_through
        );
    }

    #[test]
    fn dependency_serde_uses_type_key() {
        let dep = Dependency::new("bd-a", "bd-b", DependencyType::ParentChild);
        let json = serde_json::to_string(&dep).unwrap();
        assert!(json.contains("\"type\":\"parent-child\""));
        let back: Dependency = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dep_type, DependencyType::ParentChild);
    }

    #[test]
    fn wait_gate_defaults_to_all_children() {
        let mut dep = Dependency::new("bd-a", "bd-b", DependencyType::WaitsFor);
        assert_eq!(dep.wait_gate(), WaitGate::AllChildren);

        dep.metadata = Some(r#"{"gate":"any-children"}"#.to_string());
        assert_eq!(dep.wait_gate(), WaitGate::AnyChildren);

        dep.metadata = Some(r#"{"gate":"nonsense"}"#.to_string());
        assert_eq!(dep.wait_gate(), WaitGate::AllChildren);

        dep.metadata = Some("not json".to_string());
        assert_eq!(dep.wait_gate(), WaitGate::AllChildren);
    }

    #[test]
    fn external_edges_detected() {
        let dep = Dependency::new("bd-a", "external:infra:dns", DependencyType::Blocks);
        assert!(dep.is_external());
        assert!(!Dependency::new("bd-a", "bd-b", DependencyType::Blocks).is_external());
    }

    #[test]
    fn issue_serialization_omits_defaults() {
        let issue = sample_issue();
        let json = serde_json::to_string(&issue).unwrap();
        assert!(json.contains("\"id\":\"bd-ab1\""));
        assert!(json.contains("\"status\":\"open\""));
        assert!(json.contains("\"priority\":2"));
        assert!(!json.contains("content_hash"));
        assert!(!json.contains("ephemeral"));
        assert!(!json.contains("pinned"));
        assert!(!json.contains("labels"));
    }

    #[test]
    fn issue_deserialize_defaults_missing_fields() {
        let json = r#"{
            "id": "bd-x1",
            "title": "T",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let issue: Issue = serde_json::from_str(json).unwrap();
        assert_eq!(issue.status, Status::Open);
        assert_eq!(issue.priority, Priority::MEDIUM);
        assert_eq!(issue.issue_type, IssueType::Task);
        assert!(issue.labels.is_empty());
        assert!(!issue.ephemeral);
    }

    #[test]
    fn ready_candidate_respects_defer_and_flags() {
        let now = Utc::now();
        let mut issue = sample_issue();
        assert!(issue.is_ready_candidate(now));

        issue.defer_until = Some(now + chrono::Duration::hours(1));
        assert!(!issue.is_ready_candidate(now));

        issue.defer_until = Some(now - chrono::Duration::hours(1));
        assert!(issue.is_ready_candidate(now));

        issue.pinned = true;
        assert!(!issue.is_ready_candidate(now));

        issue.pinned = false;
        issue.ephemeral = true;
        assert!(!issue.is_ready_candidate(now));

        issue.ephemeral = false;
        issue.status = Status::Closed;
        assert!(!issue.is_ready_candidate(now));
    }

    #[test]
    fn event_type_round_trip() {
        let e: EventType = serde_json::from_str("\"status_changed\"").unwrap();
        assert_eq!(e, EventType::StatusChanged);
        let e: EventType = serde_json::from_str("\"something_else\"").unwrap();
        assert_eq!(e, EventType::Other("something_else".to_string()));
        assert_eq!(serde_json::to_string(&e).unwrap(), "\"something_else\"");
    }
}
