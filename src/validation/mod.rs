//! Field and invariant validation.
//!
//! Validation failures are rejected before any state change and surfaced
//! verbatim. The storage engine calls these on every mutation; the import
//! pipeline calls them on every incoming record.

use crate::error::{Error, Result};
use crate::model::{Dependency, Issue, Status};
use crate::util::id;

pub const TITLE_MAX: usize = 500;
pub const LABEL_MAX: usize = 100;

/// Validate an issue against the engine invariants.
///
/// Checks: title bounds, priority range, the closed-at invariant, the
/// tombstone invariant, and ID well-formedness (including child depth).
pub fn validate_issue(issue: &Issue) -> Result<()> {
    if issue.title.is_empty() {
        return Err(Error::validation("title", "must not be empty"));
    }
    if issue.title.chars().count() > TITLE_MAX {
        return Err(Error::validation(
            "title",
            format!("must be at most {TITLE_MAX} characters"),
        ));
    }

    if !(0..=4).contains(&issue.priority.0) {
        return Err(Error::validation(
            "priority",
            format!("must be 0-4, got {}", issue.priority.0),
        ));
    }

    if !issue.id.is_empty() {
        id::parse_id(&issue.id)?;
    }

    match issue.status {
        Status::Closed => {
            if issue.closed_at.is_none() {
                return Err(Error::validation(
                    "closed_at",
                    "closed issues must carry a closed_at timestamp",
                ));
            }
        }
        Status::Tombstone => {
            if issue.deleted_at.is_none() {
                return Err(Error::validation(
                    "deleted_at",
                    "tombstones must carry a deleted_at timestamp",
                ));
            }
        }
        _ => {
            if issue.closed_at.is_some() {
                return Err(Error::validation(
                    "closed_at",
                    "only closed or tombstoned issues may carry closed_at",
                ));
            }
        }
    }

    for label in &issue.labels {
        validate_label(label)?;
    }

    Ok(())
}

/// Validate a label string (1-100 chars, case-sensitive, no control chars).
pub fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(Error::validation("label", "must not be empty"));
    }
    if label.chars().count() > LABEL_MAX {
        return Err(Error::validation(
            "label",
            format!("must be at most {LABEL_MAX} characters"),
        ));
    }
    if label.chars().any(char::is_control) {
        return Err(Error::validation("label", "must not contain control characters"));
    }
    Ok(())
}

/// Validate a dependency edge shape: no self-loops, a parseable source ID,
/// and a parseable or external target.
pub fn validate_dependency(dep: &Dependency) -> Result<()> {
    if dep.issue_id == dep.depends_on_id {
        return Err(Error::validation(
            "dependency",
            format!("issue cannot depend on itself: {}", dep.issue_id),
        ));
    }
    id::parse_id(&dep.issue_id)?;
    if !dep.is_external() {
        id::parse_id(&dep.depends_on_id)?;
    }
    if let Some(meta) = dep.metadata.as_deref() {
        serde_json::from_str::<serde_json::Value>(meta).map_err(|e| {
            Error::validation("dependency.metadata", format!("not valid JSON: {e}"))
        })?;
    }
    Ok(())
}

/// Validate a comment body and author.
pub fn validate_comment(author: &str, body: &str) -> Result<()> {
    if author.is_empty() {
        return Err(Error::validation("author", "must not be empty"));
    }
    if body.trim().is_empty() {
        return Err(Error::validation("text", "must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DependencyType, Priority};
    use chrono::Utc;

    fn issue(title: &str) -> Issue {
        Issue {
            id: "bd-abc".to_string(),
            title: title.to_string(),
            ..Issue::default()
        }
    }

    #[test]
    fn title_bounds() {
        assert!(validate_issue(&issue("x")).is_ok());
        assert!(validate_issue(&issue(&"x".repeat(500))).is_ok());
        assert!(validate_issue(&issue("")).is_err());
        assert!(validate_issue(&issue(&"x".repeat(501))).is_err());
    }

    #[test]
    fn priority_range_enforced_even_if_constructed_raw() {
        let mut i = issue("ok");
        i.priority = Priority(5);
        assert!(validate_issue(&i).is_err());
        i.priority = Priority(-1);
        assert!(validate_issue(&i).is_err());
        i.priority = Priority(0);
        assert!(validate_issue(&i).is_ok());
    }

    #[test]
    fn closed_at_invariant() {
        let mut i = issue("ok");
        i.status = Status::Closed;
        assert!(validate_issue(&i).is_err());

        i.closed_at = Some(Utc::now());
        assert!(validate_issue(&i).is_ok());

        i.status = Status::Open;
        assert!(validate_issue(&i).is_err());
    }

    #[test]
    fn tombstone_invariant() {
        let mut i = issue("ok");
        i.status = Status::Tombstone;
        assert!(validate_issue(&i).is_err());
        i.deleted_at = Some(Utc::now());
        assert!(validate_issue(&i).is_ok());
    }

    #[test]
    fn label_rules() {
        assert!(validate_label("backend").is_ok());
        assert!(validate_label(&"l".repeat(100)).is_ok());
        assert!(validate_label("").is_err());
        assert!(validate_label(&"l".repeat(101)).is_err());
        assert!(validate_label("bad\nlabel").is_err());
    }

    #[test]
    fn self_dependency_rejected() {
        let dep = Dependency::new("bd-abc", "bd-abc", DependencyType::Blocks);
        assert!(validate_dependency(&dep).is_err());
    }

    #[test]
    fn external_targets_allowed_to_dangle() {
        let dep = Dependency::new("bd-abc", "external:infra:dns", DependencyType::Blocks);
        assert!(validate_dependency(&dep).is_ok());
    }

    #[test]
    fn dependency_metadata_must_be_json() {
        let mut dep = Dependency::new("bd-abc", "bd-def", DependencyType::WaitsFor);
        dep.metadata = Some("{broken".to_string());
        assert!(validate_dependency(&dep).is_err());
        dep.metadata = Some(r#"{"gate":"any-children"}"#.to_string());
        assert!(validate_dependency(&dep).is_ok());
    }

    #[test]
    fn comment_rules() {
        assert!(validate_comment("alice", "hello").is_ok());
        assert!(validate_comment("", "hello").is_err());
        assert!(validate_comment("alice", "   ").is_err());
    }
}
