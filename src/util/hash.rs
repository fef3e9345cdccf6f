//! Canonical content hashing.
//!
//! The content hash identifies an issue's *content* across workspaces: two
//! stores that agree on content produce the same digest regardless of IDs or
//! timestamps. SHA-256 over a fixed field sequence with NUL separators.
//!
//! Included, in order: title, description, design, acceptance criteria,
//! notes; status, priority, type; assignee, owner, creator, estimate;
//! external ref, source system; close/delete text fields and original type;
//! the three flags (marker emitted only when set); labels (sorted);
//! dependencies (rendered `depends_on:type:metadata`, sorted).
//!
//! Excluded: ID, the hash itself, every timestamp, and routing fields.

use sha2::{Digest, Sha256};

use crate::model::Issue;

/// Compute the canonical content hash of an issue.
#[must_use]
pub fn content_hash(issue: &Issue) -> String {
    let mut hasher = Sha256::new();

    let mut field = |value: &str| {
        // NUL is the separator; strip it from field bodies so adjacent
        // fields cannot alias.
        if value.contains('\0') {
            hasher.update(value.replace('\0', " ").as_bytes());
        } else {
            hasher.update(value.as_bytes());
        }
        hasher.update(b"\x00");
    };

    field(&issue.title);
    field(issue.description.as_deref().unwrap_or(""));
    field(issue.design.as_deref().unwrap_or(""));
    field(issue.acceptance_criteria.as_deref().unwrap_or(""));
    field(issue.notes.as_deref().unwrap_or(""));

    field(issue.status.as_str());
    field(&format!("P{}", issue.priority.0));
    field(issue.issue_type.as_str());

    field(issue.assignee.as_deref().unwrap_or(""));
    field(issue.owner.as_deref().unwrap_or(""));
    field(issue.created_by.as_deref().unwrap_or(""));
    field(
        &issue
            .estimated_minutes
            .map(|m| m.to_string())
            .unwrap_or_default(),
    );

    field(issue.external_ref.as_deref().unwrap_or(""));
    field(issue.source_system.as_deref().unwrap_or(""));

    field(issue.close_reason.as_deref().unwrap_or(""));
    field(issue.closed_by_session.as_deref().unwrap_or(""));
    field(issue.deleted_by.as_deref().unwrap_or(""));
    field(issue.delete_reason.as_deref().unwrap_or(""));
    field(issue.original_type.as_deref().unwrap_or(""));

    // Flags contribute a named marker only when set; unset flags add nothing.
    if issue.pinned {
        field("pinned");
    }
    if issue.is_template {
        field("is_template");
    }
    if issue.ephemeral {
        field("ephemeral");
    }

    let mut labels = issue.labels.clone();
    labels.sort();
    for label in &labels {
        field(label);
    }

    let mut deps: Vec<String> = issue
        .dependencies
        .iter()
        .map(|d| {
            format!(
                "{}:{}:{}",
                d.depends_on_id,
                d.dep_type.as_str(),
                d.metadata.as_deref().unwrap_or("")
            )
        })
        .collect();
    deps.sort();
    for dep in &deps {
        field(dep);
    }

    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dependency, DependencyType, Priority, Status};
    use chrono::{TimeZone, Utc};

    fn base_issue() -> Issue {
        Issue {
            id: "bd-aaa".to_string(),
            title: "Hash me".to_string(),
            description: Some("body".to_string()),
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            updated_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            ..Issue::default()
        }
    }

    #[test]
    fn deterministic_hex_digest() {
        let issue = base_issue();
        let h = content_hash(&issue);
        assert_eq!(h, content_hash(&issue));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn id_and_timestamps_do_not_matter() {
        let a = base_issue();
        let mut b = base_issue();
        b.id = "other-zzz".to_string();
        b.created_at = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        b.updated_at = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        b.closed_at = None;
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn content_fields_matter() {
        let a = base_issue();

        let mut b = base_issue();
        b.title = "Different".to_string();
        assert_ne!(content_hash(&a), content_hash(&b));

        let mut b = base_issue();
        b.status = Status::Closed;
        assert_ne!(content_hash(&a), content_hash(&b));

        let mut b = base_issue();
        b.priority = Priority::CRITICAL;
        assert_ne!(content_hash(&a), content_hash(&b));

        let mut b = base_issue();
        b.close_reason = Some("wontfix".to_string());
        assert_ne!(content_hash(&a), content_hash(&b));

        let mut b = base_issue();
        b.owner = Some("alice".to_string());
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn each_flag_hashes_distinctly() {
        let mut pinned = base_issue();
        pinned.pinned = true;
        let mut template = base_issue();
        template.is_template = true;
        let mut ephemeral = base_issue();
        ephemeral.ephemeral = true;

        let hashes = [
            content_hash(&base_issue()),
            content_hash(&pinned),
            content_hash(&template),
            content_hash(&ephemeral),
        ];
        for (i, a) in hashes.iter().enumerate() {
            for b in &hashes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn label_order_is_canonical() {
        let mut a = base_issue();
        a.labels = vec!["zeta".to_string(), "alpha".to_string()];
        let mut b = base_issue();
        b.labels = vec!["alpha".to_string(), "zeta".to_string()];
        assert_eq!(content_hash(&a), content_hash(&b));

        let mut c = base_issue();
        c.labels = vec!["alpha".to_string()];
        assert_ne!(content_hash(&a), content_hash(&c));
    }

    #[test]
    fn dependency_order_is_canonical() {
        let mut a = base_issue();
        a.dependencies = vec![
            Dependency::new("bd-z", "bd-b", DependencyType::Blocks),
            Dependency::new("bd-z", "bd-a", DependencyType::Related),
        ];
        let mut b = base_issue();
        b.dependencies = vec![
            Dependency::new("bd-z", "bd-a", DependencyType::Related),
            Dependency::new("bd-z", "bd-b", DependencyType::Blocks),
        ];
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn dependency_metadata_matters() {
        let mut a = base_issue();
        a.dependencies = vec![Dependency::new("bd-z", "bd-b", DependencyType::WaitsFor)];
        let mut b = base_issue();
        let mut dep = Dependency::new("bd-z", "bd-b", DependencyType::WaitsFor);
        dep.metadata = Some(r#"{"gate":"any-children"}"#.to_string());
        b.dependencies = vec![dep];
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn nul_bytes_cannot_alias_fields() {
        let mut a = base_issue();
        a.title = "ab".to_string();
        a.description = Some("c".to_string());
        let mut b = base_issue();
        b.title = "ab\0c".to_string();
        b.description = None;
        assert_ne!(content_hash(&a), content_hash(&b));
    }
}
