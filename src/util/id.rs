//! Issue ID generation, hierarchy, parsing, and partial-ID resolution.
//!
//! IDs have the form `<prefix>-<base36 hash>` with an optional dotted child
//! path (`bd-a1b.2.1`). The short hash grows with the population: starting
//! at the configured minimum length, the generator picks the shortest length
//! whose birthday-paradox collision estimate stays under the configured
//! probability, retrying up to ten nonces per length before growing.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Maximum depth of dotted child IDs (`P.1.2.3` is depth 3 and the limit).
pub const MAX_CHILD_DEPTH: usize = 3;

/// Hash length used when the configured maximum still collides.
const FALLBACK_HASH_LENGTH: usize = 16;

/// Nonces tried per candidate length.
const NONCES_PER_LENGTH: u32 = 10;

/// Tunables for ID generation, sourced from configuration.
#[derive(Debug, Clone)]
pub struct IdConfig {
    /// Issue ID prefix (e.g. "bd").
    pub prefix: String,
    pub min_hash_length: usize,
    pub max_hash_length: usize,
    /// Birthday-paradox threshold for growing the hash.
    pub max_collision_prob: f64,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            prefix: "bd".to_string(),
            min_hash_length: 3,
            max_hash_length: 8,
            max_collision_prob: 0.25,
        }
    }
}

/// Inputs that seed a new issue's ID.
#[derive(Debug, Clone, Copy)]
pub struct IdSeed<'a> {
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub creator: Option<&'a str>,
    pub created_at: DateTime<Utc>,
    /// Distinguishes workspaces that create identical content at the same
    /// instant.
    pub workspace_id: &'a str,
}

impl IdSeed<'_> {
    fn material(&self, nonce: u32) -> String {
        let desc: String = self
            .description
            .unwrap_or("")
            .chars()
            .take(100)
            .collect();
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.title,
            desc,
            self.creator.unwrap_or(""),
            self.created_at.timestamp_nanos_opt().unwrap_or(0),
            self.workspace_id,
            nonce
        )
    }
}

/// Stateless ID generator.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    config: IdConfig,
}

impl IdGenerator {
    #[must_use]
    pub const fn new(config: IdConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Shortest acceptable hash length for the current population.
    ///
    /// P(collision) ≈ 1 - e^(-n²/2d) for n issues in a space of d = 36^len.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn length_for_population(&self, issue_count: usize) -> usize {
        let n = issue_count as f64;
        for len in self.config.min_hash_length..=self.config.max_hash_length {
            let space = 36_f64.powi(len as i32);
            let prob = 1.0 - (-n * n / (2.0 * space)).exp();
            if prob < self.config.max_collision_prob {
                return len;
            }
        }
        self.config.max_hash_length
    }

    /// Generate a fresh ID, avoiding collisions reported by `exists`.
    pub fn generate<F>(&self, seed: &IdSeed<'_>, issue_count: usize, exists: F) -> String
    where
        F: Fn(&str) -> bool,
    {
        let mut length = self.length_for_population(issue_count);

        loop {
            for nonce in 0..NONCES_PER_LENGTH {
                let id = format!(
                    "{}-{}",
                    self.config.prefix,
                    base36_hash(&seed.material(nonce), length)
                );
                if !exists(&id) {
                    return id;
                }
            }

            if length < self.config.max_hash_length {
                length += 1;
                continue;
            }

            // Every nonce collided at the maximum length. Practically
            // unreachable outside adversarial populations.
            let mut nonce = NONCES_PER_LENGTH;
            loop {
                let hash = base36_hash(&seed.material(nonce), FALLBACK_HASH_LENGTH);
                let id = format!("{}-{hash}", self.config.prefix);
                if !exists(&id) {
                    return id;
                }
                nonce += 1;
                if nonce > 1000 {
                    // Give up probing; the nonce suffix guarantees uniqueness.
                    return format!("{}-{hash}{nonce}", self.config.prefix);
                }
            }
        }
    }
}

/// Base36 hash of the input, truncated or zero-padded to `length`.
#[must_use]
pub fn base36_hash(input: &str, length: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());

    let mut num = 0u128;
    for &byte in digest.iter().take(16) {
        num = (num << 8) | u128::from(byte);
    }

    let mut encoded = base36_encode(num);
    if encoded.len() < length {
        encoded = format!("{encoded:0>length$}");
    }
    encoded.chars().take(length).collect()
}

fn base36_encode(mut num: u128) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if num == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while num > 0 {
        out.push(ALPHABET[(num % 36) as usize] as char);
        num /= 36;
    }
    out.into_iter().rev().collect()
}

// ============================================================================
// Hierarchical IDs
// ============================================================================

/// Build the ID of child number `n` under `parent_id`.
#[must_use]
pub fn child_id(parent_id: &str, n: i64) -> String {
    format!("{parent_id}.{n}")
}

/// Number of dotted segments after the hash (0 for a root ID).
#[must_use]
pub fn id_depth(id: &str) -> usize {
    id.find('-').map_or_else(
        || id.matches('.').count(),
        |pos| id[pos + 1..].matches('.').count(),
    )
}

/// Components of a parsed issue ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    pub prefix: String,
    pub hash: String,
    pub child_path: Vec<u32>,
}

impl ParsedId {
    #[must_use]
    pub fn depth(&self) -> usize {
        self.child_path.len()
    }

    /// Immediate parent, or `None` for root IDs.
    #[must_use]
    pub fn parent_id(&self) -> Option<String> {
        if self.child_path.is_empty() {
            return None;
        }
        let mut path = self.child_path.clone();
        path.pop();
        let mut id = format!("{}-{}", self.prefix, self.hash);
        for seg in path {
            id.push('.');
            id.push_str(&seg.to_string());
        }
        Some(id)
    }
}

/// Parse an issue ID, validating the base36 hash and child path.
pub fn parse_id(id: &str) -> Result<ParsedId> {
    let Some(dash) = id.find('-') else {
        return Err(Error::InvalidId { id: id.to_string() });
    };
    let (prefix, rest) = (&id[..dash], &id[dash + 1..]);
    if prefix.is_empty() || rest.is_empty() {
        return Err(Error::InvalidId { id: id.to_string() });
    }

    let mut parts = rest.split('.');
    let hash = parts.next().unwrap_or("").to_string();
    if hash.is_empty()
        || !hash
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(Error::InvalidId { id: id.to_string() });
    }

    let mut child_path = Vec::new();
    for part in parts {
        let n: u32 = part
            .parse()
            .map_err(|_| Error::InvalidId { id: id.to_string() })?;
        child_path.push(n);
    }
    if child_path.len() > MAX_CHILD_DEPTH {
        return Err(Error::InvalidId { id: id.to_string() });
    }

    Ok(ParsedId {
        prefix: prefix.to_string(),
        hash,
        child_path,
    })
}

// ============================================================================
// Partial-ID resolution
// ============================================================================

/// Resolves user-supplied partial IDs against the known population.
///
/// Resolution order: exact match; prefix-normalized match (prepend the
/// default prefix to unhyphenated input); substring match on the hash
/// portion. More than one substring match is ambiguous.
#[derive(Debug, Clone)]
pub struct IdResolver {
    default_prefix: String,
}

impl IdResolver {
    #[must_use]
    pub fn new(default_prefix: impl Into<String>) -> Self {
        Self {
            default_prefix: default_prefix.into(),
        }
    }

    /// Resolve `input` to a full ID.
    ///
    /// `exists` answers exact-ID membership; `matching` returns all IDs whose
    /// hash portion contains the given substring.
    pub fn resolve<F, G>(&self, input: &str, exists: F, matching: G) -> Result<String>
    where
        F: Fn(&str) -> bool,
        G: Fn(&str) -> Vec<String>,
    {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidId { id: String::new() });
        }
        let normalized = input.to_lowercase();

        if exists(&normalized) {
            return Ok(normalized);
        }

        if !normalized.contains('-') {
            let with_prefix = format!("{}-{normalized}", self.default_prefix);
            if exists(&with_prefix) {
                return Ok(with_prefix);
            }
        }

        let pattern = normalized
            .find('-')
            .map_or(normalized.as_str(), |pos| &normalized[pos + 1..]);
        if !pattern.is_empty() {
            let mut candidates = matching(pattern);
            candidates.sort();
            match candidates.len() {
                0 => {}
                1 => return Ok(candidates.remove(0)),
                _ => {
                    return Err(Error::AmbiguousId {
                        input: input.to_string(),
                        candidates,
                    })
                }
            }
        }

        Err(Error::NotFound {
            id: input.to_string(),
        })
    }
}

/// Filter `all_ids` down to those whose root hash contains `pattern`.
#[must_use]
pub fn ids_matching_hash(all_ids: &[String], pattern: &str) -> Vec<String> {
    all_ids
        .iter()
        .filter(|id| {
            id.find('-').is_some_and(|pos| {
                let hash = &id[pos + 1..];
                let root = hash.split('.').next().unwrap_or(hash);
                root.contains(pattern)
            })
        })
        .cloned()
        .collect()
}
