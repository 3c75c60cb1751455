//! Job request model.
//!
//! A [`JobRequest`] is the immutable description of one unit of search work.
//! It is only ever built through validation ([`JobRequest::msa`],
//! [`JobRequest::pair`] or [`JobRequest::resolve`]); once built, its
//! [`Fingerprint`] identifies the semantic content for deduplication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};

use crate::catalog::DatabaseCatalog;
use crate::error::{RequestError, RequestResult};

/// Mode prefix that selects a pair search.
pub const PAIR_MODE_PREFIX: &str = "pair";

/// Whether `mode` selects a pair search.
///
/// Strings shorter than the prefix never match.
pub fn is_pair_mode(mode: &str) -> bool {
    mode.as_bytes().starts_with(PAIR_MODE_PREFIX.as_bytes())
}

/// Normalize a FASTA or bare-sequence query.
///
/// Header lines (`>`) are kept, trimmed. Residues must be ASCII letters, `*`
/// or `-`; they are upper-cased and whitespace is dropped, so each record's
/// sequence ends up on a single line.
pub fn normalize_query(raw: &str) -> RequestResult<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut residues = String::new();
    let mut total = 0usize;

    for (lineno, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.starts_with('>') {
            if !residues.is_empty() {
                lines.push(std::mem::take(&mut residues));
            }
            lines.push(line.to_string());
            continue;
        }

        for c in line.chars().filter(|c| !c.is_whitespace()) {
            if c.is_ascii_alphabetic() || c == '*' || c == '-' {
                residues.push(c.to_ascii_uppercase());
                total += 1;
            } else {
                return Err(RequestError::validation(format!(
                    "query contains invalid character {:?} on line {}",
                    c,
                    lineno + 1
                )));
            }
        }
    }

    if !residues.is_empty() {
        lines.push(residues);
    }

    if total == 0 {
        return Err(RequestError::validation("query is empty"));
    }

    Ok(lines.join("\n"))
}

/// The two kinds of search work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobVariant {
    Msa {
        query: String,
        databases: Vec<String>,
        mode: String,
    },
    Pair {
        query: String,
        mode: String,
    },
}

impl JobVariant {
    pub fn tag(&self) -> &'static str {
        match self {
            JobVariant::Msa { .. } => "msa",
            JobVariant::Pair { .. } => "pair",
        }
    }

    pub fn query(&self) -> &str {
        match self {
            JobVariant::Msa { query, .. } | JobVariant::Pair { query, .. } => query,
        }
    }

    pub fn mode(&self) -> &str {
        match self {
            JobVariant::Msa { mode, .. } | JobVariant::Pair { mode, .. } => mode,
        }
    }

    /// Databases to search. Always empty for pair searches.
    pub fn databases(&self) -> &[String] {
        match self {
            JobVariant::Msa { databases, .. } => databases,
            JobVariant::Pair { .. } => &[],
        }
    }

    pub fn is_pair(&self) -> bool {
        matches!(self, JobVariant::Pair { .. })
    }
}

/// SHA-224 of a request's normalized content, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash (tag, query, sorted databases, mode). Email never participates.
    pub fn compute(variant: &JobVariant) -> Self {
        let mut hasher = Sha224::new();
        hasher.update(variant.tag().as_bytes());
        hasher.update([0u8]);
        hasher.update(variant.query().as_bytes());
        hasher.update([0u8]);
        let databases = variant.databases();
        hasher.update((databases.len() as u64).to_le_bytes());
        for db in databases {
            hasher.update(db.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(variant.mode().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable, validated description of one search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    variant: JobVariant,
    email: Option<String>,
    fingerprint: Fingerprint,
    created_at: DateTime<Utc>,
}

impl JobRequest {
    /// Build an MSA request.
    ///
    /// Requested databases are trimmed, de-duplicated and sorted; each must
    /// be present in `catalog`. An empty list falls back to the catalog's
    /// defaults.
    pub fn msa<C>(
        query: &str,
        requested: &[String],
        catalog: &C,
        mode: &str,
        email: Option<&str>,
    ) -> RequestResult<Self>
    where
        C: DatabaseCatalog + ?Sized,
    {
        let query = normalize_query(query)?;
        let mode = validate_mode(mode)?;
        if is_pair_mode(&mode) {
            return Err(RequestError::validation(format!(
                "mode {mode:?} selects a pair search"
            )));
        }

        let mut databases: Vec<String> = requested
            .iter()
            .map(|db| db.trim().to_string())
            .filter(|db| !db.is_empty())
            .collect();
        databases.sort();
        databases.dedup();

        if databases.is_empty() {
            databases = catalog.defaults();
            databases.sort();
            databases.dedup();
            if databases.is_empty() {
                return Err(RequestError::validation(
                    "no databases requested and the catalog has no defaults",
                ));
            }
        } else if let Some(unknown) = databases.iter().find(|db| !catalog.contains(db)) {
            return Err(RequestError::unknown_database(unknown.clone()));
        }

        Ok(Self::from_variant(
            JobVariant::Msa {
                query,
                databases,
                mode,
            },
            email,
        ))
    }

    /// Build a pair request. `mode` must carry the pair prefix.
    pub fn pair(query: &str, mode: &str, email: Option<&str>) -> RequestResult<Self> {
        let query = normalize_query(query)?;
        let mode = validate_mode(mode)?;
        if !is_pair_mode(&mode) {
            return Err(RequestError::validation(format!(
                "mode {mode:?} is not a pair mode"
            )));
        }

        Ok(Self::from_variant(JobVariant::Pair { query, mode }, email))
    }

    /// Pick the constructor from the payload's mode and build the request.
    ///
    /// Databases are ignored for pair modes.
    pub fn resolve<C>(payload: &SearchPayload, catalog: &C) -> RequestResult<Self>
    where
        C: DatabaseCatalog + ?Sized,
    {
        let email = payload.email.as_deref();
        if is_pair_mode(payload.mode.trim()) {
            Self::pair(&payload.query, &payload.mode, email)
        } else {
            Self::msa(
                &payload.query,
                &payload.databases,
                catalog,
                &payload.mode,
                email,
            )
        }
    }

    fn from_variant(variant: JobVariant, email: Option<&str>) -> Self {
        let email = email
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string);
        let fingerprint = Fingerprint::compute(&variant);
        Self {
            variant,
            email,
            fingerprint,
            created_at: Utc::now(),
        }
    }

    pub fn variant(&self) -> &JobVariant {
        &self.variant
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

fn validate_mode(mode: &str) -> RequestResult<String> {
    let mode = mode.trim();
    if mode.is_empty() {
        return Err(RequestError::validation("mode is empty"));
    }
    Ok(mode.to_string())
}

/// Raw submission fields as clients send them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPayload {
    #[serde(alias = "q")]
    pub query: String,
    #[serde(default, alias = "dbs")]
    pub databases: Vec<String>,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl SearchPayload {
    /// Parse a JSON payload. Malformed JSON is a validation failure.
    pub fn from_json(raw: &str) -> RequestResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| RequestError::validation(format!("malformed payload: {e}")))
    }
}
