//! Schema drift detection
//!
//! Compares the field names a source actually delivers against the set its
//! adapter expects. Missing and unexpected fields that look alike are paired
//! up as probable renames. Drift is informational: findings are logged and
//! persisted, and ingestion proceeds regardless.

use crate::error::EtlResult;
use crate::ingest::types::{DriftObservation, RawRecord};
use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};
use uuid::Uuid;

/// Minimum name similarity for a missing/extra pair to count as a rename
pub const FUZZY_MATCH_THRESHOLD: f64 = 0.70;
/// Flag when more than this share of expected fields is missing
pub const MISSING_FIELD_THRESHOLD: f64 = 0.5;
/// Flag when unexpected fields exceed this share of the expected count
pub const EXTRA_FIELD_THRESHOLD: f64 = 0.3;
pub const DEFAULT_SAMPLE_SIZE: usize = 10;

/// Findings for one record, or the aggregate over a sampled batch
#[derive(Debug, Clone, PartialEq)]
pub struct DriftReport {
    pub confidence: f64,
    pub missing_fields: BTreeSet<String>,
    pub extra_fields: BTreeSet<String>,
    /// observed field -> expected field
    pub fuzzy_renames: BTreeMap<String, String>,
    pub flagged: bool,
    pub sample_count: usize,
    pub warnings: Vec<String>,
}

impl Default for DriftReport {
    fn default() -> Self {
        Self {
            confidence: 1.0,
            missing_fields: BTreeSet::new(),
            extra_fields: BTreeSet::new(),
            fuzzy_renames: BTreeMap::new(),
            flagged: false,
            sample_count: 0,
            warnings: Vec::new(),
        }
    }
}

/// Case-insensitive Ratcliff/Obershelp similarity in `[0, 1]`: twice the number of
/// matching characters over the combined length
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_lowercase().chars().collect();
    let b: Vec<char> = b.to_lowercase().chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_characters(&a, &b) as f64 / total as f64
}

/// Sum of the longest common blocks, found recursively left and right of each match
fn matching_characters(a: &[char], b: &[char]) -> usize {
    let mut matched = 0;
    let mut pending = vec![(0, a.len(), 0, b.len())];
    while let Some((alo, ahi, blo, bhi)) = pending.pop() {
        let (i, j, k) = longest_block(a, b, (alo, ahi), (blo, bhi));
        if k == 0 {
            continue;
        }
        matched += k;
        if alo < i && blo < j {
            pending.push((alo, i, blo, j));
        }
        if i + k < ahi && j + k < bhi {
            pending.push((i + k, ahi, j + k, bhi));
        }
    }
    matched
}

/// Longest common block within the given ranges as `(start_a, start_b, len)`.
/// Ties resolve to the earliest block in `a`, then in `b`.
fn longest_block(
    a: &[char],
    b: &[char],
    (alo, ahi): (usize, usize),
    (blo, bhi): (usize, usize),
) -> (usize, usize, usize) {
    let mut best = (alo, blo, 0);
    // runs[j - blo + 1] is the length of the common run ending at (i - 1, j)
    let mut runs = vec![0usize; bhi - blo + 1];
    for i in alo..ahi {
        let mut next = vec![0usize; bhi - blo + 1];
        for j in blo..bhi {
            if a[i] == b[j] {
                let k = runs[j - blo] + 1;
                next[j - blo + 1] = k;
                if k > best.2 {
                    best = (i + 1 - k, j + 1 - k, k);
                }
            }
        }
        runs = next;
    }
    best
}

#[derive(Debug, Clone)]
pub struct SchemaDriftDetector {
    sample_size: usize,
}

impl Default for SchemaDriftDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_SIZE)
    }
}

impl SchemaDriftDetector {
    pub fn new(sample_size: usize) -> Self {
        Self {
            sample_size: sample_size.max(1),
        }
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Compare one observed field set against the expected one
    pub fn analyze(&self, observed: &BTreeSet<String>, expected: &BTreeSet<String>) -> DriftReport {
        let exact = observed.intersection(expected).count();
        let mut missing: BTreeSet<String> = expected.difference(observed).cloned().collect();
        let mut extra: BTreeSet<String> = observed.difference(expected).cloned().collect();

        // Greedy pairing, best score first; ties broken by name for stable output
        let mut candidates: Vec<(f64, &String, &String)> = missing
            .iter()
            .flat_map(|m| extra.iter().map(move |e| (similarity(m, e), m, e)))
            .filter(|(score, _, _)| *score >= FUZZY_MATCH_THRESHOLD)
            .collect();
        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.cmp(b.1))
                .then_with(|| a.2.cmp(b.2))
        });

        let mut fuzzy_renames = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut used_missing = BTreeSet::new();
        let mut used_extra = BTreeSet::new();
        for (score, expected_field, observed_field) in candidates {
            if used_missing.contains(expected_field) || used_extra.contains(observed_field) {
                continue;
            }
            used_missing.insert(expected_field.clone());
            used_extra.insert(observed_field.clone());
            warnings.push(format!(
                "Possible field rename: '{}' -> '{}' (similarity {:.1}%)",
                expected_field,
                observed_field,
                score * 100.0
            ));
            fuzzy_renames.insert(observed_field.clone(), expected_field.clone());
        }
        missing.retain(|f| !used_missing.contains(f));
        extra.retain(|f| !used_extra.contains(f));

        let total = expected.len();
        let (confidence, missing_ratio, extra_ratio) = if total == 0 {
            (1.0, 0.0, 0.0)
        } else {
            let total = total as f64;
            (
                ((exact + fuzzy_renames.len()) as f64 / total).clamp(0.0, 1.0),
                missing.len() as f64 / total,
                extra.len() as f64 / total,
            )
        };

        if missing_ratio > MISSING_FIELD_THRESHOLD {
            warnings.push(format!(
                "High missing field ratio: {:.1}% ({}/{} fields missing)",
                missing_ratio * 100.0,
                missing.len(),
                total
            ));
        }
        if extra_ratio > EXTRA_FIELD_THRESHOLD {
            warnings.push(format!(
                "High new field ratio: {:.1}% ({} unexpected fields)",
                extra_ratio * 100.0,
                extra.len()
            ));
        }

        let flagged = missing_ratio > MISSING_FIELD_THRESHOLD
            || extra_ratio > EXTRA_FIELD_THRESHOLD
            || !fuzzy_renames.is_empty();

        DriftReport {
            confidence,
            missing_fields: missing,
            extra_fields: extra,
            fuzzy_renames,
            flagged,
            sample_count: 1,
            warnings,
        }
    }

    /// Analyze up to `sample_size` leading records of a batch.
    ///
    /// The aggregate carries the lowest confidence seen, the union of all
    /// findings, and is flagged when any sampled record is.
    pub fn analyze_batch(&self, records: &[RawRecord], expected: &BTreeSet<String>) -> DriftReport {
        let mut aggregate = DriftReport::default();
        let mut warnings = BTreeSet::new();

        for record in records.iter().take(self.sample_size) {
            let observed: BTreeSet<String> = record.keys().cloned().collect();
            let report = self.analyze(&observed, expected);

            aggregate.confidence = aggregate.confidence.min(report.confidence);
            aggregate.missing_fields.extend(report.missing_fields);
            aggregate.extra_fields.extend(report.extra_fields);
            aggregate.fuzzy_renames.extend(report.fuzzy_renames);
            aggregate.flagged |= report.flagged;
            aggregate.sample_count += 1;
            warnings.extend(report.warnings);
        }

        aggregate.warnings = warnings.into_iter().collect();
        aggregate
    }
}

/// Persist a batch report for `run_id` and log it
pub async fn record_observation(
    pool: &SqlitePool,
    source: &str,
    run_id: Uuid,
    report: &DriftReport,
) -> EtlResult<i64> {
    if report.flagged {
        warn!(
            source,
            %run_id,
            confidence = report.confidence,
            missing = ?report.missing_fields,
            extra = ?report.extra_fields,
            renames = ?report.fuzzy_renames,
            "Schema drift detected"
        );
    } else {
        debug!(source, %run_id, confidence = report.confidence, "No schema drift");
    }

    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO drift_observations (
            source, run_id, confidence_score, missing_fields, extra_fields,
            fuzzy_renames, flagged, sample_count, warnings, detected_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        RETURNING id
        "#,
    )
    .bind(source)
    .bind(run_id)
    .bind(report.confidence)
    .bind(serde_json::to_string(&report.missing_fields)?)
    .bind(serde_json::to_string(&report.extra_fields)?)
    .bind(serde_json::to_string(&report.fuzzy_renames)?)
    .bind(report.flagged)
    .bind(report.sample_count as i64)
    .bind(serde_json::to_string(&report.warnings)?)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(id)
}

/// Most recent observations first
pub async fn list_observations(
    pool: &SqlitePool,
    source: Option<&str>,
    limit: i64,
) -> EtlResult<Vec<DriftObservation>> {
    let observations = sqlx::query_as::<_, DriftObservation>(
        r#"
        SELECT * FROM drift_observations
        WHERE ?1 IS NULL OR source = ?1
        ORDER BY id DESC
        LIMIT ?2
        "#,
    )
    .bind(source)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(observations)
}
