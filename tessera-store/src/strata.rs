//! Sample stratification by intervention timing and diagnosis.
//!
//! Each specimen is placed relative to its subject's interventions and paired
//! with the first diagnosis dated on or after extraction. Specimens sharing
//! (position, condition, result) form one stratum.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rusqlite::params;
use serde::Serialize;
use tracing::{debug, info, warn};

use tessera_core::{Result, TesseraError};

use crate::store::{db_err, Store};

// ── Dates ───────────────────────────────────────────────────────────────────

/// The date formats found in clinical tables, tried in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateValuation {
    /// Hyphen-separated integers, `YYYY-MM-DD` and shorter.
    Iso,
    /// A plain number on a shared axis.
    Numeric,
    /// A string ending in `timepoint <N>`.
    Timepoint,
}

/// A parsed date; only values from the same valuation are compared.
#[derive(Debug, Clone, PartialEq, PartialOrd)]
pub enum DateValue {
    Iso(Vec<u64>),
    Numeric(f64),
    Timepoint(u64),
}

impl DateValuation {
    pub const ORDER: [DateValuation; 3] = [DateValuation::Iso, DateValuation::Numeric, DateValuation::Timepoint];

    pub fn value(&self, date: &str) -> Option<DateValue> {
        match self {
            DateValuation::Iso => {
                let parts: Vec<&str> = date.trim().split('-').collect();
                if parts.len() < 2 {
                    return None;
                }
                parts
                    .iter()
                    .map(|p| {
                        if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) {
                            p.parse().ok()
                        } else {
                            None
                        }
                    })
                    .collect::<Option<Vec<u64>>>()
                    .map(DateValue::Iso)
            }
            DateValuation::Numeric => date
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(DateValue::Numeric),
            DateValuation::Timepoint => {
                const MARKER: &str = "timepoint ";
                let at = date.rfind(MARKER)?;
                let digits = &date[at + MARKER.len()..];
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                digits.parse().ok().map(DateValue::Timepoint)
            }
        }
    }

    /// The first valuation that parses every date, or `None`.
    pub fn select(dates: &[&str]) -> Option<DateValuation> {
        Self::ORDER
            .into_iter()
            .find(|v| dates.iter().all(|d| v.value(d).is_some()))
    }
}

fn compare(a: &DateValue, b: &DateValue) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

// ── Positions ───────────────────────────────────────────────────────────────

/// Where a specimen's extraction falls among its subject's interventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TemporalPosition {
    BeforeIntervention,
    BetweenInterventions,
    AfterIntervention,
}

impl TemporalPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemporalPosition::BeforeIntervention => "Before intervention",
            TemporalPosition::BetweenInterventions => "Between interventions",
            TemporalPosition::AfterIntervention => "After intervention",
        }
    }
}

impl fmt::Display for TemporalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemporalPosition {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Before intervention" => Ok(TemporalPosition::BeforeIntervention),
            "Between interventions" => Ok(TemporalPosition::BetweenInterventions),
            "After intervention" => Ok(TemporalPosition::AfterIntervention),
            other => Err(TesseraError::Parse(format!("unknown temporal position '{}'", other))),
        }
    }
}

/// Outcome of placing one set of events in time.
#[derive(Debug, Clone, PartialEq)]
pub enum Placement<T> {
    Placed(T),
    /// No single valuation parses every date involved.
    Unordered,
}

/// Position of an extraction among intervention dates. `None` without
/// interventions; an intervention on the extraction date counts as prior.
pub fn interventional_position(interventions: &[&str], extraction: &str) -> Placement<Option<TemporalPosition>> {
    if interventions.is_empty() {
        return Placement::Placed(None);
    }
    let mut dates = interventions.to_vec();
    dates.push(extraction);
    let Some(valuation) = DateValuation::select(&dates) else {
        return Placement::Unordered;
    };
    let values: Vec<DateValue> = dates.iter().filter_map(|d| valuation.value(d)).collect();
    let (extraction, interventions) = match values.split_last() {
        Some(split) => split,
        None => return Placement::Unordered,
    };
    let earlier = interventions
        .iter()
        .filter(|v| compare(v, extraction) != Ordering::Greater)
        .count();
    let later = interventions.len() - earlier;
    let position = if earlier > 0 && later > 0 {
        TemporalPosition::BetweenInterventions
    } else if earlier == 0 {
        TemporalPosition::BeforeIntervention
    } else {
        TemporalPosition::AfterIntervention
    };
    Placement::Placed(Some(position))
}

/// A diagnosis event of a subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub condition: String,
    pub result: String,
    pub date: String,
}

/// The earliest diagnosis dated on or after extraction.
pub fn diagnostic_state<'a>(extraction: &str, diagnoses: &'a [Diagnosis]) -> Placement<Option<&'a Diagnosis>> {
    if diagnoses.is_empty() {
        return Placement::Placed(None);
    }
    let mut dates: Vec<&str> = vec![extraction];
    dates.extend(diagnoses.iter().map(|d| d.date.as_str()));
    let Some(valuation) = DateValuation::select(&dates) else {
        return Placement::Unordered;
    };
    let Some(extraction) = valuation.value(extraction) else {
        return Placement::Unordered;
    };
    let mut dated: Vec<(DateValue, &Diagnosis)> = diagnoses
        .iter()
        .filter_map(|d| valuation.value(&d.date).map(|v| (v, d)))
        .collect();
    dated.sort_by(|a, b| compare(&a.0, &b.0));
    Placement::Placed(
        dated
            .into_iter()
            .find(|(v, _)| compare(v, &extraction) != Ordering::Less)
            .map(|(_, d)| d),
    )
}

// ── Strata ──────────────────────────────────────────────────────────────────

/// (position, condition, result); `None` parts are stored as empty strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StratumKey {
    pub position: Option<TemporalPosition>,
    pub condition: Option<String>,
    pub result: Option<String>,
}

impl StratumKey {
    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.condition.is_none() && self.result.is_none()
    }

    /// Inverse of the empty-string storage of `sample_strata` columns.
    fn from_stored(position: &str, condition: &str, result: &str) -> Self {
        let nonempty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        StratumKey {
            position: position.parse().ok(),
            condition: nonempty(condition),
            result: nonempty(result),
        }
    }

    /// Non-empty parts joined with `; `, or `unlabeled`.
    pub fn label(&self) -> String {
        let parts: Vec<&str> = [
            self.position.as_ref().map(TemporalPosition::as_str),
            self.condition.as_deref(),
            self.result.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();
        if parts.is_empty() {
            "unlabeled".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Everything needed to stratify one specimen.
#[derive(Debug, Clone)]
pub struct SpecimenEvents {
    pub specimen: String,
    pub extraction_date: String,
    pub interventions: Vec<String>,
    pub diagnoses: Vec<Diagnosis>,
}

impl SpecimenEvents {
    /// `None` when the specimen's dates cannot be ordered.
    pub fn stratum_key(&self) -> Option<StratumKey> {
        let interventions: Vec<&str> = self.interventions.iter().map(String::as_str).collect();
        let position = match interventional_position(&interventions, &self.extraction_date) {
            Placement::Placed(p) => p,
            Placement::Unordered => return None,
        };
        let diagnosis = match diagnostic_state(&self.extraction_date, &self.diagnoses) {
            Placement::Placed(d) => d,
            Placement::Unordered => return None,
        };
        let nonempty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Some(StratumKey {
            position,
            condition: diagnosis.and_then(|d| nonempty(&d.condition)),
            result: diagnosis.and_then(|d| nonempty(&d.result)),
        })
    }
}

/// A specimen's stratum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StratumAssignment {
    pub specimen: String,
    pub stratum: i64,
}

/// A stratum with its defining key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stratum {
    #[serde(rename = "stratum identifier")]
    pub identifier: i64,
    #[serde(rename = "local temporal position indicator")]
    pub position: String,
    #[serde(rename = "subject diagnosed condition")]
    pub condition: String,
    #[serde(rename = "subject diagnosed result")]
    pub result: String,
    #[serde(rename = "label")]
    pub label: String,
    #[serde(rename = "sample count")]
    pub sample_count: usize,
}

/// Assign stratum identifiers.
///
/// Keys already in `known` keep their identifier. Specimens are visited in
/// identifier order and unseen keys are numbered from `first_identifier` in
/// first-seen order, the all-empty key last. Specimens whose dates cannot be
/// ordered are left out.
pub fn assign_strata(
    specimens: &[SpecimenEvents],
    known: BTreeMap<StratumKey, i64>,
    first_identifier: i64,
) -> Vec<(StratumAssignment, StratumKey)> {
    let mut sorted: Vec<&SpecimenEvents> = specimens.iter().collect();
    sorted.sort_by(|a, b| a.specimen.cmp(&b.specimen));

    let mut keyed = Vec::with_capacity(sorted.len());
    for s in sorted {
        match s.stratum_key() {
            Some(key) => keyed.push((s, key)),
            None => warn!(specimen = %s.specimen, "no order among specimen dates, left unassigned"),
        }
    }

    let mut identifiers = known;
    let mut next = first_identifier;
    let mut assignments = Vec::with_capacity(keyed.len());
    for empty_pass in [false, true] {
        for (s, key) in keyed.iter().filter(|(_, k)| k.is_empty() == empty_pass) {
            let id = *identifiers.entry(key.clone()).or_insert_with(|| {
                next += 1;
                next - 1
            });
            assignments.push((
                StratumAssignment {
                    specimen: s.specimen.clone(),
                    stratum: id,
                },
                key.clone(),
            ));
        }
    }
    assignments
}

impl Store {
    fn specimen_events(&self, specimen: &str) -> Result<SpecimenEvents> {
        let (subject, extraction_date): (Option<String>, Option<String>) = self
            .conn
            .query_row(
                "SELECT source, extraction_date FROM specimen_collection_process WHERE specimen = ?1",
                params![specimen],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_err)?;
        let subject = subject.unwrap_or_default();

        let interventions = {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT date FROM intervention WHERE subject = ?1")
                .map_err(db_err)?;
            let rows = stmt.query_map(params![subject], |row| row.get(0)).map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<String>>>().map_err(db_err)?
        };
        let diagnoses = {
            let mut stmt = self
                .conn
                .prepare_cached(
                    "SELECT diagnosed_condition, diagnosis, date_of_evidence FROM diagnosis WHERE subject = ?1",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![subject], |row| {
                    Ok(Diagnosis {
                        condition: row.get(0)?,
                        result: row.get(1)?,
                        date: row.get(2)?,
                    })
                })
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };
        Ok(SpecimenEvents {
            specimen: specimen.to_string(),
            extraction_date: extraction_date.unwrap_or_default(),
            interventions,
            diagnoses,
        })
    }

    /// Stratify every specimen not yet assigned. Returns the new assignments.
    pub fn create_strata(&mut self) -> Result<Vec<StratumAssignment>> {
        let assigned: Vec<String> = {
            let mut stmt = self.conn.prepare_cached("SELECT sample FROM sample_strata").map_err(db_err)?;
            let rows = stmt.query_map([], |row| row.get(0)).map_err(db_err)?;
            rows.collect::<rusqlite::Result<_>>().map_err(db_err)?
        };
        let unassigned: Vec<String> = self
            .all_specimens()?
            .into_iter()
            .filter(|s| !assigned.contains(s))
            .collect();
        let events = unassigned
            .iter()
            .map(|s| self.specimen_events(s))
            .collect::<Result<Vec<_>>>()?;
        let known: BTreeMap<StratumKey, i64> = {
            let mut stmt = self
                .conn
                .prepare_cached(
                    "SELECT DISTINCT stratum_identifier, local_temporal_position_indicator, \
                     subject_diagnosed_condition, subject_diagnosed_result FROM sample_strata",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| {
                    let key = StratumKey::from_stored(
                        &row.get::<_, String>(1)?,
                        &row.get::<_, String>(2)?,
                        &row.get::<_, String>(3)?,
                    );
                    Ok((key, row.get::<_, i64>(0)?))
                })
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<_>>().map_err(db_err)?
        };
        let last = known.values().copied().max().unwrap_or(0);

        let assignments = assign_strata(&events, known, last + 1);
        let tx = self.conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO sample_strata (stratum_identifier, sample, local_temporal_position_indicator, \
                     subject_diagnosed_condition, subject_diagnosed_result) VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT DO NOTHING",
                )
                .map_err(db_err)?;
            for (a, key) in &assignments {
                stmt.execute(params![
                    a.stratum,
                    a.specimen,
                    key.position.map(|p| p.as_str()).unwrap_or(""),
                    key.condition.as_deref().unwrap_or(""),
                    key.result.as_deref().unwrap_or(""),
                ])
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        info!(
            "assigned {} / {} samples to an annotated stratum",
            assignments.len(),
            unassigned.len()
        );
        Ok(assignments.into_iter().map(|(a, _)| a).collect())
    }

    /// Stratum assignments of the specimens collected for `study`.
    pub fn stratum_assignments(&self, study: &str) -> Result<Vec<StratumAssignment>> {
        let components = self.study_components(study)?;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT ss.sample, ss.stratum_identifier FROM sample_strata ss \
                 JOIN specimen_collection_process scp ON scp.specimen = ss.sample \
                 WHERE scp.study = ?1 ORDER BY ss.sample",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![components.collection], |row| {
                Ok(StratumAssignment {
                    specimen: row.get(0)?,
                    stratum: row.get(1)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// The strata of `study` with sample counts, by identifier.
    pub fn strata(&self, study: &str) -> Result<Vec<Stratum>> {
        let components = self.study_components(study)?;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT ss.stratum_identifier, ss.local_temporal_position_indicator, \
                 ss.subject_diagnosed_condition, ss.subject_diagnosed_result, COUNT(*) \
                 FROM sample_strata ss \
                 JOIN specimen_collection_process scp ON scp.specimen = ss.sample \
                 WHERE scp.study = ?1 \
                 GROUP BY ss.stratum_identifier, ss.local_temporal_position_indicator, \
                 ss.subject_diagnosed_condition, ss.subject_diagnosed_result \
                 ORDER BY ss.stratum_identifier",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![components.collection], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(db_err)?;
        let mut strata = Vec::new();
        for row in rows {
            let (identifier, position, condition, result, count) = row.map_err(db_err)?;
            let key = StratumKey::from_stored(&position, &condition, &result);
            strata.push(Stratum {
                identifier,
                label: key.label(),
                position,
                condition,
                result,
                sample_count: count as usize,
            });
        }
        debug!(study, strata = strata.len(), "read strata");
        Ok(strata)
    }
}
