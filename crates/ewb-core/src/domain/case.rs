//! Cases and case collections.
//!
//! A [`Case`] is one historical weather event loaded from the static case
//! catalog. Collections are immutable; every selection returns a new
//! collection.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::error::ConfigurationError;
use super::interval::DateInterval;

/// Numeric case identifier from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(pub u32);

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event categories evaluated by the benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    HeatWave,
    Freeze,
    SevereConvection,
    AtmosphericRiver,
    TropicalCyclone,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::HeatWave,
        EventType::Freeze,
        EventType::SevereConvection,
        EventType::AtmosphericRiver,
        EventType::TropicalCyclone,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::HeatWave => "heat_wave",
            EventType::Freeze => "freeze",
            EventType::SevereConvection => "severe_convection",
            EventType::AtmosphericRiver => "atmospheric_river",
            EventType::TropicalCyclone => "tropical_cyclone",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| ConfigurationError::UnknownEventType(s.to_string()))
    }
}

/// Geographic extent of a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Region {
    BoundingBox {
        latitude_min: f64,
        latitude_max: f64,
        longitude_min: f64,
        longitude_max: f64,
    },
    CenteredRegion {
        latitude: f64,
        longitude: f64,
        bounding_box_degrees: f64,
    },
}

/// One historical event to evaluate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub case_id: CaseId,
    pub title: String,
    pub event_type: EventType,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub location: Region,
}

impl Case {
    /// The `[start_date, end_date]` window of the case.
    pub fn interval(&self) -> Result<DateInterval, ConfigurationError> {
        DateInterval::new(self.start_date, self.end_date)
    }
}

/// Predicates accepted by [`CaseCollection::select`].
#[derive(Debug, Clone)]
pub enum CaseSelector {
    EventType(EventType),
    CaseIds(BTreeSet<CaseId>),
    CaseIdRange(RangeInclusive<u32>),
    /// `end_date <= date`
    EndsOnOrBefore(NaiveDate),
    /// `start_date > date`
    StartsAfter(NaiveDate),
    /// Case window fully enclosed by the interval.
    ContainedIn(DateInterval),
}

impl CaseSelector {
    pub fn matches(&self, case: &Case) -> bool {
        match self {
            CaseSelector::EventType(event_type) => case.event_type == *event_type,
            CaseSelector::CaseIds(ids) => ids.contains(&case.case_id),
            CaseSelector::CaseIdRange(range) => range.contains(&case.case_id.0),
            CaseSelector::EndsOnOrBefore(date) => case.end_date <= *date,
            CaseSelector::StartsAfter(date) => case.start_date > *date,
            CaseSelector::ContainedIn(window) => case
                .interval()
                .map(|iv| window.contains(&iv))
                .unwrap_or(false),
        }
    }
}

/// Early/late split of a collection around a cutoff date.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    /// `end_date <= cutoff`
    pub early: CaseCollection,
    /// `start_date > cutoff`
    pub late: CaseCollection,
    /// Cases spanning the cutoff. Evaluated by neither side.
    pub straddling: CaseCollection,
}

/// An ordered, immutable set of cases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseCollection {
    cases: Vec<Case>,
}

impl CaseCollection {
    pub fn new(cases: Vec<Case>) -> Self {
        Self { cases }
    }

    /// Load a JSON catalog (an array of cases).
    pub fn load_json(path: &Path) -> Result<Self, ConfigurationError> {
        let catalog_err = |reason: String| ConfigurationError::Catalog {
            path: path.to_path_buf(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| catalog_err(e.to_string()))?;
        let cases: Vec<Case> = serde_json::from_str(&raw).map_err(|e| catalog_err(e.to_string()))?;

        let mut seen = BTreeSet::new();
        for case in &cases {
            if !seen.insert(case.case_id) {
                return Err(catalog_err(format!("duplicate case_id {}", case.case_id)));
            }
            case.interval()
                .map_err(|e| catalog_err(format!("case {}: {e}", case.case_id)))?;
        }
        Ok(Self { cases })
    }

    pub fn cases(&self) -> &[Case] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn ids(&self) -> BTreeSet<CaseId> {
        self.cases.iter().map(|c| c.case_id).collect()
    }

    pub fn get(&self, id: CaseId) -> Option<&Case> {
        self.cases.iter().find(|c| c.case_id == id)
    }

    /// Cases matching `selector`, in catalog order.
    pub fn select(&self, selector: &CaseSelector) -> CaseCollection {
        CaseCollection {
            cases: self
                .cases
                .iter()
                .filter(|c| selector.matches(c))
                .cloned()
                .collect(),
        }
    }

    /// Split around `cutoff`. A case ending exactly on the cutoff is early.
    pub fn partition(&self, cutoff: NaiveDate) -> Partition {
        let mut partition = Partition::default();
        for case in &self.cases {
            if case.end_date <= cutoff {
                partition.early.cases.push(case.clone());
            } else if case.start_date > cutoff {
                partition.late.cases.push(case.clone());
            } else {
                partition.straddling.cases.push(case.clone());
            }
        }
        partition
    }
}

impl FromIterator<Case> for CaseCollection {
    fn from_iter<I: IntoIterator<Item = Case>>(iter: I) -> Self {
        Self {
            cases: iter.into_iter().collect(),
        }
    }
}
