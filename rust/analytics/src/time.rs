//! Calendar date ranges applied to `DATE(s.created_at)`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

const ALL_PERIODS_LABEL: &str = "Todos os períodos";

/// Inclusive bounds on the sale date; either side may be open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DateRange {
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start_date: Option<NaiveDate>, end_date: Option<NaiveDate>) -> Self {
        Self {
            start_date,
            end_date,
        }
    }

    pub fn check(&self) -> Result<(), String> {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) if start > end => Err(format!(
                "start_date {start} is after end_date {end}"
            )),
            _ => Ok(()),
        }
    }

    /// Human readable label shown on the KPI dashboard.
    pub fn label(&self) -> String {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => format!("{start} a {end}"),
            _ => ALL_PERIODS_LABEL.to_string(),
        }
    }
}

/// A closed period, both bounds required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, String> {
        if start > end {
            return Err(format!("period start {start} is after end {end}"));
        }
        Ok(Self { start, end })
    }

    pub fn as_range(&self) -> DateRange {
        DateRange::new(Some(self.start), Some(self.end))
    }
}
