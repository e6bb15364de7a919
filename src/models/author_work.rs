//! The `AuthorWork` entity and astronomical year arithmetic.
//!
//! Historical composition dates for philosophical works routinely predate
//! year 1 CE. Astronomical year numbering folds BCE/CE into a single signed
//! axis so ordering and interval arithmetic stay ordinary integer math:
//! 1 BCE is year 0, 2 BCE is year -1, and so on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Era {
    Bce,
    Ce,
}

/// An `(era, year)` pair as given by a human source, e.g. "384 BCE".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoricalYear {
    pub era: Era,
    pub year: u32,
}

impl HistoricalYear {
    pub fn ce(year: u32) -> Self {
        Self { era: Era::Ce, year }
    }

    pub fn bce(year: u32) -> Self {
        Self { era: Era::Bce, year }
    }

    /// Fold into astronomical year numbering: 1 BCE -> 0, 2 BCE -> -1, 1 CE -> 1.
    pub fn to_astronomical(self) -> i32 {
        match self.era {
            Era::Ce => self.year as i32,
            Era::Bce => 1 - self.year as i32,
        }
    }

    pub fn from_astronomical(year: i32) -> Self {
        if year > 0 {
            Self::ce(year as u32)
        } else {
            Self::bce((1 - year) as u32)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorWorkCreate {
    pub author: String,
    pub title: String,
    pub page_id: Option<Uuid>,
    pub composed_astronomical_year: Option<i32>,
    pub period: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorWork {
    pub id: Uuid,
    pub author: String,
    pub title: String,
    pub page_id: Option<Uuid>,
    pub composed_astronomical_year: Option<i32>,
    pub period: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_bce_is_year_zero() {
        assert_eq!(HistoricalYear::bce(1).to_astronomical(), 0);
    }

    #[test]
    fn two_bce_is_negative_one() {
        assert_eq!(HistoricalYear::bce(2).to_astronomical(), -1);
    }

    #[test]
    fn ce_years_are_unchanged() {
        assert_eq!(HistoricalYear::ce(1879).to_astronomical(), 1879);
    }

    #[test]
    fn roundtrips_through_astronomical_form() {
        for (era_year, expected) in [
            (HistoricalYear::bce(384), -383),
            (HistoricalYear::ce(1637), 1637),
            (HistoricalYear::bce(1), 0),
        ] {
            let astro = era_year.to_astronomical();
            assert_eq!(astro, expected);
            assert_eq!(HistoricalYear::from_astronomical(astro), era_year);
        }
    }
}
