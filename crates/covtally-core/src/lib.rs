//! Core domain model and percent-change enrichment for covtally.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "covtally-core";

/// One county's reported observation for one date.
///
/// Raw parsed rows carry the percent-change fields as `None`; only the
/// enrichment pass populates them. (state, county, date) is unique in a
/// well-formed dataset but inherited from source quality, not enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountyRow {
    pub date: NaiveDate,
    pub county: String,
    pub state: String,
    pub fips: String,
    pub cases: Option<u32>,
    pub deaths: Option<u32>,
    pub cases_percent_change: Option<f64>,
    pub deaths_percent_change: Option<f64>,
}

impl CountyRow {
    pub fn new(
        date: NaiveDate,
        county: impl Into<String>,
        state: impl Into<String>,
        fips: impl Into<String>,
        cases: Option<u32>,
        deaths: Option<u32>,
    ) -> Self {
        Self {
            date,
            county: county.into(),
            state: state.into(),
            fips: fips.into(),
            cases,
            deaths,
            cases_percent_change: None,
            deaths_percent_change: None,
        }
    }
}

/// Signed period-over-period change in percent. Callers guard `previous > 0`.
pub fn percent_change(previous: f64, current: f64) -> f64 {
    (current - previous) / previous * 100.0
}

/// Sort rows into contiguous (state, county) groups ascending by date and
/// compute percent change against each row's chronological predecessor.
///
/// The first row of every group gets exactly `0.0` for both changes and
/// becomes the baseline. A missing previous value, or a previous value of
/// zero, yields `0.0` rather than a division; a row whose own count is
/// missing keeps its change unset and the pass moves on. The baseline
/// advances only on counts that are present, so a gap row does not reset
/// the next row's change.
pub fn enrich(mut rows: Vec<CountyRow>) -> Vec<CountyRow> {
    rows.sort_by(|a, b| {
        a.state
            .cmp(&b.state)
            .then_with(|| a.county.cmp(&b.county))
            .then_with(|| a.date.cmp(&b.date))
    });

    let mut prev_state = String::new();
    let mut prev_county = String::new();
    let mut prev_cases: Option<u32> = None;
    let mut prev_deaths: Option<u32> = None;
    let mut first_group = true;

    for row in &mut rows {
        if first_group || row.state != prev_state || row.county != prev_county {
            first_group = false;
            prev_state = row.state.clone();
            prev_county = row.county.clone();
            prev_cases = row.cases;
            prev_deaths = row.deaths;
            row.cases_percent_change = Some(0.0);
            row.deaths_percent_change = Some(0.0);
            continue;
        }

        if let Some(current) = row.deaths {
            row.deaths_percent_change = Some(match prev_deaths {
                Some(previous) if previous > 0 => {
                    percent_change(f64::from(previous), f64::from(current))
                }
                _ => 0.0,
            });
        }
        if let Some(current) = row.cases {
            row.cases_percent_change = Some(match prev_cases {
                Some(previous) if previous > 0 => {
                    percent_change(f64::from(previous), f64::from(current))
                }
                _ => 0.0,
            });
        }

        if row.cases.is_some() {
            prev_cases = row.cases;
        }
        if row.deaths.is_some() {
            prev_deaths = row.deaths;
        }
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: &str) -> NaiveDate {
        NaiveDate::parse_from_str(d, "%Y-%m-%d").expect("test date")
    }

    fn row(d: &str, county: &str, state: &str, cases: u32, deaths: u32) -> CountyRow {
        CountyRow::new(date(d), county, state, "13089", Some(cases), Some(deaths))
    }

    #[test]
    fn percent_change_is_exact_and_signed() {
        assert_eq!(percent_change(100.0, 80.0), -20.0);
        assert_eq!(percent_change(100.0, 150.0), 50.0);
        assert_eq!(percent_change(50.0, 50.0), 0.0);
    }

    #[test]
    fn first_row_of_every_group_has_zero_change() {
        let rows = enrich(vec![
            row("2020-03-02", "DeKalb", "Georgia", 12, 1),
            row("2020-03-01", "DeKalb", "Georgia", 10, 1),
            row("2020-03-01", "Fulton", "Georgia", 4, 0),
        ]);

        let firsts: Vec<&CountyRow> = rows
            .iter()
            .filter(|r| r.date == date("2020-03-01"))
            .collect();
        assert_eq!(firsts.len(), 2);
        for first in firsts {
            assert_eq!(first.cases_percent_change, Some(0.0));
            assert_eq!(first.deaths_percent_change, Some(0.0));
        }
    }

    #[test]
    fn subsequent_rows_change_against_predecessor() {
        let rows = enrich(vec![
            row("2020-03-01", "DeKalb", "Georgia", 100, 10),
            row("2020-03-02", "DeKalb", "Georgia", 150, 8),
        ]);

        assert_eq!(rows[1].cases_percent_change, Some(50.0));
        assert_eq!(rows[1].deaths_percent_change, Some(-20.0));
    }

    #[test]
    fn zero_baseline_never_divides() {
        let rows = enrich(vec![
            row("2020-03-01", "Fulton", "Georgia", 0, 0),
            row("2020-03-02", "Fulton", "Georgia", 5, 2),
        ]);

        assert_eq!(rows[1].cases_percent_change, Some(0.0));
        assert_eq!(rows[1].deaths_percent_change, Some(0.0));
    }

    #[test]
    fn missing_current_count_leaves_change_unset() {
        let mut second = row("2020-03-02", "DeKalb", "Georgia", 0, 0);
        second.cases = None;
        second.deaths = None;
        let rows = enrich(vec![row("2020-03-01", "DeKalb", "Georgia", 10, 2), second]);

        assert_eq!(rows[1].cases_percent_change, None);
        assert_eq!(rows[1].deaths_percent_change, None);

        // The gap row does not disturb the baseline for the next row.
        let rows = enrich(vec![
            row("2020-03-01", "DeKalb", "Georgia", 10, 2),
            {
                let mut r = row("2020-03-02", "DeKalb", "Georgia", 0, 0);
                r.cases = None;
                r.deaths = None;
                r
            },
            row("2020-03-03", "DeKalb", "Georgia", 20, 4),
        ]);
        assert_eq!(rows[2].cases_percent_change, Some(100.0));
        assert_eq!(rows[2].deaths_percent_change, Some(100.0));
    }

    #[test]
    fn groups_are_contiguous_and_date_ascending() {
        let rows = enrich(vec![
            row("2020-03-03", "Fulton", "Georgia", 3, 0),
            row("2020-03-01", "DeKalb", "Georgia", 1, 0),
            row("2020-03-01", "Fulton", "Georgia", 1, 0),
            row("2020-03-02", "DeKalb", "Georgia", 2, 0),
            row("2020-03-01", "Autauga", "Alabama", 1, 0),
        ]);

        let keys: Vec<(&str, &str)> = rows
            .iter()
            .map(|r| (r.state.as_str(), r.county.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("Alabama", "Autauga"),
                ("Georgia", "DeKalb"),
                ("Georgia", "DeKalb"),
                ("Georgia", "Fulton"),
                ("Georgia", "Fulton"),
            ]
        );
        for pair in rows.windows(2) {
            if pair[0].state == pair[1].state && pair[0].county == pair[1].county {
                assert!(pair[0].date < pair[1].date);
            }
        }
    }

    #[test]
    fn identical_county_name_in_two_states_is_two_groups() {
        let rows = enrich(vec![
            row("2020-03-01", "Washington", "Alabama", 10, 1),
            row("2020-03-01", "Washington", "Georgia", 20, 2),
            row("2020-03-02", "Washington", "Georgia", 30, 2),
        ]);

        assert_eq!(rows[1].cases_percent_change, Some(0.0));
        assert_eq!(rows[2].cases_percent_change, Some(50.0));
    }
}
