use chrono::NaiveDate;
use std::collections::HashMap;

use crate::db::models::Contest;

/// Periods ordered by their earliest contest date.
#[derive(Debug, Clone, Default)]
pub struct PeriodCalendar {
    starts: HashMap<String, NaiveDate>,
    order: Vec<String>,
}

impl PeriodCalendar {
    pub fn from_contests(contests: &[Contest]) -> Self {
        let mut cal = PeriodCalendar::default();
        cal.extend(contests);
        cal
    }

    /// Add periods seen in `contests`. Known periods keep their start date
    /// unless an earlier contest shows up.
    pub fn extend(&mut self, contests: &[Contest]) {
        for c in contests {
            self.starts
                .entry(c.period.clone())
                .and_modify(|d| {
                    if c.contest_date < *d {
                        *d = c.contest_date;
                    }
                })
                .or_insert(c.contest_date);
        }
        let mut order: Vec<(NaiveDate, String)> =
            self.starts.iter().map(|(p, d)| (*d, p.clone())).collect();
        order.sort();
        self.order = order.into_iter().map(|(_, p)| p).collect();
    }

    pub fn start_of(&self, period: &str) -> Option<NaiveDate> {
        self.starts.get(period).copied()
    }

    pub fn latest(&self) -> Option<&str> {
        self.order.last().map(String::as_str)
    }

    /// The period immediately before `period`. An unknown period is treated
    /// as newer than everything known, so its prior is the latest period.
    pub fn prior(&self, period: &str) -> Option<&str> {
        match self.order.iter().position(|p| p == period) {
            Some(0) => None,
            Some(i) => Some(self.order[i - 1].as_str()),
            None => self.latest(),
        }
    }

}
