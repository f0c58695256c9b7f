//! Read-only derivations over the forecast store and spline curves
//!
//! Everything here is a pure view: daily totals, peaks, momentary power and
//! near-term energy. The optional hard limit is applied to every *served*
//! value at this boundary; cached data is never mutated by it.

use crate::spline::SplineSet;
use crate::store::{EstimateField, ForecastInterval, ForecastStore, utc_day_start};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Half-hourly breakdown of one forecast day
#[derive(Debug, Clone)]
pub struct DayDetail {
    /// Local calendar date of the day
    pub date: NaiveDate,
    /// Total energy for the day, kWh
    pub total_kwh: f64,
    /// The day's half-hour intervals, ascending
    pub periods: Vec<ForecastInterval>,
}

/// Read-only aggregate view over the engine's current state
pub struct Aggregates<'a> {
    store: &'a ForecastStore,
    splines: &'a SplineSet,
    /// Serve-side clip, watts
    hard_limit_w: Option<f64>,
    tz: Tz,
}

impl<'a> Aggregates<'a> {
    /// Build a view; `hard_limit_w` clips every served value
    pub fn new(
        store: &'a ForecastStore,
        splines: &'a SplineSet,
        hard_limit_w: Option<f64>,
        tz: Tz,
    ) -> Self {
        Self {
            store,
            splines,
            hard_limit_w,
            tz,
        }
    }

    /// Start of the local day `offset` days from today, as a UTC instant
    pub fn day_start_utc(&self, now: DateTime<Utc>, offset: i64) -> DateTime<Utc> {
        let local_date = now.with_timezone(&self.tz).date_naive() + Duration::days(offset);
        match self
            .tz
            .from_local_datetime(&local_date.and_hms_opt(0, 0, 0).unwrap_or_default())
            .earliest()
        {
            Some(local_midnight) => local_midnight.with_timezone(&Utc),
            None => utc_day_start(now) + Duration::days(offset),
        }
    }

    /// Total forecast energy for a local day, kWh
    pub fn daily_total(
        &self,
        now: DateTime<Utc>,
        day_offset: i64,
        field: EstimateField,
        site: Option<&str>,
    ) -> f64 {
        let start = self.day_start_utc(now, day_offset);
        let end = self.day_start_utc(now, day_offset + 1);
        self.store
            .query(site, start, end, false)
            .iter()
            .map(|interval| self.clip_kw(interval.value(field)) * 0.5)
            .sum()
    }

    /// Peak forecast power for a local day, watts, with its period start.
    ///
    /// Ties break to the earliest period. `None` when the day has no data.
    pub fn peak(
        &self,
        now: DateTime<Utc>,
        day_offset: i64,
        field: EstimateField,
        site: Option<&str>,
    ) -> Option<(f64, DateTime<Utc>)> {
        let start = self.day_start_utc(now, day_offset);
        let end = self.day_start_utc(now, day_offset + 1);
        let mut best: Option<(f64, DateTime<Utc>)> = None;
        for interval in self.store.query(site, start, end, false) {
            let value = interval.value(field);
            let is_better = match best {
                Some((current, _)) => value > current,
                None => true,
            };
            if is_better {
                best = Some((value, interval.period_start));
            }
        }
        best.map(|(kw, at)| (self.clip_w(kw * 1000.0), at))
    }

    /// Momentary power at an instant, watts, never negative
    pub fn power_at(
        &self,
        at: DateTime<Utc>,
        field: EstimateField,
        site: Option<&str>,
    ) -> f64 {
        let kw = self.splines.curve(site, field).value_at(at);
        self.clip_w((kw * 1000.0).max(0.0))
    }

    /// Energy from `now` over the next `hours` hours, kWh.
    ///
    /// Integrates the continuous curve from the query instant, unlike the
    /// wall-clock-aligned hour sums below; the two can legitimately differ.
    pub fn next_hours_energy(
        &self,
        now: DateTime<Utc>,
        hours: f64,
        field: EstimateField,
        site: Option<&str>,
    ) -> f64 {
        let to = now + Duration::seconds((hours * 3600.0) as i64);
        self.splines
            .curve(site, field)
            .energy_between(now, to, self.limit_kw())
    }

    /// Energy remaining between `now` and local midnight, kWh
    pub fn remaining_today(
        &self,
        now: DateTime<Utc>,
        field: EstimateField,
        site: Option<&str>,
    ) -> f64 {
        let midnight = self.day_start_utc(now, 1);
        self.splines
            .curve(site, field)
            .energy_between(now, midnight, self.limit_kw())
    }

    /// Energy within the current wall-clock hour, kWh: the sum of the two
    /// discrete half-hour samples inside it
    pub fn this_hour_energy(
        &self,
        now: DateTime<Utc>,
        field: EstimateField,
        site: Option<&str>,
    ) -> f64 {
        let hour_start = hour_start_utc(now);
        self.hour_sum(hour_start, field, site)
    }

    /// Energy within the next wall-clock hour, kWh
    pub fn next_hour_energy(
        &self,
        now: DateTime<Utc>,
        field: EstimateField,
        site: Option<&str>,
    ) -> f64 {
        let hour_start = hour_start_utc(now) + Duration::hours(1);
        self.hour_sum(hour_start, field, site)
    }

    /// Half-hourly breakdown of a local day, for forecast display
    pub fn day_detail(
        &self,
        now: DateTime<Utc>,
        day_offset: i64,
        site: Option<&str>,
    ) -> DayDetail {
        let start = self.day_start_utc(now, day_offset);
        let end = self.day_start_utc(now, day_offset + 1);
        let periods = self.store.query(site, start, end, false);
        let total_kwh = periods
            .iter()
            .map(|interval| self.clip_kw(interval.pv_estimate) * 0.5)
            .sum();
        DayDetail {
            date: now.with_timezone(&self.tz).date_naive() + Duration::days(day_offset),
            total_kwh,
            periods,
        }
    }

    fn hour_sum(&self, hour_start: DateTime<Utc>, field: EstimateField, site: Option<&str>) -> f64 {
        self.store
            .query(site, hour_start, hour_start + Duration::hours(1), false)
            .iter()
            .map(|interval| self.clip_kw(interval.value(field)) * 0.5)
            .sum()
    }

    fn limit_kw(&self) -> Option<f64> {
        self.hard_limit_w.map(|w| w / 1000.0)
    }

    fn clip_kw(&self, kw: f64) -> f64 {
        self.limit_kw().map_or(kw, |cap| kw.min(cap))
    }

    fn clip_w(&self, w: f64) -> f64 {
        self.hard_limit_w.map_or(w, |cap| w.min(cap))
    }
}

/// Start of the wall-clock hour containing `at`
fn hour_start_utc(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dampening::DampeningTable;
    use crate::solcast::RawInterval;
    use std::collections::BTreeSet;

    fn setup(dir: &tempfile::TempDir, now: DateTime<Utc>) -> (ForecastStore, SplineSet) {
        let mut store = ForecastStore::load(
            dir.path().join("solcast.json"),
            dir.path().join("solcast-undampened.json"),
            BTreeSet::new(),
        )
        .unwrap();
        let table = DampeningTable::load(dir.path().join("dampening.json"));

        // A simple day: 1 kW at 10:00, 3 kW at 10:30, 2 kW at 11:00
        let fetched = vec![
            raw_at(now, 10, 0, 1.0),
            raw_at(now, 10, 30, 3.0),
            raw_at(now, 11, 0, 2.0),
        ];
        store
            .merge("s1", &fetched, now, &table, chrono_tz::UTC)
            .unwrap();

        let day = utc_day_start(now);
        let splines = SplineSet::build(&store, &["s1".to_string()], day);
        (store, splines)
    }

    fn raw_at(now: DateTime<Utc>, hour: u32, minute: u32, kw: f64) -> RawInterval {
        let at = utc_day_start(now) + Duration::hours(i64::from(hour))
            + Duration::minutes(i64::from(minute));
        RawInterval {
            period_start: at,
            pv_estimate: kw,
            pv_estimate10: kw * 0.5,
            pv_estimate90: kw * 1.5,
        }
    }

    fn noon() -> DateTime<Utc> {
        use chrono::TimeZone as _;
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn daily_total_converts_power_to_energy() {
        let dir = tempfile::tempdir().unwrap();
        let (store, splines) = setup(&dir, noon());
        let agg = Aggregates::new(&store, &splines, None, chrono_tz::UTC);
        let total = agg.daily_total(noon(), 0, EstimateField::Estimate, None);
        assert!((total - 3.0).abs() < 1e-9, "total was {}", total);
    }

    #[test]
    fn peak_reports_watts_and_period() {
        let dir = tempfile::tempdir().unwrap();
        let (store, splines) = setup(&dir, noon());
        let agg = Aggregates::new(&store, &splines, None, chrono_tz::UTC);
        let (watts, at) = agg.peak(noon(), 0, EstimateField::Estimate, None).unwrap();
        assert!((watts - 3000.0).abs() < 1e-9);
        assert_eq!(at, utc_day_start(noon()) + Duration::minutes(630));
    }

    #[test]
    fn peak_tie_breaks_to_earliest() {
        let dir = tempfile::tempdir().unwrap();
        let now = noon();
        let mut store = ForecastStore::load(
            dir.path().join("solcast.json"),
            dir.path().join("solcast-undampened.json"),
            BTreeSet::new(),
        )
        .unwrap();
        let table = DampeningTable::load(dir.path().join("dampening.json"));
        store
            .merge(
                "s1",
                &[raw_at(now, 10, 0, 2.0), raw_at(now, 13, 0, 2.0)],
                now,
                &table,
                chrono_tz::UTC,
            )
            .unwrap();
        let splines = SplineSet::build(&store, &["s1".to_string()], utc_day_start(now));
        let agg = Aggregates::new(&store, &splines, None, chrono_tz::UTC);
        let (_, at) = agg.peak(now, 0, EstimateField::Estimate, None).unwrap();
        assert_eq!(at, utc_day_start(now) + Duration::hours(10));
    }

    #[test]
    fn peak_of_empty_day_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let (store, splines) = setup(&dir, noon());
        let agg = Aggregates::new(&store, &splines, None, chrono_tz::UTC);
        assert!(agg.peak(noon(), 5, EstimateField::Estimate, None).is_none());
    }

    #[test]
    fn power_matches_sample_at_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let (store, splines) = setup(&dir, noon());
        let agg = Aggregates::new(&store, &splines, None, chrono_tz::UTC);
        let at = utc_day_start(noon()) + Duration::minutes(630);
        let watts = agg.power_at(at, EstimateField::Estimate, None);
        assert!((watts - 3000.0).abs() < 1e-6, "watts was {}", watts);
    }

    #[test]
    fn hard_limit_clips_served_values_only() {
        let dir = tempfile::tempdir().unwrap();
        let (store, splines) = setup(&dir, noon());
        let agg = Aggregates::new(&store, &splines, Some(1500.0), chrono_tz::UTC);

        let at = utc_day_start(noon()) + Duration::minutes(630);
        assert!((agg.power_at(at, EstimateField::Estimate, None) - 1500.0).abs() < 1e-9);

        let (watts, _) = agg.peak(noon(), 0, EstimateField::Estimate, None).unwrap();
        assert!((watts - 1500.0).abs() < 1e-9);

        // 1.0 + min(3.0, 1.5) + min(2.0, 1.5), halved
        let total = agg.daily_total(noon(), 0, EstimateField::Estimate, None);
        assert!((total - 2.0).abs() < 1e-9, "total was {}", total);

        // The store itself still holds the unclipped values
        let stored = store.query(None, at, at + Duration::minutes(30), false);
        assert!((stored[0].pv_estimate - 3.0).abs() < 1e-9);
    }

    #[test]
    fn hour_sums_align_to_wall_clock() {
        let dir = tempfile::tempdir().unwrap();
        let (store, splines) = setup(&dir, noon());
        let agg = Aggregates::new(&store, &splines, None, chrono_tz::UTC);
        let at = utc_day_start(noon()) + Duration::hours(10) + Duration::minutes(10);
        // 10:00-11:00 holds 1.0 and 3.0 kW halves
        let this_hour = agg.this_hour_energy(at, EstimateField::Estimate, None);
        assert!((this_hour - 2.0).abs() < 1e-9);
        // 11:00-12:00 holds 2.0 and nothing
        let next_hour = agg.next_hour_energy(at, EstimateField::Estimate, None);
        assert!((next_hour - 1.0).abs() < 1e-9);
    }

    #[test]
    fn estimate_bands_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let (store, splines) = setup(&dir, noon());
        let agg = Aggregates::new(&store, &splines, None, chrono_tz::UTC);
        let total50 = agg.daily_total(noon(), 0, EstimateField::Estimate, None);
        let total10 = agg.daily_total(noon(), 0, EstimateField::Estimate10, None);
        let total90 = agg.daily_total(noon(), 0, EstimateField::Estimate90, None);
        assert!((total10 - total50 * 0.5).abs() < 1e-9);
        assert!((total90 - total50 * 1.5).abs() < 1e-9);
    }

    #[test]
    fn day_detail_lists_periods() {
        let dir = tempfile::tempdir().unwrap();
        let (store, splines) = setup(&dir, noon());
        let agg = Aggregates::new(&store, &splines, None, chrono_tz::UTC);
        let detail = agg.day_detail(noon(), 0, None);
        assert_eq!(detail.periods.len(), 3);
        assert!((detail.total_kwh - 3.0).abs() < 1e-9);
        assert_eq!(detail.date, noon().date_naive());
    }

    #[test]
    fn remaining_today_shrinks_through_the_day() {
        let dir = tempfile::tempdir().unwrap();
        let (store, splines) = setup(&dir, noon());
        let agg = Aggregates::new(&store, &splines, None, chrono_tz::UTC);
        let morning = utc_day_start(noon()) + Duration::hours(9);
        let evening = utc_day_start(noon()) + Duration::hours(18);
        let from_morning =
            agg.remaining_today(morning, EstimateField::Estimate, None);
        let from_evening =
            agg.remaining_today(evening, EstimateField::Estimate, None);
        assert!(from_morning > from_evening);
        assert!(from_evening >= 0.0);
    }
}
