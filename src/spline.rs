//! Monotone spline interpolation over half-hourly forecast samples
//!
//! Discrete half-hour samples are turned into a continuous "power right
//! now" estimate with a monotone piecewise-cubic interpolant (PCHIP,
//! Fritsch-Carlson slopes). A plain cubic spline would overshoot at the
//! sharp sunrise and sunset transitions; the monotone variant tracks the
//! samples without bounce. Curves are sampled at 5-minute resolution
//! across one day.

use crate::store::{EstimateField, ForecastStore};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

/// Seconds between curve samples
const STEP_SECS: i64 = 300;

/// Seconds between input knots
const KNOT_SECS: i64 = 1800;

/// Samples per day at 5-minute resolution, inclusive of both midnights
const SAMPLES_PER_DAY: usize = 289;

/// A day's interpolated curve for one scope and estimate band, kW
#[derive(Debug, Clone)]
pub struct DayCurve {
    day_start: DateTime<Utc>,
    values: Vec<f64>,
}

impl DayCurve {
    /// Interpolate a day of half-hour samples.
    ///
    /// `samples` holds the 48 half-hourly values from `day_start`. A
    /// synthetic zero knot at next-midnight forces the curve toward zero
    /// at the end of the day instead of extrapolating. No interpolated
    /// value is negative, and any span between two consecutive zero
    /// knots stays at zero.
    pub fn build(day_start: DateTime<Utc>, samples: &[f64]) -> Self {
        let mut ys: Vec<f64> = samples.iter().take(48).copied().collect();
        ys.resize(48, 0.0);
        ys.push(0.0);

        let xs: Vec<f64> = (0..ys.len()).map(|i| (i as i64 * KNOT_SECS) as f64).collect();
        let slopes = pchip_slopes(&xs, &ys);

        let mut values = Vec::with_capacity(SAMPLES_PER_DAY);
        for step in 0..SAMPLES_PER_DAY {
            let t = (step as i64 * STEP_SECS) as f64;
            let k = ((step as i64 * STEP_SECS) / KNOT_SECS) as usize;
            let k = k.min(ys.len() - 2);
            // Hold flat spans of zero samples at zero
            let v = if ys[k] == 0.0 && ys[k + 1] == 0.0 {
                0.0
            } else {
                hermite(xs[k], xs[k + 1], ys[k], ys[k + 1], slopes[k], slopes[k + 1], t)
            };
            values.push(v.max(0.0));
        }

        Self { day_start, values }
    }

    /// An all-zero curve for a day without data
    pub fn zero(day_start: DateTime<Utc>) -> Self {
        Self {
            day_start,
            values: vec![0.0; SAMPLES_PER_DAY],
        }
    }

    /// Curve value at an instant; zero outside the curve's day
    pub fn value_at(&self, at: DateTime<Utc>) -> f64 {
        let offset = (at - self.day_start).num_seconds();
        if offset < 0 {
            return 0.0;
        }
        let idx = (offset / STEP_SECS) as usize;
        self.values.get(idx).copied().unwrap_or(0.0)
    }

    /// Trapezoidal integral between two instants, kWh.
    ///
    /// Bounds are clamped to the curve's day; an inverted range is zero.
    /// `cap` clips each integrand sample, in kW, before summation.
    pub fn energy_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cap: Option<f64>,
    ) -> f64 {
        let start = (from - self.day_start).num_seconds().max(0);
        let end = (to - self.day_start)
            .num_seconds()
            .min((SAMPLES_PER_DAY as i64 - 1) * STEP_SECS);
        if end <= start {
            return 0.0;
        }
        let clip = |v: f64| cap.map_or(v, |c| v.min(c));
        let first = (start / STEP_SECS) as usize;
        let last = (end / STEP_SECS) as usize;
        let mut energy = 0.0;
        for i in first..last {
            let a = clip(self.values[i]);
            let b = clip(self.values[i + 1]);
            energy += (a + b) / 2.0 * (STEP_SECS as f64 / 3600.0);
        }
        energy
    }
}

/// Monotone slopes per Fritsch-Carlson
fn pchip_slopes(xs: &[f64], ys: &[f64]) -> Vec<f64> {
    let n = xs.len();
    if n < 2 {
        return vec![0.0; n];
    }

    let h: Vec<f64> = (0..n - 1).map(|i| xs[i + 1] - xs[i]).collect();
    let delta: Vec<f64> = (0..n - 1).map(|i| (ys[i + 1] - ys[i]) / h[i]).collect();

    let mut m = vec![0.0; n];
    m[0] = delta[0];
    m[n - 1] = delta[n - 2];
    for i in 1..n - 1 {
        if delta[i - 1] * delta[i] <= 0.0 {
            m[i] = 0.0;
        } else {
            // Weighted harmonic mean keeps the interpolant monotone
            let w1 = 2.0 * h[i] + h[i - 1];
            let w2 = h[i] + 2.0 * h[i - 1];
            m[i] = (w1 + w2) / (w1 / delta[i - 1] + w2 / delta[i]);
        }
    }

    // Clamp endpoint slopes so the first and last spans cannot overshoot
    for (i, edge) in [(0usize, 0usize), (n - 1, n - 2)] {
        if delta[edge] == 0.0 {
            m[i] = 0.0;
        } else if (m[i] / delta[edge]) > 3.0 {
            m[i] = 3.0 * delta[edge];
        } else if m[i] / delta[edge] < 0.0 {
            m[i] = 0.0;
        }
    }

    m
}

/// Cubic Hermite evaluation on one span
fn hermite(x0: f64, x1: f64, y0: f64, y1: f64, m0: f64, m1: f64, x: f64) -> f64 {
    let h = x1 - x0;
    let t = (x - x0) / h;
    let t2 = t * t;
    let t3 = t2 * t;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + t;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    h00 * y0 + h10 * h * m0 + h01 * y1 + h11 * h * m1
}

/// The three per-band curves for one scope
#[derive(Debug, Clone)]
pub struct ScopeCurves {
    estimate: DayCurve,
    estimate10: DayCurve,
    estimate90: DayCurve,
}

impl ScopeCurves {
    fn build(store: &ForecastStore, site: Option<&str>, day_start: DateTime<Utc>) -> Self {
        let build_one = |field| {
            let samples = store.day_samples(site, day_start, field);
            DayCurve::build(day_start, &samples)
        };
        Self {
            estimate: build_one(EstimateField::Estimate),
            estimate10: build_one(EstimateField::Estimate10),
            estimate90: build_one(EstimateField::Estimate90),
        }
    }

    fn zero(day_start: DateTime<Utc>) -> Self {
        Self {
            estimate: DayCurve::zero(day_start),
            estimate10: DayCurve::zero(day_start),
            estimate90: DayCurve::zero(day_start),
        }
    }

    fn curve(&self, field: EstimateField) -> &DayCurve {
        match field {
            EstimateField::Estimate => &self.estimate,
            EstimateField::Estimate10 => &self.estimate10,
            EstimateField::Estimate90 => &self.estimate90,
        }
    }
}

/// All of today's curves: the combined "all sites" scope plus one per site
#[derive(Debug, Clone)]
pub struct SplineSet {
    day_start: DateTime<Utc>,
    all: ScopeCurves,
    sites: BTreeMap<String, ScopeCurves>,
}

impl SplineSet {
    /// Build curves for the day starting at `day_start` (local midnight,
    /// expressed in UTC) for the combined scope and every listed site.
    pub fn build(store: &ForecastStore, site_ids: &[String], day_start: DateTime<Utc>) -> Self {
        let all = ScopeCurves::build(store, None, day_start);
        let sites = site_ids
            .iter()
            .map(|id| (id.clone(), ScopeCurves::build(store, Some(id), day_start)))
            .collect();
        Self {
            day_start,
            all,
            sites,
        }
    }

    /// Empty curves, used before the first merge of a day
    pub fn empty(day_start: DateTime<Utc>) -> Self {
        Self {
            day_start,
            all: ScopeCurves::zero(day_start),
            sites: BTreeMap::new(),
        }
    }

    /// The day these curves cover (start instant)
    pub fn day_start(&self) -> DateTime<Utc> {
        self.day_start
    }

    /// Curve for a scope and band; a site without its own curves falls
    /// back to the combined scope
    pub fn curve(&self, site: Option<&str>, field: EstimateField) -> &DayCurve {
        match site {
            Some(site_id) => self
                .sites
                .get(site_id)
                .map(|c| c.curve(field))
                .unwrap_or_else(|| self.all.curve(field)),
            None => self.all.curve(field),
        }
    }
}
