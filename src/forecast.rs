//! Sales forecasting.
//!
//! Fits an ordinary-least-squares model from calendar features (day of week,
//! day of month, month) to the quantity of each recorded sale, then projects
//! the next [`HORIZON_DAYS`] days. Everything here is pure: the caller passes
//! the observations and the date to start forecasting from.

use chrono::{Datelike, Duration, NaiveDate};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::Serialize;

/// Fewer observations than this yields [`ForecastOutcome::NeedsMoreData`].
pub const MIN_OBSERVATIONS: usize = 30;
pub const HORIZON_DAYS: i64 = 30;
/// Share of the observations held out for the test score, in percent.
pub const TEST_PERCENT: usize = 20;
pub const SPLIT_SEED: u64 = 42;

pub const N_FEATURES: usize = 3;
const ZERO_VARIANCE: f64 = 1e-12;
const PIVOT_TOLERANCE: f64 = 1e-10;

pub type Features = [f64; N_FEATURES];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub date: NaiveDate,
    pub quantity: i64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SalesSummary {
    pub count: usize,
    pub total_quantity: i64,
    pub mean_quantity: f64,
}

impl SalesSummary {
    pub fn from_observations(observations: &[Observation]) -> Self {
        let count = observations.len();
        let total_quantity = saturating_total(observations.iter().map(|o| o.quantity));
        let mean_quantity = if count == 0 {
            0.0
        } else {
            total_quantity as f64 / count as f64
        };
        SalesSummary {
            count,
            total_quantity,
            mean_quantity,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DailyForecast {
    pub date: NaiveDate,
    pub quantity: i64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Forecast {
    pub daily: Vec<DailyForecast>,
    pub total_quantity: i64,
    pub daily_average: f64,
    pub train_r2: f64,
    pub test_r2: f64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ForecastOutcome {
    NeedsMoreData {
        summary: SalesSummary,
    },
    Ready {
        summary: SalesSummary,
        forecast: Forecast,
    },
}

/// Runs the whole pipeline for one item's sale history.
///
/// Observations should be in sale order. Predictions are clamped to zero and
/// rounded half away from zero.
pub fn forecast(observations: &[Observation], today: NaiveDate) -> ForecastOutcome {
    let summary = SalesSummary::from_observations(observations);
    if observations.len() < MIN_OBSERVATIONS {
        return ForecastOutcome::NeedsMoreData { summary };
    }

    let features: Vec<Features> = observations.iter().map(|o| date_features(o.date)).collect();
    let targets: Vec<f64> = observations.iter().map(|o| o.quantity as f64).collect();

    let (train_idx, test_idx) = train_test_split(observations.len(), TEST_PERCENT, SPLIT_SEED);
    let pick_x = |idx: &[usize]| idx.iter().map(|&i| features[i]).collect::<Vec<_>>();
    let pick_y = |idx: &[usize]| idx.iter().map(|&i| targets[i]).collect::<Vec<_>>();
    let (train_x, train_y) = (pick_x(&train_idx), pick_y(&train_idx));
    let (test_x, test_y) = (pick_x(&test_idx), pick_y(&test_idx));

    let scaler = StandardScaler::fit(&train_x);
    let train_x = scaler.transform_all(&train_x);
    let test_x = scaler.transform_all(&test_x);

    let model = LinearModel::fit(&train_x, &train_y);
    let train_r2 = r2_score(&train_y, &model.predict_all(&train_x));
    let test_r2 = r2_score(&test_y, &model.predict_all(&test_x));

    let daily: Vec<DailyForecast> = (0..HORIZON_DAYS)
        .map(|offset| {
            let date = today + Duration::days(offset);
            let predicted = model.predict(&scaler.transform(&date_features(date)));
            DailyForecast {
                date,
                quantity: to_quantity(predicted),
            }
        })
        .collect();

    let total_quantity = saturating_total(daily.iter().map(|d| d.quantity));
    let daily_average = total_quantity as f64 / HORIZON_DAYS as f64;

    log::debug!(
        "Forecast fitted on {} rows (train r2 {:.3}, test r2 {:.3})",
        train_idx.len(),
        train_r2,
        test_r2
    );

    ForecastOutcome::Ready {
        summary,
        forecast: Forecast {
            daily,
            total_quantity,
            daily_average,
            train_r2,
            test_r2,
        },
    }
}

/// Day of week (Monday = 0), day of month and month.
pub fn date_features(date: NaiveDate) -> Features {
    [
        date.weekday().num_days_from_monday() as f64,
        date.day() as f64,
        date.month() as f64,
    ]
}

fn saturating_total(quantities: impl Iterator<Item = i64>) -> i64 {
    quantities.fold(0, i64::saturating_add)
}

// f64::max drops NaN, so the result is never negative.
fn to_quantity(predicted: f64) -> i64 {
    predicted.max(0.0).round() as i64
}

/// Shuffles `0..n` with a seeded RNG and returns `(train, test)` indices.
/// The test side gets `ceil(n * test_percent / 100)` rows.
pub fn train_test_split(n: usize, test_percent: usize, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let n_test = (n * test_percent).div_ceil(100).min(n);
    let train = indices.split_off(n_test);
    (train, indices)
}

#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    mean: Features,
    scale: Features,
}

impl StandardScaler {
    /// Mean and population standard deviation per column. A constant column
    /// keeps a scale of 1 so it transforms to all zeros.
    pub fn fit(rows: &[Features]) -> Self {
        let mut mean = [0.0; N_FEATURES];
        let mut scale = [1.0; N_FEATURES];
        if rows.is_empty() {
            return StandardScaler { mean, scale };
        }

        let n = rows.len() as f64;
        for col in 0..N_FEATURES {
            let m = rows.iter().map(|r| r[col]).sum::<f64>() / n;
            let var = rows.iter().map(|r| (r[col] - m).powi(2)).sum::<f64>() / n;
            let std = var.sqrt();
            mean[col] = m;
            if std > ZERO_VARIANCE {
                scale[col] = std;
            }
        }
        StandardScaler { mean, scale }
    }

    pub fn transform(&self, row: &Features) -> Features {
        let mut out = [0.0; N_FEATURES];
        for col in 0..N_FEATURES {
            out[col] = (row[col] - self.mean[col]) / self.scale[col];
        }
        out
    }

    pub fn transform_all(&self, rows: &[Features]) -> Vec<Features> {
        rows.iter().map(|r| self.transform(r)).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    pub intercept: f64,
    pub coef: Features,
}

impl LinearModel {
    /// Least squares with intercept, solved through the normal equations of
    /// the centered data. Columns without a usable pivot get a zero weight.
    pub fn fit(x: &[Features], y: &[f64]) -> Self {
        if x.is_empty() || x.len() != y.len() {
            return LinearModel {
                intercept: 0.0,
                coef: [0.0; N_FEATURES],
            };
        }

        let n = x.len() as f64;
        let mut x_mean = [0.0; N_FEATURES];
        for row in x {
            for col in 0..N_FEATURES {
                x_mean[col] += row[col] / n;
            }
        }
        let y_mean = y.iter().sum::<f64>() / n;

        let mut gram = [[0.0; N_FEATURES]; N_FEATURES];
        let mut rhs = [0.0; N_FEATURES];
        for (row, &target) in x.iter().zip(y) {
            let centered: Features = std::array::from_fn(|c| row[c] - x_mean[c]);
            let dy = target - y_mean;
            for i in 0..N_FEATURES {
                rhs[i] += centered[i] * dy;
                for j in 0..N_FEATURES {
                    gram[i][j] += centered[i] * centered[j];
                }
            }
        }

        let coef = solve_symmetric(gram, rhs);
        let intercept = y_mean - (0..N_FEATURES).map(|c| coef[c] * x_mean[c]).sum::<f64>();
        LinearModel { intercept, coef }
    }

    pub fn predict(&self, row: &Features) -> f64 {
        self.intercept + (0..N_FEATURES).map(|c| self.coef[c] * row[c]).sum::<f64>()
    }

    pub fn predict_all(&self, rows: &[Features]) -> Vec<f64> {
        rows.iter().map(|r| self.predict(r)).collect()
    }
}

// Gaussian elimination with partial pivoting.
fn solve_symmetric(mut a: [[f64; N_FEATURES]; N_FEATURES], mut b: Features) -> Features {
    let largest = a
        .iter()
        .enumerate()
        .map(|(i, row)| row[i].abs())
        .fold(0.0_f64, f64::max);
    let tolerance = PIVOT_TOLERANCE * largest.max(1.0);

    let mut pivot_cols = Vec::with_capacity(N_FEATURES);
    let mut row = 0;
    for col in 0..N_FEATURES {
        let best = (row..N_FEATURES).max_by(|&p, &q| a[p][col].abs().total_cmp(&a[q][col].abs()));
        let Some(best) = best else { break };
        if a[best][col].abs() <= tolerance {
            continue;
        }
        a.swap(row, best);
        b.swap(row, best);
        for below in row + 1..N_FEATURES {
            let factor = a[below][col] / a[row][col];
            for k in col..N_FEATURES {
                a[below][k] -= factor * a[row][k];
            }
            b[below] -= factor * b[row];
        }
        pivot_cols.push(col);
        row += 1;
    }

    let mut coef = [0.0; N_FEATURES];
    for (r, &col) in pivot_cols.iter().enumerate().rev() {
        let tail: f64 = (col + 1..N_FEATURES).map(|k| a[r][k] * coef[k]).sum();
        coef[col] = (b[r] - tail) / a[r][col];
    }
    coef
}

/// Coefficient of determination. With no variance in `y_true` the score is
/// 1.0 for an exact fit and 0.0 otherwise.
pub fn r2_score(y_true: &[f64], y_pred: &[f64]) -> f64 {
    if y_true.is_empty() || y_true.len() != y_pred.len() {
        return 0.0;
    }
    let mean = y_true.iter().sum::<f64>() / y_true.len() as f64;
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - mean).powi(2)).sum();
    if ss_tot <= ZERO_VARIANCE {
        return if ss_res <= ZERO_VARIANCE { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}
