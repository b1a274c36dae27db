use serde::Serialize;
use std::cmp::Ordering;

/// Fallback per-question ceiling for bucketing when no template is in
/// hand. Only a reasonable default for rating-scale dominated templates;
/// callers with a template should derive the real maximum from it.
pub const DEFAULT_PER_QUESTION_MAX: f64 = 5.0;

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionStats {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub std_dev: Option<f64>,
    pub count: usize,
}

impl DistributionStats {
    pub fn empty() -> Self {
        DistributionStats {
            min: None,
            max: None,
            mean: None,
            median: None,
            std_dev: None,
            count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Percentiles {
    #[serde(rename = "25th")]
    pub p25: Option<f64>,
    #[serde(rename = "50th")]
    pub p50: Option<f64>,
    #[serde(rename = "75th")]
    pub p75: Option<f64>,
}

impl Percentiles {
    pub fn empty() -> Self {
        Percentiles {
            p25: None,
            p50: None,
            p75: None,
        }
    }
}

fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    sorted
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

/// Descriptive statistics over a score collection. Empty input yields all
/// nulls with count 0. std_dev is the sample standard deviation (n-1),
/// defined as 0.0 when count <= 1.
pub fn describe(scores: &[f64]) -> DistributionStats {
    if scores.is_empty() {
        return DistributionStats::empty();
    }

    let n = scores.len();
    let sorted = sorted_copy(scores);
    let sum: f64 = scores.iter().sum();
    let mean = sum / (n as f64);

    let std_dev = if n > 1 {
        let ss: f64 = scores.iter().map(|v| (v - mean) * (v - mean)).sum();
        (ss / ((n - 1) as f64)).sqrt()
    } else {
        0.0
    };

    DistributionStats {
        min: Some(round2(sorted[0])),
        max: Some(round2(sorted[n - 1])),
        mean: Some(round2(mean)),
        median: Some(round2(median_of_sorted(&sorted))),
        std_dev: Some(round2(std_dev)),
        count: n,
    }
}

/// Quartile split into 4 groups (exclusive method, linear interpolation).
/// Fewer than 4 samples yields all nulls — a usability guard so dashboards
/// do not render quartiles of two data points.
pub fn quartiles(scores: &[f64]) -> Percentiles {
    let n = scores.len();
    if n < 4 {
        return Percentiles::empty();
    }
    let sorted = sorted_copy(scores);

    let point = |i: usize| -> f64 {
        let m = (i as f64) * ((n + 1) as f64) / 4.0;
        let j = m.floor() as usize;
        let delta = m - (j as f64);
        if j < 1 {
            sorted[0]
        } else if j >= n {
            sorted[n - 1]
        } else {
            sorted[j - 1] + delta * (sorted[j] - sorted[j - 1])
        }
    };

    Percentiles {
        p25: Some(round2(point(1))),
        p50: Some(round2(point(2))),
        p75: Some(round2(point(3))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Low,
    Medium,
    High,
}

impl Band {
    pub fn as_str(self) -> &'static str {
        match self {
            Band::Low => "low",
            Band::Medium => "medium",
            Band::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendDirection {
    Improving,
    Declining,
    Stable,
}

impl TrendDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TrendDirection::Improving => "improving",
            TrendDirection::Declining => "declining",
            TrendDirection::Stable => "stable",
        }
    }
}

/// Compare two adjacent window means. The percentage change is 0 when the
/// baseline is zero or negative, where a ratio would be meaningless.
pub fn trend(previous_mean: f64, recent_mean: f64) -> (TrendDirection, f64) {
    let direction = if recent_mean > previous_mean {
        TrendDirection::Improving
    } else if recent_mean < previous_mean {
        TrendDirection::Declining
    } else {
        TrendDirection::Stable
    };
    let change = if previous_mean > 0.0 {
        round2((recent_mean - previous_mean) / previous_mean * 100.0)
    } else {
        0.0
    };
    (direction, change)
}

/// Bucket a total score against an explicit maximum. A zero maximum
/// degrades the ratio to 0 (low) instead of dividing by zero.
pub fn bucket_by_max(score: f64, max_possible: f64) -> Band {
    let ratio = if max_possible > 0.0 {
        score / max_possible
    } else {
        0.0
    };
    if ratio < 0.33 {
        Band::Low
    } else if ratio < 0.66 {
        Band::Medium
    } else {
        Band::High
    }
}
