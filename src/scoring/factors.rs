//! Individual factor functions
//!
//! Every factor maps its raw inputs into [0, 1]. A factor returns `None`
//! when its inputs are unknown so the engine can substitute the neutral
//! value and mark the score degraded.

/// Momentum horizons: (horizon label, return that saturates the horizon, weight)
pub const MOMENTUM_HORIZONS: [(&str, f64, f64); 3] = [
    ("5m", 0.10, 0.25),
    ("1h", 0.20, 0.35),
    ("24h", 0.50, 0.40),
];

/// Healthy volume/market-cap band
pub const VOLUME_BAND: (f64, f64) = (0.10, 0.50);
/// Distance above the band over which the score decays to zero
const VOLUME_EXCESS_DECAY: f64 = 1.5;

/// Age bonus ceiling. Kept below the composite bar so age cannot carry a
/// score on its own.
pub const AGE_BONUS_CAP: f64 = 0.7;

/// Deployer balance drop treated as a sell
pub const DEV_SELL_THRESHOLD: f64 = -0.10;
const DEV_NEUTRAL: f64 = 0.6;

/// Clamp into [0, 1], mapping NaN to 0
pub fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Weighted combination of 5m/1h/24h returns.
///
/// Each horizon contributes `return / threshold` (capped at 1). Unknown
/// horizons are dropped and the remaining weights renormalized.
pub fn momentum(
    return_5m: Option<f64>,
    return_1h: Option<f64>,
    return_24h: Option<f64>,
) -> Option<f64> {
    let returns = [return_5m, return_1h, return_24h];

    let mut total = 0.0;
    let mut weight_sum = 0.0;
    for ((_, threshold, weight), ret) in MOMENTUM_HORIZONS.iter().zip(returns) {
        if let Some(r) = ret {
            total += weight * unit(r / threshold);
            weight_sum += weight;
        }
    }

    if weight_sum == 0.0 {
        return None;
    }
    Some(unit(total / weight_sum))
}

/// Volume/market-cap ratio scored highest inside the healthy band
pub fn volume_health(ratio: Option<f64>) -> Option<f64> {
    let ratio = ratio?;
    let (low, high) = VOLUME_BAND;

    let score = if ratio < low {
        // Too little turnover
        ratio / low
    } else if ratio <= high {
        1.0
    } else {
        // Wash-trading-like excess
        1.0 - (ratio - high) / VOLUME_EXCESS_DECAY
    };
    Some(unit(score))
}

/// Monotonically decreasing bonus for young tokens
pub fn age_bonus(age_secs: u64) -> f64 {
    let hours = age_secs as f64 / 3600.0;

    // (start hour, end hour, bonus at start, bonus at end)
    const SEGMENTS: [(f64, f64, f64, f64); 3] = [
        (1.0, 6.0, AGE_BONUS_CAP, 0.5),
        (6.0, 24.0, 0.5, 0.2),
        (24.0, 72.0, 0.2, 0.0),
    ];

    if hours <= 1.0 {
        return AGE_BONUS_CAP;
    }
    for (start, end, from, to) in SEGMENTS {
        if hours <= end {
            let progress = (hours - start) / (end - start);
            return unit(from + (to - from) * progress);
        }
    }
    0.0
}

/// Inverse of top-10 concentration, lifted by a broad holder base
pub fn whale(top10_percent: Option<f64>, holder_count: Option<u64>) -> Option<f64> {
    let top10 = top10_percent?;
    let concentration = unit((100.0 - top10) / 100.0);

    let score = match holder_count {
        Some(holders) if holders > 0 => {
            let breadth = unit((holders as f64).log10() / 4.0);
            0.75 * concentration + 0.25 * breadth
        }
        Some(_) => 0.75 * concentration,
        None => concentration,
    };
    Some(unit(score))
}

/// Deployer behaviour: sharp penalty on a sell, neutral-to-positive otherwise
pub fn dev(balance_delta: Option<f64>) -> Option<f64> {
    let delta = balance_delta?;

    let score = if delta <= DEV_SELL_THRESHOLD {
        // 0.2 at a 10% drop, 0 at a 50% drop
        0.2 * (1.0 - (-delta - 0.10) / 0.40)
    } else if delta < 0.0 {
        DEV_NEUTRAL
    } else {
        DEV_NEUTRAL + delta.min(0.2) * 2.0
    };
    Some(unit(score))
}
