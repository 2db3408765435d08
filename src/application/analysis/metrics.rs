//! Risk and performance metrics over return series.
//!
//! Everything here is a pure function over decimal-fraction returns: no
//! persistence, no global state. The calling layer decides what to store.
//! Failures carry a reason (`InsufficientData` / `DegenerateInput`) instead
//! of collapsing to a bare `None`, so callers can assert on why a metric is
//! missing.

use crate::domain::errors::MetricError;
use crate::domain::metrics::RiskMetrics;
use chrono::Utc;
use statrs::statistics::Statistics;

/// Annual risk-free rate (stablecoin staking yield).
pub const RISK_FREE_RATE: f64 = 0.05;

/// Crypto trades around the clock.
pub const TRADING_DAYS_PER_YEAR: f64 = 365.0;

/// Conservative quarter-Kelly default.
pub const DEFAULT_KELLY_FRACTION: f64 = 0.25;

fn excess_returns(returns: &[f64], risk_free_rate: f64) -> Vec<f64> {
    let daily_rf = risk_free_rate / TRADING_DAYS_PER_YEAR;
    returns.iter().map(|r| r - daily_rf).collect()
}

/// Percentile with linear interpolation between closest ranks.
fn percentile(values: &[f64], pct: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    if sorted.len() == 1 {
        return sorted[0];
    }

    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * frac
    }
}

/// Sharpe ratio: mean excess return over its standard deviation, optionally
/// annualized by sqrt(365).
pub fn sharpe_ratio(
    returns: &[f64],
    risk_free_rate: Option<f64>,
    annualize: bool,
) -> Result<f64, MetricError> {
    if returns.len() < 2 {
        return Err(MetricError::InsufficientData {
            required: 2,
            actual: returns.len(),
        });
    }

    let rf = risk_free_rate.unwrap_or(RISK_FREE_RATE);
    let excess = excess_returns(returns, rf);

    let std = excess.as_slice().population_std_dev();
    if std == 0.0 {
        return Err(MetricError::DegenerateInput("zero variance"));
    }

    let mut sharpe = excess.as_slice().mean() / std;
    if annualize {
        sharpe *= TRADING_DAYS_PER_YEAR.sqrt();
    }
    Ok(sharpe)
}

/// Sortino ratio: like Sharpe but the denominator only penalizes downside
/// volatility. Returns +inf when there are no negative excess returns.
pub fn sortino_ratio(
    returns: &[f64],
    risk_free_rate: Option<f64>,
    annualize: bool,
) -> Result<f64, MetricError> {
    if returns.len() < 2 {
        return Err(MetricError::InsufficientData {
            required: 2,
            actual: returns.len(),
        });
    }

    let rf = risk_free_rate.unwrap_or(RISK_FREE_RATE);
    let excess = excess_returns(returns, rf);
    let downside: Vec<f64> = excess.iter().copied().filter(|r| *r < 0.0).collect();

    if downside.is_empty() {
        return Ok(f64::INFINITY);
    }

    let downside_std = downside.as_slice().population_std_dev();
    if downside_std == 0.0 {
        return Err(MetricError::DegenerateInput("zero downside variance"));
    }

    let mut sortino = excess.as_slice().mean() / downside_std;
    if annualize {
        sortino *= TRADING_DAYS_PER_YEAR.sqrt();
    }
    Ok(sortino)
}

/// Calmar ratio: annualized total return over absolute max drawdown.
pub fn calmar_ratio(returns: &[f64], max_dd: Option<f64>) -> Result<f64, MetricError> {
    if returns.len() < 2 {
        return Err(MetricError::InsufficientData {
            required: 2,
            actual: returns.len(),
        });
    }

    let total_return: f64 = returns.iter().sum();
    let annual_return = total_return * (TRADING_DAYS_PER_YEAR / returns.len() as f64);

    let dd = match max_dd {
        Some(dd) => dd,
        None => max_drawdown(returns)?,
    };
    if dd == 0.0 {
        return Err(MetricError::DegenerateInput("zero drawdown"));
    }

    Ok(annual_return / dd.abs())
}

/// Maximum drawdown: minimum of the cumulative return series relative to its
/// running maximum. Always <= 0.
pub fn max_drawdown(returns: &[f64]) -> Result<f64, MetricError> {
    if returns.len() < 2 {
        return Err(MetricError::InsufficientData {
            required: 2,
            actual: returns.len(),
        });
    }

    let mut cumulative = 0.0;
    let mut running_max = f64::NEG_INFINITY;
    let mut max_dd = 0.0_f64;

    for r in returns {
        cumulative += r;
        running_max = running_max.max(cumulative);
        max_dd = max_dd.min(cumulative - running_max);
    }

    Ok(max_dd)
}

/// Value at Risk: the (1 - confidence) percentile of the return series.
/// Negative for any loss-bearing series at usual confidence levels.
pub fn value_at_risk(returns: &[f64], confidence: f64) -> Result<f64, MetricError> {
    if returns.len() < 5 {
        return Err(MetricError::InsufficientData {
            required: 5,
            actual: returns.len(),
        });
    }

    Ok(percentile(returns, (1.0 - confidence) * 100.0))
}

/// Conditional VaR (expected shortfall): mean of the returns at or below the
/// VaR quantile. Equals VaR when the tail is empty.
pub fn conditional_var(returns: &[f64], confidence: f64) -> Result<f64, MetricError> {
    let var = value_at_risk(returns, confidence)?;

    let tail: Vec<f64> = returns.iter().copied().filter(|r| *r <= var).collect();
    if tail.is_empty() {
        return Ok(var);
    }
    Ok(tail.as_slice().mean())
}

/// Standard deviation of returns, optionally over the trailing `window`
/// points and optionally annualized.
pub fn volatility(
    returns: &[f64],
    window: Option<usize>,
    annualize: bool,
) -> Result<f64, MetricError> {
    if returns.len() < 2 {
        return Err(MetricError::InsufficientData {
            required: 2,
            actual: returns.len(),
        });
    }

    let slice = match window {
        Some(w) if returns.len() > w => &returns[returns.len() - w..],
        _ => returns,
    };

    let mut vol = slice.population_std_dev();
    if annualize {
        vol *= TRADING_DAYS_PER_YEAR.sqrt();
    }
    Ok(vol)
}

/// Kelly criterion `f* = (p*b - q) / b`, clamped to [0, 1] and scaled by the
/// chosen fraction. `avg_loss` is the magnitude of the average loss.
pub fn kelly_fraction(
    win_rate: f64,
    avg_win: f64,
    avg_loss: f64,
    fraction: f64,
) -> Result<f64, MetricError> {
    if avg_loss == 0.0 {
        return Err(MetricError::DegenerateInput("zero average loss"));
    }
    if win_rate <= 0.0 || win_rate >= 1.0 {
        return Err(MetricError::DegenerateInput("win rate outside (0, 1)"));
    }

    let b = avg_win / avg_loss.abs();
    let q = 1.0 - win_rate;

    let kelly = ((win_rate * b - q) / b).clamp(0.0, 1.0);
    Ok(kelly * fraction)
}

pub fn win_rate(returns: &[f64]) -> Result<f64, MetricError> {
    if returns.is_empty() {
        return Err(MetricError::InsufficientData {
            required: 1,
            actual: 0,
        });
    }
    let wins = returns.iter().filter(|r| **r > 0.0).count();
    Ok(wins as f64 / returns.len() as f64)
}

/// Gross profit over gross loss. +inf for all-winning series.
pub fn profit_factor(returns: &[f64]) -> Result<f64, MetricError> {
    if returns.is_empty() {
        return Err(MetricError::InsufficientData {
            required: 1,
            actual: 0,
        });
    }

    let gross_profit: f64 = returns.iter().filter(|r| **r > 0.0).sum();
    let gross_loss: f64 = returns.iter().filter(|r| **r < 0.0).sum::<f64>().abs();

    if gross_loss == 0.0 {
        if gross_profit > 0.0 {
            return Ok(f64::INFINITY);
        }
        return Err(MetricError::DegenerateInput("no wins and no losses"));
    }
    Ok(gross_profit / gross_loss)
}

/// `(avg_win, avg_loss)` where the loss side is reported as a magnitude.
pub fn avg_win_loss(returns: &[f64]) -> (Option<f64>, Option<f64>) {
    let wins: Vec<f64> = returns.iter().copied().filter(|r| *r > 0.0).collect();
    let losses: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();

    let avg_win = if wins.is_empty() {
        None
    } else {
        Some(wins.as_slice().mean())
    };
    let avg_loss = if losses.is_empty() {
        None
    } else {
        Some(losses.as_slice().mean().abs())
    };
    (avg_win, avg_loss)
}

/// Current win/loss streaks counted backwards from the latest return.
pub fn consecutive_streaks(returns: &[f64]) -> (usize, usize) {
    let mut wins = 0;
    let mut losses = 0;

    for r in returns.iter().rev() {
        if *r > 0.0 {
            if losses == 0 {
                wins += 1;
            } else {
                break;
            }
        } else if *r < 0.0 {
            if wins == 0 {
                losses += 1;
            } else {
                break;
            }
        }
    }
    (wins, losses)
}

/// Bundle every metric into one snapshot. Fields are `None` where the series
/// was too short or degenerate.
pub fn calculate_all_metrics(returns: &[f64]) -> RiskMetrics {
    let wr = win_rate(returns).ok();
    let (avg_win, avg_loss) = avg_win_loss(returns);
    let (cons_wins, cons_losses) = consecutive_streaks(returns);
    let max_dd = max_drawdown(returns).ok();

    let kelly = match (wr, avg_win, avg_loss) {
        (Some(p), Some(w), Some(l)) => kelly_fraction(p, w, l, DEFAULT_KELLY_FRACTION).ok(),
        _ => None,
    };

    RiskMetrics {
        timestamp: Utc::now(),
        sharpe_ratio: sharpe_ratio(returns, None, true).ok(),
        sortino_ratio: sortino_ratio(returns, None, true).ok(),
        calmar_ratio: calmar_ratio(returns, max_dd).ok(),
        volatility_daily: volatility(returns, None, false).ok(),
        volatility_weekly: volatility(returns, Some(7), false).ok(),
        current_drawdown: None, // needs cumulative portfolio tracking
        max_drawdown: max_dd,
        var_95: value_at_risk(returns, 0.95).ok(),
        var_99: value_at_risk(returns, 0.99).ok(),
        cvar_95: conditional_var(returns, 0.95).ok(),
        cvar_99: conditional_var(returns, 0.99).ok(),
        kelly_fraction: kelly,
        half_kelly: kelly.map(|k| k / 2.0),
        optimal_position_size: None, // needs portfolio context
        win_rate: wr,
        profit_factor: profit_factor(returns).ok(),
        avg_win,
        avg_loss,
        consecutive_wins: cons_wins,
        consecutive_losses: cons_losses,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Daily returns of the worked 7-day cycle example.
    const WEEK: [f64; 7] = [0.01, 0.02, -0.03, 0.015, -0.005, 0.02, 0.01];

    #[test]
    fn test_sharpe_requires_two_points() {
        let err = sharpe_ratio(&[0.01], None, true).unwrap_err();
        assert_eq!(
            err,
            MetricError::InsufficientData {
                required: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_sharpe_zero_variance_is_degenerate() {
        let err = sharpe_ratio(&[0.01, 0.01, 0.01], None, true).unwrap_err();
        assert_eq!(err, MetricError::DegenerateInput("zero variance"));
    }

    #[test]
    fn test_sharpe_invariant_to_risk_free_shift() {
        let rf = RISK_FREE_RATE;
        let shifted: Vec<f64> = WEEK.iter().map(|r| r + rf / TRADING_DAYS_PER_YEAR).collect();

        let base = sharpe_ratio(&WEEK, Some(0.0), true).unwrap();
        let with_rf = sharpe_ratio(&shifted, Some(rf), true).unwrap();
        assert!((base - with_rf).abs() < 1e-9);
    }

    #[test]
    fn test_sortino_infinite_without_losses() {
        // All returns stay above the daily risk-free rate.
        let returns = [0.01, 0.02, 0.015, 0.03];
        let sortino = sortino_ratio(&returns, None, true).unwrap();
        assert!(sortino.is_infinite() && sortino > 0.0);
    }

    #[test]
    fn test_max_drawdown_is_non_positive() {
        let dd = max_drawdown(&WEEK).unwrap();
        assert!(dd <= 0.0);
        // Worst single dip in the series is the -3% day.
        assert!((dd - (-0.03)).abs() < 1e-9);
    }

    #[test]
    fn test_cvar_never_exceeds_var() {
        let returns = [0.02, -0.05, 0.01, -0.02, 0.03, -0.01, 0.015, -0.04];
        for confidence in [0.9, 0.95, 0.99] {
            let var = value_at_risk(&returns, confidence).unwrap();
            let cvar = conditional_var(&returns, confidence).unwrap();
            assert!(
                cvar <= var + 1e-12,
                "cvar {} > var {} at c={}",
                cvar,
                var,
                confidence
            );
        }
    }

    #[test]
    fn test_var_requires_five_points() {
        let err = value_at_risk(&[0.01, -0.02, 0.03], 0.95).unwrap_err();
        assert!(matches!(err, MetricError::InsufficientData { required: 5, .. }));
    }

    #[test]
    fn test_kelly_known_value() {
        // p=0.6, b=2 -> f* = (0.6*2 - 0.4)/2 = 0.4, quarter-Kelly = 0.1
        let kelly = kelly_fraction(0.6, 0.02, 0.01, 0.25).unwrap();
        assert!((kelly - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_kelly_degenerate_inputs() {
        assert!(kelly_fraction(0.0, 0.02, 0.01, 0.25).is_err());
        assert!(kelly_fraction(1.0, 0.02, 0.01, 0.25).is_err());
        assert!(kelly_fraction(0.6, 0.02, 0.0, 0.25).is_err());
    }

    #[test]
    fn test_week_cycle_bundle() {
        let metrics = calculate_all_metrics(&WEEK);

        let total: f64 = WEEK.iter().sum();
        assert!((total - 0.04).abs() < 1e-9); // ~ +4% over the week

        assert!(metrics.sharpe_ratio.unwrap().is_finite());
        assert!(metrics.max_drawdown.unwrap() <= 0.0);
        assert!((metrics.win_rate.unwrap() - 5.0 / 7.0).abs() < 1e-9);
        // Sortino and Sharpe agree in sign here.
        assert_eq!(
            metrics.sortino_ratio.unwrap().is_sign_positive(),
            metrics.sharpe_ratio.unwrap().is_sign_positive()
        );
    }

    #[test]
    fn test_streaks_count_from_the_end() {
        assert_eq!(consecutive_streaks(&[-0.01, 0.02, 0.01, 0.03]), (3, 0));
        assert_eq!(consecutive_streaks(&[0.02, -0.01, -0.02]), (0, 2));
        assert_eq!(consecutive_streaks(&[]), (0, 0));
    }

    #[test]
    fn test_profit_factor() {
        let pf = profit_factor(&[0.02, -0.01, 0.03, -0.01]).unwrap();
        assert!((pf - 2.5).abs() < 1e-9);
        assert!(profit_factor(&[0.01, 0.02]).unwrap().is_infinite());
    }

    #[test]
    fn test_volatility_window() {
        let series: Vec<f64> = (0..20).map(|i| if i < 13 { 0.05 } else { 0.01 }).collect();
        // Last 7 points are constant -> zero volatility inside the window.
        let windowed = volatility(&series, Some(7), false).unwrap();
        assert!(windowed.abs() < 1e-12);
        let full = volatility(&series, None, false).unwrap();
        assert!(full > 0.0);
    }
}
