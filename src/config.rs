//! System configuration: constants and environment variable parsing.
//!
//! Hot-path scalars are cached in `OnceLock` after first read so every
//! quoting/execution cycle sees one consistent value. Grouped tunables live
//! in `from_env()` config structs.

use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

/// Feed reconnect backoff: initial delay in seconds.
pub const RECONNECT_BASE_DELAY_SECS: u64 = 1;

/// Feed reconnect backoff: cap in seconds.
pub const RECONNECT_MAX_DELAY_SECS: u64 = 60;

/// Risk monitor evaluation interval.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Default snapshot staleness threshold in milliseconds.
const DEFAULT_STALENESS_MS: u64 = 2_000;

/// Default per-instrument silence bound before a gap is suspected.
/// Shorter than staleness: a gap refresh fires before quoting stops.
const DEFAULT_LIVENESS_MS: u64 = 1_000;

/// Default feed-disconnect duration that degrades the risk state.
const DEFAULT_FEED_TIMEOUT_SECS: u64 = 30;

/// Default drawdown limit from peak equity, in basis points (200 = 2%).
const DEFAULT_MAX_DRAWDOWN_BPS: u32 = 200;

/// Default depth safety buffer in basis points (12000 = 1.2x requested size).
const DEFAULT_DEPTH_BUFFER_BPS: u32 = 12_000;

/// Default per-leg slippage bound: max deviation from mid, in cents.
const DEFAULT_MAX_SLIPPAGE_CENTS: i64 = 3;

/// Default per-basket budget in cents.
const DEFAULT_BASKET_BUDGET_CENTS: i64 = 10_000;

/// Default timeout for a single order submission or cancel.
const DEFAULT_PLACEMENT_TIMEOUT_MS: u64 = 2_000;

/// Default fill-monitoring poll interval.
const DEFAULT_FILL_POLL_MS: u64 = 100;

/// Default fill-monitoring deadline before open legs are cancelled.
const DEFAULT_FILL_DEADLINE_MS: u64 = 5_000;

/// Default markout horizon for forward P&L evaluation.
const DEFAULT_MARKOUT_HORIZON_MS: u64 = 5_000;

/// Per-position bounded fill history length.
pub const FILL_HISTORY_LEN: usize = 64;

/// Per-position bounded mark history length (volatility estimation window).
pub const MARK_HISTORY_LEN: usize = 512;

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(s) => match s.parse::<u64>() {
            Ok(v) if v > 0 => v,
            _ => {
                warn!("Invalid {}='{}', using default {}", name, s, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_i64(name: &str, default: i64) -> i64 {
    match std::env::var(name) {
        Ok(s) => match s.parse::<i64>() {
            Ok(v) if v > 0 => v,
            _ => {
                warn!("Invalid {}='{}', using default {}", name, s, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_f64(name: &str, default: f64) -> f64 {
    match std::env::var(name) {
        Ok(s) => match s.parse::<f64>() {
            Ok(v) if v.is_finite() && v > 0.0 => v,
            _ => {
                warn!("Invalid {}='{}', using default {}", name, s, default);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

/// Snapshot staleness threshold. Consumers must refuse to quote or execute
/// against an instrument whose snapshot is older than this.
pub fn staleness_threshold() -> Duration {
    static CACHED: OnceLock<Duration> = OnceLock::new();
    *CACHED.get_or_init(|| Duration::from_millis(env_u64("STALENESS_MS", DEFAULT_STALENESS_MS)))
}

/// Per-instrument silence bound before a gap is suspected and a REST
/// refresh is requested. Always clamped below the staleness threshold.
pub fn liveness_threshold() -> Duration {
    static CACHED: OnceLock<Duration> = OnceLock::new();
    *CACHED.get_or_init(|| {
        let ms = env_u64("LIVENESS_MS", DEFAULT_LIVENESS_MS);
        let stale = staleness_threshold().as_millis() as u64;
        Duration::from_millis(ms.min(stale.saturating_sub(1).max(1)))
    })
}

/// Feed-disconnect duration after which the risk state degrades.
pub fn feed_timeout() -> Duration {
    static CACHED: OnceLock<Duration> = OnceLock::new();
    *CACHED.get_or_init(|| {
        Duration::from_secs(env_u64("FEED_TIMEOUT_SECS", DEFAULT_FEED_TIMEOUT_SECS))
    })
}

/// Drawdown limit from peak equity in basis points.
pub fn max_drawdown_bps() -> u32 {
    static CACHED: OnceLock<u32> = OnceLock::new();
    *CACHED.get_or_init(|| env_u64("MAX_DRAWDOWN_BPS", DEFAULT_MAX_DRAWDOWN_BPS as u64) as u32)
}

/// Whether a partial fill (after liquidation) forces the kill switch.
pub fn kill_on_partial_fill() -> bool {
    static CACHED: OnceLock<bool> = OnceLock::new();
    *CACHED.get_or_init(|| env_flag("KILL_ON_PARTIAL_FILL", true))
}

/// Tolerance in cents when re-validating rehydrated positions against
/// exchange-reported balances.
pub fn rehydrate_tolerance_cents() -> i64 {
    static CACHED: OnceLock<i64> = OnceLock::new();
    *CACHED.get_or_init(|| env_i64("REHYDRATE_TOLERANCE_CENTS", 100))
}

/// Markout horizon for forward P&L evaluation of fills.
pub fn markout_horizon() -> Duration {
    static CACHED: OnceLock<Duration> = OnceLock::new();
    *CACHED.get_or_init(|| {
        Duration::from_millis(env_u64("MARKOUT_HORIZON_MS", DEFAULT_MARKOUT_HORIZON_MS))
    })
}

/// Basket execution tunables.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Depth required at the target price, as bps of requested size
    /// (12000 = 1.2x buffer for book movement during placement).
    pub depth_buffer_bps: u32,
    /// Max per-leg deviation from mid in cents.
    pub max_slippage_cents: i64,
    /// Aggregate basket cost ceiling in cents.
    pub budget_cents: i64,
    /// Per-call timeout for submit/cancel.
    pub placement_timeout: Duration,
    /// Fill-status poll interval.
    pub fill_poll_interval: Duration,
    /// Deadline for the whole fill-monitoring phase.
    pub fill_deadline: Duration,
    /// Cents added past the touch when pricing an emergency liquidation
    /// order, to guarantee a fill.
    pub liquidation_aggression_cents: i64,
}

impl ExecConfig {
    pub fn from_env() -> Self {
        Self {
            depth_buffer_bps: env_u64("DEPTH_BUFFER_BPS", DEFAULT_DEPTH_BUFFER_BPS as u64) as u32,
            max_slippage_cents: env_i64("MAX_SLIPPAGE_CENTS", DEFAULT_MAX_SLIPPAGE_CENTS),
            budget_cents: env_i64("BASKET_BUDGET_CENTS", DEFAULT_BASKET_BUDGET_CENTS),
            placement_timeout: Duration::from_millis(env_u64(
                "PLACEMENT_TIMEOUT_MS",
                DEFAULT_PLACEMENT_TIMEOUT_MS,
            )),
            fill_poll_interval: Duration::from_millis(env_u64(
                "FILL_POLL_MS",
                DEFAULT_FILL_POLL_MS,
            )),
            fill_deadline: Duration::from_millis(env_u64(
                "FILL_DEADLINE_MS",
                DEFAULT_FILL_DEADLINE_MS,
            )),
            liquidation_aggression_cents: env_i64("LIQUIDATION_AGGRESSION_CENTS", 5),
        }
    }

    /// Required depth for a leg of the given size, after the safety buffer.
    pub fn required_depth(&self, size: i64) -> i64 {
        // Round up so a 1-contract leg still demands the buffer.
        (size * self.depth_buffer_bps as i64 + 9_999) / 10_000
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            depth_buffer_bps: DEFAULT_DEPTH_BUFFER_BPS,
            max_slippage_cents: DEFAULT_MAX_SLIPPAGE_CENTS,
            budget_cents: DEFAULT_BASKET_BUDGET_CENTS,
            placement_timeout: Duration::from_millis(DEFAULT_PLACEMENT_TIMEOUT_MS),
            fill_poll_interval: Duration::from_millis(DEFAULT_FILL_POLL_MS),
            fill_deadline: Duration::from_millis(DEFAULT_FILL_DEADLINE_MS),
            liquidation_aggression_cents: 5,
        }
    }
}

/// Quote generation tunables.
#[derive(Debug, Clone)]
pub struct QuoteConfig {
    /// Full base spread in cents; half of it on each side before widening.
    pub base_spread_cents: f64,
    /// Floor for the half-spread in cents.
    pub min_half_spread_cents: f64,
    /// Additional half-spread per contract of absolute inventory, cents.
    pub widen_per_contract_cents: f64,
    /// Base risk-aversion coefficient: cents of reservation shift per
    /// contract of inventory, before volatility scaling.
    pub risk_aversion_base: f64,
    /// Cap on the volatility multiple applied to `risk_aversion_base`.
    pub risk_aversion_cap: f64,
    /// Distance from 0/100 cents inside which boundary widening applies.
    pub boundary_band_cents: i64,
    /// Half-spread multiplier inside the boundary band.
    pub boundary_spread_mult: f64,
    /// Contracts quoted per side.
    pub quote_size: i64,
    /// Absolute inventory at which the risk-increasing side stops quoting.
    pub max_inventory: i64,
}

impl QuoteConfig {
    pub fn from_env() -> Self {
        Self {
            base_spread_cents: env_f64("BASE_SPREAD_CENTS", 4.0),
            min_half_spread_cents: env_f64("MIN_HALF_SPREAD_CENTS", 1.0),
            widen_per_contract_cents: env_f64("WIDEN_PER_CONTRACT_CENTS", 0.05),
            risk_aversion_base: env_f64("RISK_AVERSION_BASE", 0.1),
            risk_aversion_cap: env_f64("RISK_AVERSION_CAP", 3.0),
            boundary_band_cents: env_i64("BOUNDARY_BAND_CENTS", 10),
            boundary_spread_mult: env_f64("BOUNDARY_SPREAD_MULT", 2.0),
            quote_size: env_i64("QUOTE_SIZE_CONTRACTS", 10),
            max_inventory: env_i64("MAX_INVENTORY_CONTRACTS", 100),
        }
    }
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            base_spread_cents: 4.0,
            min_half_spread_cents: 1.0,
            widen_per_contract_cents: 0.05,
            risk_aversion_base: 0.1,
            risk_aversion_cap: 3.0,
            boundary_band_cents: 10,
            boundary_spread_mult: 2.0,
            quote_size: 10,
            max_inventory: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_depth_applies_buffer() {
        let cfg = ExecConfig::default();
        // 1.2x of 10 contracts = 12
        assert_eq!(cfg.required_depth(10), 12);
        // Rounds up: 1.2x of 1 = 1.2 -> 2
        assert_eq!(cfg.required_depth(1), 2);
    }

    #[test]
    fn test_exec_config_defaults() {
        let cfg = ExecConfig::default();
        assert_eq!(cfg.depth_buffer_bps, 12_000);
        assert_eq!(cfg.max_slippage_cents, 3);
        assert_eq!(cfg.placement_timeout, Duration::from_millis(2_000));
    }

    #[test]
    fn test_quote_config_defaults() {
        let cfg = QuoteConfig::default();
        assert!(cfg.min_half_spread_cents >= 1.0);
        assert!(cfg.risk_aversion_cap >= 1.0);
        assert!(cfg.boundary_spread_mult > 1.0);
    }
}
