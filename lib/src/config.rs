//! Shared tuning knobs and naming rules. Host-specific settings (bind
//! addresses, database URLs) live with the binaries; everything the
//! coordinator and executors must agree on lives here.

use once_cell::sync::Lazy;
use regex::Regex;

/// Seconds of heartbeat silence before a worker is declared dead.
pub const WORKER_ACK_TIMEOUT_SECS: u64 = 30;

/// Cadence of the coordinator scheduling loop, in seconds.
pub const TASK_CHECK_CYCLE_SECS: u64 = 10;

/// Number of parallel unit-task slots per executor.
pub const PROCESSOR_NUM: usize = 2;

/// Cadence of the executor heartbeat, in seconds.
pub const UPDATE_CYCLE_SECS: u64 = 5;

/// Rows per trading day of tick data.
pub const TICK_LENGTH: usize = 4740;

/// Rows per trading day of factor results. Matches the tick grid.
pub const FACTOR_LENGTH: usize = 4740;

/// Version label given to the first version of a new factor.
pub const INIT_VERSION: &str = "INIT";

/// Prefix of canonical group factor names.
pub const GROUP_FACTOR_PREFIX: &str = "G#";

/// Suffix marking a stock code as a composed view.
pub const STOCK_VIEW_SUFFIX: &str = ".VIEW";

static STOCK_VIEW_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_\-.0-9]+$").expect("stock view name regex"));

/// Canonical name of a group factor: the prefix followed by the sorted
/// member names joined by `#`. Sorting makes the name independent of the
/// order members were submitted in.
pub fn group_factor_name<S: AsRef<str>>(members: &[S]) -> String {
    let mut members: Vec<&str> = members.iter().map(|member| member.as_ref()).collect();
    members.sort_unstable();
    format!("{}{}", GROUP_FACTOR_PREFIX, members.join("#"))
}

pub fn is_group_factor_name(name: &str) -> bool {
    name.starts_with(GROUP_FACTOR_PREFIX)
}

pub fn is_stock_view(stock_code: &str) -> bool {
    stock_code.ends_with(STOCK_VIEW_SUFFIX)
}

/// View names must be filesystem- and SQL-friendly and end in `.VIEW`.
pub fn is_valid_stock_view_name(name: &str) -> bool {
    is_stock_view(name) && STOCK_VIEW_NAME_RE.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_name_is_order_independent() {
        assert_eq!(group_factor_name(&["beta", "alpha"]), "G#alpha#beta");
        assert_eq!(
            group_factor_name(&["alpha", "beta"]),
            group_factor_name(&["beta", "alpha"])
        );
        assert!(is_group_factor_name(&group_factor_name(&["x"])));
    }

    #[test]
    fn test_stock_view_detection() {
        assert!(is_stock_view("BASKET.VIEW"));
        assert!(!is_stock_view("000001.SZ"));
    }

    #[test]
    fn test_stock_view_name_validation() {
        assert!(is_valid_stock_view_name("my-basket_1.VIEW"));
        assert!(!is_valid_stock_view_name("basket"));
        assert!(!is_valid_stock_view_name("bad name.VIEW"));
        assert!(!is_valid_stock_view_name("semi;colon.VIEW"));
    }
}
