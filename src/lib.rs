pub mod categorize;
pub mod cells;
pub mod config;
pub mod error;
pub mod extract;
pub mod io;
pub mod matcher;
pub mod processing;
pub mod stats;

/// Percentage of `part` in `total`, 0 for an empty total.
pub fn percent(part: u64, total: u64) -> f64 {
    if total > 0 {
        (part as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}
