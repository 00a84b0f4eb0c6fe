//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use flowrun::pipeline::Row;
use std::time::Duration;

/// Upper bound for waiting on a pipeline in tests
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// First column of every row as an integer, sorted
pub fn first_ints(rows: &[Row]) -> Vec<i64> {
    let mut values: Vec<i64> = rows
        .iter()
        .map(|r| {
            r.get(0)
                .and_then(|v| v.as_int())
                .expect("row without integer first column")
        })
        .collect();
    values.sort_unstable();
    values
}

/// First column of every row as an integer, in arrival order
pub fn ints_in_order(rows: &[Row]) -> Vec<i64> {
    rows.iter()
        .map(|r| {
            r.get(0)
                .and_then(|v| v.as_int())
                .expect("row without integer first column")
        })
        .collect()
}

/// Poll `cond` until it holds or the timeout passes
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
