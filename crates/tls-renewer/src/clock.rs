//! Wall-clock access for renewal scheduling
//!
//! All arithmetic in the renewal state machine is done in milliseconds since
//! the Unix epoch. The trait exists so tests can pin "now".

/// Source of the current time in milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// The real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Render an epoch-millisecond timestamp for log output
pub fn format_ms(epoch_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(epoch_ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| format!("{}ms", epoch_ms))
}
