//! Cron scheduling for the clean cycle.
//!
//! The loop sleeps until the next fire time in the configured timezone and
//! then awaits the cycle inline, so a tick that lands while a long cycle
//! is still running is simply absorbed (singleton semantics).

use std::str::FromStr;

use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clean::Cleaner;

/// Parses an IANA timezone name, falling back to UTC with a warning.
pub fn parse_time_zone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(err) => {
            warn!(name, %err, "invalid timezone, falling back to UTC");
            Tz::UTC
        }
    }
}

/// Parses a cron expression. Classic 5-field specs get a seconds field
/// prepended, since the cron crate expects one.
pub fn parse_schedule(spec: &str) -> Result<Schedule, cron::error::Error> {
    let normalized = if spec.split_whitespace().count() == 5 {
        format!("0 {spec}")
    } else {
        spec.to_string()
    };
    Schedule::from_str(&normalized)
}

/// Runs clean cycles on `schedule` until cancelled.
pub async fn run_clean_schedule(
    cleaner: Cleaner,
    schedule: Schedule,
    tz: Tz,
    cancel: CancellationToken,
) {
    loop {
        let now = Utc::now().with_timezone(&tz);
        let Some(next) = schedule.after(&now).next() else {
            warn!("cron schedule has no upcoming fire times, scheduler exiting");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        debug!(next = %next, "next clean cycle scheduled");

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {
                if let Err(err) = cleaner.run(&cancel).await {
                    warn!(%err, "clean cycle aborted");
                }
            }
        }
    }
}
