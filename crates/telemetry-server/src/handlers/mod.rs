pub mod activities;
pub mod health;
pub mod history;
pub mod ingest;
pub mod logs;
pub mod metrics;
pub mod sessions;
pub mod stream;

use chrono::{Local, Utc};
use telemetry_engine::LocalClock;

/// Clock in the server's own timezone, used when a caller supplies no offset.
pub fn server_clock() -> LocalClock {
    let offset_minutes = Local::now().offset().local_minus_utc() / 60;
    LocalClock::new(Utc::now(), offset_minutes)
}
