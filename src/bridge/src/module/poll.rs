use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Run `tick` every `period`, first run right away when `immediate` is set.
/// A slow tick delays the next one instead of bursting.
pub(crate) fn spawn_poll<F, Fut>(period: Duration, immediate: bool, mut tick: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(MIN_PERIOD);
    tokio::spawn(async move {
        let first = if immediate {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut ticker = interval_at(first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            tick().await;
        }
    })
}

/// Fetch interval from settings, falling back to the module default when unset.
pub(crate) fn fetch_interval(configured_secs: u64, default_secs: u64) -> Duration {
    if configured_secs == 0 {
        Duration::from_secs(default_secs)
    } else {
        Duration::from_secs(configured_secs)
    }
}

/// RFC 3339 rendering of a unix timestamp in UTC.
pub(crate) fn unix_to_rfc3339(seconds: i64) -> Option<String> {
    time::OffsetDateTime::from_unix_timestamp(seconds)
        .ok()?
        .format(&time::format_description::well_known::Rfc3339)
        .ok()
}
