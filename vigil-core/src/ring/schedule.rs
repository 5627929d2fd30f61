use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::error::{CoordError, Result};

/// When a ring subscription fires.
#[derive(Clone)]
pub enum Schedule {
    /// Fire every fixed period.
    Interval(Duration),
    /// Fire on a cron expression, evaluated in UTC.
    Cron(Box<cron::Schedule>),
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Interval(period) => {
                f.debug_tuple("Interval").field(period).finish()
            }
            Schedule::Cron(schedule) => {
                f.debug_tuple("Cron").field(schedule).finish()
            }
        }
    }
}

impl Schedule {
    pub fn interval(period: Duration) -> Self {
        Schedule::Interval(period)
    }

    /// Parse a cron expression. Standard five-field expressions are accepted
    /// and fire at second zero; six and seven field expressions carry their
    /// own seconds (and year) field.
    pub fn cron(expression: &str) -> Result<Self> {
        let fields = expression.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {}", expression.trim()),
            6 | 7 => expression.trim().to_string(),
            _ => {
                return Err(CoordError::NotValid(format!(
                    "cron expression {expression:?} must have 5, 6 or 7 fields"
                )));
            }
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            CoordError::NotValid(format!("cron expression {expression:?}: {e}"))
        })?;
        Ok(Schedule::Cron(Box::new(schedule)))
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Interval(period) if period.is_zero() => Err(
                CoordError::NotValid("schedule interval must be positive".into()),
            ),
            Schedule::Interval(_) => Ok(()),
            Schedule::Cron(schedule) => match schedule.upcoming(Utc).next() {
                Some(_) => Ok(()),
                None => Err(CoordError::NotValid(
                    "cron schedule never fires again".into(),
                )),
            },
        }
    }
}

/// Next fire time strictly after `after`, and the gap to the fire time that
/// follows it.
pub(crate) fn next_cron_fire(
    schedule: &cron::Schedule,
    after: DateTime<Utc>,
) -> Option<(DateTime<Utc>, Duration)> {
    let mut upcoming = schedule.after(&after);
    let next = upcoming.next()?;
    let gap = upcoming
        .next()
        .and_then(|following| (following - next).to_std().ok())
        .unwrap_or(Duration::ZERO);
    Some((next, gap))
}

/// Subtract a random jitter of between half and all of
/// `period * jitter_ratio` from `period`.
pub(crate) fn jittered_guard(period: Duration, jitter_ratio: f32) -> Duration {
    let ratio = f64::from(jitter_ratio.clamp(0.0, 0.5));
    if ratio == 0.0 || period.is_zero() {
        return period;
    }
    let unit: f64 = rand::rng().random_range(0.5..=1.0);
    let jitter = period.mul_f64(ratio * unit);
    period.saturating_sub(jitter)
}

/// Source of scheduling ticks for one subscription. Each tick yields the
/// scheduling interval it covers.
pub(crate) enum Ticker {
    Interval { interval: Interval, period: Duration },
    Cron(mpsc::Receiver<Duration>),
}

impl Ticker {
    /// Start ticking. The first tick arrives one period (or at the next cron
    /// fire time) from now, never immediately.
    pub(crate) fn start(
        schedule: &Schedule,
        scope: &CancellationToken,
        tasks: &TaskTracker,
    ) -> Self {
        match schedule {
            Schedule::Interval(period) => {
                let mut interval =
                    tokio::time::interval_at(Instant::now() + *period, *period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Ticker::Interval {
                    interval,
                    period: *period,
                }
            }
            Schedule::Cron(schedule) => {
                let (ticks, rx) = mpsc::channel(1);
                tasks.spawn(run_cron(
                    schedule.as_ref().clone(),
                    scope.clone(),
                    ticks,
                ));
                Ticker::Cron(rx)
            }
        }
    }

    /// Wait for the next tick. Returns `None` once `scope` ends.
    pub(crate) async fn tick(
        &mut self,
        scope: &CancellationToken,
    ) -> Option<Duration> {
        match self {
            Ticker::Interval { interval, period } => tokio::select! {
                _ = scope.cancelled() => None,
                _ = interval.tick() => Some(*period),
            },
            Ticker::Cron(ticks) => tokio::select! {
                _ = scope.cancelled() => None,
                gap = ticks.recv() => gap,
            },
        }
    }
}

async fn run_cron(
    schedule: cron::Schedule,
    scope: CancellationToken,
    ticks: mpsc::Sender<Duration>,
) {
    let mut last_fire: Option<DateTime<Utc>> = None;
    loop {
        let now = Utc::now();
        let after = match last_fire {
            Some(fired) if fired > now => fired,
            _ => now,
        };
        let Some((next, gap)) = next_cron_fire(&schedule, after) else {
            debug!("cron schedule exhausted");
            break;
        };

        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = scope.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        last_fire = Some(next);

        // A consumer still busy with the previous tick skips this one.
        if let Err(mpsc::error::TrySendError::Closed(_)) = ticks.try_send(gap) {
            break;
        }
        trace!(fire_time = %next, "cron tick");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_cron_fires_on_the_minute() {
        let Schedule::Cron(schedule) = Schedule::cron("*/5 * * * *").unwrap() else {
            panic!("expected cron schedule");
        };
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 1, 30).unwrap();
        let (next, gap) = next_cron_fire(&schedule, start).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 12, 5, 0).unwrap());
        assert_eq!(gap, Duration::from_secs(300));
    }

    #[test]
    fn malformed_cron_is_rejected() {
        assert!(matches!(
            Schedule::cron("every five minutes"),
            Err(CoordError::NotValid(_))
        ));
        assert!(matches!(Schedule::cron("* * *"), Err(CoordError::NotValid(_))));
    }

    #[test]
    fn zero_interval_is_not_valid() {
        assert!(Schedule::interval(Duration::ZERO).validate().is_err());
        assert!(Schedule::interval(Duration::from_secs(1)).validate().is_ok());
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let period = Duration::from_secs(10);
        for _ in 0..100 {
            let guard = jittered_guard(period, 0.1);
            assert!(guard <= Duration::from_millis(9_500));
            assert!(guard >= Duration::from_millis(9_000));
        }
        assert_eq!(jittered_guard(period, 0.0), period);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_ticker_waits_a_full_period() {
        let scope = CancellationToken::new();
        let tasks = TaskTracker::new();
        let period = Duration::from_secs(30);
        let mut ticker = Ticker::start(&Schedule::interval(period), &scope, &tasks);

        let started = Instant::now();
        assert_eq!(ticker.tick(&scope).await, Some(period));
        assert!(started.elapsed() >= period);

        scope.cancel();
        assert_eq!(ticker.tick(&scope).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cron_ticker_fires_until_cancelled() {
        let scope = CancellationToken::new();
        let tasks = TaskTracker::new();
        let schedule = Schedule::cron("*/2 * * * * *").unwrap();
        let mut ticker = Ticker::start(&schedule, &scope, &tasks);
        tasks.close();

        let started = Instant::now();
        assert_eq!(ticker.tick(&scope).await, Some(Duration::from_secs(2)));
        assert_eq!(ticker.tick(&scope).await, Some(Duration::from_secs(2)));
        assert!(started.elapsed() >= Duration::from_secs(1));

        scope.cancel();
        assert_eq!(ticker.tick(&scope).await, None);
        tokio::time::timeout(Duration::from_secs(5), tasks.wait())
            .await
            .expect("cron timer task stops with its scope");
    }
}
