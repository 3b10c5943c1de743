//! Wall clock and the fixed local time zone (UTC+5:45).
//!
//! Instants travel as `DateTime<Utc>` and are converted to local date/time
//! here, at the service boundary. The ledger only sees naive local values.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};

/// Offset of the attendance time zone from UTC, in seconds.
pub const LOCAL_OFFSET_SECS: i32 = 5 * 3600 + 45 * 60;

pub fn local_offset() -> FixedOffset {
    FixedOffset::east_opt(LOCAL_OFFSET_SECS).expect("UTC+5:45 is a valid offset")
}

pub fn to_local(instant: DateTime<Utc>) -> DateTime<FixedOffset> {
    instant.with_timezone(&local_offset())
}

/// Attach the local offset to a naive local date/time.
pub fn local_timestamp(date: NaiveDate, time: NaiveTime) -> DateTime<FixedOffset> {
    let naive_utc = date.and_time(time) - Duration::seconds(i64::from(LOCAL_OFFSET_SECS));
    local_offset().from_utc_datetime(&naive_utc)
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn local_now(&self) -> DateTime<FixedOffset> {
        to_local(self.now())
    }
}

impl<T: Clock + ?Sized> Clock for Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now) }
    }

    /// Clock pinned to a local wall-clock reading.
    pub fn at_local(date: NaiveDate, time: NaiveTime) -> Self {
        Self::new(local_timestamp(date, time).with_timezone(&Utc))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn set_local(&self, date: NaiveDate, time: NaiveTime) {
        self.set(local_timestamp(date, time).with_timezone(&Utc));
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
