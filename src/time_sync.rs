// time_sync.rs - wall clock and NTP policy

use crate::*;

pub const NTP_SYNC_INTERVAL_SECS: i64 = 7 * 24 * 60 * 60;

pub trait Clock {
    /// Current wall clock time. Not meaningful before the first sync.
    fn now(&self) -> DateTime<Utc>;
    /// Blocking NTP sync against `server`; false on timeout.
    fn sync(&mut self, server: &str) -> bool;
    fn delay_ms(&mut self, ms: u32);
    fn uptime_ms(&self) -> u32;
}

pub fn is_valid_time(t: DateTime<Utc>) -> bool {
    t.year() > 2020
}

fn valid_timestamp(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(ts, 0).filter(|t| is_valid_time(*t))
}

/// Why a sync is needed, or None to skip it.
pub fn sync_reason(now: DateTime<Utc>, last_sync: i64, mode: WakeMode) -> Option<&'static str> {
    if !is_valid_time(now) {
        return Some("invalid current time");
    }
    let Some(last) = valid_timestamp(last_sync) else {
        return Some("never synced before");
    };
    if (now - last).num_seconds() > NTP_SYNC_INTERVAL_SECS {
        return Some("interval exceeded");
    }
    if mode == WakeMode::ManualTransmit {
        return Some("manual mode");
    }
    None
}

/// Best effort: failures are counted, never fatal.
pub fn sync_time(clock: &mut dyn Clock, settings: &mut Settings, mode: WakeMode) {
    let now = clock.now();
    let Some(reason) = sync_reason(now, settings.last_ntp_sync, mode) else {
        let days = (now.timestamp() - settings.last_ntp_sync) / 86_400;
        info!("NTP: Skipping sync - last sync {days} days ago");
        return;
    };
    info!("NTP: Sync needed - {reason}");

    if clock.sync(&settings.ntp_server) {
        settings.last_ntp_sync = clock.now().timestamp();
        info!("NTP: Sync successful, saved timestamp");
    } else {
        settings.ntp_error_counter = settings.ntp_error_counter.saturating_add(1);
        error!("NTP: Sync failed ({} errors)", settings.ntp_error_counter);
    }
}


// EOF
