use chrono::Timelike;
use chrono_tz::Tz;

/// Returns true when the current wall-clock time in `tz` matches `hh_mm`
/// (to the minute). Used by the gateway's lifecycle task to decide whether
/// this is the minute to trigger a scheduled restart.
pub fn matches_restart_time(hh_mm: &str, tz: Tz, now_utc: chrono::DateTime<chrono::Utc>) -> bool {
    let Some((h, m)) = hh_mm.split_once(':') else {
        return false;
    };
    let (Ok(h), Ok(m)) = (h.parse::<u32>(), m.parse::<u32>()) else {
        return false;
    };
    let local = now_utc.with_timezone(&tz);
    local.hour() == h && local.minute() == m
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn matches_exact_minute() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        // 2024-01-01 04:00:00 JST == 2023-12-31 19:00:00 UTC
        let now = chrono::Utc.with_ymd_and_hms(2023, 12, 31, 19, 0, 0).unwrap();
        assert!(matches_restart_time("04:00", tz, now));
        assert!(!matches_restart_time("04:01", tz, now));
    }

    #[test]
    fn rejects_malformed_time() {
        let tz: Tz = "UTC".parse().unwrap();
        let now = chrono::Utc::now();
        assert!(!matches_restart_time("not-a-time", tz, now));
    }
}
