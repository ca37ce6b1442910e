// Feed schedule interpretation
//
// Schedules are simple interval specs: "300s", "5m", "2h", "daily",
// "hourly", "weekly", "every 15m", or a bare number of seconds. A feed is
// due when it has never run or its interval has elapsed since last_run_at.

use chrono::{DateTime, Duration, Utc};

use shu_core::traits::PluginFeed;

const MIN_INTERVAL_SECONDS: i64 = 60;

/// Parse a schedule spec into seconds. None when unparseable.
pub fn interval_seconds(schedule: &str) -> Option<i64> {
    let spec = schedule.trim().to_ascii_lowercase();
    let spec = spec.strip_prefix("every ").unwrap_or(&spec).trim();

    let seconds = match spec {
        "hourly" => 3600,
        "daily" => 86_400,
        "weekly" => 604_800,
        _ => {
            if let Ok(n) = spec.parse::<i64>() {
                n
            } else {
                let (number, unit) = spec.split_at(spec.len().saturating_sub(1));
                let value: i64 = number.trim().parse().ok()?;
                match unit {
                    "s" => value,
                    "m" => value * 60,
                    "h" => value * 3600,
                    "d" => value * 86_400,
                    _ => return None,
                }
            }
        }
    };

    (seconds > 0).then_some(seconds.max(MIN_INTERVAL_SECONDS))
}

/// True when the feed should run at `now`.
pub fn is_due(feed: &PluginFeed, now: DateTime<Utc>) -> bool {
    let Some(interval) = interval_seconds(&feed.schedule) else {
        return false;
    };
    match feed.last_run_at {
        None => true,
        Some(last_run) => now - last_run >= Duration::seconds(interval),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn feed(schedule: &str, last_run_at: Option<DateTime<Utc>>) -> PluginFeed {
        PluginFeed {
            id: Uuid::now_v7(),
            user_id: "user-1".to_string(),
            plugin_name: "p".to_string(),
            params: json!({}),
            schedule: schedule.to_string(),
            enabled: true,
            last_run_at,
        }
    }

    #[test]
    fn parses_interval_specs() {
        assert_eq!(interval_seconds("300s"), Some(300));
        assert_eq!(interval_seconds("5m"), Some(300));
        assert_eq!(interval_seconds("2h"), Some(7200));
        assert_eq!(interval_seconds("every 15m"), Some(900));
        assert_eq!(interval_seconds("daily"), Some(86_400));
        assert_eq!(interval_seconds("900"), Some(900));
        assert_eq!(interval_seconds("soon"), None);
        assert_eq!(interval_seconds("-5m"), None);
    }

    #[test]
    fn short_intervals_are_floored() {
        assert_eq!(interval_seconds("5s"), Some(60));
    }

    #[test]
    fn never_run_feeds_are_due() {
        assert!(is_due(&feed("5m", None), Utc::now()));
    }

    #[test]
    fn due_after_interval_elapses() {
        let now = Utc::now();
        let recent = feed("5m", Some(now - Duration::seconds(60)));
        let stale = feed("5m", Some(now - Duration::seconds(600)));
        assert!(!is_due(&recent, now));
        assert!(is_due(&stale, now));
    }
}
