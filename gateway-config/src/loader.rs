use std::collections::HashMap;
use std::path::Path;

use crate::error::{ConfigError, Result};
use crate::snapshot::ConfigSnapshot;

/// A single rejected key/value pair, kept so the registry can log it once per
/// reload instead of silently substituting the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub key: String,
    pub raw_value: String,
    pub reason: String,
}

pub struct LoadOutcome {
    pub snapshot: ConfigSnapshot,
    pub warnings: Vec<ConfigWarning>,
}

/// Reads `path` as `KEY=VALUE` lines (UTF-8, `#`-prefixed comments and blank
/// lines ignored) and builds a [`ConfigSnapshot`]. Unknown keys are ignored;
/// out-of-range or mistyped values fall back to the corresponding default and
/// are reported via [`ConfigWarning`].
pub async fn load_from_path(path: &Path) -> Result<LoadOutcome> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(parse(&text))
}

pub async fn save_to_path(path: &Path, content: &str) -> Result<()> {
    tokio::fs::write(path, content)
        .await
        .map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
}

pub fn parse(text: &str) -> LoadOutcome {
    let raw = parse_kv_lines(text);
    let mut snapshot = ConfigSnapshot::default();
    let mut warnings = Vec::new();

    macro_rules! int_field {
        ($key:literal, $field:ident, $ty:ty, $min:expr, $max:expr) => {
            if let Some(v) = raw.get($key) {
                match v.parse::<$ty>() {
                    Ok(n) if ($min..=$max).contains(&n) => snapshot.$field = n,
                    Ok(n) => warnings.push(ConfigWarning {
                        key: $key.to_string(),
                        raw_value: v.clone(),
                        reason: format!("{n} outside range {}..={}", $min, $max),
                    }),
                    Err(_) => warnings.push(ConfigWarning {
                        key: $key.to_string(),
                        raw_value: v.clone(),
                        reason: "not an integer".to_string(),
                    }),
                }
            }
        };
    }

    macro_rules! bool_field {
        ($key:literal, $field:ident) => {
            if let Some(v) = raw.get($key) {
                match v.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => snapshot.$field = true,
                    "false" | "0" | "no" => snapshot.$field = false,
                    _ => warnings.push(ConfigWarning {
                        key: $key.to_string(),
                        raw_value: v.clone(),
                        reason: "not a boolean".to_string(),
                    }),
                }
            }
        };
    }

    int_field!("DEFAULT_QUALITY", default_quality, u8, 10, 100);
    int_field!("PHOTO_SIZE", photo_size, u32, 100, 8192);
    int_field!("MAX_CONCURRENCY", max_concurrency, usize, 1, 32);
    int_field!("SHARP_MEMORY_LIMIT", sharp_memory_limit_mb, u32, 16, 4096);
    int_field!(
        "SHARP_PIXEL_LIMIT",
        sharp_pixel_limit,
        u64,
        1_000_000,
        1_000_000_000
    );
    int_field!("CACHE_TTL_MS", cache_ttl_ms, u64, 60_000, 86_400_000);
    int_field!(
        "CACHE_MIN_SIZE",
        cache_min_size,
        u64,
        1024,
        104_857_600
    );
    int_field!("RATE_LIMIT_REQUESTS", rate_limit_requests, u32, 1, 1000);
    int_field!(
        "RATE_LIMIT_WINDOW_MS",
        rate_limit_window_ms,
        u64,
        1000,
        300_000
    );
    int_field!(
        "RATE_LIMIT_QUEUE_SIZE",
        rate_limit_queue_size,
        u32,
        10,
        1000
    );
    int_field!("STACK_MAX_SIZE", stack_max_size, usize, 50, 500);
    int_field!(
        "STACK_PROCESSING_DELAY_MS",
        stack_processing_delay_ms,
        u64,
        1,
        100
    );
    int_field!("MAX_LIST", max_list, usize, 10, 10_000);
    int_field!("WEBP_EFFORT", webp_effort, u8, 0, 6);
    int_field!("WEBP_EFFORT_FAST", webp_effort_fast, u8, 0, 6);
    int_field!("WEBP_REDUCTION_EFFORT", webp_reduction_effort, u32, 0, u32::MAX);
    int_field!("PORT", port, u16, 1, 65535);

    bool_field!("COMPRESSION_ENABLED", compression_enabled);
    bool_field!("IMAGE_CONVERSION_ENABLED", image_conversion_enabled);
    bool_field!("RATE_LIMIT_ENABLED", rate_limit_enabled);
    bool_field!(
        "EMERGENCY_DISABLE_RATE_LIMIT",
        emergency_disable_rate_limit
    );
    bool_field!(
        "DROP_REQUESTS_WHEN_OVERLOADED",
        drop_requests_when_overloaded
    );
    bool_field!("AGGRESSIVE_DROP_ENABLED", aggressive_drop_enabled);
    bool_field!("EMERGENCY_RESET_ENABLED", emergency_reset_enabled);
    bool_field!("RESTART_ENABLED", restart_enabled);

    if let Some(v) = raw.get("COMPRESSION_THRESHOLD") {
        match v.parse::<f32>() {
            Ok(n) if (0.0..=1.0).contains(&n) => snapshot.compression_threshold = n,
            Ok(n) => warnings.push(ConfigWarning {
                key: "COMPRESSION_THRESHOLD".into(),
                raw_value: v.clone(),
                reason: format!("{n} outside range 0.0..=1.0"),
            }),
            Err(_) => warnings.push(ConfigWarning {
                key: "COMPRESSION_THRESHOLD".into(),
                raw_value: v.clone(),
                reason: "not a float".into(),
            }),
        }
    }

    if let Some(v) = raw.get("RESTART_TIME") {
        if is_valid_hhmm(v) {
            snapshot.restart_time = v.clone();
        } else {
            warnings.push(ConfigWarning {
                key: "RESTART_TIME".into(),
                raw_value: v.clone(),
                reason: "expected HH:MM".into(),
            });
        }
    }

    if let Some(v) = raw.get("IMAGE_MODE") {
        match v.parse::<u8>() {
            Ok(n @ 1..=3) => snapshot.image_mode = n,
            _ => warnings.push(ConfigWarning {
                key: "IMAGE_MODE".into(),
                raw_value: v.clone(),
                reason: "expected 1, 2, or 3".into(),
            }),
        }
    }

    if let Some(v) = raw.get("MAGICK_PATH") {
        snapshot.magick_path = v.clone();
    }
    if let Some(v) = raw.get("WEBP_PRESET") {
        snapshot.webp_preset = v.clone();
    }
    if let Some(v) = raw.get("ROOT_PATH") {
        snapshot.root_path = v.into();
    }

    LoadOutcome { snapshot, warnings }
}

fn parse_kv_lines(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

fn is_valid_hhmm(s: &str) -> bool {
    let Some((h, m)) = s.split_once(':') else {
        return false;
    };
    matches!((h.parse::<u32>(), m.parse::<u32>()), (Ok(h), Ok(m)) if h < 24 && m < 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_keys_are_ignored() {
        let outcome = parse("NOT_A_REAL_KEY=123\nDEFAULT_QUALITY=70\n");
        assert_eq!(outcome.snapshot.default_quality, 70);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn out_of_range_falls_back_to_default_and_warns() {
        let outcome = parse("DEFAULT_QUALITY=5\n");
        assert_eq!(outcome.snapshot.default_quality, ConfigSnapshot::default().default_quality);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].key, "DEFAULT_QUALITY");
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let outcome = parse("# a comment\n\nPORT=9001\n");
        assert_eq!(outcome.snapshot.port, 9001);
    }

    #[test]
    fn restart_time_requires_hh_mm() {
        let bad = parse("RESTART_TIME=25:99\n");
        assert_eq!(bad.warnings.len(), 1);
        let good = parse("RESTART_TIME=04:30\n");
        assert_eq!(good.snapshot.restart_time, "04:30");
    }

    #[test]
    fn booleans_accept_common_spellings() {
        let outcome = parse("RESTART_ENABLED=yes\n");
        assert!(outcome.snapshot.restart_enabled);
    }
}
