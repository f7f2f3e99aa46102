use std::path::PathBuf;

/// All recognized gateway settings, parsed and range-validated.
///
/// Mirrors the reference codebase's typed `Config` struct family
/// (`ServerConfig`, `CacheConfig`, `FfmpegConfig`, ...), flattened into one
/// value object because the gateway's settings are a single small KV file
/// rather than a layered `.env` + CLI + defaults stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub default_quality: u8,
    pub photo_size: u32,
    pub max_concurrency: usize,
    pub sharp_memory_limit_mb: u32,
    pub sharp_pixel_limit: u64,
    pub cache_ttl_ms: u64,
    pub cache_min_size: u64,
    pub rate_limit_requests: u32,
    pub rate_limit_window_ms: u64,
    pub rate_limit_queue_size: u32,
    pub stack_max_size: usize,
    pub stack_processing_delay_ms: u64,
    pub max_list: usize,
    pub webp_effort: u8,
    pub webp_effort_fast: u8,
    pub webp_reduction_effort: u32,
    pub compression_enabled: bool,
    pub image_conversion_enabled: bool,
    pub rate_limit_enabled: bool,
    pub emergency_disable_rate_limit: bool,
    pub drop_requests_when_overloaded: bool,
    pub aggressive_drop_enabled: bool,
    pub emergency_reset_enabled: bool,
    pub restart_enabled: bool,
    pub compression_threshold: f32,
    pub restart_time: String,
    pub magick_path: String,
    pub image_mode: u8,
    pub webp_preset: String,
    pub port: u16,
    pub root_path: PathBuf,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            default_quality: 80,
            photo_size: 1600,
            max_concurrency: 4,
            sharp_memory_limit_mb: 256,
            sharp_pixel_limit: 100_000_000,
            cache_ttl_ms: 7 * 24 * 60 * 60 * 1000,
            cache_min_size: 10 * 1024,
            rate_limit_requests: 100,
            rate_limit_window_ms: 60_000,
            rate_limit_queue_size: 50,
            stack_max_size: 100,
            stack_processing_delay_ms: 5,
            max_list: 2000,
            webp_effort: 4,
            webp_effort_fast: 2,
            webp_reduction_effort: 4,
            compression_enabled: true,
            image_conversion_enabled: true,
            rate_limit_enabled: true,
            emergency_disable_rate_limit: false,
            drop_requests_when_overloaded: true,
            aggressive_drop_enabled: true,
            emergency_reset_enabled: true,
            restart_enabled: false,
            compression_threshold: 0.3,
            restart_time: "04:00".to_string(),
            magick_path: "magick".to_string(),
            image_mode: 2,
            webp_preset: "photo".to_string(),
            port: 8080,
            root_path: PathBuf::from("."),
        }
    }
}

impl ConfigSnapshot {
    pub fn effective_rate_limit_enabled(&self) -> bool {
        self.rate_limit_enabled && !self.emergency_disable_rate_limit
    }

    pub fn clamp_quality(&self, requested: Option<u8>) -> u8 {
        requested.unwrap_or(self.default_quality).clamp(30, 90)
    }
}
