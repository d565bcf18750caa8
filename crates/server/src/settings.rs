//! Environment-driven configuration.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {name}")]
pub struct SettingsError {
    pub name: &'static str,
    pub value: String,
}

/// Hostmap reporting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostmapMode {
    #[default]
    Enabled,
    Leaders,
    Disabled,
}

/// Recognized environment options.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Extra debug tracing.
    pub debug: bool,
    /// Maintain and report per-type performance counters.
    pub perf_counters: bool,
    pub hostmap_mode: HostmapMode,
    /// Emit rank layout on startup.
    pub debug_ranks: bool,
    /// Print datums still alive at shutdown.
    pub report_leaks: bool,
    /// Read reference counting; disabled, read counts are ignored and
    /// data lives until its write count drops.
    pub read_refcount: bool,
    /// Byte budget offered per steal exchange.
    pub steal_max_memory: usize,
    /// How long a server idles before probing peers.
    pub idle_check_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            perf_counters: false,
            hostmap_mode: HostmapMode::default(),
            debug_ranks: false,
            report_leaks: false,
            read_refcount: true,
            steal_max_memory: 16 * 1024 * 1024,
            idle_check_interval: Duration::from_millis(100),
        }
    }
}

impl Settings {
    /// Read settings from `XLB_`-prefixed environment variables.
    /// Unset variables keep their defaults; malformed ones are errors.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut settings = Self::default();
        settings.debug = env_bool("XLB_DEBUG", settings.debug)?;
        settings.perf_counters = env_bool("XLB_PERF_COUNTERS", settings.perf_counters)?;
        settings.debug_ranks = env_bool("XLB_DEBUG_RANKS", settings.debug_ranks)?;
        settings.report_leaks = env_bool("XLB_REPORT_LEAKS", settings.report_leaks)?;
        settings.read_refcount = env_bool("XLB_READ_REFCOUNT", settings.read_refcount)?;

        if let Ok(value) = std::env::var("XLB_HOSTMAP_MODE") {
            settings.hostmap_mode = match value.to_ascii_lowercase().as_str() {
                "enabled" => HostmapMode::Enabled,
                "leaders" => HostmapMode::Leaders,
                "disabled" => HostmapMode::Disabled,
                _ => {
                    return Err(SettingsError {
                        name: "XLB_HOSTMAP_MODE",
                        value,
                    });
                }
            };
        }
        if let Ok(value) = std::env::var("XLB_STEAL_MAX_MEMORY") {
            settings.steal_max_memory = value.parse().map_err(|_| SettingsError {
                name: "XLB_STEAL_MAX_MEMORY",
                value,
            })?;
        }
        Ok(settings)
    }
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, SettingsError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => match value.as_str() {
            "1" | "true" | "TRUE" | "yes" => Ok(true),
            "0" | "false" | "FALSE" | "no" => Ok(false),
            _ => Err(SettingsError { name, value }),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert!(settings.read_refcount);
        assert!(!settings.report_leaks);
        assert_eq!(settings.hostmap_mode, HostmapMode::Enabled);
    }
}
