// Configuration document loading (serde + serde_yaml): a list of prospector
// stanzas plus registrar settings. Duration fields are human-readable
// strings ("10s", "24h") via `humantime-serde`; invalid values fail startup.

use crate::errors::ConfigError;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_scan_frequency() -> Duration {
    Duration::from_secs(10)
}

/// `0` is the "disabled" sentinel: never skip as ignore-older, never
/// idle-exit a harvester purely on age.
fn default_ignore_older() -> Duration {
    Duration::ZERO
}

fn default_harvester_buffer_size() -> usize {
    16 * 1024
}

fn default_registrar_path() -> PathBuf {
    PathBuf::from("registry.json")
}

fn default_flush_every_acks() -> u64 {
    1000
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_consecutive_snapshot_failures() -> u32 {
    5
}

/// One prospector stanza: a set of glob patterns plus the policy that
/// governs how they're scanned and harvested. Mirrors filebeat's
/// `FileConfig`, with each prospector resolving its own `scan_frequency`/
/// `ignore_older` defaults independently rather than from one process-wide
/// default (SPEC_FULL.md section D).
#[derive(Debug, Clone, Deserialize)]
pub struct ProspectorConfig {
    /// Glob patterns to expand each scan. `"-"` means stdin.
    pub paths: Vec<String>,

    #[serde(with = "humantime_serde", default = "default_scan_frequency")]
    pub scan_frequency: Duration,

    #[serde(with = "humantime_serde", default = "default_ignore_older")]
    pub ignore_older: Duration,

    #[serde(default = "default_harvester_buffer_size")]
    pub harvester_buffer_size: usize,

    #[serde(default)]
    pub tail_on_rotate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistrarConfig {
    #[serde(default = "default_registrar_path")]
    pub path: PathBuf,

    #[serde(default = "default_flush_every_acks")]
    pub flush_every_acks: u64,

    #[serde(with = "humantime_serde", default = "default_flush_interval")]
    pub flush_interval: Duration,

    #[serde(default = "default_max_consecutive_snapshot_failures")]
    pub max_consecutive_snapshot_failures: u32,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        RegistrarConfig {
            path: default_registrar_path(),
            flush_every_acks: default_flush_every_acks(),
            flush_interval: default_flush_interval(),
            max_consecutive_snapshot_failures: default_max_consecutive_snapshot_failures(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub prospectors: Vec<ProspectorConfig>,

    #[serde(default)]
    pub registrar: RegistrarConfig,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &std::path::Path) -> Result<Self, ConfigError> {
        let config: Config =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        for (index, prospector) in config.prospectors.iter().enumerate() {
            if prospector.paths.is_empty() {
                return Err(ConfigError::NoPaths { index });
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let yaml = r#"
prospectors:
  - paths: ["/var/log/*.log"]
"#;
        let config = Config::parse(yaml, std::path::Path::new("<test>")).unwrap();
        assert_eq!(config.prospectors.len(), 1);
        assert_eq!(config.prospectors[0].scan_frequency, Duration::from_secs(10));
        assert_eq!(config.prospectors[0].harvester_buffer_size, 16 * 1024);
        assert_eq!(config.registrar.flush_every_acks, 1000);
    }

    #[test]
    fn parses_human_readable_durations() {
        let yaml = r#"
prospectors:
  - paths: ["/var/log/*.log"]
    scan_frequency: 5s
    ignore_older: 24h
    tail_on_rotate: true
registrar:
  path: /var/lib/flicker/registry.json
  flush_interval: 30s
"#;
        let config = Config::parse(yaml, std::path::Path::new("<test>")).unwrap();
        assert_eq!(config.prospectors[0].scan_frequency, Duration::from_secs(5));
        assert_eq!(
            config.prospectors[0].ignore_older,
            Duration::from_secs(24 * 3600)
        );
        assert!(config.prospectors[0].tail_on_rotate);
        assert_eq!(config.registrar.flush_interval, Duration::from_secs(30));
    }

    #[test]
    fn rejects_prospector_with_no_paths() {
        let yaml = r#"
prospectors:
  - paths: []
"#;
        let err = Config::parse(yaml, std::path::Path::new("<test>")).unwrap_err();
        assert!(matches!(err, ConfigError::NoPaths { index: 0 }));
    }

    #[test]
    fn rejects_invalid_duration() {
        let yaml = r#"
prospectors:
  - paths: ["/var/log/*.log"]
    scan_frequency: "not a duration"
"#;
        let err = Config::parse(yaml, std::path::Path::new("<test>"));
        assert!(err.is_err());
    }
}
