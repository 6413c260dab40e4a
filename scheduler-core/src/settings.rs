//! Ambient configuration surface (SPEC_FULL.md §6), loaded from a TOML file
//! the way the teacher's `ConfigManager` loads `AgentConfig`
//! (`agent/src/config.rs`): read the file, parse, validate, log every
//! resolved field at `debug!`.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SchedulerError};

fn default_shutdown_timeout_ms() -> u64 {
    60_000
}

fn default_etcd_lease_ttl_secs() -> i64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    /// Root package the class-scanning layer starts from. This crate does
    /// not implement scanning itself (see SPEC_FULL.md's Non-goals); the
    /// field is carried through so a caller's own scanner can read it from
    /// the same file.
    pub base_package: String,
    /// Regexes matched against a candidate class's fully-qualified name by
    /// `matches_scan_filter`. Empty means "include everything not excluded".
    #[serde(default)]
    pub includes: Vec<String>,
    /// Regexes that veto a candidate regardless of `includes` (checked
    /// first in `matches_scan_filter`).
    #[serde(default)]
    pub exclusions: Vec<String>,
    #[serde(skip)]
    compiled_includes: Vec<Regex>,
    #[serde(skip)]
    compiled_exclusions: Vec<Regex>,
    #[serde(default)]
    pub etcd_enable: bool,
    #[serde(default)]
    pub etcd_endpoints: Vec<String>,
    /// TTL in seconds for the lease backing `EtcdPort`'s keepalive
    /// (`spawn_ttl_refresher` refreshes at half this interval).
    #[serde(default = "default_etcd_lease_ttl_secs")]
    pub etcd_lease_ttl_secs: i64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl SchedulerSettings {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SchedulerError::Config(format!("reading {}: {e}", path.display())))?;
        let mut settings: SchedulerSettings = toml::from_str(&raw)
            .map_err(|e| SchedulerError::Config(format!("parsing {}: {e}", path.display())))?;
        settings.validate()?;
        settings.compile_filters()?;

        debug!(
            base_package = %settings.base_package,
            includes = ?settings.includes,
            exclusions = ?settings.exclusions,
            etcd_enable = settings.etcd_enable,
            etcd_endpoints = ?settings.etcd_endpoints,
            etcd_lease_ttl_secs = settings.etcd_lease_ttl_secs,
            shutdown_timeout_ms = settings.shutdown_timeout_ms,
            "scheduler settings loaded"
        );
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.base_package.trim().is_empty() {
            return Err(SchedulerError::Config("base_package must not be blank".into()));
        }
        if self.etcd_enable && self.etcd_endpoints.is_empty() {
            return Err(SchedulerError::Config(
                "etcd_enable=true requires at least one etcd_endpoints entry".into(),
            ));
        }
        if self.etcd_enable && self.etcd_lease_ttl_secs <= 0 {
            return Err(SchedulerError::Config(
                "etcd_lease_ttl_secs must be positive when etcd_enable=true".into(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn compile_filters(&mut self) -> Result<()> {
        self.compiled_includes = self
            .includes
            .iter()
            .map(|p| Regex::new(p).map_err(|e| SchedulerError::Config(format!("invalid includes pattern {p:?}: {e}"))))
            .collect::<Result<_>>()?;
        self.compiled_exclusions = self
            .exclusions
            .iter()
            .map(|p| Regex::new(p).map_err(|e| SchedulerError::Config(format!("invalid exclusions pattern {p:?}: {e}"))))
            .collect::<Result<_>>()?;
        Ok(())
    }

    /// Applies the `includes`/`exclusions` regex lists (SPEC_FULL.md §6) to a
    /// candidate class's fully-qualified name. An embedding application's own
    /// scanner (component discovery is out of scope for this crate, per
    /// spec.md's Non-goals) calls this to decide whether a discovered class
    /// should be handed to `Registry::register_class`. `exclusions` always
    /// wins; an empty `includes` list means "everything not excluded".
    pub fn matches_scan_filter(&self, candidate_class: &str) -> bool {
        if self.compiled_exclusions.iter().any(|r| r.is_match(candidate_class)) {
            return false;
        }
        self.compiled_includes.is_empty()
            || self.compiled_includes.iter().any(|r| r.is_match(candidate_class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_minimal_settings_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "base_package = \"com.example.jobs\"").unwrap();

        let settings = SchedulerSettings::load(file.path()).await.unwrap();
        assert_eq!(settings.base_package, "com.example.jobs");
        assert!(!settings.etcd_enable);
        assert_eq!(settings.shutdown_timeout_ms, 60_000);
    }

    #[tokio::test]
    async fn etcd_enabled_without_endpoints_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "base_package = \"com.example.jobs\"").unwrap();
        writeln!(file, "etcd_enable = true").unwrap();

        let err = SchedulerSettings::load(file.path()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Config(_)));
    }

    #[tokio::test]
    async fn etcd_enabled_with_non_positive_ttl_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "base_package = \"com.example.jobs\"").unwrap();
        writeln!(file, "etcd_enable = true").unwrap();
        writeln!(file, "etcd_endpoints = [\"http://localhost:2379\"]").unwrap();
        writeln!(file, "etcd_lease_ttl_secs = 0").unwrap();

        let err = SchedulerSettings::load(file.path()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Config(_)));
    }

    #[tokio::test]
    async fn scan_filter_excludes_win_over_includes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "base_package = \"com.example.jobs\"").unwrap();
        writeln!(file, "includes = [\"^com\\\\.example\\\\.jobs\\\\..*\"]").unwrap();
        writeln!(file, "exclusions = [\".*Deprecated$\"]").unwrap();

        let settings = SchedulerSettings::load(file.path()).await.unwrap();
        assert!(settings.matches_scan_filter("com.example.jobs.NightlyReport"));
        assert!(!settings.matches_scan_filter("com.example.jobs.OldTask.Deprecated"));
        assert!(!settings.matches_scan_filter("com.other.jobs.NightlyReport"));
    }

    #[tokio::test]
    async fn scan_filter_with_no_includes_admits_anything_not_excluded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "base_package = \"com.example.jobs\"").unwrap();
        writeln!(file, "exclusions = [\"^com\\\\.example\\\\.internal\\\\..*\"]").unwrap();

        let settings = SchedulerSettings::load(file.path()).await.unwrap();
        assert!(settings.matches_scan_filter("com.example.jobs.NightlyReport"));
        assert!(!settings.matches_scan_filter("com.example.internal.Secret"));
    }
}
