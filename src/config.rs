//! TOML configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rustc_hash::FxHashSet;
use serde::Deserialize;

use crate::convert::Rounding;
use crate::cycle::CycleSettings;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::sequencer::{Mode, SettlementPolicy, UnsettledPolicy};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub trade: TradeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    pub source: SourceConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountsConfig {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradeConfig {
    #[serde(default = "default_trade_with_pct")]
    pub trade_with_pct: f64,
    #[serde(default = "default_padding")]
    pub padding_usd: f64,
    #[serde(default = "default_rounding")]
    pub rounding: Rounding,
    #[serde(default = "default_mode")]
    pub mode: Mode,
}

fn default_trade_with_pct() -> f64 {
    100.0
}
fn default_padding() -> f64 {
    10.0
}
fn default_rounding() -> Rounding {
    Rounding::Down
}
fn default_mode() -> Mode {
    Mode::DryRun
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            trade_with_pct: default_trade_with_pct(),
            padding_usd: default_padding(),
            rounding: default_rounding(),
            mode: default_mode(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_secs: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_backoff() -> f64 {
    1.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_secs: default_base_backoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    #[serde(default = "default_wait")]
    pub wait_secs: u64,
    #[serde(default = "default_poll")]
    pub poll_secs: u64,
    #[serde(default = "default_on_unsettled")]
    pub on_unsettled: UnsettledPolicy,
}

fn default_wait() -> u64 {
    30
}
fn default_poll() -> u64 {
    1
}
fn default_on_unsettled() -> UnsettledPolicy {
    UnsettledPolicy::Proceed
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            wait_secs: default_wait(),
            poll_secs: default_poll(),
            on_unsettled: default_on_unsettled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_change_wait")]
    pub change_wait_secs: u64,
}

fn default_poll_interval() -> u64 {
    300
}
fn default_change_wait() -> u64 {
    30
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            change_wait_secs: default_change_wait(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub target_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub paper_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub dir: PathBuf,
}

fn default_snapshot_dir() -> PathBuf {
    "./snapshots".into()
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_audit_file")]
    pub audit_file: String,
}

fn default_log_dir() -> String {
    "./logs".into()
}
fn default_audit_file() -> String {
    "audit.jsonl".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            audit_file: default_audit_file(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate config invariants.
    fn validate(&self) -> Result<()> {
        if self.accounts.ids.is_empty() {
            return Err(Error::Config("accounts.ids must not be empty".into()));
        }
        // Ids become snapshot file names.
        let mut seen = FxHashSet::default();
        for id in &self.accounts.ids {
            if id.is_empty() {
                return Err(Error::Config("account ids must not be empty".into()));
            }
            if !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(Error::Config(format!(
                    "account id {id:?} may only contain letters, digits, '-' and '_'"
                )));
            }
            if !seen.insert(id.as_str()) {
                return Err(Error::Config(format!("account id {id:?} is listed twice")));
            }
        }
        let pct = self.trade.trade_with_pct;
        if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
            return Err(Error::Config("trade_with_pct must be in [0, 100]".into()));
        }
        if !self.trade.padding_usd.is_finite() || self.trade.padding_usd < 0.0 {
            return Err(Error::Config("padding_usd must be >= 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be >= 1".into()));
        }
        let backoff = self.retry.base_backoff_secs;
        if !backoff.is_finite() || backoff < 0.0 {
            return Err(Error::Config(
                "retry.base_backoff_secs must be finite and >= 0".into(),
            ));
        }
        if self.settlement.poll_secs == 0 {
            return Err(Error::Config("settlement.poll_secs must be > 0".into()));
        }
        if self.schedule.poll_interval_secs == 0 {
            return Err(Error::Config(
                "schedule.poll_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Padding in cents.
    pub fn padding_cents(&self) -> i64 {
        (self.trade.padding_usd * 100.0).round() as i64
    }

    /// Cycle settings with an optional mode override from the command line.
    pub fn cycle_settings(&self, mode_override: Option<Mode>) -> CycleSettings {
        CycleSettings {
            trade_with_pct: self.trade.trade_with_pct,
            padding_cents: self.padding_cents(),
            rounding: self.trade.rounding,
            mode: mode_override.unwrap_or(self.trade.mode),
            retry: RetryPolicy::new(
                self.retry.max_attempts,
                Duration::from_secs_f64(self.retry.base_backoff_secs),
            ),
            settlement: SettlementPolicy {
                wait: Duration::from_secs(self.settlement.wait_secs),
                poll: Duration::from_secs(self.settlement.poll_secs),
                on_unsettled: self.settlement.on_unsettled,
            },
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.schedule.poll_interval_secs)
    }

    pub fn change_wait(&self) -> Duration {
        Duration::from_secs(self.schedule.change_wait_secs)
    }

    /// Full path to the audit log file.
    pub fn audit_path(&self) -> PathBuf {
        Path::new(&self.logging.dir).join(&self.logging.audit_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_toml() -> &'static str {
        r#"
[accounts]
ids = ["PAPER-1", "PAPER-2"]

[trade]
trade_with_pct = 50.0
padding_usd = 25.5
rounding = "nearest"
mode = "live"

[retry]
max_attempts = 5
base_backoff_secs = 0.5

[settlement]
wait_secs = 10
poll_secs = 2
on_unsettled = "skip_buys"

[schedule]
poll_interval_secs = 60
change_wait_secs = 5

[source]
target_file = "target.json"

[broker]
paper_file = "paper_account.json"

[snapshot]
dir = "/var/lib/copytrade"

[logging]
dir = "/tmp/logs"
audit_file = "test.jsonl"
"#
    }

    fn minimal_toml() -> &'static str {
        r#"
[accounts]
ids = ["PAPER-1"]

[source]
target_file = "target.json"

[broker]
paper_file = "paper_account.json"
"#
    }

    #[test]
    fn parse_full_config() {
        let config = Config::from_toml(example_toml()).unwrap();
        assert_eq!(config.accounts.ids, vec!["PAPER-1", "PAPER-2"]);
        assert_eq!(config.trade.rounding, Rounding::Nearest);
        assert_eq!(config.trade.mode, Mode::Live);
        assert_eq!(config.padding_cents(), 25_50);
        assert_eq!(config.settlement.on_unsettled, UnsettledPolicy::SkipBuys);
        assert_eq!(config.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.change_wait(), Duration::from_secs(5));
        assert_eq!(config.audit_path(), PathBuf::from("/tmp/logs/test.jsonl"));
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let config = Config::from_toml(minimal_toml()).unwrap();
        assert_eq!(config.trade.trade_with_pct, 100.0);
        assert_eq!(config.padding_cents(), 10_00);
        assert_eq!(config.trade.rounding, Rounding::Down);
        assert_eq!(config.trade.mode, Mode::DryRun);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.settlement.wait_secs, 30);
        assert_eq!(config.settlement.on_unsettled, UnsettledPolicy::Proceed);
        assert_eq!(config.schedule.poll_interval_secs, 300);
        assert_eq!(config.snapshot.dir, PathBuf::from("./snapshots"));
        assert_eq!(config.audit_path(), PathBuf::from("./logs/audit.jsonl"));
    }

    #[test]
    fn cycle_settings_from_config() {
        let config = Config::from_toml(example_toml()).unwrap();
        let settings = config.cycle_settings(None);
        assert_eq!(settings.mode, Mode::Live);
        assert_eq!(settings.padding_cents, 25_50);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.retry.base_delay, Duration::from_millis(500));
        assert_eq!(settings.settlement.wait, Duration::from_secs(10));
        assert_eq!(settings.settlement.poll, Duration::from_secs(2));

        let forced = config.cycle_settings(Some(Mode::DryRun));
        assert_eq!(forced.mode, Mode::DryRun);
    }

    #[test]
    fn missing_required_section() {
        let toml = r#"
[accounts]
ids = ["PAPER-1"]
"#;
        assert!(matches!(
            Config::from_toml(toml),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn unknown_rounding_rejected_at_load() {
        let toml = minimal_toml().replace(
            "[source]",
            "[trade]\nrounding = \"up\"\n\n[source]",
        );
        assert!(matches!(
            Config::from_toml(&toml),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let cases = [
            ("[accounts]\nids = [\"PAPER-1\"]", "[accounts]\nids = []"),
            ("[accounts]\nids = [\"PAPER-1\"]", "[accounts]\nids = [\" \"]"),
            ("[source]", "[trade]\ntrade_with_pct = 120.0\n\n[source]"),
            ("[source]", "[trade]\npadding_usd = -1.0\n\n[source]"),
            ("[source]", "[retry]\nmax_attempts = 0\n\n[source]"),
            ("[source]", "[retry]\nbase_backoff_secs = -2.0\n\n[source]"),
            ("[source]", "[settlement]\npoll_secs = 0\n\n[source]"),
            ("[source]", "[schedule]\npoll_interval_secs = 0\n\n[source]"),
        ];
        for (from, to) in cases {
            let toml = minimal_toml().replace(from, to);
            assert!(
                matches!(Config::from_toml(&toml), Err(Error::Config(_))),
                "accepted: {to}"
            );
        }
    }

    #[test]
    fn account_ids_must_map_to_distinct_snapshot_files() {
        for ids in [
            r#"["a/1"]"#,
            r#"["../etc"]"#,
            r#"["ACC 1"]"#,
            r#"["a/1", "a_1"]"#,
            r#"["PAPER-1", "PAPER-1"]"#,
        ] {
            let toml = minimal_toml().replace(r#"ids = ["PAPER-1"]"#, &format!("ids = {ids}"));
            assert!(
                matches!(Config::from_toml(&toml), Err(Error::Config(_))),
                "accepted: {ids}"
            );
        }

        let toml = minimal_toml().replace(
            r#"ids = ["PAPER-1"]"#,
            r#"ids = ["PAPER-1", "acc_2"]"#,
        );
        assert_eq!(Config::from_toml(&toml).unwrap().accounts.ids.len(), 2);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, minimal_toml()).unwrap();
        assert!(Config::load(&path).is_ok());
        assert!(matches!(
            Config::load(&dir.path().join("missing.toml")),
            Err(Error::ConfigRead { .. })
        ));
    }
}
