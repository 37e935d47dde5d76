use chrono::NaiveTime;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    pub stream: StreamConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub harvester: HarvesterConfig,
    pub engine: EngineConfig,
    pub response: ResponseConfig,
    pub thresholds: Thresholds,
    pub signatures: Signatures,
    pub whitelists: Whitelists,
    pub rules: RuleSettings,
}

/// Anomaly store (PostgreSQL).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Source DB instrumentation read surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub url: String,
    /// The pipeline's own DB account, excluded server-side.
    pub self_user: String,
    /// The pipeline's own schema, excluded server-side.
    pub self_schema: String,
    /// Magic substring marking pipeline-generated statements.
    pub self_marker: String,
    /// Persistent mirror of the statement ring (cold source), maintained by
    /// a DB-side scheduled job.
    pub cold_table: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub url: String,
    /// Stream key prefix; the full key is `<prefix>:<dbms>`.
    pub prefix: String,
    pub group: String,
    pub quarantine_prefix: String,
    pub response_queue: String,
    /// Approximate stream length bound (XADD MAXLEN ~).
    pub maxlen: usize,
    /// Depth at which the harvester starts slowing down.
    pub soft_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for state files, parquet staging/archive and model blobs
    /// (`UBA_LOGS_DIR`).
    pub logs_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvesterConfig {
    pub source_dbms: String,
    pub poll_interval_ms: u64,
    /// Poll interval ceiling under stream backpressure.
    pub max_poll_interval_ms: u64,
    pub batch_size: usize,
    pub backoff_cap_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub block_ms: u64,
    pub consumer_prefix: String,
    /// Unacked messages older than this are reclaimed from dead consumers.
    pub visibility_timeout_ms: u64,
    /// Staged parquet parts older than this are moved to the archive.
    pub archive_grace_secs: u64,
    /// Consecutive sink failures before a batch is quarantined.
    pub max_batch_failures: u32,
    pub lag_warn_depth: usize,
    /// Soft score threshold above which `all_logs.is_anomaly` is set even
    /// without a rule hit.
    pub anomaly_score_threshold: f64,
    pub profile_stale_secs: u64,
    /// Refit a profile when its sample count grew by this fraction.
    pub profile_refit_growth: f64,
    /// Per-user feature history kept in memory for model training.
    pub profile_history_cap: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    pub enabled: bool,
    /// Admin channel for lockout/kill (`MYSQL_ADMIN_URL`).
    pub admin_url: String,
    /// Accounts the responder must never lock.
    pub protected_users: Vec<String>,
    /// Event-anomaly count per user per batch that triggers a directive.
    pub lockout_threshold: usize,
}

/// Rule thresholds. All of these are runtime configuration by contract;
/// embedding them in rule code is forbidden.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub mass_deletion_rows: i64,
    pub execution_time_limit_ms: f64,
    pub cpu_time_limit_ms: f64,
    pub lock_time_limit_ms: f64,
    pub brute_force_attempts: u32,
    pub scan_efficiency_min: f64,
    pub scan_efficiency_min_rows: i64,
    pub max_query_entropy: f64,
    pub warning_count_threshold: i32,
    pub index_evasion_min_rows: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Signatures {
    pub sqli_keywords: Vec<String>,
    pub admin_keywords: Vec<String>,
    pub sensitive_tables: Vec<String>,
    pub large_dump_tables: Vec<String>,
    pub disallowed_programs: Vec<String>,
    pub restricted_connection_users: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Whitelists {
    pub maintenance_users: Vec<String>,
    pub maintenance_keywords: Vec<String>,
    /// Maintenance window during which maintenance users are exempt ("HH:MM").
    pub maintenance_window_start: String,
    pub maintenance_window_end: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuleSettings {
    pub late_night_start_time: String,
    pub late_night_end_time: String,
    pub work_hours_start: u32,
    pub work_hours_end: u32,
    pub safe_hours_start: u32,
    pub safe_hours_end: u32,
    /// 0 = Monday .. 6 = Sunday.
    pub safe_weekdays: Vec<u8>,
    pub time_window_minutes: i64,
    pub min_distinct_tables: usize,
    pub profile_min_samples: usize,
    pub quantile_start: f64,
    pub quantile_end: f64,
    pub allowed_users_sensitive: Vec<String>,
    pub admin_users: Vec<String>,
    pub ddl_allowed_tables: Vec<String>,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "vigil")]
#[command(version, about = "Vigil - Database UEBA Pipeline")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Anomaly store URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Source DB URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub source_url: Option<String>,

    /// Redis URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub redis_url: Option<String>,

    /// State / archive root directory (overrides config file)
    #[arg(long, value_name = "DIR")]
    pub logs_dir: Option<String>,

    /// Logging level (overrides config file, e.g. "info,vigil=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Harvester poll interval in milliseconds (overrides config file)
    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    /// Harvester batch size (overrides config file)
    #[arg(long, value_name = "ROWS")]
    pub batch_size: Option<usize>,

    /// Engine only: process staged archive files instead of the stream,
    /// then exit
    #[arg(long)]
    pub backfill: bool,

    /// init-db only: drop the existing tables before creating them
    #[arg(long)]
    pub recreate: bool,
}

impl Config {
    /// Load configuration with command line, environment variable, and file
    /// support.
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables
    /// 3. Configuration file (vigil.toml)
    /// 4. Default values
    pub fn load() -> Result<(Self, CommandLineArgs), anyhow::Error> {
        let cli_args = CommandLineArgs::parse();
        let config = Self::load_with(&cli_args)?;
        Ok((config, cli_args))
    }

    pub fn load_with(cli_args: &CommandLineArgs) -> Result<Self, anyhow::Error> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - DATABASE_URL: anomaly store URL
    /// - MYSQL_LOG_DATABASE_URL: source DB URL
    /// - MYSQL_ADMIN_URL: responder admin channel URL
    /// - REDIS_URL: stream backend URL
    /// - UBA_LOGS_DIR: state + archive root
    /// - VIGIL_LOG_LEVEL: logging level
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
            tracing::info!("Override database.url from env");
        }

        if let Ok(url) = std::env::var("MYSQL_LOG_DATABASE_URL") {
            self.source.url = url;
            tracing::info!("Override source.url from env");
        }

        if let Ok(url) = std::env::var("MYSQL_ADMIN_URL") {
            self.response.admin_url = url;
            tracing::info!("Override response.admin_url from env");
        }

        if let Ok(url) = std::env::var("REDIS_URL") {
            self.stream.url = url;
            tracing::info!("Override stream.url from env");
        }

        if let Ok(dir) = std::env::var("UBA_LOGS_DIR") {
            self.storage.logs_dir = dir;
            tracing::info!("Override storage.logs_dir from env: {}", self.storage.logs_dir);
        }

        if let Ok(level) = std::env::var("VIGIL_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(url) = &args.database_url {
            self.database.url = url.clone();
            tracing::info!("Override database.url from CLI");
        }

        if let Some(url) = &args.source_url {
            self.source.url = url.clone();
            tracing::info!("Override source.url from CLI");
        }

        if let Some(url) = &args.redis_url {
            self.stream.url = url.clone();
            tracing::info!("Override stream.url from CLI");
        }

        if let Some(dir) = &args.logs_dir {
            self.storage.logs_dir = dir.clone();
            tracing::info!("Override storage.logs_dir from CLI: {}", self.storage.logs_dir);
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(interval) = args.poll_interval_ms {
            self.harvester.poll_interval_ms = interval;
            tracing::info!(
                "Override harvester.poll_interval_ms from CLI: {}",
                self.harvester.poll_interval_ms
            );
        }

        if let Some(batch) = args.batch_size {
            self.harvester.batch_size = batch;
            tracing::info!("Override harvester.batch_size from CLI: {}", batch);
        }
    }

    /// Validate configuration. Invalid values are fatal at startup; there is
    /// no mid-flight reload.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.database.url.is_empty() {
            anyhow::bail!("database.url cannot be empty");
        }
        if self.source.url.is_empty() {
            anyhow::bail!("source.url cannot be empty");
        }
        if self.stream.url.is_empty() {
            anyhow::bail!("stream.url cannot be empty");
        }
        if self.storage.logs_dir.is_empty() {
            anyhow::bail!("storage.logs_dir cannot be empty");
        }

        if self.harvester.poll_interval_ms == 0 {
            anyhow::bail!("harvester.poll_interval_ms must be > 0");
        }
        if self.harvester.batch_size == 0 {
            anyhow::bail!("harvester.batch_size must be > 0");
        }
        if self.engine.batch_size == 0 {
            anyhow::bail!("engine.batch_size must be > 0");
        }
        if self.engine.max_batch_failures == 0 {
            anyhow::bail!("engine.max_batch_failures must be > 0");
        }

        if self.thresholds.max_query_entropy <= 0.0 {
            anyhow::bail!("thresholds.max_query_entropy must be > 0");
        }
        if !(0.0..=1.0).contains(&self.thresholds.scan_efficiency_min) {
            anyhow::bail!("thresholds.scan_efficiency_min must be within [0, 1]");
        }

        parse_hhmm(&self.rules.late_night_start_time)
            .ok_or_else(|| anyhow::anyhow!("rules.late_night_start_time is not HH:MM"))?;
        parse_hhmm(&self.rules.late_night_end_time)
            .ok_or_else(|| anyhow::anyhow!("rules.late_night_end_time is not HH:MM"))?;
        parse_hhmm(&self.whitelists.maintenance_window_start)
            .ok_or_else(|| anyhow::anyhow!("whitelists.maintenance_window_start is not HH:MM"))?;
        parse_hhmm(&self.whitelists.maintenance_window_end)
            .ok_or_else(|| anyhow::anyhow!("whitelists.maintenance_window_end is not HH:MM"))?;

        if self.rules.safe_hours_start > 24 || self.rules.safe_hours_end > 24 {
            anyhow::bail!("rules.safe_hours_* must be within 0..=24");
        }
        if self.rules.work_hours_start > 24 || self.rules.work_hours_end > 24 {
            anyhow::bail!("rules.work_hours_* must be within 0..=24");
        }
        if self.rules.safe_weekdays.iter().any(|d| *d > 6) {
            anyhow::bail!("rules.safe_weekdays entries must be within 0..=6");
        }
        if self.rules.time_window_minutes < 1 {
            anyhow::bail!("rules.time_window_minutes must be >= 1");
        }
        if self.rules.min_distinct_tables < 1 {
            anyhow::bail!("rules.min_distinct_tables must be >= 1");
        }
        if self.rules.profile_min_samples < 1 {
            anyhow::bail!("rules.profile_min_samples must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.rules.quantile_start)
            || !(0.0..=1.0).contains(&self.rules.quantile_end)
            || self.rules.quantile_start >= self.rules.quantile_end
        {
            anyhow::bail!("rules.quantile_start/quantile_end must satisfy 0 <= start < end <= 1");
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/vigil.toml", "vigil.toml", "./conf/vigil.toml", "./vigil.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let raw: toml::Value = toml::from_str(&content)?;
        warn_unknown_keys(&raw);
        let config: Config = raw.try_into()?;
        Ok(config)
    }
}

/// Unknown keys are ignored, but loudly: a typo in a threshold name must not
/// silently fall back to the default.
fn warn_unknown_keys(raw: &toml::Value) {
    const SECTIONS: &[&str] = &[
        "database",
        "source",
        "stream",
        "storage",
        "logging",
        "harvester",
        "engine",
        "response",
        "thresholds",
        "signatures",
        "whitelists",
        "rules",
    ];
    const THRESHOLD_KEYS: &[&str] = &[
        "mass_deletion_rows",
        "execution_time_limit_ms",
        "cpu_time_limit_ms",
        "lock_time_limit_ms",
        "brute_force_attempts",
        "scan_efficiency_min",
        "scan_efficiency_min_rows",
        "max_query_entropy",
        "warning_count_threshold",
        "index_evasion_min_rows",
    ];
    const SIGNATURE_KEYS: &[&str] = &[
        "sqli_keywords",
        "admin_keywords",
        "sensitive_tables",
        "large_dump_tables",
        "disallowed_programs",
        "restricted_connection_users",
    ];
    const WHITELIST_KEYS: &[&str] = &[
        "maintenance_users",
        "maintenance_keywords",
        "maintenance_window_start",
        "maintenance_window_end",
    ];
    const RULE_KEYS: &[&str] = &[
        "late_night_start_time",
        "late_night_end_time",
        "work_hours_start",
        "work_hours_end",
        "safe_hours_start",
        "safe_hours_end",
        "safe_weekdays",
        "time_window_minutes",
        "min_distinct_tables",
        "profile_min_samples",
        "quantile_start",
        "quantile_end",
        "allowed_users_sensitive",
        "admin_users",
        "ddl_allowed_tables",
    ];

    let Some(table) = raw.as_table() else { return };
    for (section, value) in table {
        if !SECTIONS.contains(&section.as_str()) {
            tracing::warn!("Ignoring unknown config section [{}]", section);
            continue;
        }
        let known: &[&str] = match section.as_str() {
            "thresholds" => THRESHOLD_KEYS,
            "signatures" => SIGNATURE_KEYS,
            "whitelists" => WHITELIST_KEYS,
            "rules" => RULE_KEYS,
            _ => continue,
        };
        if let Some(section_table) = value.as_table() {
            for key in section_table.keys() {
                if !known.contains(&key.as_str()) {
                    tracing::warn!("Ignoring unknown config key {}.{}", section, key);
                }
            }
        }
    }
}

/// Parse a "HH:MM" clock value.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

impl RuleSettings {
    pub fn late_night_window(&self) -> (NaiveTime, NaiveTime) {
        // Validated at startup; defensively fall back to defaults anyway.
        let start = parse_hhmm(&self.late_night_start_time)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(23, 0, 0).unwrap());
        let end = parse_hhmm(&self.late_night_end_time)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        (start, end)
    }
}

impl Whitelists {
    pub fn maintenance_window(&self) -> (NaiveTime, NaiveTime) {
        let start = parse_hhmm(&self.maintenance_window_start)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        let end = parse_hhmm(&self.maintenance_window_end)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(5, 0, 0).unwrap());
        (start, end)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "postgres://localhost:5432/uba".to_string() }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "mysql://uba_reader@localhost:3306/performance_schema".to_string(),
            self_user: "uba_user".to_string(),
            self_schema: "uba_db".to_string(),
            self_marker: "UBA_EVENT".to_string(),
            cold_table: "uba_shadow.statement_log".to_string(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            prefix: "uba:logs".to_string(),
            group: "engine_group".to_string(),
            quarantine_prefix: "uba:quarantine".to_string(),
            response_queue: "uba:response:queue".to_string(),
            maxlen: 1_000_000,
            soft_limit: 200_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { logs_dir: "data/uba".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,vigil=debug".to_string(),
            file: Some("logs/vigil.log".to_string()),
        }
    }
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            source_dbms: "mysql".to_string(),
            poll_interval_ms: 1_000,
            max_poll_interval_ms: 5_000,
            batch_size: 5_000,
            backoff_cap_secs: 30,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            block_ms: 50_000,
            consumer_prefix: "engine".to_string(),
            visibility_timeout_ms: 60_000,
            archive_grace_secs: 3_600,
            max_batch_failures: 3,
            lag_warn_depth: 100_000,
            anomaly_score_threshold: 0.6,
            profile_stale_secs: 86_400,
            profile_refit_growth: 0.2,
            profile_history_cap: 2_000,
        }
    }
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            admin_url: String::new(),
            protected_users: vec!["root".to_string()],
            lockout_threshold: 10,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            mass_deletion_rows: 500,
            execution_time_limit_ms: 5_000.0,
            cpu_time_limit_ms: 1_000.0,
            lock_time_limit_ms: 500.0,
            brute_force_attempts: 5,
            scan_efficiency_min: 0.01,
            scan_efficiency_min_rows: 1_000,
            max_query_entropy: 6.0,
            warning_count_threshold: 5,
            index_evasion_min_rows: 1_000,
        }
    }
}

impl Default for Signatures {
    fn default() -> Self {
        Self {
            sqli_keywords: [
                "UNION SELECT",
                "OR 1=1",
                "SLEEP(",
                "BENCHMARK(",
                "UPDATEXML",
                "EXTRACTVALUE",
                "--",
                "#",
                "INFORMATION_SCHEMA",
            ]
            .map(String::from)
            .to_vec(),
            admin_keywords: [
                "GRANT ",
                "REVOKE ",
                "CREATE USER",
                "DROP USER",
                "ALTER USER",
                "SET PASSWORD",
            ]
            .map(String::from)
            .to_vec(),
            sensitive_tables: Vec::new(),
            large_dump_tables: Vec::new(),
            disallowed_programs: Vec::new(),
            restricted_connection_users: Vec::new(),
        }
    }
}

impl Default for Whitelists {
    fn default() -> Self {
        Self {
            maintenance_users: Vec::new(),
            maintenance_keywords: ["backup", "optimize table", "analyze table"]
                .map(String::from)
                .to_vec(),
            maintenance_window_start: "22:00".to_string(),
            maintenance_window_end: "05:00".to_string(),
        }
    }
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            late_night_start_time: "23:00".to_string(),
            late_night_end_time: "06:00".to_string(),
            work_hours_start: 8,
            work_hours_end: 18,
            safe_hours_start: 8,
            safe_hours_end: 18,
            safe_weekdays: vec![0, 1, 2, 3, 4],
            time_window_minutes: 5,
            min_distinct_tables: 4,
            profile_min_samples: 100,
            quantile_start: 0.05,
            quantile_end: 0.95,
            allowed_users_sensitive: Vec::new(),
            admin_users: Vec::new(),
            ddl_allowed_tables: Vec::new(),
        }
    }
}
