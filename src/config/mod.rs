// src/config/mod.rs
// Configuration for the defense stack. Defaults are compiled in from
// config/defaults.env; a JSON config file and QUAG_* environment variables
// override them, in that order of precedence (env wins).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::{env, fs};

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::error::{Error, Result};

const DEFAULTS_ENV_TEXT: &str = include_str!("../../config/defaults.env");

const DELAY_SEC_MIN: f64 = 0.0;
const DELAY_SEC_MAX: f64 = 60.0;
const STATE_TIMEOUT_MS_MIN: u64 = 50;
const STATE_TIMEOUT_MS_MAX: u64 = 10_000;

static DEFAULTS_MAP: Lazy<HashMap<String, String>> = Lazy::new(|| {
    parse_defaults_env_map(DEFAULTS_ENV_TEXT)
        .unwrap_or_else(|err| panic!("invalid config/defaults.env: {}", err))
});

/// Alert dispatch channel selected by QUAG_ALERT_METHOD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertMethod {
    None,
    Webhook,
    Slack,
    Smtp,
}

impl AlertMethod {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(AlertMethod::None),
            "webhook" => Ok(AlertMethod::Webhook),
            "slack" => Ok(AlertMethod::Slack),
            "smtp" => Ok(AlertMethod::Smtp),
            other => Err(Error::Config(format!("unknown alert method '{}'", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertMethod::None => "none",
            AlertMethod::Webhook => "webhook",
            AlertMethod::Slack => "slack",
            AlertMethod::Smtp => "smtp",
        }
    }
}

/// Runtime configuration, resolved once at startup. Hot reload is out of
/// scope; components hold this through the Runtime for the process lifetime.
#[derive(Debug, Clone)]
pub struct Config {
    pub system_seed: String,

    pub tarpit_rewrite_path: String,
    pub tarpit_min_delay_sec: f64,
    pub tarpit_max_delay_sec: f64,
    pub tarpit_max_hops: u32,
    pub tarpit_hop_window_seconds: u64,
    pub tarpit_flag_ttl_seconds: u64,
    pub tarpit_hit_log: Option<PathBuf>,

    pub blocklist_ttl_seconds: u64,

    pub known_bad_ua_substrings: Vec<String>,
    pub known_benign_crawler_uas: Vec<String>,
    pub check_empty_ua: bool,
    pub check_missing_accept_language: bool,
    pub check_generic_accept: bool,

    pub frequency_window_sec: u64,
    pub frequency_saturation: u32,
    pub score_threshold_low: f64,
    pub score_threshold_high: f64,
    pub model_artifact_path: Option<PathBuf>,
    pub robots_txt_path: Option<PathBuf>,

    pub enable_ip_reputation: bool,
    pub ip_reputation_api_url: Option<String>,
    pub ip_reputation_timeout_sec: f64,
    pub ip_reputation_malicious_score_bonus: f64,
    pub ip_reputation_min_malicious_threshold: f64,

    pub enable_llm_classification: bool,
    pub llm_api_url: Option<String>,
    pub llm_timeout_sec: f64,

    pub enable_captcha_trigger: bool,
    pub captcha_score_threshold_low: f64,
    pub captcha_score_threshold_high: f64,
    pub captcha_verification_url: Option<String>,

    pub alert_method: AlertMethod,
    pub alert_min_reason_severity: String,
    pub alert_reason_severity_order: Vec<String>,
    pub alert_webhook_url: Option<String>,
    pub alert_slack_webhook_url: Option<String>,
    pub alert_smtp_host: Option<String>,
    pub alert_smtp_port: u16,
    pub alert_smtp_user: Option<String>,
    pub alert_smtp_use_tls: bool,
    pub alert_email_to: Option<String>,
    pub alert_email_from: Option<String>,

    pub enable_community_reporting: bool,
    pub community_blocklist_report_url: Option<String>,
    pub community_blocklist_report_timeout: f64,

    pub redis_url: String,
    pub state_timeout_ms: u64,

    pub markov_db_path: Option<PathBuf>,

    pub escalation_endpoint: String,
    pub escalation_timeout_sec: f64,
    pub enforcement_webhook_url: String,

    pub secrets_dir: PathBuf,
    pub redis_password_filename: String,
    pub ip_reputation_api_key_filename: String,
    pub llm_api_token_filename: String,
    pub community_api_key_filename: String,
    pub smtp_password_filename: String,

    pub public_listen_addr: SocketAddr,
    pub internal_listen_addr: SocketAddr,
}

/// Value lookup chain: explicit overrides, process environment, JSON config
/// file, compiled-in defaults. The JSON file uses the key without the QUAG_
/// prefix, lowercased (e.g. "system_seed").
struct Sources {
    overrides: Option<HashMap<String, String>>,
    file: Option<serde_json::Map<String, Value>>,
    use_env: bool,
}

impl Sources {
    fn raw(&self, key: &str) -> Option<String> {
        if let Some(map) = &self.overrides {
            if let Some(v) = map.get(key) {
                return Some(v.clone());
            }
        }
        if self.use_env {
            if let Ok(v) = env::var(key) {
                return Some(v);
            }
        }
        if let Some(map) = &self.file {
            let file_key = key.trim_start_matches("QUAG_").to_ascii_lowercase();
            if let Some(v) = map.get(&file_key) {
                return Some(json_value_to_string(v));
            }
        }
        DEFAULTS_MAP.get(key).cloned()
    }

    fn string(&self, key: &str) -> Result<String> {
        self.raw(key)
            .ok_or_else(|| Error::Config(format!("missing config key {}", key)))
    }

    fn opt_string(&self, key: &str) -> Result<Option<String>> {
        let v = self.string(key)?;
        let v = v.trim();
        if v.is_empty() {
            Ok(None)
        } else {
            Ok(Some(v.to_string()))
        }
    }

    fn opt_path(&self, key: &str) -> Result<Option<PathBuf>> {
        Ok(self.opt_string(key)?.map(PathBuf::from))
    }

    fn bool(&self, key: &str) -> Result<bool> {
        let v = self.string(key)?;
        parse_bool_like(&v)
            .ok_or_else(|| Error::Config(format!("invalid boolean for {}: '{}'", key, v)))
    }

    fn u64(&self, key: &str) -> Result<u64> {
        let v = self.string(key)?;
        v.trim()
            .parse::<u64>()
            .map_err(|_| Error::Config(format!("invalid integer for {}: '{}'", key, v)))
    }

    fn u32(&self, key: &str) -> Result<u32> {
        let v = self.string(key)?;
        v.trim()
            .parse::<u32>()
            .map_err(|_| Error::Config(format!("invalid integer for {}: '{}'", key, v)))
    }

    fn u16(&self, key: &str) -> Result<u16> {
        let v = self.string(key)?;
        v.trim()
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("invalid port for {}: '{}'", key, v)))
    }

    fn f64(&self, key: &str) -> Result<f64> {
        let v = self.string(key)?;
        v.trim()
            .parse::<f64>()
            .map_err(|_| Error::Config(format!("invalid number for {}: '{}'", key, v)))
    }

    fn list(&self, key: &str) -> Result<Vec<String>> {
        let v = self.string(key)?;
        parse_string_list_value(&v)
            .ok_or_else(|| Error::Config(format!("invalid list for {}: '{}'", key, v)))
    }

    fn addr(&self, key: &str) -> Result<SocketAddr> {
        let v = self.string(key)?;
        v.trim()
            .parse::<SocketAddr>()
            .map_err(|_| Error::Config(format!("invalid listen address for {}: '{}'", key, v)))
    }
}

impl Config {
    /// Loads configuration from the environment plus an optional JSON file.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let file_map = match file {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        Self::resolve(Sources {
            overrides: None,
            file: file_map,
            use_env: true,
        })
    }

    /// Loads configuration from an explicit key map over the compiled-in
    /// defaults, ignoring the process environment. Used by tools and tests.
    pub fn from_overrides(overrides: HashMap<String, String>) -> Result<Self> {
        Self::resolve(Sources {
            overrides: Some(overrides),
            file: None,
            use_env: false,
        })
    }

    fn resolve(src: Sources) -> Result<Self> {
        let mut cfg = Config {
            system_seed: src.string("QUAG_SYSTEM_SEED")?,

            tarpit_rewrite_path: src.string("QUAG_TARPIT_REWRITE_PATH")?,
            tarpit_min_delay_sec: src.f64("QUAG_TARPIT_MIN_DELAY_SEC")?,
            tarpit_max_delay_sec: src.f64("QUAG_TARPIT_MAX_DELAY_SEC")?,
            tarpit_max_hops: src.u32("QUAG_TARPIT_MAX_HOPS")?,
            tarpit_hop_window_seconds: src.u64("QUAG_TARPIT_HOP_WINDOW_SECONDS")?,
            tarpit_flag_ttl_seconds: src.u64("QUAG_TARPIT_FLAG_TTL_SECONDS")?,
            tarpit_hit_log: src.opt_path("QUAG_TARPIT_HIT_LOG")?,

            blocklist_ttl_seconds: src.u64("QUAG_BLOCKLIST_TTL_SECONDS")?,

            known_bad_ua_substrings: lowercase_all(src.list("QUAG_KNOWN_BAD_UA_SUBSTRINGS")?),
            known_benign_crawler_uas: lowercase_all(src.list("QUAG_KNOWN_BENIGN_CRAWLER_UAS")?),
            check_empty_ua: src.bool("QUAG_CHECK_EMPTY_UA")?,
            check_missing_accept_language: src.bool("QUAG_CHECK_MISSING_ACCEPT_LANGUAGE")?,
            check_generic_accept: src.bool("QUAG_CHECK_GENERIC_ACCEPT")?,

            frequency_window_sec: src.u64("QUAG_FREQUENCY_WINDOW_SEC")?,
            frequency_saturation: src.u32("QUAG_FREQUENCY_SATURATION")?,
            score_threshold_low: src.f64("QUAG_SCORE_THRESHOLD_LOW")?,
            score_threshold_high: src.f64("QUAG_SCORE_THRESHOLD_HIGH")?,
            model_artifact_path: src.opt_path("QUAG_MODEL_ARTIFACT_PATH")?,
            robots_txt_path: src.opt_path("QUAG_ROBOTS_TXT_PATH")?,

            enable_ip_reputation: src.bool("QUAG_ENABLE_IP_REPUTATION")?,
            ip_reputation_api_url: src.opt_string("QUAG_IP_REPUTATION_API_URL")?,
            ip_reputation_timeout_sec: src.f64("QUAG_IP_REPUTATION_TIMEOUT_SEC")?,
            ip_reputation_malicious_score_bonus: src
                .f64("QUAG_IP_REPUTATION_MALICIOUS_SCORE_BONUS")?,
            ip_reputation_min_malicious_threshold: src
                .f64("QUAG_IP_REPUTATION_MIN_MALICIOUS_THRESHOLD")?,

            enable_llm_classification: src.bool("QUAG_ENABLE_LLM_CLASSIFICATION")?,
            llm_api_url: src.opt_string("QUAG_LLM_API_URL")?,
            llm_timeout_sec: src.f64("QUAG_LLM_TIMEOUT_SEC")?,

            enable_captcha_trigger: src.bool("QUAG_ENABLE_CAPTCHA_TRIGGER")?,
            captcha_score_threshold_low: src.f64("QUAG_CAPTCHA_SCORE_THRESHOLD_LOW")?,
            captcha_score_threshold_high: src.f64("QUAG_CAPTCHA_SCORE_THRESHOLD_HIGH")?,
            captcha_verification_url: src.opt_string("QUAG_CAPTCHA_VERIFICATION_URL")?,

            alert_method: AlertMethod::parse(&src.string("QUAG_ALERT_METHOD")?)?,
            alert_min_reason_severity: src
                .string("QUAG_ALERT_MIN_REASON_SEVERITY")?
                .trim()
                .to_ascii_lowercase(),
            alert_reason_severity_order: lowercase_all(
                src.list("QUAG_ALERT_REASON_SEVERITY_ORDER")?,
            ),
            alert_webhook_url: src.opt_string("QUAG_ALERT_WEBHOOK_URL")?,
            alert_slack_webhook_url: src.opt_string("QUAG_ALERT_SLACK_WEBHOOK_URL")?,
            alert_smtp_host: src.opt_string("QUAG_ALERT_SMTP_HOST")?,
            alert_smtp_port: src.u16("QUAG_ALERT_SMTP_PORT")?,
            alert_smtp_user: src.opt_string("QUAG_ALERT_SMTP_USER")?,
            alert_smtp_use_tls: src.bool("QUAG_ALERT_SMTP_USE_TLS")?,
            alert_email_to: src.opt_string("QUAG_ALERT_EMAIL_TO")?,
            alert_email_from: src.opt_string("QUAG_ALERT_EMAIL_FROM")?,

            enable_community_reporting: src.bool("QUAG_ENABLE_COMMUNITY_REPORTING")?,
            community_blocklist_report_url: src
                .opt_string("QUAG_COMMUNITY_BLOCKLIST_REPORT_URL")?,
            community_blocklist_report_timeout: src
                .f64("QUAG_COMMUNITY_BLOCKLIST_REPORT_TIMEOUT")?,

            redis_url: src.string("QUAG_REDIS_URL")?,
            state_timeout_ms: src.u64("QUAG_STATE_TIMEOUT_MS")?,

            markov_db_path: src.opt_path("QUAG_MARKOV_DB_PATH")?,

            escalation_endpoint: src.string("QUAG_ESCALATION_ENDPOINT")?,
            escalation_timeout_sec: src.f64("QUAG_ESCALATION_TIMEOUT_SEC")?,
            enforcement_webhook_url: src.string("QUAG_ENFORCEMENT_WEBHOOK_URL")?,

            secrets_dir: PathBuf::from(src.string("QUAG_SECRETS_DIR")?),
            redis_password_filename: src.string("QUAG_REDIS_PASSWORD_FILENAME")?,
            ip_reputation_api_key_filename: src.string("QUAG_IP_REPUTATION_API_KEY_FILENAME")?,
            llm_api_token_filename: src.string("QUAG_LLM_API_TOKEN_FILENAME")?,
            community_api_key_filename: src.string("QUAG_COMMUNITY_API_KEY_FILENAME")?,
            smtp_password_filename: src.string("QUAG_SMTP_PASSWORD_FILENAME")?,

            public_listen_addr: src.addr("QUAG_PUBLIC_LISTEN_ADDR")?,
            internal_listen_addr: src.addr("QUAG_INTERNAL_LISTEN_ADDR")?,
        };
        clamp_config_values(&mut cfg);
        validate(&cfg)?;
        Ok(cfg)
    }

    /// Tarpit mount without its trailing slash, for path rewriting and
    /// router nesting.
    pub fn tarpit_mount(&self) -> &str {
        self.tarpit_rewrite_path.trim_end_matches('/')
    }
}

fn clamp_config_values(cfg: &mut Config) {
    cfg.tarpit_min_delay_sec = cfg.tarpit_min_delay_sec.clamp(DELAY_SEC_MIN, DELAY_SEC_MAX);
    cfg.tarpit_max_delay_sec = cfg.tarpit_max_delay_sec.clamp(DELAY_SEC_MIN, DELAY_SEC_MAX);
    cfg.score_threshold_low = cfg.score_threshold_low.clamp(0.0, 1.0);
    cfg.score_threshold_high = cfg.score_threshold_high.clamp(0.0, 1.0);
    cfg.captcha_score_threshold_low = cfg.captcha_score_threshold_low.clamp(0.0, 1.0);
    cfg.captcha_score_threshold_high = cfg.captcha_score_threshold_high.clamp(0.0, 1.0);
    cfg.ip_reputation_malicious_score_bonus =
        cfg.ip_reputation_malicious_score_bonus.clamp(0.0, 1.0);
    cfg.frequency_saturation = cfg.frequency_saturation.max(1);
    cfg.state_timeout_ms = cfg
        .state_timeout_ms
        .clamp(STATE_TIMEOUT_MS_MIN, STATE_TIMEOUT_MS_MAX);
}

fn validate(cfg: &Config) -> Result<()> {
    if cfg.system_seed.trim().is_empty() {
        return Err(Error::Config(
            "QUAG_SYSTEM_SEED must be set to a deployment-unique value".into(),
        ));
    }
    if !cfg.tarpit_rewrite_path.starts_with('/') || !cfg.tarpit_rewrite_path.ends_with('/') {
        return Err(Error::Config(format!(
            "QUAG_TARPIT_REWRITE_PATH must start and end with '/': '{}'",
            cfg.tarpit_rewrite_path
        )));
    }
    if cfg.tarpit_rewrite_path == "/" {
        return Err(Error::Config(
            "QUAG_TARPIT_REWRITE_PATH must not be the root path".into(),
        ));
    }
    if cfg.tarpit_min_delay_sec > cfg.tarpit_max_delay_sec {
        return Err(Error::Config(format!(
            "tarpit delay bounds inverted: min {} > max {}",
            cfg.tarpit_min_delay_sec, cfg.tarpit_max_delay_sec
        )));
    }
    if cfg.score_threshold_low > cfg.score_threshold_high {
        return Err(Error::Config(format!(
            "score thresholds inverted: low {} > high {}",
            cfg.score_threshold_low, cfg.score_threshold_high
        )));
    }
    if cfg.alert_reason_severity_order.is_empty() {
        return Err(Error::Config(
            "QUAG_ALERT_REASON_SEVERITY_ORDER must not be empty".into(),
        ));
    }
    if !cfg
        .alert_reason_severity_order
        .iter()
        .any(|k| k == &cfg.alert_min_reason_severity)
    {
        return Err(Error::Config(format!(
            "QUAG_ALERT_MIN_REASON_SEVERITY '{}' is not in the severity order list",
            cfg.alert_min_reason_severity
        )));
    }
    match cfg.alert_method {
        AlertMethod::Webhook if cfg.alert_webhook_url.is_none() => {
            return Err(Error::Config(
                "alert method 'webhook' requires QUAG_ALERT_WEBHOOK_URL".into(),
            ));
        }
        AlertMethod::Slack if cfg.alert_slack_webhook_url.is_none() => {
            return Err(Error::Config(
                "alert method 'slack' requires QUAG_ALERT_SLACK_WEBHOOK_URL".into(),
            ));
        }
        AlertMethod::Smtp => {
            if cfg.alert_smtp_host.is_none()
                || cfg.alert_email_to.is_none()
                || cfg.alert_email_from.is_none()
            {
                return Err(Error::Config(
                    "alert method 'smtp' requires QUAG_ALERT_SMTP_HOST, QUAG_ALERT_EMAIL_TO and QUAG_ALERT_EMAIL_FROM".into(),
                ));
            }
        }
        _ => {}
    }
    if cfg.enable_ip_reputation && cfg.ip_reputation_api_url.is_none() {
        return Err(Error::Config(
            "IP reputation enabled but QUAG_IP_REPUTATION_API_URL is not set".into(),
        ));
    }
    if cfg.enable_llm_classification && cfg.llm_api_url.is_none() {
        return Err(Error::Config(
            "LLM classification enabled but QUAG_LLM_API_URL is not set".into(),
        ));
    }
    if cfg.enable_captcha_trigger && cfg.captcha_verification_url.is_none() {
        return Err(Error::Config(
            "captcha trigger enabled but QUAG_CAPTCHA_VERIFICATION_URL is not set".into(),
        ));
    }
    if cfg.enable_community_reporting && cfg.community_blocklist_report_url.is_none() {
        return Err(Error::Config(
            "community reporting enabled but QUAG_COMMUNITY_BLOCKLIST_REPORT_URL is not set"
                .into(),
        ));
    }
    if !cfg.redis_url.starts_with("redis://") && !cfg.redis_url.starts_with("rediss://") {
        return Err(Error::Config(format!(
            "QUAG_REDIS_URL must be a redis:// URL: '{}'",
            cfg.redis_url
        )));
    }
    Ok(())
}

fn read_config_file(path: &Path) -> Result<serde_json::Map<String, Value>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read config file {}: {}", path.display(), e)))?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("invalid JSON in {}: {}", path.display(), e)))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(Error::Config(format!(
            "config file {} must contain a JSON object",
            path.display()
        ))),
    }
}

fn json_value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(json_value_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

pub(crate) fn parse_bool_like(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_string_list_value(raw: &str) -> Option<Vec<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    if let Ok(v) = serde_json::from_str::<Vec<String>>(trimmed) {
        return Some(
            v.into_iter()
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect(),
        );
    }
    Some(
        trimmed
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
    )
}

fn lowercase_all(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.to_ascii_lowercase())
        .collect()
}

fn parse_defaults_env_map(input: &str) -> std::result::Result<HashMap<String, String>, String> {
    let mut map = HashMap::new();
    for (index, raw_line) in input.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, raw_value) = line
            .split_once('=')
            .ok_or_else(|| format!("line {}: missing '='", line_no))?;

        let key = key.trim();
        if key.is_empty() {
            return Err(format!("line {}: empty key", line_no));
        }
        if !key
            .chars()
            .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_')
        {
            return Err(format!("line {}: invalid key '{}'", line_no, key));
        }

        let mut value = raw_value.trim().to_string();
        if let Some((head, _)) = value.split_once(" #") {
            value = head.trim().to_string();
        }
        if value.len() >= 2 {
            let first = value.as_bytes()[0] as char;
            let last = value.as_bytes()[value.len() - 1] as char;
            if (first == '"' && last == '"') || (first == '\'' && last == '\'') {
                value = value[1..value.len() - 1].to_string();
            }
        }

        map.insert(key.to_string(), value);
    }
    Ok(map)
}
