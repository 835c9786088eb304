use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const OPENAI_KEY_ENV: &str = "SPAM_FILTER_OPENAI_API_KEY";
pub const GEMINI_KEY_ENV: &str = "SPAM_FILTER_GEMINI_API_KEY";

/// Longest accepted cache TTL, ten years.
pub const MAX_TTL_SECONDS: u64 = 10 * 365 * 86_400;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub classifier: ClassifierConfig,
    pub spam: SpamConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

/// Which front end receives mail from the MTA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    /// SMTP content filter that relays accepted mail upstream.
    #[default]
    Smtp,
    /// Milter; the MTA keeps the message and applies our header edits.
    Milter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub filter_type: FilterType,
    pub listen_address: String,
    /// `unix:/path` or `inet:host:port`, used when `filter_type` is milter.
    pub milter_socket: String,
    /// Name announced in the SMTP greeting.
    pub hostname: String,
    pub block_spam: bool,
    pub message_timeout_seconds: u64,
    pub modify_subject: bool,
    pub subject_prefix: String,
    pub max_message_bytes: usize,
    pub headers: HeaderNames,
    pub upstream: UpstreamConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            filter_type: FilterType::Smtp,
            listen_address: "0.0.0.0:10025".to_string(),
            milter_socket: "unix:/var/run/llm-spam-filter/milter.sock".to_string(),
            hostname: "llm-spam-filter".to_string(),
            block_spam: false,
            message_timeout_seconds: 10,
            modify_subject: false,
            subject_prefix: "[**SPAM**] ".to_string(),
            max_message_bytes: 25 * 1024 * 1024,
            headers: HeaderNames::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_seconds)
    }
}

/// Names of the headers added to forwarded mail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderNames {
    pub spam: String,
    pub score: String,
    pub reason: String,
    pub error: String,
}

impl Default for HeaderNames {
    fn default() -> Self {
        HeaderNames {
            spam: "X-Spam-Status".to_string(),
            score: "X-Spam-Score".to_string(),
            reason: "X-Spam-Reason".to_string(),
            error: "X-Spam-Error".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            host: "127.0.0.1".to_string(),
            port: 10026,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Openai,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub provider: Provider,
    pub timeout_seconds: u64,
    pub max_body_size: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub openai: ProviderConfig,
    pub gemini: ProviderConfig,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            provider: Provider::Openai,
            timeout_seconds: 10,
            max_body_size: 4096,
            max_tokens: 1000,
            temperature: 0.1,
            top_p: 0.9,
            openai: ProviderConfig::named("gpt-4"),
            gemini: ProviderConfig::named("gemini-pro"),
        }
    }
}

impl ClassifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn selected(&self) -> &ProviderConfig {
        match self.provider {
            Provider::Openai => &self.openai,
            Provider::Gemini => &self.gemini,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_key: String,
    pub model_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    fn named(model: &str) -> Self {
        ProviderConfig {
            model_name: model.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpamConfig {
    pub threshold: f64,
    pub whitelisted_domains: Vec<String>,
}

impl Default for SpamConfig {
    fn default() -> Self {
        SpamConfig {
            threshold: 0.7,
            whitelisted_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Memory,
    Sqlite,
    Mysql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    pub ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub sqlite_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mysql_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            cache_type: CacheType::Memory,
            ttl_seconds: 86_400,
            cleanup_interval_seconds: 3_600,
            sqlite_path: "/data/spam_cache.db".to_string(),
            mysql_url: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_seconds.min(MAX_TTL_SECONDS) as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.fill_model_defaults();
        Ok(config)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Fill empty API keys from `SPAM_FILTER_*_API_KEY`.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (provider, var) in [
            (&mut self.classifier.openai, OPENAI_KEY_ENV),
            (&mut self.classifier.gemini, GEMINI_KEY_ENV),
        ] {
            if provider.api_key.is_empty() {
                if let Some(key) = lookup(var).filter(|k| !k.is_empty()) {
                    provider.api_key = key;
                }
            }
        }
    }

    fn fill_model_defaults(&mut self) {
        let defaults = ClassifierConfig::default();
        if self.classifier.openai.model_name.is_empty() {
            self.classifier.openai.model_name = defaults.openai.model_name;
        }
        if self.classifier.gemini.model_name.is_empty() {
            self.classifier.gemini.model_name = defaults.gemini.model_name;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid =
            |msg: &str| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg.to_string())) };

        if !(0.0..=1.0).contains(&self.spam.threshold) {
            return invalid("spam.threshold must be between 0 and 1");
        }
        match self.server.filter_type {
            FilterType::Smtp => {
                if self.server.listen_address.trim().is_empty() {
                    return invalid("server.listen_address is empty");
                }
                if self.server.upstream.host.trim().is_empty() {
                    return invalid("server.upstream.host is empty");
                }
            }
            FilterType::Milter => {
                if let Err(e) = self.server.milter_socket.parse::<MilterSocket>() {
                    return Err(ConfigError::Invalid(format!("server.milter_socket: {}", e)));
                }
            }
        }
        if self.server.message_timeout_seconds == 0 {
            return invalid("server.message_timeout_seconds must be positive");
        }
        if self.classifier.timeout_seconds == 0 {
            return invalid("classifier.timeout_seconds must be positive");
        }
        if self.server.modify_subject && self.server.subject_prefix.is_empty() {
            return invalid("server.subject_prefix is empty while modify_subject is set");
        }
        let headers = &self.server.headers;
        for name in [&headers.spam, &headers.score, &headers.reason, &headers.error] {
            if !is_header_name(name) {
                return Err(ConfigError::Invalid(format!(
                    "'{}' is not a valid header name",
                    name
                )));
            }
        }

        if self.cache.enabled {
            if self.cache.ttl_seconds == 0 {
                return invalid("cache.ttl_seconds must be positive");
            }
            if self.cache.ttl_seconds > MAX_TTL_SECONDS {
                return Err(ConfigError::Invalid(format!(
                    "cache.ttl_seconds must be at most {}",
                    MAX_TTL_SECONDS
                )));
            }
            if self.cache.cleanup_interval_seconds == 0 {
                return invalid("cache.cleanup_interval_seconds must be positive");
            }
            match self.cache.cache_type {
                CacheType::Sqlite if self.cache.sqlite_path.trim().is_empty() => {
                    return invalid("cache.sqlite_path is empty");
                }
                CacheType::Mysql
                    if self.cache.mysql_url.as_deref().unwrap_or("").trim().is_empty() =>
                {
                    return invalid("cache.mysql_url is required for the mysql cache");
                }
                _ => {}
            }
        }

        let selected = self.classifier.selected();
        if selected.api_key.is_empty() {
            let var = match self.classifier.provider {
                Provider::Openai => OPENAI_KEY_ENV,
                Provider::Gemini => GEMINI_KEY_ENV,
            };
            return Err(ConfigError::MissingCredential(format!(
                "{:?} api_key is not set (config or {})",
                self.classifier.provider, var
            )));
        }
        if selected.model_name.is_empty() {
            return invalid("classifier model_name is empty");
        }

        Ok(())
    }
}

/// Where the milter listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MilterSocket {
    Unix(std::path::PathBuf),
    Inet(String),
}

impl std::str::FromStr for MilterSocket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:").or_else(|| s.strip_prefix("local:")) {
            if path.is_empty() {
                return Err("empty socket path".to_string());
            }
            return Ok(MilterSocket::Unix(path.into()));
        }
        let addr = s.strip_prefix("inet:").unwrap_or(s);
        // postfix writes inet:port@host
        let addr = match addr.split_once('@') {
            Some((port, host)) => format!("{}:{}", host, port),
            None => addr.to_string(),
        };
        let valid = matches!(
            addr.rsplit_once(':'),
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok()
        );
        if valid {
            Ok(MilterSocket::Inet(addr))
        } else {
            Err(format!("'{}' is not unix:/path or inet:host:port", s))
        }
    }
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic() && b != b':')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_key() -> Config {
        let mut config = Config::default();
        config.classifier.openai.api_key = "sk-test".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_address, "0.0.0.0:10025");
        assert_eq!(config.server.headers.spam, "X-Spam-Status");
        assert_eq!(config.server.subject_prefix, "[**SPAM**] ");
        assert_eq!(config.spam.threshold, 0.7);
        assert_eq!(config.cache.ttl_seconds, 86_400);
        assert_eq!(config.cache.cache_type, CacheType::Memory);
        assert_eq!(config.classifier.openai.model_name, "gpt-4");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            "spam:\n  threshold: 0.5\n  whitelisted_domains: [example.com]\n\
             cache:\n  type: sqlite\n\
             classifier:\n  provider: gemini\n  gemini:\n    api_key: g-key\n",
        )
        .unwrap();
        assert_eq!(config.spam.threshold, 0.5);
        assert_eq!(config.spam.whitelisted_domains, vec!["example.com"]);
        assert_eq!(config.cache.cache_type, CacheType::Sqlite);
        assert_eq!(config.classifier.provider, Provider::Gemini);
        assert_eq!(config.classifier.gemini.model_name, "gemini-pro");
        assert_eq!(config.server.upstream.port, 10026);
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_cache_type_rejected() {
        assert!(matches!(
            Config::from_yaml("cache:\n  type: redis\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_threshold_and_credentials() {
        let mut config = with_key();
        config.validate().unwrap();

        config.spam.threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCredential(_))
        ));
    }

    #[test]
    fn test_validate_cache_settings() {
        let mut config = with_key();
        config.cache.cache_type = CacheType::Mysql;
        assert!(config.validate().is_err());
        config.cache.mysql_url = Some("mysql://u:p@localhost/spam".to_string());
        config.validate().unwrap();

        config.cache.ttl_seconds = 0;
        assert!(config.validate().is_err());
        config.cache.enabled = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_ttl_upper_bound() {
        let mut config = with_key();
        config.cache.ttl_seconds = MAX_TTL_SECONDS;
        config.validate().unwrap();

        config.cache.ttl_seconds = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        // never panics, even for values validation would reject
        assert_eq!(
            config.cache.ttl(),
            chrono::Duration::seconds(MAX_TTL_SECONDS as i64)
        );
        let entry = crate::model::CacheEntry::new("a@b.com", false, 0.1, config.cache.ttl());
        assert!(entry.expires_at > entry.last_seen);
    }

    #[test]
    fn test_env_fills_only_empty_keys() {
        let mut config = Config::default();
        config.classifier.gemini.api_key = "from-file".to_string();
        config.apply_env_from(|name| Some(format!("env:{}", name)));
        assert_eq!(
            config.classifier.openai.api_key,
            format!("env:{}", OPENAI_KEY_ENV)
        );
        assert_eq!(config.classifier.gemini.api_key, "from-file");
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let config = with_key();
        config.to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.classifier.openai.api_key, "sk-test");
        assert_eq!(loaded.server.headers, config.server.headers);
    }

    #[test]
    fn test_milter_front_end_settings() {
        let config = Config::from_yaml(
            "server:\n  filter_type: milter\n  milter_socket: inet:127.0.0.1:10030\n\
             classifier:\n  openai:\n    api_key: k\n",
        )
        .unwrap();
        assert_eq!(config.server.filter_type, FilterType::Milter);
        config.validate().unwrap();
        assert_eq!(Config::default().server.filter_type, FilterType::Smtp);

        let mut config = config;
        config.server.milter_socket = "somewhere".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(Config::from_yaml("server:\n  filter_type: lmtp\n").is_err());
    }

    #[test]
    fn test_milter_socket_forms() {
        assert_eq!(
            "unix:/run/f.sock".parse::<MilterSocket>(),
            Ok(MilterSocket::Unix("/run/f.sock".into()))
        );
        assert_eq!(
            "inet:localhost:9000".parse::<MilterSocket>(),
            Ok(MilterSocket::Inet("localhost:9000".to_string()))
        );
        assert_eq!(
            "inet:9000@127.0.0.1".parse::<MilterSocket>(),
            Ok(MilterSocket::Inet("127.0.0.1:9000".to_string()))
        );
        assert!("unix:".parse::<MilterSocket>().is_err());
        assert!("inet:host:port".parse::<MilterSocket>().is_err());
    }

    #[test]
    fn test_bad_header_name() {
        let mut config = with_key();
        config.server.headers.reason = "X Spam".to_string();
        assert!(config.validate().is_err());
    }
}
