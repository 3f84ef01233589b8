use formation_engine::config::{Config as EngineConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "formations".to_string()
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    /// Filter used when `RUST_LOG` is unset.
    pub level: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.engine.validate()?;

        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn service_config() {
        let yaml = r#"
            listener:
                host: 0.0.0.0
                port: 3000
            admin_listener:
                host: 0.0.0.0
                port: 3001
            callback_base_url: https://formations.internal
            notifications:
                timeout_secs: 30
            fixtures: /etc/formations/fixtures.yaml
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: https://key@sentry.internal/1
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config.engine.listener.port, 3000);
        assert_eq!(config.engine.notifications.timeout_secs, 30);
        assert_eq!(config.engine.notifications.concurrency, 8);
        assert_eq!(config.engine.default_formation_template, "default");
        assert_eq!(
            config.engine.fixtures.as_deref(),
            Some(std::path::Path::new("/etc/formations/fixtures.yaml"))
        );
        let metrics = config.metrics.expect("metrics config");
        assert_eq!(metrics.statsd_port, 8125);
        assert_eq!(metrics.prefix, "formations");
        assert_eq!(
            config.logging.sentry_dsn.as_deref(),
            Some("https://key@sentry.internal/1")
        );
        assert_eq!(config.logging.level, None);
    }

    #[test]
    fn rejects_invalid_config() {
        let yaml = r#"
            listener:
                host: 0.0.0.0
                port: 0
            admin_listener:
                host: 0.0.0.0
                port: 3001
            callback_base_url: https://formations.internal
            "#;
        let tmp = write_tmp_file(yaml);
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::Invalid(ValidationError::InvalidPort))
        ));

        let tmp = write_tmp_file("listener: [1, 2]");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
