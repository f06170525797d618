use std::{env, net::SocketAddr, str::FromStr};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            "development" | "dev" | "" => Ok(Environment::Development),
            other => Err(anyhow::anyhow!(
                "unsupported environment '{other}' (expected 'development', 'test' or 'production')"
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_redis_host")]
    pub redis_host: String,
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    #[serde(default)]
    pub metrics_api_key: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            environment: Environment::default(),
            jwt_secret: default_jwt_secret(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            log_level: default_log_level(),
            cors_origin: default_cors_origin(),
            metrics_api_key: String::new(),
        }
    }
}

impl AppConfig {
    const PORT_ENV: &'static str = "PORT";
    const ENVIRONMENT_ENV: &'static str = "NODE_ENV";
    const JWT_SECRET_ENV: &'static str = "JWT_SECRET";
    const REDIS_HOST_ENV: &'static str = "REDIS_HOST";
    const REDIS_PORT_ENV: &'static str = "REDIS_PORT";
    const LOG_LEVEL_ENV: &'static str = "LOG_LEVEL";
    const CORS_ORIGIN_ENV: &'static str = "CORS_ORIGIN";
    const METRICS_API_KEY_ENV: &'static str = "METRICS_API_KEY";

    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(port) = env::var(Self::PORT_ENV) {
            config.port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid {name}", name = Self::PORT_ENV))?;
        }

        if let Ok(environment) = env::var(Self::ENVIRONMENT_ENV) {
            config.environment = Environment::from_str(&environment)?;
        }

        if let Ok(secret) = env::var(Self::JWT_SECRET_ENV) {
            let trimmed = secret.trim().to_owned();
            if !trimmed.is_empty() {
                config.jwt_secret = trimmed;
            }
        }

        if config.environment.is_production() && config.jwt_secret == default_jwt_secret() {
            bail!(
                "{name} must be set in production",
                name = Self::JWT_SECRET_ENV
            );
        }

        if let Ok(host) = env::var(Self::REDIS_HOST_ENV) {
            let trimmed = host.trim().to_owned();
            if !trimmed.is_empty() {
                config.redis_host = trimmed;
            }
        }

        if let Ok(port) = env::var(Self::REDIS_PORT_ENV) {
            config.redis_port = port
                .trim()
                .parse()
                .with_context(|| format!("invalid {name}", name = Self::REDIS_PORT_ENV))?;
        }

        if let Ok(level) = env::var(Self::LOG_LEVEL_ENV) {
            let trimmed = level.trim().to_owned();
            if !trimmed.is_empty() {
                config.log_level = trimmed;
            }
        }

        if let Ok(origin) = env::var(Self::CORS_ORIGIN_ENV) {
            let trimmed = origin.trim().to_owned();
            if !trimmed.is_empty() {
                config.cors_origin = trimmed;
            }
        }

        if let Ok(key) = env::var(Self::METRICS_API_KEY_ENV) {
            config.metrics_api_key = key.trim().to_owned();
        }

        Ok(config)
    }

    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }
}

fn default_port() -> u16 {
    4100
}

fn default_jwt_secret() -> String {
    "dev-secret".to_owned()
}

fn default_redis_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_cors_origin() -> String {
    "http://localhost:3000".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_local_development() {
        let config = AppConfig::default();
        assert_eq!(config.port, 4100);
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.redis_url(), "redis://127.0.0.1:6379");
        assert_eq!(config.bind_address().port(), 4100);
    }

    #[test]
    fn environment_parses_aliases() {
        assert_eq!(
            Environment::from_str("prod").unwrap(),
            Environment::Production
        );
        assert_eq!(
            Environment::from_str("Development").unwrap(),
            Environment::Development
        );
        assert!(Environment::from_str("staging").is_err());
    }

    #[test]
    fn production_detection() {
        assert!(Environment::Production.is_production());
        assert!(!Environment::Test.is_production());
    }
}
