// ABOUTME: Server configuration - environment variables with BAY_ prefix
// ABOUTME: Loaded once at startup and passed into the component constructors

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Docker,
    Scheduler,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub driver: DriverKind,
    pub docker_network: String,
    pub scheduler_url: String,
    pub scheduler_namespace: String,
    pub dev_mode: bool,
    /// token -> owner pairs, parsed from `BAY_AUTH_TOKENS=tok1:owner1,tok2:owner2`.
    pub auth_tokens: HashMap<String, String>,
    pub cors_origin: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let driver = match std::env::var("BAY_DRIVER").as_deref() {
            Ok("scheduler") => DriverKind::Scheduler,
            _ => DriverKind::Docker,
        };

        let auth_tokens = std::env::var("BAY_AUTH_TOKENS")
            .map(|raw| parse_token_pairs(&raw))
            .unwrap_or_default();

        Self {
            host: std::env::var("BAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("BAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            database_url: std::env::var("BAY_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://bay.db".to_string()),
            driver,
            docker_network: std::env::var("BAY_DOCKER_NETWORK")
                .unwrap_or_else(|_| "bay-network".to_string()),
            scheduler_url: std::env::var("BAY_SCHEDULER_URL")
                .unwrap_or_else(|_| "http://bay-scheduler:7000".to_string()),
            scheduler_namespace: std::env::var("BAY_SCHEDULER_NAMESPACE")
                .unwrap_or_else(|_| "bay".to_string()),
            dev_mode: std::env::var("BAY_DEV_MODE").is_ok(),
            auth_tokens,
            cors_origin: std::env::var("BAY_CORS_ORIGIN").ok(),
        }
    }
}

fn parse_token_pairs(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (token, owner) = pair.split_once(':')?;
            let token = token.trim();
            let owner = owner.trim();
            if token.is_empty() || owner.is_empty() {
                None
            } else {
                Some((token.to_string(), owner.to_string()))
            }
        })
        .collect()
}
