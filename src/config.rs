use std::{env, fs, net::SocketAddr, path::PathBuf};

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::replicate::DEFAULT_BASE_URL;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub data_root: PathBuf,
    /// Base URL under which stored blobs are externally reachable; the
    /// provider fetches training archives through it.
    pub public_base_url: String,
    pub notify_queue_capacity: usize,
    pub request_timeout_seconds: u64,
    pub replicate: ReplicateSettings,
    pub openai: Option<OpenAiSettings>,
}

#[derive(Debug, Clone)]
pub struct ReplicateSettings {
    pub api_key: String,
    pub owner: String,
    pub trainer_model: String,
    pub trainer_version: String,
    pub webhook_url: Option<String>,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("ATELIER_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (api_key, api_key_is_fallback) = resolve_api_key();

        let data_root = PathBuf::from(
            env::var("ATELIER_DATA_ROOT").unwrap_or_else(|_| "/data/atelier".to_string()),
        );

        let public_base_url = env::var("ATELIER_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:8080/data".to_string());

        let notify_queue_capacity = env::var("ATELIER_NOTIFY_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(128);

        let request_timeout_seconds = env::var("ATELIER_REQUEST_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(120);

        let replicate = ReplicateSettings {
            api_key: env::var("REPLICATE_API_KEY").context("REPLICATE_API_KEY not configured")?,
            owner: env::var("REPLICATE_OWNER").context("REPLICATE_OWNER not configured")?,
            trainer_model: env::var("REPLICATE_TRAINER_MODEL")
                .context("REPLICATE_TRAINER_MODEL not configured")?,
            trainer_version: env::var("REPLICATE_TRAINER_VERSION")
                .context("REPLICATE_TRAINER_VERSION not configured")?,
            webhook_url: env::var("REPLICATE_WEBHOOK_URL")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            base_url: env::var("REPLICATE_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
        };

        // Prompt enhancement is optional: without a key the feature is off.
        let openai = env::var("OPENAI_API_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|api_key| OpenAiSettings {
                api_key,
                model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-5-mini".to_string()),
                base_url: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            });

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            data_root,
            public_base_url,
            notify_queue_capacity,
            request_timeout_seconds,
            replicate,
            openai,
        })
    }
}

fn resolve_api_key() -> (String, bool) {
    if let Ok(value) = env::var("ATELIER_API_KEY") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), false);
        }
    }

    if let Ok(key_file) = env::var("ATELIER_API_KEY_FILE") {
        match fs::read_to_string(&key_file) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return (trimmed.to_string(), false);
                }
                eprintln!(
                    "[flux-atelier] ATELIER_API_KEY_FILE is empty: {}. Falling back to generated key.",
                    key_file
                );
            }
            Err(err) => {
                eprintln!(
                    "[flux-atelier] Failed reading ATELIER_API_KEY_FILE at {}: {}. Falling back to generated key.",
                    key_file, err
                );
            }
        }
    } else {
        eprintln!("[flux-atelier] ATELIER_API_KEY not set. Falling back to generated key.");
    }

    let generated = format!("fallback-{}", Uuid::new_v4());
    (generated, true)
}
