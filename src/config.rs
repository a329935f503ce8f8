use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_LISTEN_ADDR: &str = "[::1]:50051";
const DEFAULT_ENGINE_PATH: &str = "ffmpeg";
const DEFAULT_INGEST_BASE: &str = "rtmp://a.rtmp.youtube.com/live2";
const DEFAULT_CONFIRM_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_KILL_GRACE_MS: u64 = 5_000;

/// Service settings, read from the environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub engine_path: PathBuf,
    pub ingest_base: String,
    pub confirm_timeout: Duration,
    pub kill_grace: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = parse_or(&lookup, "KAWA_LISTEN_ADDR", DEFAULT_LISTEN_ADDR)?;
        let engine_path = lookup("KAWA_ENGINE_PATH")
            .filter(|path| !path.is_empty())
            .unwrap_or_else(|| DEFAULT_ENGINE_PATH.to_owned());
        let ingest_base = lookup("KAWA_INGEST_BASE")
            .filter(|base| !base.is_empty())
            .unwrap_or_else(|| DEFAULT_INGEST_BASE.to_owned());
        let confirm_ms: u64 = parse_or(
            &lookup,
            "KAWA_CONFIRM_TIMEOUT_MS",
            &DEFAULT_CONFIRM_TIMEOUT_MS.to_string(),
        )?;
        let grace_ms: u64 = parse_or(
            &lookup,
            "KAWA_KILL_GRACE_MS",
            &DEFAULT_KILL_GRACE_MS.to_string(),
        )?;

        Ok(Config {
            listen_addr,
            engine_path: PathBuf::from(engine_path),
            ingest_base: ingest_base.trim_end_matches('/').to_owned(),
            confirm_timeout: Duration::from_millis(confirm_ms),
            kill_grace: Duration::from_millis(grace_ms),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = lookup(key).unwrap_or_else(|| default.to_owned());
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value,
    })
}
