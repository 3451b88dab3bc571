use anyhow::{anyhow, Context, Result};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

pub fn required_env(name: &str) -> Result<String> {
    let value = env::var(name).with_context(|| format!("missing env: {name}"))?;
    if value.trim().is_empty() {
        return Err(anyhow!("empty env: {name}"));
    }
    Ok(value)
}

/// Returns `None` when the variable is unset or blank.
pub fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn socket_addr_from_env(name: &str, default: &str) -> Result<SocketAddr> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    SocketAddr::from_str(&value).map_err(|err| anyhow!("invalid socket addr for {name}: {err}"))
}

pub fn u64_from_env(name: &str, default: u64) -> Result<u64> {
    match optional_env(name) {
        Some(value) => value
            .parse::<u64>()
            .map_err(|err| anyhow!("invalid integer for {name}: {err}")),
        None => Ok(default),
    }
}
