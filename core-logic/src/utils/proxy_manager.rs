use crate::config::ProxyConfig;
use crate::error::ConfigError;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Parses one `ip:port[:username:password]` line.
///
/// Blank lines and `#` comments yield `Ok(None)`.
pub fn parse_proxy_line(line: &str, line_no: usize) -> Result<Option<ProxyConfig>, ConfigError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let parts: Vec<&str> = line.split(':').collect();
    let invalid = || ConfigError::InvalidProxyLine {
        line: line_no,
        content: line.to_string(),
    };

    // ip:port -> 2 parts, ip:port:user:pass -> 4 parts
    if parts.len() != 2 && parts.len() != 4 {
        return Err(invalid());
    }
    if parts[0].is_empty() || parts[1].parse::<u16>().is_err() {
        return Err(invalid());
    }

    let (username, password) = if parts.len() == 4 {
        (Some(parts[2].to_string()), Some(parts[3].to_string()))
    } else {
        (None, None)
    };

    Ok(Some(ProxyConfig {
        url: format!("http://{}:{}", parts[0], parts[1]),
        username,
        password,
    }))
}

/// Loads proxies from a text file, one per line.
///
/// A missing file means "no proxies". Malformed lines are skipped with a warning.
pub fn load_proxies(path: impl AsRef<Path>) -> Result<Vec<ProxyConfig>, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        warn!("{} not found. Running without proxies.", path.display());
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.display().to_string(),
        msg: e.to_string(),
    })?;

    let mut proxies = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        match parse_proxy_line(line, idx + 1) {
            Ok(Some(proxy)) => proxies.push(proxy),
            Ok(None) => {}
            Err(e) => warn!("Skipping proxy: {}", e),
        }
    }

    info!("Loaded {} proxies from {}", proxies.len(), path.display());
    Ok(proxies)
}
