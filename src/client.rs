use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::utils::parse_headers_with_escapes;

/// Configuration for building the shared HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub skip_tls_verify: bool,
    pub resolve_target_addr: Option<String>,
    pub custom_headers: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            skip_tls_verify: false,
            resolve_target_addr: None,
            custom_headers: None,
        }
    }
}

/// Result of building the client, includes parsed headers for logging.
pub struct ClientBuildResult {
    pub client: reqwest::Client,
    pub parsed_headers: HeaderMap,
}

/// Builds the reqwest client shared by every virtual user.
///
/// One client means one connection pool; VUs reuse keep-alive connections the
/// way separate browser tabs to the same host would.
pub fn build_client(config: &ClientConfig) -> Result<ClientBuildResult, EngineError> {
    let mut client_builder = reqwest::Client::builder().timeout(config.request_timeout);

    if let Some(ref resolve_str) = config.resolve_target_addr {
        if !resolve_str.is_empty() {
            client_builder = configure_dns_override(client_builder, resolve_str)?;
        } else {
            warn!("RESOLVE_TARGET_ADDR is set but empty, no DNS override will be applied");
        }
    }

    let parsed_headers = parse_custom_headers(config.custom_headers.as_deref())?;
    if !parsed_headers.is_empty() {
        client_builder = client_builder.default_headers(parsed_headers.clone());
        info!(count = parsed_headers.len(), "Configured custom default headers");
    }

    if config.skip_tls_verify {
        warn!("Skipping TLS certificate verification");
        client_builder = client_builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }

    let client = client_builder
        .build()
        .map_err(|e| EngineError::Client(e.to_string()))?;

    Ok(ClientBuildResult {
        client,
        parsed_headers,
    })
}

/// Applies a `hostname:ip:port` DNS override.
fn configure_dns_override(
    client_builder: reqwest::ClientBuilder,
    resolve_str: &str,
) -> Result<reqwest::ClientBuilder, EngineError> {
    let parts: Vec<&str> = resolve_str.split(':').map(str::trim).collect();
    let [hostname, ip, port] = parts.as_slice() else {
        return Err(EngineError::Config(format!(
            "RESOLVE_TARGET_ADDR ('{}') is not in the expected format 'hostname:ip:port'",
            resolve_str
        )));
    };

    if hostname.is_empty() || ip.is_empty() || port.is_empty() {
        return Err(EngineError::Config(format!(
            "RESOLVE_TARGET_ADDR ('{}'): hostname, IP and port must all be non-empty",
            resolve_str
        )));
    }

    let port: u16 = port.parse().map_err(|e| {
        EngineError::Config(format!(
            "Failed to parse port '{}' in RESOLVE_TARGET_ADDR: {}",
            port, e
        ))
    })?;

    let socket_addr: SocketAddr = format!("{}:{}", ip, port).parse().map_err(|e| {
        EngineError::Config(format!(
            "Failed to parse IP '{}' in RESOLVE_TARGET_ADDR: {}",
            ip, e
        ))
    })?;

    info!(hostname = %hostname, addr = %socket_addr, "Configured DNS override");
    Ok(client_builder.resolve(hostname, socket_addr))
}

/// Parses `Name:Value` pairs separated by commas (`\,` for a literal comma).
pub fn parse_custom_headers(custom_headers_str: Option<&str>) -> Result<HeaderMap, EngineError> {
    let mut parsed_headers = HeaderMap::new();

    let headers_str = match custom_headers_str {
        Some(s) if !s.trim().is_empty() => s,
        _ => return Ok(parsed_headers),
    };

    for header_pair_str in parse_headers_with_escapes(headers_str) {
        let pair = header_pair_str.trim();

        let (name_str, value_str) = pair.split_once(':').ok_or_else(|| {
            EngineError::Config(format!(
                "Invalid header format in CUSTOM_HEADERS: '{}'. Expected 'Name:Value'.",
                pair
            ))
        })?;
        let name_str = name_str.trim();
        let value_str = value_str.trim();

        if name_str.is_empty() {
            return Err(EngineError::Config(format!(
                "Invalid header format: header name cannot be empty in '{}'.",
                pair
            )));
        }

        let header_name = HeaderName::from_str(name_str).map_err(|e| {
            EngineError::Config(format!("Invalid header name '{}': {}", name_str, e))
        })?;
        let header_value = HeaderValue::from_str(value_str).map_err(|e| {
            EngineError::Config(format!("Invalid header value for '{}': {}", name_str, e))
        })?;

        parsed_headers.insert(header_name, header_value);
    }

    Ok(parsed_headers)
}
