//! Input validation and sanitization
//!
//! Checks applied to connection profiles, daemon configuration and any text
//! that ends up in a published status message.

use crate::error::{ChimneyError, ChimneyResult};
use std::net::IpAddr;
use url::Url;

/// Maximum length for interface names (Linux kernel limit is 15)
const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Maximum length for configuration values
const MAX_CONFIG_VALUE_LEN: usize = 255;

/// Maximum length for error messages shown to users
const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Proxy URL schemes the tunnel engine understands
const PROXY_SCHEMES: &[&str] = &["socks5", "socks5h", "http", "https", "tcp", "udp", "ws", "wss"];

/// Validate an interface name template such as `chimney%d`
///
/// Same character rules as a kernel interface name, plus a single `%d`
/// placeholder the kernel replaces with the first free index.
pub fn validate_interface_template(template: &str) -> ChimneyResult<()> {
    if template.is_empty() {
        return Err(ChimneyError::InvalidParameter(
            "Interface name cannot be empty".to_string()
        ));
    }

    if template.len() > MAX_INTERFACE_NAME_LEN {
        return Err(ChimneyError::InvalidParameter(
            format!("Interface name too long (max {} characters)", MAX_INTERFACE_NAME_LEN)
        ));
    }

    if template.matches("%d").count() > 1 {
        return Err(ChimneyError::InvalidParameter(
            "Interface name may contain at most one %d placeholder".to_string()
        ));
    }

    // Only allow alphanumeric, dash, underscore outside the placeholder
    for c in template.replace("%d", "").chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            return Err(ChimneyError::InvalidParameter(
                format!("Invalid interface name '{}': contains invalid character '{}'", template, c)
            ));
        }
    }

    if template.starts_with('-') {
        return Err(ChimneyError::InvalidParameter(
            "Interface name cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Validate IP address
pub fn validate_ip_address(addr: &str) -> ChimneyResult<IpAddr> {
    addr.parse::<IpAddr>()
        .map_err(|_| ChimneyError::InvalidParameter(
            format!("Invalid IP address: {}", addr)
        ))
}

/// Validate prefix length for IPv4 or IPv6
pub fn validate_prefix_len(prefix: u8, is_ipv6: bool) -> ChimneyResult<()> {
    let max = if is_ipv6 { 128 } else { 32 };
    if prefix > max {
        return Err(ChimneyError::InvalidParameter(
            format!("Prefix length {} exceeds maximum {}", prefix, max)
        ));
    }
    Ok(())
}

/// Validate a route in CIDR notation (e.g. `0.0.0.0/0`)
pub fn validate_cidr(cidr: &str) -> ChimneyResult<()> {
    let (ip, prefix) = cidr.split_once('/').ok_or_else(|| ChimneyError::InvalidParameter(
        format!("Route '{}' is not in CIDR notation", cidr)
    ))?;
    let ip = validate_ip_address(ip)?;
    let prefix = prefix.parse::<u8>().map_err(|_| ChimneyError::InvalidParameter(
        format!("Invalid prefix length in route '{}'", cidr)
    ))?;
    validate_prefix_len(prefix, ip.is_ipv6())
}

/// Validate MTU value
pub fn validate_mtu(mtu: u32) -> ChimneyResult<()> {
    // 576 is the smallest MTU every IPv4 host must accept
    if mtu < 576 {
        return Err(ChimneyError::InvalidParameter(
            "MTU must be at least 576 bytes".to_string()
        ));
    }
    if mtu > 9000 {
        return Err(ChimneyError::InvalidParameter(
            "MTU cannot exceed 9000 bytes".to_string()
        ));
    }
    Ok(())
}

/// Validate a proxy endpoint of the form `scheme://host:port`
///
/// Userinfo (`user:pass@`) is rejected; credentials travel in the profile's
/// own fields so they never show up in process listings.
pub fn validate_proxy_url(proxy_url: &str) -> ChimneyResult<()> {
    // Without this `host:port` would parse as scheme `host`
    if !proxy_url.contains("://") {
        return Err(ChimneyError::InvalidParameter(
            format!("Proxy URL '{}' is missing a scheme", proxy_url)
        ));
    }

    let parsed = Url::parse(proxy_url).map_err(|e| ChimneyError::InvalidParameter(
        format!("Invalid proxy URL '{}': {}", proxy_url, e)
    ))?;

    if !PROXY_SCHEMES.contains(&parsed.scheme()) {
        return Err(ChimneyError::InvalidParameter(
            format!("Unsupported proxy scheme: {}", parsed.scheme())
        ));
    }

    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(ChimneyError::InvalidParameter(
            "Proxy URL must not embed credentials".to_string()
        ));
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(ChimneyError::InvalidParameter(
            format!("Proxy URL '{}' is missing a host", proxy_url)
        ));
    }

    if !matches!(parsed.path(), "" | "/") || parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(ChimneyError::InvalidParameter(
            format!("Proxy URL '{}' must not carry a path, query or fragment", proxy_url)
        ));
    }

    match parsed.port_or_known_default() {
        Some(port) if port != 0 => Ok(()),
        Some(_) => Err(ChimneyError::InvalidParameter(
            format!("Invalid port in proxy URL '{}'", proxy_url)
        )),
        None => Err(ChimneyError::InvalidParameter(
            format!("Proxy URL '{}' is missing a port", proxy_url)
        )),
    }
}

/// Sanitize configuration values to prevent injection
///
/// Rejects values containing control characters or null bytes and caps the
/// length; returns the value unchanged otherwise.
pub fn sanitize_config_value(value: &str) -> ChimneyResult<String> {
    if value.contains('\0') {
        return Err(ChimneyError::InvalidParameter(
            "Configuration value contains null byte".to_string()
        ));
    }

    if value.chars().any(|c| c.is_control() && c != '\t') {
        return Err(ChimneyError::InvalidParameter(
            "Configuration value contains invalid control characters".to_string()
        ));
    }

    if value.len() > MAX_CONFIG_VALUE_LEN {
        return Err(ChimneyError::InvalidParameter(
            format!("Configuration value too long (max {} characters)", MAX_CONFIG_VALUE_LEN)
        ));
    }

    Ok(value.to_string())
}

/// Sanitize error text before it is published as a status message
///
/// Messages are rendered verbatim by front ends, so they are collapsed to one
/// line and length-limited.
pub fn sanitize_error_message(text: &str) -> String {
    let mut sanitized: String = text
        .trim()
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str("... (truncated)");
    }

    sanitized
}
