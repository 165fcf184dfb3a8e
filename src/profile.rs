//! Connection profile handed to a connection attempt

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ChimneyError, ChimneyResult};
use crate::validation;

/// Proxy endpoints, DNS address and credentials for one connection attempt
///
/// The proxy endpoints and the DNS address are required; `user` and `pass`
/// may be empty. Field names on disk and on the wire are camelCase.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    pub tcp_proxy_url: String,
    pub udp_proxy_url: String,
    pub dns_address: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub pass: String,
}

impl ConnectionProfile {
    /// Create a profile without credentials
    pub fn new(
        tcp_proxy_url: impl Into<String>,
        udp_proxy_url: impl Into<String>,
        dns_address: impl Into<String>,
    ) -> Self {
        Self {
            tcp_proxy_url: tcp_proxy_url.into(),
            udp_proxy_url: udp_proxy_url.into(),
            dns_address: dns_address.into(),
            user: String::new(),
            pass: String::new(),
        }
    }

    /// Attach proxy credentials
    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = user.into();
        self.pass = pass.into();
        self
    }

    /// Copy with every field trimmed
    pub fn normalized(&self) -> Self {
        Self {
            tcp_proxy_url: self.tcp_proxy_url.trim().to_string(),
            udp_proxy_url: self.udp_proxy_url.trim().to_string(),
            dns_address: self.dns_address.trim().to_string(),
            user: self.user.trim().to_string(),
            pass: self.pass.trim().to_string(),
        }
    }

    /// Wire names of required fields that are empty
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.tcp_proxy_url.trim().is_empty() {
            missing.push("tcpProxyUrl");
        }
        if self.udp_proxy_url.trim().is_empty() {
            missing.push("udpProxyUrl");
        }
        if self.dns_address.trim().is_empty() {
            missing.push("dnsAddress");
        }
        missing
    }

    /// Check that every required field is present
    ///
    /// This is the only check the supervisor applies before spawning a
    /// worker; the engine is left to interpret the endpoint strings.
    pub fn validate(&self) -> ChimneyResult<()> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ChimneyError::ConfigInvalid(format!(
                "Connection profile is incomplete, missing {}",
                missing.join(", ")
            )))
        }
    }

    /// Full check used before a profile is persisted
    pub fn validate_strict(&self) -> ChimneyResult<()> {
        self.validate()?;
        validation::validate_proxy_url(self.tcp_proxy_url.trim())
            .and_then(|_| validation::validate_proxy_url(self.udp_proxy_url.trim()))
            .and_then(|_| validation::validate_ip_address(self.dns_address.trim()).map(|_| ()))
            .and_then(|_| validation::sanitize_config_value(&self.user).map(|_| ()))
            .and_then(|_| validation::sanitize_config_value(&self.pass).map(|_| ()))
            .map_err(|e| ChimneyError::ConfigInvalid(e.to_string()))
    }

    /// Whether proxy credentials are configured
    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty()
    }
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("tcp_proxy_url", &self.tcp_proxy_url)
            .field("udp_proxy_url", &self.udp_proxy_url)
            .field("dns_address", &self.dns_address)
            .field("user", &self.user)
            .field("pass", &if self.pass.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConnectionProfile {
        ConnectionProfile::new("socks5://proxy:1080", "udp://proxy:1081", "1.1.1.1")
    }

    #[test]
    fn test_missing_fields_reported_together() {
        let profile = ConnectionProfile::new("", "x", "  ");
        assert_eq!(profile.missing_fields(), vec!["tcpProxyUrl", "dnsAddress"]);

        let err = profile.validate().unwrap_err();
        assert!(matches!(err, ChimneyError::ConfigInvalid(_)));
        assert!(err.to_string().contains("tcpProxyUrl, dnsAddress"));
    }

    #[test]
    fn test_credentials_are_optional() {
        assert!(sample().validate().is_ok());
        assert!(sample().validate_strict().is_ok());
        assert!(!sample().has_credentials());
        assert!(sample().with_credentials("alice", "s3cret").has_credentials());
    }

    #[test]
    fn test_strict_validation_rejects_malformed_values() {
        let mut profile = sample();
        profile.dns_address = "dns.example".to_string();
        assert!(matches!(profile.validate_strict(), Err(ChimneyError::ConfigInvalid(_))));

        let mut profile = sample();
        profile.tcp_proxy_url = "proxy:1080".to_string();
        assert!(profile.validate_strict().is_err());
        // Only presence is checked on the connect path
        assert!(profile.validate().is_ok());
    }

    #[test]
    fn test_normalized_trims_fields() {
        let profile = ConnectionProfile::new(" socks5://proxy:1080 ", "udp://proxy:1081\n", " 8.8.8.8")
            .with_credentials(" bob ", "pw ");
        let normalized = profile.normalized();
        assert_eq!(normalized.tcp_proxy_url, "socks5://proxy:1080");
        assert_eq!(normalized.udp_proxy_url, "udp://proxy:1081");
        assert_eq!(normalized.dns_address, "8.8.8.8");
        assert_eq!(normalized.user, "bob");
        assert_eq!(normalized.pass, "pw");
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", sample().with_credentials("alice", "hunter2"));
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["tcpProxyUrl"], "socks5://proxy:1080");
        assert_eq!(json["udpProxyUrl"], "udp://proxy:1081");
        assert_eq!(json["dnsAddress"], "1.1.1.1");

        let parsed: ConnectionProfile = serde_json::from_str(
            r#"{"tcpProxyUrl":"a","udpProxyUrl":"b","dnsAddress":"c"}"#
        ).unwrap();
        assert!(parsed.user.is_empty());
        assert!(parsed.pass.is_empty());
    }
}
