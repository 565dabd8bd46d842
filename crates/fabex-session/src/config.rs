use std::fmt;
use std::time::Duration;

use fabex_transport::{Capabilities, CqAttr, EpAttr, EqAttr};
use serde::Serialize;

/// Default service port.
pub const DEFAULT_PORT: u16 = 8080;

/// Communication mode; selects the capabilities requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommMode {
    /// Client to server only.
    OneWay,
    /// Both directions.
    TwoWay,
}

impl CommMode {
    pub fn caps(self) -> Capabilities {
        match self {
            CommMode::OneWay => Capabilities::SEND | Capabilities::RECV,
            CommMode::TwoWay => Capabilities::MSG | Capabilities::SEND | Capabilities::RECV,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommMode::OneWay => "one-way",
            CommMode::TwoWay => "two-way",
        }
    }
}

impl fmt::Display for CommMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session configuration shared by both roles.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub mode: CommMode,
    /// Port the server listens on (0 picks an ephemeral port).
    pub port: u16,
    /// Local address the server binds (`None` binds every interface).
    pub bind_addr: Option<String>,
    /// How long one wait for the server-side connection confirmation lasts.
    pub confirm_timeout: Duration,
    /// How many confirmation waits are made before giving up.
    pub confirm_retries: u32,
    /// Bound on the wait for a connection request (`None` waits forever).
    pub request_timeout: Option<Duration>,
    /// Size of the receive posted before connecting/accepting (0 disables).
    pub prepost_bytes: usize,
    /// Endpoint attribute overrides passed to the provider.
    pub ep_attr: Option<EpAttr>,
    pub eq_attr: EqAttr,
    pub cq_attr: CqAttr,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: CommMode::TwoWay,
            port: DEFAULT_PORT,
            bind_addr: None,
            confirm_timeout: Duration::from_millis(500),
            confirm_retries: 3,
            request_timeout: None,
            prepost_bytes: std::mem::size_of::<f32>(),
            ep_attr: None,
            eq_attr: EqAttr::default(),
            cq_attr: CqAttr::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_mode(mut self, mode: CommMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = Some(addr.into());
        self
    }

    pub fn with_ep_attr(mut self, attr: EpAttr) -> Self {
        self.ep_attr = Some(attr);
        self
    }

    pub fn with_confirm(mut self, timeout: Duration, retries: u32) -> Self {
        self.confirm_timeout = timeout;
        self.confirm_retries = retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_selects_capabilities() {
        assert_eq!(
            CommMode::OneWay.caps(),
            Capabilities::SEND | Capabilities::RECV
        );
        assert!(CommMode::TwoWay.caps().contains(Capabilities::MSG));
    }

    #[test]
    fn defaults_match_reference_setup() {
        let config = SessionConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.confirm_timeout, Duration::from_millis(500));
        assert_eq!(config.prepost_bytes, 4);
        assert_eq!(config.eq_attr.size, 10);
        assert!(config.request_timeout.is_none());
    }

    #[test]
    fn mode_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&CommMode::OneWay).unwrap(),
            "\"one-way\""
        );
    }
}
