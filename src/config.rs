use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// Node configuration handed across the FFI boundary as JSON.
///
/// Unknown keys are ignored; a missing `type`, `server` or `server_port`
/// is a parse error.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: ProtocolKind,
    pub server: String,
    pub server_port: u16,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    /// Consumed by the local inbound only; the TUN path ignores it.
    #[serde(default)]
    pub local_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Mandala,
    Trojan,
    Vless,
    Shadowsocks,
    #[serde(alias = "socks")]
    Socks5,
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ProtocolKind::Mandala => write!(f, "mandala"),
            ProtocolKind::Trojan => write!(f, "trojan"),
            ProtocolKind::Vless => write!(f, "vless"),
            ProtocolKind::Shadowsocks => write!(f, "shadowsocks"),
            ProtocolKind::Socks5 => write!(f, "socks5"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// SNI; falls back to `server` when empty.
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub enable_ech: bool,
    #[serde(default)]
    pub ech_doh_url: String,
    #[serde(default)]
    pub ech_public_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Ws,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(rename = "type", default)]
    pub kind: TransportKind,
    #[serde(default = "default_ws_path")]
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_ws_path() -> String {
    "/".to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Tcp,
            path: default_ws_path(),
            headers: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsConfig {
    #[serde(default)]
    pub fragment: bool,
    #[serde(default)]
    pub noise: Noise,
}

/// `settings.noise` arrives either as a boolean flag or as a byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Noise {
    Flag(bool),
    Count(u32),
}

impl Default for Noise {
    fn default() -> Self {
        Noise::Flag(false)
    }
}

impl Noise {
    /// Number of random bytes to append to the Mandala prologue.
    /// A bare `true` selects a small default suffix.
    pub fn byte_count(&self) -> usize {
        match self {
            Noise::Flag(false) => 0,
            Noise::Flag(true) => 16,
            Noise::Count(n) => *n as usize,
        }
    }
}

impl NodeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let mut cfg: NodeConfig = serde_json::from_str(json)?;
        // Nodes imported from socks/ss share URIs carry the user name in
        // the uuid field; the handshake reads username.
        if matches!(cfg.kind, ProtocolKind::Socks5 | ProtocolKind::Shadowsocks)
            && cfg.username.is_empty()
            && !cfg.uuid.is_empty()
        {
            cfg.username = cfg.uuid.clone();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::Config("empty server".into()));
        }
        if self.kind == ProtocolKind::Vless {
            uuid::Uuid::parse_str(&self.uuid)?;
        }
        Ok(())
    }

    /// SNI actually presented on the wire, also the WebSocket `Host`.
    pub fn effective_server_name(&self) -> &str {
        if self.tls.server_name.is_empty() {
            &self.server
        } else {
            &self.tls.server_name
        }
    }

    pub fn ech_query_domain(&self) -> &str {
        if self.tls.ech_public_name.is_empty() {
            self.effective_server_name()
        } else {
            &self.tls.ech_public_name
        }
    }
}
