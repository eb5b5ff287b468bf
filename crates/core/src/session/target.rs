//! Output targets and their identity keys.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{MosaicError, Result};

/// Destination port for RTP outputs given without one.
pub const DEFAULT_RTP_PORT: u16 = 5004;

pub const DEFAULT_FPS: u32 = 30;

/// Where composite frames are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Rtp,
    Hls,
    Window,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rtp => "rtp",
            Self::Hls => "hls",
            Self::Window => "window",
        })
    }
}

impl FromStr for Protocol {
    type Err = MosaicError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rtp" => Ok(Self::Rtp),
            "hls" => Ok(Self::Hls),
            "window" => Ok(Self::Window),
            other => Err(MosaicError::InvalidTarget(format!("unknown protocol '{other}'"))),
        }
    }
}

/// Identity of a target in the session registry. At most one live session
/// exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TargetKey(String);

impl TargetKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One output destination plus its encoding parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub protocol: Protocol,
    /// `host:port` for RTP, the stream name for HLS, `None` for a window.
    pub destination: Option<String>,
    pub fps: u32,
    /// Per-session encoder options, merged over the configured defaults.
    pub encoder_options: BTreeMap<String, String>,
}

impl OutputTarget {
    /// RTP output to `host`, `host:port` or `rtp://host:port`.
    pub fn rtp(address: &str, port: Option<u16>) -> Result<Self> {
        let address = address.trim();
        let address = address.strip_prefix("rtp://").unwrap_or(address);
        let (host, parsed_port) = split_host_port(address)?;
        if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(MosaicError::InvalidTarget(format!("bad RTP host '{address}'")));
        }
        let port = port.or(parsed_port).unwrap_or(DEFAULT_RTP_PORT);
        if port == 0 {
            return Err(MosaicError::InvalidTarget("RTP port must be non-zero".to_string()));
        }
        let destination = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Ok(Self::new(Protocol::Rtp, Some(destination)))
    }

    /// HLS output named `name`; the name becomes a directory component.
    pub fn hls(name: &str) -> Result<Self> {
        let name = name.trim();
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(MosaicError::InvalidTarget(format!("bad HLS stream name '{name}'")));
        }
        Ok(Self::new(Protocol::Hls, Some(name.to_string())))
    }

    /// The local display.
    pub fn window() -> Self {
        Self::new(Protocol::Window, None)
    }

    fn new(protocol: Protocol, destination: Option<String>) -> Self {
        Self {
            protocol,
            destination,
            fps: DEFAULT_FPS,
            encoder_options: BTreeMap::new(),
        }
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps.max(1);
        self
    }

    pub fn with_options(mut self, options: BTreeMap<String, String>) -> Self {
        self.encoder_options = options;
        self
    }

    pub fn key(&self) -> TargetKey {
        let destination = self.destination.as_deref().unwrap_or_default();
        TargetKey(match self.protocol {
            Protocol::Rtp => format!("rtp://{destination}"),
            Protocol::Hls => format!("hls:{destination}"),
            Protocol::Window => "window:local".to_string(),
        })
    }

    /// Encoder output URL for RTP targets.
    pub fn rtp_url(&self) -> Option<String> {
        match (self.protocol, &self.destination) {
            (Protocol::Rtp, Some(dest)) => Some(format!("rtp://{dest}")),
            _ => None,
        }
    }
}

fn split_host_port(address: &str) -> Result<(&str, Option<u16>)> {
    // Bracketed IPv6: [::1]:5004
    if let Some(rest) = address.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(MosaicError::InvalidTarget(format!("bad RTP address '{address}'")));
        };
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None if tail.is_empty() => None,
            None => return Err(MosaicError::InvalidTarget(format!("bad RTP address '{address}'"))),
        };
        return Ok((host, port));
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host, Some(parse_port(port)?))),
        _ => Ok((address, None)),
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| MosaicError::InvalidTarget(format!("bad port '{port}'")))
}

/// Parse `key=value` strings into an option map. Later keys win.
pub fn parse_key_value_options<S: AsRef<str>>(pairs: &[S]) -> Result<BTreeMap<String, String>> {
    let mut options = BTreeMap::new();
    for pair in pairs {
        let pair = pair.as_ref();
        let Some((key, value)) = pair.split_once('=') else {
            return Err(MosaicError::InvalidOption(pair.to_string()));
        };
        let key = key.trim().trim_start_matches('-');
        if key.is_empty() {
            return Err(MosaicError::InvalidOption(pair.to_string()));
        }
        options.insert(key.to_string(), value.trim().to_string());
    }
    Ok(options)
}
