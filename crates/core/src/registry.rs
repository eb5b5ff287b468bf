//! Channel registry: the named feeds a mosaic can be built from.
//!
//! The registry is a CSV file with a header row. `channelName` and
//! `ipAddress` are required; `rotation` and `trim` are optional:
//!
//! ```text
//! channelName,direction,ipAddress,rotation,trim
//! CAM1,in,239.1.1.1,,
//! CAM2,in,10.0.0.7:6002,90,
//! STUDIO,in,srt://studio.local:9000,0,0:0:50%:100%
//! ```
//!
//! Other columns are ignored. Addresses are normalised with
//! [`normalize_source_url`]. Duplicate channel names are rejected. Quoted
//! fields may span lines; a record's line number is the line it starts on.

use std::collections::HashMap;
use std::path::Path;

use serde::Serialize;

use crate::error::{MosaicError, RegistryErrorKind, Result};
use crate::media::transform::{FrameTransform, Trim};

/// Default RTP port for bare source addresses without one.
pub const DEFAULT_SOURCE_PORT: u16 = 6000;

const NAME_COLUMN: &str = "channelName";
const ADDRESS_COLUMN: &str = "ipAddress";
const ROTATION_COLUMN: &str = "rotation";
const TRIM_COLUMN: &str = "trim";

/// One named network video feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Channel {
    pub name: String,
    /// Source URL. Empty when the registry row had no address.
    pub url: String,
    #[serde(skip_serializing_if = "FrameTransform::is_identity")]
    pub transform: FrameTransform,
}

impl Channel {
    pub fn new(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            url: normalize_source_url(address),
            transform: FrameTransform::default(),
        }
    }

    pub fn with_transform(mut self, transform: FrameTransform) -> Self {
        self.transform = transform;
        self
    }

    /// Whether the channel has a feed to pull from.
    pub fn has_source(&self) -> bool {
        !self.url.is_empty()
    }
}

/// Normalise a registry address into a source URL.
///
/// `10.0.0.7`           → `rtp://10.0.0.7:6000`
/// `10.0.0.7:6002`      → `rtp://10.0.0.7:6002`
/// `udp://@239.1.1.1:5` → unchanged
/// ``                   → `` (no source)
pub fn normalize_source_url(address: &str) -> String {
    let address = address.trim();
    if address.is_empty() || address.contains("://") {
        return address.to_string();
    }
    let has_port = address
        .rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()));
    if has_port {
        format!("rtp://{address}")
    } else {
        format!("rtp://{address}:{DEFAULT_SOURCE_PORT}")
    }
}

/// Ordered, name-unique list of channels.
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: Vec<Channel>,
}

impl ChannelRegistry {
    /// Read and parse a registry CSV file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let registry = Self::parse(&text)?;
        tracing::info!(path = %path.display(), channels = registry.len(), "registry loaded");
        Ok(registry)
    }

    /// Parse registry CSV text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut rows = csv_records(text)?.into_iter();

        let (_, header) = rows.next().ok_or(MosaicError::Registry {
            kind: RegistryErrorKind::Empty,
        })?;
        let position = |name: &str| header.iter().position(|h| h.trim() == name);
        let column = |name: &'static str| {
            position(name).ok_or(MosaicError::Registry {
                kind: RegistryErrorKind::MissingColumn(name),
            })
        };
        let name_idx = column(NAME_COLUMN)?;
        let addr_idx = column(ADDRESS_COLUMN)?;
        let rotation_idx = position(ROTATION_COLUMN);
        let trim_idx = position(TRIM_COLUMN);

        let mut entries = Vec::new();
        for (line, fields) in rows {
            let field = |idx: Option<usize>| {
                idx.and_then(|i| fields.get(i))
                    .map(|s| s.trim())
                    .unwrap_or("")
            };
            let malformed = || MosaicError::Registry {
                kind: RegistryErrorKind::MalformedRow { line },
            };

            let name = field(Some(name_idx));
            if name.is_empty() {
                return Err(malformed());
            }
            let rotation = match field(rotation_idx) {
                "" => 0,
                raw => raw
                    .parse::<f64>()
                    .ok()
                    .filter(|d| d.is_finite())
                    .ok_or_else(malformed)? as i64,
            };
            let trim = match field(trim_idx) {
                "" => None,
                raw => Some(raw.parse::<Trim>().map_err(|reason| {
                    tracing::warn!(line, %reason, "bad trim in registry");
                    malformed()
                })?),
            };

            let channel = Channel::new(name, field(Some(addr_idx)))
                .with_transform(FrameTransform::from_degrees(rotation, trim));
            entries.push((line, channel));
        }

        Self::from_numbered(entries)
    }

    /// Build a registry from `(name, address)` pairs, in order.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        Self::from_numbered(
            entries
                .into_iter()
                .enumerate()
                .map(|(idx, (name, addr))| (idx + 1, Channel::new(name, addr))),
        )
    }

    fn from_numbered(entries: impl IntoIterator<Item = (usize, Channel)>) -> Result<Self> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut channels = Vec::new();
        for (line, channel) in entries {
            if let Some(&first_line) = seen.get(&channel.name) {
                return Err(MosaicError::Registry {
                    kind: RegistryErrorKind::DuplicateChannel {
                        name: channel.name,
                        first_line,
                        line,
                    },
                });
            }
            seen.insert(channel.name.clone(), line);
            tracing::trace!(channel = %channel.name, url = %channel.url, "registry entry");
            channels.push(channel);
        }
        Ok(Self { channels })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// Pick channels by name.
    ///
    /// An empty selection means every channel. The result keeps registry
    /// order and ignores repeated names. Unknown names fail with
    /// [`MosaicError::ChannelNotFound`].
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Channel>> {
        if names.is_empty() {
            return Ok(self.channels.clone());
        }
        if let Some(unknown) = names.iter().find(|n| self.get(n.as_ref()).is_none()) {
            return Err(MosaicError::ChannelNotFound(unknown.as_ref().to_string()));
        }
        Ok(self
            .channels
            .iter()
            .filter(|c| names.iter().any(|n| n.as_ref() == c.name))
            .cloned()
            .collect())
    }
}

/// Split CSV text into records, each tagged with the line it starts on.
///
/// Honours double quotes, `""` escapes and quoted line breaks. Blank lines
/// and lines starting with `#` outside a quoted field are skipped.
fn csv_records(text: &str) -> Result<Vec<(usize, Vec<String>)>> {
    let mut records = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut start_line = 1;

    for (idx, raw) in text.split('\n').enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if !in_quotes {
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            start_line = idx + 1;
        } else {
            field.push('\n');
        }

        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '"' if in_quotes && chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = !in_quotes,
                ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
                _ => field.push(c),
            }
        }
        if !in_quotes {
            fields.push(std::mem::take(&mut field));
            records.push((start_line, std::mem::take(&mut fields)));
        }
    }

    if in_quotes {
        return Err(MosaicError::Registry {
            kind: RegistryErrorKind::MalformedRow { line: start_line },
        });
    }
    Ok(records)
}
