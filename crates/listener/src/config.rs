//! Listener configuration, resolved once at startup.

use crate::{ListenerError, ListenerResult};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LISTENER_ADDR: &str = "0.0.0.0:5001";
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// How inbound bytes are cut into messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Framing {
    /// Whatever one socket read returns is one message.
    #[default]
    PerRead,
    /// MLLP block framing: `0x0B <message> 0x1C 0x0D`, reassembled across reads.
    Mllp,
}

impl FromStr for Framing {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-read" | "per_read" | "read" => Ok(Framing::PerRead),
            "mllp" => Ok(Framing::Mllp),
            other => Err(ListenerError::InvalidConfig(format!(
                "unknown framing '{other}' (expected 'per-read' or 'mllp')"
            ))),
        }
    }
}

/// Text encoding of a session, fixed when the connection is accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TextEncoding {
    /// UTF-8; invalid sequences become U+FFFD.
    #[default]
    Utf8,
    /// ISO-8859-1.
    Latin1,
}

impl TextEncoding {
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

impl FromStr for TextEncoding {
    type Err = ListenerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" => Ok(TextEncoding::Latin1),
            other => Err(ListenerError::InvalidConfig(format!(
                "unknown encoding '{other}' (expected 'utf-8' or 'latin1')"
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ListenerConfig {
    pub addr: SocketAddr,
    pub idle_timeout: Duration,
    pub framing: Framing,
    pub encoding: TextEncoding,
    /// Upper bound on a reassembled MLLP message.
    pub max_message_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 5001)),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            framing: Framing::default(),
            encoding: TextEncoding::default(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl ListenerConfig {
    /// Resolve the listener configuration from `LIS_LISTENER_ADDR`, `LIS_IDLE_TIMEOUT_SECS`,
    /// `LIS_FRAMING` and `LIS_ENCODING`.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::InvalidConfig`] if a variable is set but does not parse.
    pub fn from_env() -> ListenerResult<Self> {
        Self::from_values(
            std::env::var("LIS_LISTENER_ADDR").ok(),
            std::env::var("LIS_IDLE_TIMEOUT_SECS").ok(),
            std::env::var("LIS_FRAMING").ok(),
            std::env::var("LIS_ENCODING").ok(),
        )
    }

    pub fn from_values(
        addr: Option<String>,
        idle_timeout_secs: Option<String>,
        framing: Option<String>,
        encoding: Option<String>,
    ) -> ListenerResult<Self> {
        let set = |v: Option<String>| v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let addr = set(addr)
            .unwrap_or_else(|| DEFAULT_LISTENER_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ListenerError::InvalidConfig(format!("invalid listener address: {e}")))?;

        let idle_timeout_secs = match set(idle_timeout_secs) {
            Some(v) => v.parse::<u64>().map_err(|e| {
                ListenerError::InvalidConfig(format!("invalid idle timeout '{v}': {e}"))
            })?,
            None => DEFAULT_IDLE_TIMEOUT_SECS,
        };
        if idle_timeout_secs == 0 {
            return Err(ListenerError::InvalidConfig(
                "idle timeout must be at least one second".into(),
            ));
        }

        Ok(Self {
            addr,
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            framing: set(framing)
                .map(|v| v.parse::<Framing>())
                .transpose()?
                .unwrap_or_default(),
            encoding: set(encoding)
                .map(|v| v.parse::<TextEncoding>())
                .transpose()?
                .unwrap_or_default(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        })
    }
}
