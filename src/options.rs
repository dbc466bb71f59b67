//! Connection options and the handshake preamble.
//!
//! Every connection starts with one JSON-encoded [`Options`] value sent
//! by the client, negotiating the magic number, the codec for all
//! subsequent frames, and the timeouts. Durations travel as integer
//! nanoseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CodecType;

/// Marks a connection as speaking this protocol.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Default connect timeout (dial plus handshake).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The handshake preamble.
///
/// `handle_timeout` is the per-request bound the server applies when
/// dispatching handlers on this connection; zero disables it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    pub magic_number: u32,
    pub codec_type: CodecType,
    #[serde(with = "duration_nanos")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_nanos", default)]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    pub fn with_codec(mut self, codec_type: CodecType) -> Self {
        self.codec_type = codec_type;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handle_timeout(mut self, timeout: Duration) -> Self {
        self.handle_timeout = timeout;
        self
    }

    /// Force the magic number to the canonical constant. Dialing always
    /// normalizes user-supplied options first.
    pub(crate) fn normalized(mut self) -> Self {
        self.magic_number = MAGIC_NUMBER;
        self
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}
