//! Connection handshake payload.
//!
//! ```text
//! version:2 nh:2 (key~2 value~2){nh}
//! ```

use bytes::{BufMut, BytesMut};

use super::Headers;
use crate::{
    codec::{Reader, put_string2},
    errors::{ProtocolError, Result},
    opcodes::Opcode,
};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u16 = 2;

/// Header naming the sender's reachable `host:port`.
pub const HOST_PORT: &str = "host_port";

/// Header naming the sender's process.
pub const PROCESS_NAME: &str = "process_name";

/// Init request or response body. Both directions share the layout.
///
/// # Protocol Flow
///
/// 1. Initiator sends `InitRequest` with the reserved id
/// 2. Responder validates the version and required headers
/// 3. Responder answers `InitResponse`, or an `Error` on the reserved id
/// 4. Only then may either side send calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    /// Protocol version.
    pub version: u16,
    /// Handshake headers; must include `host_port` and `process_name`.
    pub headers: Headers,
}

impl Init {
    /// Handshake body with the two required headers.
    pub fn new(host_port: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            headers: vec![
                (HOST_PORT.to_string(), host_port.into()),
                (PROCESS_NAME.to_string(), process_name.into()),
            ],
        }
    }

    /// Look up a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Advertised `host:port`.
    pub fn host_port(&self) -> Option<&str> {
        self.header(HOST_PORT)
    }

    /// Advertised process name.
    pub fn process_name(&self) -> Option<&str> {
        self.header(PROCESS_NAME)
    }

    /// First required header that is absent, if any.
    pub fn missing_required_header(&self) -> Option<&'static str> {
        [HOST_PORT, PROCESS_NAME].into_iter().find(|key| self.header(key).is_none())
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u16(self.version);
        let count = u16::try_from(self.headers.len()).map_err(|_| ProtocolError::FieldTooLong {
            field: "init headers",
            len: self.headers.len(),
            max: usize::from(u16::MAX),
        })?;
        dst.put_u16(count);
        for (key, value) in &self.headers {
            put_string2(dst, "init header key", key)?;
            put_string2(dst, "init header value", value)?;
        }
        Ok(())
    }

    pub(crate) fn decode(reader: &mut Reader, opcode: Opcode) -> Result<Self> {
        let version = reader.u16()?;
        let count = reader.u16()?;
        let mut headers = Vec::with_capacity(usize::from(count).min(64));
        for _ in 0..count {
            let key = reader.string2("init header key")?;
            let value = reader.string2("init header value")?;
            headers.push((key, value));
        }
        reader.finish(opcode)?;
        Ok(Self { version, headers })
    }
}
