//! ClientHello introspection used to decide between the modern and classic paths.
//!
//! The modern engine only needs a handful of facts from the client's first
//! flight: which protocol versions it offers, the SNI host and its ALPN list.
//! [`read_client_hello`] pulls whole handshake records off the wire until one
//! ClientHello is buffered and returns the raw bytes untouched, so they can be
//! replayed into whichever TLS engine ends up handling the connection.

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS record header: content type, legacy version, length.
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest record payload accepted (TLSPlaintext plus the permitted expansion).
pub const MAX_RECORD_PAYLOAD: usize = (1 << 14) + 2048;

/// Upper bound on a buffered ClientHello handshake message.
pub const MAX_CLIENT_HELLO_LEN: usize = 32 * 1024;

/// Wire value for TLS 1.3 in `supported_versions`.
pub const TLS13_VERSION: u16 = 0x0304;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const HANDSHAKE_HEADER_LEN: usize = 4;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_ALPN: u16 = 0x0010;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;
const SERVER_NAME_TYPE_HOST: u8 = 0x00;
const MAX_ALPN_PROTOCOLS: usize = 32;

/// Errors raised while reading or parsing the client's first flight.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HelloError {
    #[error("record content type {0:#04x} is not a handshake")]
    NotHandshakeRecord(u8),
    #[error("record version {0:#06x} is not TLS")]
    UnsupportedRecordVersion(u16),
    #[error("record payload of {0} bytes exceeds limit")]
    RecordTooLong(usize),
    #[error("empty handshake record")]
    EmptyRecord,
    #[error("handshake message type {0:#04x} is not a ClientHello")]
    NotClientHello(u8),
    #[error("ClientHello of {0} bytes exceeds limit ({MAX_CLIENT_HELLO_LEN} bytes)")]
    MessageTooLong(usize),
    #[error("ClientHello truncated")]
    Truncated,
    #[error("malformed extension {0:#06x}")]
    MalformedExtension(u16),
    #[error("extension {0:#06x} contains non UTF-8 data")]
    NonUtf8(u16),
}

/// Facts extracted from a ClientHello.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClientHelloSummary {
    pub legacy_version: u16,
    pub supported_versions: Vec<u16>,
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<String>,
}

impl ClientHelloSummary {
    /// True when the client lists TLS 1.3 in `supported_versions`.
    pub fn offers_tls13(&self) -> bool {
        self.supported_versions.contains(&TLS13_VERSION)
    }
}

/// A ClientHello read off the wire together with the exact bytes consumed.
#[derive(Debug, Clone)]
pub struct SniffedHello {
    pub buffered: Bytes,
    pub summary: ClientHelloSummary,
}

/// Error from [`read_client_hello`]: either the socket failed or the bytes
/// were not a usable ClientHello.
#[derive(Debug, Error)]
pub enum SniffError {
    #[error("io error while reading ClientHello: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Hello(#[from] HelloError),
}

/// Read handshake records until a full ClientHello message is available.
pub async fn read_client_hello<R>(reader: &mut R) -> Result<SniffedHello, SniffError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = BytesMut::with_capacity(RECORD_HEADER_LEN + 512);
    let mut message = BytesMut::new();

    loop {
        let mut header = [0u8; RECORD_HEADER_LEN];
        reader.read_exact(&mut header).await?;
        raw.extend_from_slice(&header);
        let payload_len = check_record_header(&header)?;

        let start = raw.len();
        raw.resize(start + payload_len, 0);
        reader.read_exact(&mut raw[start..]).await?;
        message.extend_from_slice(&raw[start..]);

        if let Some(total) = handshake_message_len(&message)? {
            if message.len() >= total {
                let summary = parse_client_hello(&message[..total])?;
                return Ok(SniffedHello {
                    buffered: raw.freeze(),
                    summary,
                });
            }
        }
    }
}

/// Validate a record header and return its payload length.
fn check_record_header(header: &[u8; RECORD_HEADER_LEN]) -> Result<usize, HelloError> {
    if header[0] != CONTENT_TYPE_HANDSHAKE {
        return Err(HelloError::NotHandshakeRecord(header[0]));
    }
    let version = u16::from_be_bytes([header[1], header[2]]);
    if header[1] != 0x03 {
        return Err(HelloError::UnsupportedRecordVersion(version));
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len == 0 {
        return Err(HelloError::EmptyRecord);
    }
    if len > MAX_RECORD_PAYLOAD {
        return Err(HelloError::RecordTooLong(len));
    }
    Ok(len)
}

/// Total length (header included) of the handshake message at the front of
/// `message`, once enough bytes are present to know it.
fn handshake_message_len(message: &[u8]) -> Result<Option<usize>, HelloError> {
    if message.is_empty() {
        return Ok(None);
    }
    if message[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(HelloError::NotClientHello(message[0]));
    }
    if message.len() < HANDSHAKE_HEADER_LEN {
        return Ok(None);
    }
    let body_len = u32::from_be_bytes([0, message[1], message[2], message[3]]) as usize;
    if body_len > MAX_CLIENT_HELLO_LEN {
        return Err(HelloError::MessageTooLong(body_len));
    }
    Ok(Some(HANDSHAKE_HEADER_LEN + body_len))
}

/// Parse a complete ClientHello handshake message (type and length included).
pub fn parse_client_hello(message: &[u8]) -> Result<ClientHelloSummary, HelloError> {
    let mut cursor = Cursor::new(message);
    let msg_type = cursor.u8()?;
    if msg_type != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(HelloError::NotClientHello(msg_type));
    }
    let body_len = cursor.u24()?;
    let mut body = Cursor::new(cursor.take(body_len)?);

    let legacy_version = body.u16()?;
    body.take(32)?; // random
    let session_id_len = body.u8()? as usize;
    body.take(session_id_len)?;
    let suites_len = body.u16()? as usize;
    if suites_len < 2 || suites_len % 2 != 0 {
        return Err(HelloError::Truncated);
    }
    body.take(suites_len)?;
    let compression_len = body.u8()? as usize;
    body.take(compression_len)?;

    let mut summary = ClientHelloSummary {
        legacy_version,
        ..ClientHelloSummary::default()
    };

    // Pre-extension hellos end here.
    if body.is_empty() {
        return Ok(summary);
    }

    let extensions_len = body.u16()? as usize;
    let mut extensions = Cursor::new(body.take(extensions_len)?);
    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let data = extensions.take(ext_len)?;
        match ext_type {
            EXT_SERVER_NAME => summary.server_name = parse_server_name(data)?,
            EXT_ALPN => summary.alpn_protocols = parse_alpn_extension(data)?,
            EXT_SUPPORTED_VERSIONS => {
                summary.supported_versions = parse_supported_versions(data)?;
            }
            _ => {}
        }
    }

    Ok(summary)
}

fn parse_server_name(data: &[u8]) -> Result<Option<String>, HelloError> {
    let malformed = |_| HelloError::MalformedExtension(EXT_SERVER_NAME);
    let mut cursor = Cursor::new(data);
    let list_len = cursor.u16().map_err(malformed)? as usize;
    let mut list = Cursor::new(cursor.take(list_len).map_err(malformed)?);
    while !list.is_empty() {
        let name_type = list.u8().map_err(malformed)?;
        let name_len = list.u16().map_err(malformed)? as usize;
        let name = list.take(name_len).map_err(malformed)?;
        if name_type == SERVER_NAME_TYPE_HOST {
            let host = std::str::from_utf8(name)
                .map_err(|_| HelloError::NonUtf8(EXT_SERVER_NAME))?;
            return Ok(Some(host.to_ascii_lowercase()));
        }
    }
    Ok(None)
}

/// ALPN protocol list: a u16 length followed by u8-length-prefixed entries.
fn parse_alpn_extension(data: &[u8]) -> Result<Vec<String>, HelloError> {
    let malformed = |_| HelloError::MalformedExtension(EXT_ALPN);
    let mut cursor = Cursor::new(data);
    let list_len = cursor.u16().map_err(malformed)? as usize;
    let mut list = Cursor::new(cursor.take(list_len).map_err(malformed)?);
    let mut entries = Vec::new();
    while !list.is_empty() {
        let len = list.u8().map_err(malformed)? as usize;
        if len == 0 {
            return Err(HelloError::MalformedExtension(EXT_ALPN));
        }
        let entry = list.take(len).map_err(malformed)?;
        let entry = std::str::from_utf8(entry).map_err(|_| HelloError::NonUtf8(EXT_ALPN))?;
        entries.push(entry.to_owned());
        if entries.len() > MAX_ALPN_PROTOCOLS {
            return Err(HelloError::MalformedExtension(EXT_ALPN));
        }
    }
    Ok(entries)
}

fn parse_supported_versions(data: &[u8]) -> Result<Vec<u16>, HelloError> {
    let malformed = |_| HelloError::MalformedExtension(EXT_SUPPORTED_VERSIONS);
    let mut cursor = Cursor::new(data);
    let len = cursor.u8().map_err(malformed)? as usize;
    if len % 2 != 0 {
        return Err(HelloError::MalformedExtension(EXT_SUPPORTED_VERSIONS));
    }
    let mut list = Cursor::new(cursor.take(len).map_err(malformed)?);
    let mut versions = Vec::with_capacity(len / 2);
    while !list.is_empty() {
        versions.push(list.u16().map_err(malformed)?);
    }
    Ok(versions)
}

struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], HelloError> {
        if self.data.len() < len {
            return Err(HelloError::Truncated);
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, HelloError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, HelloError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self) -> Result<usize, HelloError> {
        let bytes = self.take(3)?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]) as usize)
    }
}
