//! SNI (Server Name Indication) extraction from TLS ClientHello.
//!
//! This module reads the initial bytes of an inbound connection and parses
//! them to extract the SNI hostname for routing decisions, without taking
//! part in the handshake. The bytes read are handed back to the caller so
//! they can be forwarded to the backend untouched.
//!
//! Defaults:
//! - sniff timeout: 1s
//! - max sniff bytes: 1024

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Default time to wait for the initial bytes.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(1);

/// Default maximum bytes to read when sniffing for SNI.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 1024;

const RECORD_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;
const RECORD_HEADER_LEN: usize = 5;

/// Result of SNI inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Successfully extracted SNI hostname (normalized to lowercase).
    Found(String),
    /// TLS ClientHello present but no SNI extension.
    NoSni,
    /// Data is not a TLS ClientHello (first bytes don't match).
    NotTls,
    /// ClientHello cut off before the SNI extension could be located.
    Incomplete,
    /// ClientHello is structurally inconsistent.
    Malformed,
    /// Nothing was received before end-of-stream or the sniff deadline.
    Empty,
}

impl SniResult {
    /// The hostname, if one was found. Every other outcome routes as
    /// "no SNI present".
    pub fn hostname(&self) -> Option<&str> {
        match self {
            SniResult::Found(hostname) => Some(hostname),
            _ => None,
        }
    }
}

/// Configuration for SNI inspection.
#[derive(Debug, Clone)]
pub struct SniConfig {
    /// Maximum time to wait for the header bytes.
    pub timeout: Duration,
    /// Maximum bytes to read.
    pub max_bytes: usize,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// Reads a connection header and inspects it for SNI.
#[derive(Debug, Clone, Default)]
pub struct SniInspector {
    config: SniConfig,
}

impl SniInspector {
    /// Create a new SNI inspector with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new SNI inspector with custom configuration.
    pub fn with_config(config: SniConfig) -> Self {
        Self { config }
    }

    /// Read the connection header into `buffer` and inspect it for SNI.
    ///
    /// Reading stops at end-of-stream, at the sniff deadline, once the
    /// first byte rules out TLS, once the first TLS record is complete, or
    /// when `max_bytes` are buffered. Hitting the deadline is not an error:
    /// whatever arrived is kept and inspected.
    ///
    /// On success `buffer` holds every byte consumed from the stream; the
    /// caller must forward them to the backend.
    pub async fn inspect<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
        buffer: &mut Vec<u8>,
    ) -> io::Result<SniResult> {
        buffer.clear();
        buffer.resize(self.config.max_bytes, 0);

        let deadline = Instant::now() + self.config.timeout;
        let mut total_read = 0;

        let outcome = loop {
            let n = match timeout_at(deadline, stream.read(&mut buffer[total_read..])).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => break Err(e),
                Err(_) => {
                    debug!(bytes_read = total_read, "SNI sniff deadline reached");
                    break Ok(());
                }
            };
            if n == 0 {
                break Ok(());
            }
            total_read += n;

            if header_complete(&buffer[..total_read], self.config.max_bytes) {
                break Ok(());
            }
        };

        buffer.truncate(total_read);
        outcome?;

        if buffer.is_empty() {
            return Ok(SniResult::Empty);
        }
        Ok(parse_sni(buffer))
    }
}

/// Whether enough bytes are buffered to stop reading.
fn header_complete(data: &[u8], max_bytes: usize) -> bool {
    if data.len() >= max_bytes {
        return true;
    }
    if data.first().is_some_and(|&b| b != RECORD_TYPE_HANDSHAKE) {
        return true;
    }
    if data.len() < RECORD_HEADER_LEN {
        return false;
    }
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    data.len() >= RECORD_HEADER_LEN + record_len
}

/// Bounds-checked big-endian cursor. Every read returns `None` past the end.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| ((b[0] as usize) << 16) | ((b[1] as usize) << 8) | (b[2] as usize))
    }

    /// Take a block prefixed by a one-byte length.
    fn block8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    /// Take a block prefixed by a two-byte length.
    fn block16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}

/// Parse SNI from the first bytes of a TLS connection.
///
/// TLS record:
/// - byte 0: record type (0x16 = Handshake)
/// - bytes 1-2: version (0x03xx)
/// - bytes 3-4: record length
///
/// Handshake ClientHello:
/// - byte 0: handshake type (0x01 = ClientHello)
/// - bytes 1-3: length
/// - 2 bytes: client version
/// - 32 bytes: random
/// - 1 byte + variable: session ID
/// - 2 bytes + variable: cipher suites
/// - 1 byte + variable: compression methods
/// - 2 bytes + variable: extensions
///
/// Never fails: a buffer that ends before the SNI extension yields
/// `Incomplete`, anything inconsistent yields `Malformed`.
pub fn parse_sni(data: &[u8]) -> SniResult {
    if data.is_empty() {
        return SniResult::Empty;
    }
    if data[0] != RECORD_TYPE_HANDSHAKE {
        return SniResult::NotTls;
    }
    if data.len() < RECORD_HEADER_LEN {
        return SniResult::Incomplete;
    }
    if data[1] != 0x03 {
        return SniResult::NotTls;
    }

    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let record_end = RECORD_HEADER_LEN + record_len;
    let truncated = data.len() < record_end;
    let record = &data[RECORD_HEADER_LEN..data.len().min(record_end)];

    // Out-of-bounds reads mean "cut short" when the record itself is
    // incomplete, and "inconsistent" when it is not.
    let short = || {
        if truncated {
            SniResult::Incomplete
        } else {
            SniResult::Malformed
        }
    };

    match parse_client_hello(record) {
        Ok(result) => result,
        Err(OutOfBounds) => short(),
    }
}

struct OutOfBounds;

fn parse_client_hello(record: &[u8]) -> Result<SniResult, OutOfBounds> {
    let mut hs = Cursor::new(record);

    match hs.u8() {
        Some(HANDSHAKE_TYPE_CLIENT_HELLO) => {}
        Some(_) => return Ok(SniResult::NotTls),
        None => return Err(OutOfBounds),
    }
    let _handshake_len = hs.u24().ok_or(OutOfBounds)?;

    // version (2) + random (32)
    hs.take(34).ok_or(OutOfBounds)?;
    hs.block8().ok_or(OutOfBounds)?; // session id
    hs.block16().ok_or(OutOfBounds)?; // cipher suites
    hs.block8().ok_or(OutOfBounds)?; // compression methods

    if hs.is_empty() {
        // A complete ClientHello without extensions.
        return Ok(SniResult::NoSni);
    }

    let extensions_len = hs.u16().ok_or(OutOfBounds)? as usize;
    let mut exts = match hs.take(extensions_len) {
        Some(block) => Cursor::new(block),
        // Extensions cut off; scan what arrived.
        None => Cursor::new(&hs.data[hs.pos..]),
    };

    while !exts.is_empty() {
        let ext_type = exts.u16().ok_or(OutOfBounds)?;
        let ext_data = exts.block16().ok_or(OutOfBounds)?;

        if ext_type == EXTENSION_SERVER_NAME {
            return Ok(parse_sni_extension(ext_data));
        }
    }

    if extensions_len > exts.data.len() {
        // The SNI extension may still be in the bytes that never arrived.
        return Err(OutOfBounds);
    }

    Ok(SniResult::NoSni)
}

/// Parse the server_name extension value.
///
/// - 2 bytes: list length
/// - for each entry:
///   - 1 byte: name type (0 = host_name)
///   - 2 bytes + variable: name
fn parse_sni_extension(data: &[u8]) -> SniResult {
    let mut ext = Cursor::new(data);
    let Some(list) = ext.block16() else {
        return SniResult::Malformed;
    };

    let mut names = Cursor::new(list);
    while !names.is_empty() {
        let (Some(name_type), Some(name)) = (names.u8(), names.block16()) else {
            return SniResult::Malformed;
        };
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }

        return match std::str::from_utf8(name) {
            Ok(hostname) => {
                // Normalize: lowercase, trim trailing dot
                let normalized = hostname.to_lowercase().trim_end_matches('.').to_string();
                if normalized.is_empty() {
                    SniResult::Malformed
                } else {
                    SniResult::Found(normalized)
                }
            }
            Err(_) => SniResult::Malformed,
        };
    }

    SniResult::NoSni
}
