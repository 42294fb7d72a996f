//! RouterOS API transport over TCP
//!
//! # Wire Format
//!
//! A sentence is a sequence of words terminated by an empty word. Each word
//! is prefixed with its length:
//!
//! | Length            | Encoding                     |
//! |-------------------|------------------------------|
//! | < 0x80            | 1 byte                       |
//! | < 0x4000          | 2 bytes, `len \| 0x8000`      |
//! | < 0x20_0000       | 3 bytes, `len \| 0xC0_0000`   |
//! | < 0x1000_0000     | 4 bytes, `len \| 0xE000_0000` |
//! | otherwise         | `0xF0` then 4 bytes          |
//!
//! Replies start with `!re` (one row), `!done` (end of reply), `!trap`
//! (command error, still followed by `!done`) or `!fatal` (session closed).
//! Login uses the plain `/login =name= =password=` form of RouterOS 6.43+.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::connection::ConnectionParams;
use super::transport::{ApiCommand, ApiSession, ApiTransport, Row, TransportError};

/// Longest word accepted from a device
pub const MAX_WORD_LENGTH: usize = 16 * 1024 * 1024;

/// Encode a word length prefix
pub fn encode_length(len: usize, out: &mut Vec<u8>) {
    // Lengths above u32 never occur; words are capped well below
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    match len {
        0..=0x7F => out.push(len as u8),
        0x80..=0x3FFF => out.extend_from_slice(&((len | 0x8000) as u16).to_be_bytes()),
        0x4000..=0x1F_FFFF => out.extend_from_slice(&(len | 0xC0_0000).to_be_bytes()[1..]),
        0x20_0000..=0x0FFF_FFFF => out.extend_from_slice(&(len | 0xE000_0000).to_be_bytes()),
        _ => {
            out.push(0xF0);
            out.extend_from_slice(&len.to_be_bytes());
        }
    }
}

/// Encode a full sentence including the terminating empty word
pub fn encode_sentence<S: AsRef<str>>(words: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for word in words {
        let bytes = word.as_ref().as_bytes();
        encode_length(bytes.len(), &mut out);
        out.extend_from_slice(bytes);
    }
    out.push(0);
    out
}

/// Read a word length prefix
///
/// # Errors
///
/// Returns `TransportError::Protocol` for reserved control bytes and
/// `TransportError::Io` on socket errors.
pub async fn read_length<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, TransportError> {
    let first = reader.read_u8().await?;
    let (extra, initial) = match first {
        b if b & 0x80 == 0x00 => (0, u32::from(b)),
        b if b & 0xC0 == 0x80 => (1, u32::from(b & 0x3F)),
        b if b & 0xE0 == 0xC0 => (2, u32::from(b & 0x1F)),
        b if b & 0xF0 == 0xE0 => (3, u32::from(b & 0x0F)),
        0xF0 => (4, 0),
        b => {
            return Err(TransportError::Protocol(format!(
                "reserved length prefix 0x{b:02X}"
            )))
        }
    };

    let mut len = initial;
    for _ in 0..extra {
        len = (len << 8) | u32::from(reader.read_u8().await?);
    }
    Ok(len as usize)
}

/// Read one sentence
///
/// # Errors
///
/// Returns `TransportError::Protocol` for oversized or non-UTF-8 words.
pub async fn read_sentence<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<String>, TransportError> {
    let mut words = Vec::new();
    loop {
        let len = read_length(reader).await?;
        if len == 0 {
            return Ok(words);
        }
        if len > MAX_WORD_LENGTH {
            return Err(TransportError::Protocol(format!("word of {len} bytes")));
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        let word = String::from_utf8(buf)
            .map_err(|_| TransportError::Protocol("word is not UTF-8".to_string()))?;
        words.push(word);
    }
}

/// Split an `=name=value` word
fn attribute(word: &str) -> Option<(String, String)> {
    let rest = word.strip_prefix('=')?;
    let (name, value) = rest.split_once('=').unwrap_or((rest, ""));
    Some((name.to_string(), value.to_string()))
}

/// Read sentences until `!done`, collecting `!re` rows
///
/// `=ret=` on `!done` is returned as a row so `add` replies carry the new id.
///
/// # Errors
///
/// - `TransportError::Trap` if the device rejected the command
/// - `TransportError::Fatal` if the device closed the session
pub async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<Row>, TransportError> {
    let mut rows: Vec<Row> = Vec::new();
    let mut trap: Option<String> = None;

    loop {
        let sentence = read_sentence(reader).await?;
        let Some(kind) = sentence.first() else {
            continue;
        };
        trace!(reply = %kind, words = sentence.len(), "Sentence received");

        match kind.as_str() {
            "!re" => rows.push(sentence[1..].iter().filter_map(|w| attribute(w)).collect()),
            "!trap" => {
                let message = sentence[1..]
                    .iter()
                    .filter_map(|w| attribute(w))
                    .find(|(k, _)| k == "message")
                    .map(|(_, v)| v)
                    .unwrap_or_else(|| "unknown error".to_string());
                trap.get_or_insert(message);
            }
            "!fatal" => {
                let reason = sentence.get(1).cloned().unwrap_or_default();
                return Err(TransportError::Fatal(reason));
            }
            "!empty" => {}
            "!done" => {
                if let Some(message) = trap {
                    return Err(TransportError::Trap { message });
                }
                let ret: Row = sentence[1..].iter().filter_map(|w| attribute(w)).collect();
                if !ret.is_empty() {
                    rows.push(ret);
                }
                return Ok(rows);
            }
            other => {
                return Err(TransportError::Protocol(format!("unexpected reply {other:?}")));
            }
        }
    }
}

/// Session over any byte stream
pub struct RouterOsSession<S> {
    stream: BufReader<S>,
    command_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> RouterOsSession<S> {
    pub fn new(stream: S, command_timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            command_timeout,
        }
    }

    async fn exchange(&mut self, words: &[String]) -> Result<Vec<Row>, TransportError> {
        let sentence = encode_sentence(words);
        let limit = self.command_timeout;
        let run = async {
            self.stream.get_mut().write_all(&sentence).await?;
            self.stream.get_mut().flush().await?;
            read_reply(&mut self.stream).await
        };
        timeout(limit, run)
            .await
            .map_err(|_| TransportError::Timeout(limit))?
    }

    /// Log in with the plain-text method
    ///
    /// # Errors
    ///
    /// Returns `TransportError::AuthFailed` if the device rejects the
    /// credentials or only offers the legacy challenge login.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), TransportError> {
        let words = vec![
            "/login".to_string(),
            format!("=name={username}"),
            format!("=password={password}"),
        ];
        match self.exchange(&words).await {
            Ok(rows) if rows.iter().any(|r| r.contains_key("ret")) => Err(
                TransportError::AuthFailed("device requires legacy challenge login".to_string()),
            ),
            Ok(_) => Ok(()),
            Err(TransportError::Trap { message }) => Err(TransportError::AuthFailed(message)),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> ApiSession for RouterOsSession<S> {
    async fn query(&mut self, command: &ApiCommand) -> Result<Vec<Row>, TransportError> {
        self.exchange(&command.words()).await
    }
}

/// Plain TCP RouterOS API transport
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterOsTransport;

impl RouterOsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ApiTransport for RouterOsTransport {
    async fn connect(
        &self,
        params: &ConnectionParams,
        connect_timeout: Duration,
    ) -> Result<Box<dyn ApiSession>, TransportError> {
        let addr = (params.host, params.port);
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(connect_timeout))?
            .map_err(|e| TransportError::Connect {
                host: params.host.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        let mut session = RouterOsSession::new(stream, connect_timeout);
        session
            .login(&params.credentials.username, &params.credentials.password)
            .await?;
        debug!(host = %params.host, port = params.port, "RouterOS session established");
        Ok(Box::new(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn encoded(len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        encode_length(len, &mut out);
        out
    }

    #[test]
    fn test_length_encoding_boundaries() {
        assert_eq!(encoded(0), vec![0x00]);
        assert_eq!(encoded(0x7F), vec![0x7F]);
        assert_eq!(encoded(0x80), vec![0x80, 0x80]);
        assert_eq!(encoded(0x3FFF), vec![0xBF, 0xFF]);
        assert_eq!(encoded(0x4000), vec![0xC0, 0x40, 0x00]);
        assert_eq!(encoded(0x1F_FFFF), vec![0xDF, 0xFF, 0xFF]);
        assert_eq!(encoded(0x20_0000), vec![0xE0, 0x20, 0x00, 0x00]);
        assert_eq!(encoded(0x1000_0000), vec![0xF0, 0x10, 0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_length_decoding_boundaries() {
        for len in [0usize, 1, 0x7F, 0x80, 0x3FFF, 0x4000, 0x1F_FFFF, 0x20_0000, 0x0FFF_FFFF] {
            let bytes = encoded(len);
            let mut reader = bytes.as_slice();
            assert_eq!(read_length(&mut reader).await.unwrap(), len);
        }
    }

    #[tokio::test]
    async fn test_reserved_prefix_rejected() {
        let bytes = [0xF8u8];
        let mut reader = &bytes[..];
        assert!(matches!(
            read_length(&mut reader).await,
            Err(TransportError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_read_reply_rows_and_done() {
        let mut bytes = encode_sentence(&["!re", "=name=alice", "=.id=*1"]);
        bytes.extend(encode_sentence(&["!re", "=name=bob", "=.id=*2"]));
        bytes.extend(encode_sentence(&["!done"]));
        let mut reader = bytes.as_slice();

        let rows = read_reply(&mut reader).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["name"], "bob");
        assert_eq!(rows[0][".id"], "*1");
    }

    #[tokio::test]
    async fn test_read_reply_trap() {
        let mut bytes = encode_sentence(&["!trap", "=message=no such item"]);
        bytes.extend(encode_sentence(&["!done"]));
        let mut reader = bytes.as_slice();

        let err = read_reply(&mut reader).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_read_reply_fatal() {
        let bytes = encode_sentence(&["!fatal", "session terminated on request"]);
        let mut reader = bytes.as_slice();
        assert!(matches!(
            read_reply(&mut reader).await,
            Err(TransportError::Fatal(_))
        ));
    }

    #[test]
    fn test_attribute_with_equals_in_value() {
        assert_eq!(
            attribute("=comment=a=b"),
            Some(("comment".to_string(), "a=b".to_string()))
        );
        assert_eq!(attribute("=disabled"), Some(("disabled".to_string(), String::new())));
        assert_eq!(attribute("!re"), None);
    }

    #[tokio::test]
    async fn test_session_login_and_query() {
        let (client, server) = duplex(4096);

        let device = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let login = read_sentence(&mut server).await.unwrap();
            assert_eq!(login, vec!["/login", "=name=api", "=password=pw"]);
            server
                .get_mut()
                .write_all(&encode_sentence(&["!done"]))
                .await
                .unwrap();

            let query = read_sentence(&mut server).await.unwrap();
            assert_eq!(query, vec!["/ppp/active/print"]);
            let mut reply = encode_sentence(&["!re", "=name=alice"]);
            reply.extend(encode_sentence(&["!done"]));
            server.get_mut().write_all(&reply).await.unwrap();
        });

        let mut session = RouterOsSession::new(client, Duration::from_secs(5));
        session.login("api", "pw").await.unwrap();
        let rows = session
            .query(&ApiCommand::new("/ppp/active/print"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "alice");

        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let (client, server) = duplex(4096);

        tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let _ = read_sentence(&mut server).await;
            let mut reply = encode_sentence(&["!trap", "=message=invalid user name or password (6)"]);
            reply.extend(encode_sentence(&["!done"]));
            let _ = server.get_mut().write_all(&reply).await;
        });

        let mut session = RouterOsSession::new(client, Duration::from_secs(5));
        assert!(matches!(
            session.login("api", "wrong").await,
            Err(TransportError::AuthFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 on loopback is closed on any sane test host
        let params = ConnectionParams {
            host: std::net::Ipv4Addr::LOCALHOST,
            port: 1,
            credentials: crate::model::Credentials::new("api", "pw"),
        };
        let result = RouterOsTransport::new()
            .connect(&params, Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
