//! Stream transport for relay connections.
//!
//! A relay connection rides on any bidirectional byte stream. [`Dialer`] is
//! the seam between the client and the network: [`TcpDialer`] opens a TCP
//! connection and performs the HTTP upgrade, tests substitute in-memory
//! pipes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::RelayError;

/// Default HTTP path of the relay endpoint
pub const DEFAULT_PATH: &str = "/derp";

/// Default port when the URL names none
pub const DEFAULT_PORT: u16 = 80;

/// Upper bound on the HTTP upgrade response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Byte stream a connection can run over
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased relay stream
pub type BoxedStream = Box<dyn RelayStream>;

/// Opens a stream to a relay, ready for the handshake
#[async_trait]
pub trait Dialer: Send + Sync + fmt::Debug {
    /// Dial `url`
    async fn dial(&self, url: &RelayUrl) -> io::Result<BoxedStream>;
}

/// Relay endpoint, `http://host[:port][/path]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayUrl {
    host: String,
    port: u16,
    path: String,
}

impl RelayUrl {
    /// Host name or address
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// HTTP path of the upgrade request
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port` form for the Host header and for dialing
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}{}", self.authority(), self.path)
    }
}

impl FromStr for RelayUrl {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| RelayError::InvalidUrl {
            url: s.to_string(),
            reason: reason.to_string(),
        };

        let rest = match s.strip_prefix("http://") {
            Some(rest) => rest,
            None if s.starts_with("https://") => return Err(invalid("TLS relays are not supported")),
            None => return Err(invalid("scheme must be http")),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        let path = if path.is_empty() || path == "/" {
            DEFAULT_PATH.to_string()
        } else {
            path.to_string()
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let end = bracketed.find(']').ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let host = &bracketed[..end];
            let port = match &bracketed[end + 1..] {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(|| invalid("garbage after host"))?),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = match port {
            Some(port) => port.parse::<u16>().map_err(|_| invalid("bad port"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            path,
        })
    }
}

impl TryFrom<String> for RelayUrl {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.to_string()
    }
}

/// Plain TCP dialer with an HTTP/1.1 `Upgrade: DERP` request
#[derive(Debug, Clone, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, url: &RelayUrl) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((url.host(), url.port())).await?;
        stream.set_nodelay(true)?;
        debug!("TCP connected to {}", url);

        let upgraded = upgrade(stream, url).await?;
        Ok(Box::new(upgraded))
    }
}

/// Send the upgrade request and consume the `101` response head.
///
/// Bytes the relay sent after the head stay buffered in the returned reader.
pub async fn upgrade<S>(mut stream: S, url: &RelayUrl) -> io::Result<BufReader<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: DERP\r\n\r\n",
        url.path(),
        url.authority()
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let mut head_len = 0usize;

    head_len += reader.read_line(&mut line).await?;
    let status = line.trim_end().to_string();
    let mut parts = status.split_whitespace();
    let version = parts.next().unwrap_or_default();
    let code = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") || code != "101" {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("relay refused upgrade: {:?}", status),
        ));
    }

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF in upgrade response",
            ));
        }
        head_len += n;
        if head_len > MAX_RESPONSE_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upgrade response head too large",
            ));
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    debug!("Relay {} upgraded to DERP", url);
    Ok(reader)
}
