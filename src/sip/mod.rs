//! SIP control channel client.
//!
//! The SIP user agent exposes a local TCP endpoint speaking
//! netstring-encoded JSON: each message is `"<decimal-length>:{...json...},"`.
//! This client covers the handful of commands a call session needs —
//! registration status, call enumeration, dial, hangup, quit.

use crate::config::SipConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Connect timeout for the control endpoint.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a sane control response.
const MAX_MESSAGE_LEN: usize = 1 << 20;

/// The slice of call control the session depends on; kept narrow so tests
/// can record calls without a SIP stack.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Place a call to a phone number.
    async fn dial(&self, number: &str) -> Result<()>;

    /// Hang up the active call.
    async fn hangup(&self) -> Result<()>;
}

/// Netstring-JSON client for the SIP user agent's control port.
pub struct SipControl {
    config: SipConfig,
}

impl SipControl {
    /// Create a client for the configured control endpoint.
    pub fn new(config: SipConfig) -> Self {
        Self { config }
    }

    /// Registration status of the SIP account.
    pub async fn reginfo(&self) -> Result<String> {
        self.command("reginfo", None).await
    }

    /// Enumerate active calls.
    pub async fn list_calls(&self) -> Result<String> {
        self.command("listcalls", None).await
    }

    /// Ask the SIP user agent to exit.
    pub async fn quit(&self) -> Result<String> {
        self.command("quit", None).await
    }

    /// Issue one command and unwrap the response's `data`/`error` field.
    async fn command(&self, name: &str, params: Option<String>) -> Result<String> {
        let mut message = serde_json::json!({ "command": name });
        if let Some(params) = params {
            message["params"] = serde_json::Value::String(params);
        }

        let addr = format!("{}:{}", self.config.ctrl_host, self.config.ctrl_port);
        let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| AgentError::Sip(format!("control connect to {addr} timed out")))?
            .map_err(|e| AgentError::Sip(format!("control connect to {addr} failed: {e}")))?;

        let encoded = encode_netstring(message.to_string().as_bytes());
        stream
            .write_all(&encoded)
            .await
            .map_err(|e| AgentError::Sip(format!("control write failed: {e}")))?;

        let payload = read_netstring(&mut stream).await?;
        let response: serde_json::Value = serde_json::from_slice(&payload)
            .map_err(|e| AgentError::Sip(format!("malformed control response: {e}")))?;

        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            return Err(AgentError::Sip(format!("{name} failed: {error}")));
        }
        let data = match response.get("data") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        debug!("control {name}: {data}");
        Ok(data)
    }
}

#[async_trait]
impl CallControl for SipControl {
    async fn dial(&self, number: &str) -> Result<()> {
        let uri = format!(
            "sip:{}@{}",
            canonicalize_number(number),
            self.config.server
        );
        info!("dialing {uri}");
        self.command("dial", Some(uri)).await?;
        Ok(())
    }

    async fn hangup(&self) -> Result<()> {
        self.command("hangup", None).await?;
        Ok(())
    }
}

/// Strip a phone number to digits; a bare 10-digit national number gets the
/// leading `1`.
pub fn canonicalize_number(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 10 {
        format!("1{digits}")
    } else {
        digits
    }
}

/// Wrap a payload as `<len>:<payload>,`.
fn encode_netstring(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{}:", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out.push(b',');
    out
}

/// Read one netstring off the stream. A short read mid-message is an error;
/// the channel is request/response and the peer owns framing.
async fn read_netstring(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut length_digits = Vec::new();
    loop {
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| AgentError::Sip(format!("control read failed: {e}")))?;
        if byte == b':' {
            break;
        }
        if !byte.is_ascii_digit() || length_digits.len() > 8 {
            return Err(AgentError::Sip("malformed netstring length".to_owned()));
        }
        length_digits.push(byte);
    }
    let length: usize = std::str::from_utf8(&length_digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| AgentError::Sip("malformed netstring length".to_owned()))?;
    if length > MAX_MESSAGE_LEN {
        return Err(AgentError::Sip(format!("netstring too large: {length}")));
    }

    let mut payload = vec![0u8; length];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| AgentError::Sip(format!("control read failed: {e}")))?;
    let trailer = stream
        .read_u8()
        .await
        .map_err(|e| AgentError::Sip(format!("control read failed: {e}")))?;
    if trailer != b',' {
        return Err(AgentError::Sip("netstring missing trailer".to_owned()));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_canonicalized() {
        assert_eq!(canonicalize_number("(555) 867-5309"), "15558675309");
        assert_eq!(canonicalize_number("+1 555 867 5309"), "15558675309");
        assert_eq!(canonicalize_number("5309"), "5309");
        assert_eq!(canonicalize_number("15558675309"), "15558675309");
    }

    #[test]
    fn netstring_encoding_matches_the_wire_format() {
        assert_eq!(encode_netstring(b"{}"), b"2:{},".to_vec());
        let encoded = encode_netstring(br#"{"command":"reginfo"}"#);
        assert_eq!(encoded, br#"21:{"command":"reginfo"},"#.to_vec());
    }

    #[tokio::test]
    async fn netstring_roundtrip_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.expect("accept");
            peer.write_all(&encode_netstring(br#"{"data":"ok"}"#))
                .await
                .expect("write");
        });

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let payload = read_netstring(&mut stream).await.expect("read");
        assert_eq!(payload, br#"{"data":"ok"}"#.to_vec());
        server.await.expect("server");
    }

    #[tokio::test]
    async fn truncated_netstring_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.expect("accept");
            // Length promises 50 bytes; send 5 and close.
            peer.write_all(b"50:hello").await.expect("write");
        });

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        assert!(read_netstring(&mut stream).await.is_err());
        server.await.expect("server");
    }
}
