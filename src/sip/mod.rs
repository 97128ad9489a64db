//! SIP control channel client.
//!
//! The SIP user agent runs out-of-process and exposes a local TCP
//! endpoint speaking netstring-encoded JSON: each message is
//! `"<decimal-length>:{...json...},"`. The client opens a fresh
//! connection per command, sends one request, and reads one response.
//! Responses carry either a `data` field (success) or an `error` field.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound on a response payload; the control channel only ever
/// returns small JSON documents.
const MAX_NETSTRING: usize = 1 << 20;

/// Wrap a payload as a netstring.
pub fn netstring_encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out.push(b',');
    out
}

/// Try to parse one netstring from the front of `buf`.
///
/// Returns the payload and the number of bytes consumed, or `None` when
/// more input is needed. Malformed framing is an error.
pub fn netstring_parse(buf: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
    let Some(colon) = buf.iter().position(|&b| b == b':') else {
        if buf.len() > 10 {
            bail!("netstring length prefix too long");
        }
        return Ok(None);
    };
    let length: usize = std::str::from_utf8(&buf[..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("bad netstring length prefix"))?;
    if length > MAX_NETSTRING {
        bail!("netstring payload of {} bytes exceeds limit", length);
    }
    let total = colon + 1 + length + 1;
    if buf.len() < total {
        return Ok(None);
    }
    if buf[total - 1] != b',' {
        bail!("netstring missing trailing comma");
    }
    Ok(Some((buf[colon + 1..total - 1].to_vec(), total)))
}

/// Strip a phone number to digits; bare 10-digit national numbers get
/// the leading 1.
pub fn canonicalize_number(number: &str) -> String {
    let digits: String = number.chars().filter(char::is_ascii_digit).collect();
    if digits.len() == 10 {
        format!("1{}", digits)
    } else {
        digits
    }
}

/// Client for the SIP user agent's control endpoint.
#[derive(Debug, Clone)]
pub struct SipControl {
    addr: String,
    server: String,
}

impl SipControl {
    /// `addr` is the TCP control endpoint; `server` the SIP registrar
    /// used to form dial URIs.
    pub fn new(addr: &str, server: &str) -> Self {
        Self {
            addr: addr.to_string(),
            server: server.to_string(),
        }
    }

    /// Registration status of the user agent.
    pub async fn reginfo(&self) -> Result<Value> {
        self.command(json!({ "command": "reginfo" })).await
    }

    /// Enumerate active calls.
    #[allow(dead_code)]
    pub async fn list_calls(&self) -> Result<Value> {
        self.command(json!({ "command": "listcalls" })).await
    }

    /// Place a call to `number`.
    pub async fn dial(&self, number: &str) -> Result<Value> {
        let uri = format!("sip:{}@{}", canonicalize_number(number), self.server);
        self.command(json!({ "command": "dial", "uri": uri })).await
    }

    /// Hang up the active call.
    pub async fn hangup(&self) -> Result<Value> {
        self.command(json!({ "command": "hangup" })).await
    }

    /// Ask the user agent to exit.
    #[allow(dead_code)]
    pub async fn quit(&self) -> Result<Value> {
        self.command(json!({ "command": "quit" })).await
    }

    async fn command(&self, cmd: Value) -> Result<Value> {
        debug!(command = %cmd, "SIP control request");
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to SIP control at {}", self.addr))?;

        let request = netstring_encode(&serde_json::to_vec(&cmd)?);
        stream.write_all(&request).await.context("control write")?;

        let mut buf = Vec::new();
        let mut read_buf = [0u8; 4096];
        let payload = loop {
            if let Some((payload, _)) = netstring_parse(&buf)? {
                break payload;
            }
            let n = stream.read(&mut read_buf).await.context("control read")?;
            if n == 0 {
                bail!("SIP control closed before replying");
            }
            buf.extend_from_slice(&read_buf[..n]);
        };

        let response: Value =
            serde_json::from_slice(&payload).context("control response is not JSON")?;
        if let Some(error) = response.get("error") {
            bail!("SIP control error: {}", error);
        }
        Ok(response
            .get("data")
            .cloned()
            .unwrap_or(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_wraps_with_length_and_comma() {
        assert_eq!(netstring_encode(b"{}"), b"2:{},".to_vec());
        assert_eq!(netstring_encode(b""), b"0:,".to_vec());
    }

    #[test]
    fn parse_round_trips() {
        let encoded = netstring_encode(br#"{"command":"reginfo"}"#);
        let (payload, consumed) = netstring_parse(&encoded).unwrap().unwrap();
        assert_eq!(payload, br#"{"command":"reginfo"}"#.to_vec());
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn parse_waits_for_complete_input() {
        let encoded = netstring_encode(b"{\"a\":1}");
        for cut in 0..encoded.len() {
            assert!(netstring_parse(&encoded[..cut]).unwrap().is_none());
        }
    }

    #[test]
    fn parse_rejects_bad_framing() {
        assert!(netstring_parse(b"abc:xyz,").is_err());
        assert!(netstring_parse(b"3:abcX").is_err());
    }

    #[test]
    fn two_messages_parse_in_sequence() {
        let mut stream = netstring_encode(b"one");
        stream.extend_from_slice(&netstring_encode(b"second"));
        let (first, consumed) = netstring_parse(&stream).unwrap().unwrap();
        assert_eq!(first, b"one".to_vec());
        let (second, _) = netstring_parse(&stream[consumed..]).unwrap().unwrap();
        assert_eq!(second, b"second".to_vec());
    }

    #[test]
    fn numbers_canonicalize_to_e164_digits() {
        assert_eq!(canonicalize_number("(555) 123-4567"), "15551234567");
        assert_eq!(canonicalize_number("+1 555 123 4567"), "15551234567");
        assert_eq!(canonicalize_number("911"), "911");
        assert_eq!(canonicalize_number("15551234567"), "15551234567");
    }
}
