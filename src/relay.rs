//! Hands accepted mail to the next hop.

use crate::config::UpstreamConfig;
use crate::error::RelayError;
use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::extension::ClientId;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use std::time::Duration;

#[async_trait]
pub trait Relay: Send + Sync {
    /// Replay the envelope and send `message` as the DATA payload. An empty
    /// `sender` is the null reverse-path.
    async fn forward(
        &self,
        sender: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<(), RelayError>;
}

/// Plain SMTP to the upstream MTA, one connection per message.
pub struct SmtpRelay {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    target: String,
}

impl SmtpRelay {
    pub fn new(upstream: &UpstreamConfig, hello_name: &str) -> Self {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(upstream.host.as_str())
            .port(upstream.port)
            .hello_name(ClientId::Domain(hello_name.to_string()))
            .timeout(Some(Duration::from_secs(60)))
            .build();
        SmtpRelay {
            transport,
            target: format!("{}:{}", upstream.host, upstream.port),
        }
    }
}

pub fn envelope(sender: &str, recipients: &[String]) -> Result<Envelope, RelayError> {
    let parse = |addr: &str| {
        addr.parse::<Address>()
            .map_err(|_| RelayError::Address(addr.to_string()))
    };
    let from = match sender.trim() {
        "" => None,
        addr => Some(parse(addr)?),
    };
    let to = recipients
        .iter()
        .map(|r| parse(r.trim()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Envelope::new(from, to)?)
}

/// DATA payload for the upstream transport. Bare LF line breaks become CRLF
/// so the transport's dot-stuffing sees every line start, and one final CRLF
/// is dropped because the transport writes `CRLF . CRLF` after the payload.
pub fn wire_payload(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + message.len() / 32);
    let mut prev = 0u8;
    for &b in message {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    if out.ends_with(b"\r\n") {
        out.truncate(out.len() - 2);
    }
    out
}

#[async_trait]
impl Relay for SmtpRelay {
    async fn forward(
        &self,
        sender: &str,
        recipients: &[String],
        message: &[u8],
    ) -> Result<(), RelayError> {
        let envelope = envelope(sender, recipients)?;
        let payload = wire_payload(message);
        let response = self.transport.send_raw(&envelope, &payload).await?;
        log::debug!(
            "Forwarded {} bytes to {}: {:?}",
            message.len(),
            self.target,
            response.code()
        );
        Ok(())
    }
}
