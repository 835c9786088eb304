//! SMTP content-filter front end.
//!
//! The MTA hands each message over a small subset of SMTP; accepted mail is
//! forwarded to the upstream MTA through a [`Relay`] with the same envelope.

use crate::filter::{FilterAction, FilterEngine, MailContext};
use crate::relay::Relay;
use anyhow::Context as _;
use lettre::Address;
use log::{debug, error, info, warn};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const MAX_COMMAND_LINE: usize = 4096;
const MAX_DATA_LINE: usize = 1024 * 1024;
/// How long in-flight sessions get to finish after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    SenderSet,
    RecipientsSet,
}

enum LineRead {
    Line,
    TooLong,
    Eof,
}

enum DataRead {
    Complete(Vec<u8>),
    TooBig,
    Eof,
}

pub struct SmtpServer {
    filter: Arc<FilterEngine>,
    relay: Arc<dyn Relay>,
    hostname: String,
    max_message_bytes: usize,
}

impl SmtpServer {
    pub fn new(
        filter: Arc<FilterEngine>,
        relay: Arc<dyn Relay>,
        hostname: impl Into<String>,
        max_message_bytes: usize,
    ) -> Self {
        SmtpServer {
            filter,
            relay,
            hostname: hostname.into(),
            max_message_bytes,
        }
    }

    /// Accept connections until `shutdown` fires, then wait for open sessions.
    pub async fn run(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> anyhow::Result<()> {
        let local = listener.local_addr().context("listener has no local address")?;
        info!("SMTP filter listening on {}", local);
        let sessions = TaskTracker::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    sessions.spawn(async move {
                        let peer = peer.to_string();
                        debug!("Connection from {}", peer);
                        if let Err(e) = server.handle_connection(stream, &peer).await {
                            debug!("Session with {} ended: {}", peer, e);
                        }
                    });
                }
            }
        }

        info!("Stopped accepting connections, draining {} sessions", sessions.len());
        sessions.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, sessions.wait()).await.is_err() {
            warn!("Sessions still open after {:?}, abandoning them", DRAIN_TIMEOUT);
        }
        Ok(())
    }

    /// Drive one SMTP session to completion.
    pub async fn handle_connection<S>(&self, stream: S, peer: &str) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut line = Vec::with_capacity(512);
        let mut state = State::Idle;
        let mut context = MailContext {
            peer: Some(peer.to_string()),
            ..Default::default()
        };

        reply(
            &mut writer,
            &format!("220 {} ESMTP llm-spam-filter", self.hostname),
        )
        .await?;

        loop {
            match read_line(&mut reader, &mut line, MAX_COMMAND_LINE).await? {
                LineRead::Eof => return Ok(()),
                LineRead::TooLong => {
                    reply(&mut writer, "500 5.5.6 Line too long").await?;
                    continue;
                }
                LineRead::Line => {}
            }

            let command = String::from_utf8_lossy(&line);
            let command = command.trim_end_matches(['\r', '\n']);
            let (verb, args) = match command.split_once(' ') {
                Some((verb, args)) => (verb.to_ascii_uppercase(), args.trim()),
                None => (command.to_ascii_uppercase(), ""),
            };

            match verb.as_str() {
                "HELO" | "EHLO" => {
                    state = State::Idle;
                    context = MailContext {
                        peer: context.peer.take(),
                        helo: Some(args.to_string()),
                        ..Default::default()
                    };
                    if verb == "EHLO" {
                        let response = format!(
                            "250-{}\r\n250-SIZE {}\r\n250 8BITMIME",
                            self.hostname, self.max_message_bytes
                        );
                        reply(&mut writer, &response).await?;
                    } else {
                        reply(&mut writer, &format!("250 {}", self.hostname)).await?;
                    }
                }
                "MAIL" => {
                    if state != State::Idle {
                        reply(&mut writer, "503 5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    match parse_path(args, "FROM:") {
                        Some(sender) if !sender.is_empty() && !is_address(&sender) => {
                            reply(&mut writer, "553 5.1.7 Bad sender address syntax").await?
                        }
                        Some(sender) => {
                            context.sender = sender;
                            context.recipients.clear();
                            state = State::SenderSet;
                            reply(&mut writer, "250 2.1.0 Ok").await?;
                        }
                        None => reply(&mut writer, "501 5.5.4 Syntax: MAIL FROM:<address>").await?,
                    }
                }
                "RCPT" => {
                    if state == State::Idle {
                        reply(&mut writer, "503 5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    match parse_path(args, "TO:").filter(|r| !r.is_empty()) {
                        // the relay could never replay it, so refuse it now
                        Some(recipient) if !is_address(&recipient) => {
                            reply(&mut writer, "553 5.1.3 Bad recipient address syntax").await?
                        }
                        Some(recipient) => {
                            context.recipients.push(recipient);
                            state = State::RecipientsSet;
                            reply(&mut writer, "250 2.1.5 Ok").await?;
                        }
                        None => reply(&mut writer, "501 5.5.4 Syntax: RCPT TO:<address>").await?,
                    }
                }
                "DATA" => {
                    if state != State::RecipientsSet {
                        reply(&mut writer, "503 5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    reply(&mut writer, "354 End data with <CR><LF>.<CR><LF>").await?;

                    let response = match read_data(&mut reader, self.max_message_bytes).await? {
                        DataRead::Eof => {
                            debug!("{} disconnected during DATA", peer);
                            return Ok(());
                        }
                        DataRead::TooBig => "552 5.3.4 Message too big".to_string(),
                        DataRead::Complete(message) => {
                            let outcome = tokio::select! {
                                response = self.deliver(&context, &message) => Some(response),
                                _ = peer_closed(&mut reader) => None,
                            };
                            match outcome {
                                Some(response) => response,
                                None => {
                                    info!(
                                        "{} disconnected before a decision, abandoning message from {}",
                                        peer, context.sender
                                    );
                                    return Ok(());
                                }
                            }
                        }
                    };

                    state = State::Idle;
                    context.sender.clear();
                    context.recipients.clear();
                    reply(&mut writer, &response).await?;
                }
                "RSET" => {
                    state = State::Idle;
                    context.sender.clear();
                    context.recipients.clear();
                    reply(&mut writer, "250 2.0.0 Ok").await?;
                }
                "NOOP" => reply(&mut writer, "250 2.0.0 Ok").await?,
                "QUIT" => {
                    reply(&mut writer, "221 2.0.0 Bye").await?;
                    return Ok(());
                }
                _ => reply(&mut writer, "502 5.5.2 Command not recognized").await?,
            }
        }
    }

    /// Evaluate one message and carry out the action. Returns the reply.
    async fn deliver(&self, context: &MailContext, raw: &[u8]) -> String {
        match self.filter.evaluate(context, raw).await {
            FilterAction::Reject { score } => {
                format!("550 5.7.1 Rejected as spam (score={:.4})", score)
            }
            FilterAction::TempFail(_) => "451 4.3.0 Failed to parse message".to_string(),
            FilterAction::Forward { message, .. } => {
                match self
                    .relay
                    .forward(&context.sender, &context.recipients, &message)
                    .await
                {
                    Ok(()) => "250 2.0.0 Ok: queued".to_string(),
                    Err(e) => {
                        error!(
                            "Upstream delivery failed sender={} recipients={} error={}",
                            context.sender,
                            context.recipients.join(","),
                            e
                        );
                        "451 4.4.1 Upstream delivery failed".to_string()
                    }
                }
            }
        }
    }
}

async fn reply<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> io::Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}

/// `FROM:<addr> PARAMS` -> `addr`. Also accepts a path without brackets.
fn parse_path(args: &str, keyword: &str) -> Option<String> {
    let head = args.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = args[keyword.len()..].trim_start();
    if let Some(inner) = rest.strip_prefix('<') {
        let end = inner.find('>')?;
        return Some(inner[..end].trim().to_string());
    }
    rest.split_whitespace().next().map(str::to_string)
}

fn is_address(addr: &str) -> bool {
    addr.parse::<Address>().is_ok()
}

/// Read one line including its terminator into `buf`. Lines longer than
/// `limit` are consumed and discarded.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut overflow = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (overflow, buf.is_empty()) {
                (true, _) => LineRead::TooLong,
                (false, true) => LineRead::Eof,
                (false, false) => LineRead::Line,
            });
        }

        let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (&available[..=i], true),
            None => (available, false),
        };
        let used = chunk.len();
        if !overflow && buf.len() + used <= limit {
            buf.extend_from_slice(chunk);
        } else {
            overflow = true;
            buf.clear();
        }
        reader.consume(used);

        if done {
            return Ok(if overflow { LineRead::TooLong } else { LineRead::Line });
        }
    }
}

/// Collect the DATA payload up to the lone-dot terminator, undoing dot
/// stuffing. Oversized messages are read to the end and dropped.
async fn read_data<R>(reader: &mut R, max_bytes: usize) -> io::Result<DataRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut message = Vec::new();
    let mut line = Vec::with_capacity(1024);
    let mut too_big = false;

    loop {
        match read_line(reader, &mut line, MAX_DATA_LINE).await? {
            LineRead::Eof => return Ok(DataRead::Eof),
            LineRead::TooLong => {
                too_big = true;
                continue;
            }
            LineRead::Line => {}
        }

        if line == b".\r\n" || line == b".\n" {
            break;
        }
        if !line.ends_with(b"\n") {
            // stream ended without the terminator
            return Ok(DataRead::Eof);
        }

        let content = line.strip_prefix(b".").unwrap_or(&line);
        if too_big || message.len() + content.len() > max_bytes {
            too_big = true;
            continue;
        }
        message.extend_from_slice(content);
    }

    Ok(if too_big {
        DataRead::TooBig
    } else {
        DataRead::Complete(message)
    })
}

/// Resolves once the peer has closed its side. Pipelined input leaves it
/// pending; the bytes stay buffered for the next command.
async fn peer_closed<R: AsyncBufRead + Unpin>(reader: &mut R) {
    match reader.fill_buf().await {
        Ok(buf) if !buf.is_empty() => std::future::pending::<()>().await,
        _ => {}
    }
}
