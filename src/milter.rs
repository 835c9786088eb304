//! Milter front end.
//!
//! The MTA keeps custody of the message. Each transaction is rebuilt from the
//! header and body callbacks, judged by the [`FilterEngine`], and answered
//! with a reply code plus the decision headers as milter actions.

use crate::config::MilterSocket;
use crate::filter::{FilterEngine, MailContext, Verdict};
use crate::headers::HeaderBlock;
use crate::rewrite::HeaderEdits;
use anyhow::Context as _;
use indymilter::{
    Actions, Callbacks, Config as IndyConfig, ContextActions, EomActions, EomContext,
    SetErrorReply, SmtpReply, Status,
};
use std::ffi::CString;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;

/// Line break used inside folded header values handed to the MTA.
const MILTER_FOLD: &str = "\n ";

/// Per-connection state: the envelope and the message as received so far.
#[derive(Debug, Default)]
struct Transaction {
    context: MailContext,
    message: Vec<u8>,
    truncated: bool,
}

impl Transaction {
    fn new(peer: String) -> Self {
        Transaction {
            context: MailContext {
                peer: Some(peer),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Forget the current message, keeping connection details.
    fn reset(&mut self) {
        self.context.sender.clear();
        self.context.recipients.clear();
        self.message.clear();
        self.truncated = false;
    }

    fn start(&mut self, args: &[CString]) {
        self.reset();
        self.context.sender = envelope_path(args);
    }

    fn push_header(&mut self, name: &[u8], value: &[u8], limit: usize) {
        let mut line = Vec::with_capacity(name.len() + value.len() + 4);
        line.extend_from_slice(name);
        line.extend_from_slice(b": ");
        line.extend_from_slice(value);
        line.extend_from_slice(b"\r\n");
        self.push(&line, limit);
    }

    fn push(&mut self, bytes: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.message.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.message.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }
}

/// First `MAIL`/`RCPT` argument without its angle brackets.
fn envelope_path(args: &[CString]) -> String {
    let Some(first) = args.first() else {
        return String::new();
    };
    let path = first.to_string_lossy();
    let path = path.trim();
    path.strip_prefix('<')
        .and_then(|p| p.strip_suffix('>'))
        .unwrap_or(path)
        .trim()
        .to_string()
}

/// What to tell the MTA at end of message.
#[derive(Debug, PartialEq)]
enum Outcome {
    Reject(String),
    TempFail(String),
    Accept {
        edits: HeaderEdits,
        /// Whether the message already has a Subject to change.
        has_subject: bool,
    },
}

async fn judge(filter: &FilterEngine, transaction: &Transaction) -> Outcome {
    let raw = &transaction.message;
    match filter.judge(&transaction.context, raw).await {
        Verdict::Reject { score } => Outcome::Reject(format!("Rejected as spam (score={:.4})", score)),
        Verdict::TempFail(_) => Outcome::TempFail("Failed to parse message".to_string()),
        Verdict::Accept(decision) => {
            let subject = HeaderBlock::parse(raw)
                .ok()
                .and_then(|block| block.first("subject"));
            let edits = filter.rewriter().edits(
                &decision.result,
                decision.error.as_deref(),
                subject.as_deref(),
                MILTER_FOLD,
            );
            Outcome::Accept {
                edits,
                has_subject: subject.is_some(),
            }
        }
    }
}

fn set_reply(reply: &mut SmtpReply, code: &str, enhanced: &str, text: &str) {
    if let Err(e) = reply.set_error_reply(code, Some(enhanced), [text]) {
        log::warn!("Cannot set {} reply: {}", code, e);
    }
}

async fn apply_edits(actions: &EomActions, edits: &HeaderEdits, has_subject: bool) {
    // decision headers go on top, in order
    for (index, (name, value)) in edits.added.iter().enumerate() {
        if let Err(e) = actions
            .insert_header(index as i32, name.as_str(), value.as_str())
            .await
        {
            log::error!("Failed to add header {}: {}", name, e);
        }
    }
    if let Some(subject) = &edits.subject {
        let applied = if has_subject {
            actions.change_header("Subject", 1, Some(subject.as_str())).await
        } else {
            actions.add_header("Subject", subject.as_str()).await
        };
        if let Err(e) = applied {
            log::error!("Failed to set Subject: {}", e);
        }
    }
}

async fn end_of_message(filter: Arc<FilterEngine>, cx: &mut EomContext<Transaction>) -> Status {
    let Some(transaction) = cx.data.as_mut() else {
        log::warn!("End of message without a transaction, accepting");
        return Status::Accept;
    };
    if transaction.truncated {
        log::debug!(
            "Message from {} over the size limit, judging the first {} bytes",
            transaction.context.sender,
            transaction.message.len()
        );
    }

    let outcome = judge(&filter, transaction).await;
    transaction.reset();

    match outcome {
        Outcome::Reject(text) => {
            set_reply(&mut cx.reply, "550", "5.7.1", &text);
            Status::Reject
        }
        Outcome::TempFail(text) => {
            set_reply(&mut cx.reply, "451", "4.3.0", &text);
            Status::Tempfail
        }
        Outcome::Accept { edits, has_subject } => {
            apply_edits(&cx.actions, &edits, has_subject).await;
            Status::Accept
        }
    }
}

pub struct Milter {
    filter: Arc<FilterEngine>,
    max_message_bytes: usize,
}

impl Milter {
    pub fn new(filter: Arc<FilterEngine>, max_message_bytes: usize) -> Self {
        Milter {
            filter,
            max_message_bytes,
        }
    }

    fn callbacks(&self) -> Callbacks<Transaction> {
        let filter = self.filter.clone();
        let limit = self.max_message_bytes;

        Callbacks::new()
            .on_connect(|cx, hostname, _socket| {
                let peer = hostname.to_string_lossy().into_owned();
                log::debug!("Milter connection from {}", peer);
                cx.data = Some(Transaction::new(peer));
                Box::pin(async { Status::Continue })
            })
            .on_helo(|cx, hostname| {
                let tx = cx.data.get_or_insert_with(Default::default);
                tx.context.helo = Some(hostname.to_string_lossy().into_owned());
                Box::pin(async { Status::Continue })
            })
            .on_mail(|cx, args| {
                cx.data.get_or_insert_with(Default::default).start(&args);
                Box::pin(async { Status::Continue })
            })
            .on_rcpt(|cx, args| {
                let recipient = envelope_path(&args);
                if !recipient.is_empty() {
                    let tx = cx.data.get_or_insert_with(Default::default);
                    tx.context.recipients.push(recipient);
                }
                Box::pin(async { Status::Continue })
            })
            .on_header(move |cx, name, value| {
                cx.data.get_or_insert_with(Default::default).push_header(
                    name.as_bytes(),
                    value.as_bytes(),
                    limit,
                );
                Box::pin(async { Status::Continue })
            })
            .on_eoh(move |cx| {
                cx.data
                    .get_or_insert_with(Default::default)
                    .push(b"\r\n", limit);
                Box::pin(async { Status::Continue })
            })
            .on_body(move |cx, chunk| {
                cx.data.get_or_insert_with(Default::default).push(&chunk, limit);
                Box::pin(async { Status::Continue })
            })
            .on_eom(move |cx| Box::pin(end_of_message(filter.clone(), cx)))
            .on_abort(|cx| {
                if let Some(tx) = cx.data.as_mut() {
                    tx.reset();
                }
                Box::pin(async { Status::Continue })
            })
            .on_close(|cx| {
                cx.data = None;
                Box::pin(async { Status::Continue })
            })
    }

    /// Serve milter connections until `shutdown` is cancelled.
    pub async fn run(&self, socket: &MilterSocket, shutdown: CancellationToken) -> anyhow::Result<()> {
        let config = IndyConfig {
            actions: Actions::ADD_HEADER | Actions::CHANGE_HEADER,
            ..Default::default()
        };
        let stop = async move { shutdown.cancelled().await };

        match socket {
            MilterSocket::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)
                        .with_context(|| format!("removing stale socket {}", path.display()))?;
                }
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("binding {}", path.display()))?;
                log::info!("Milter listening on unix:{}", path.display());
                indymilter::run(listener, self.callbacks(), config, stop).await?;
                // best effort; a new run replaces it anyway
                let _ = std::fs::remove_file(path);
            }
            MilterSocket::Inet(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("binding {}", addr))?;
                log::info!("Milter listening on inet:{}", addr);
                indymilter::run(listener, self.callbacks(), config, stop).await?;
            }
        }
        log::info!("Milter stopped");
        Ok(())
    }
}
