//! Per-message evaluation shared by every front end: extract, decide, and
//! turn the decision into an action.

use crate::config::ServerConfig;
use crate::engine::DecisionEngine;
use crate::error::ParseError;
use crate::extractor::ContentExtractor;
use crate::model::{extract_address, AnalysisResult, Email};
use crate::rewrite::MessageRewriter;
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Envelope of one mail transaction.
#[derive(Debug, Clone, Default)]
pub struct MailContext {
    /// `MAIL FROM` path; empty for the null reverse-path.
    pub sender: String,
    pub recipients: Vec<String>,
    pub helo: Option<String>,
    pub peer: Option<String>,
}

/// Outcome of the decision step, including a failure that was absorbed.
#[derive(Debug, Clone)]
pub struct Decision {
    pub result: AnalysisResult,
    pub error: Option<String>,
    pub elapsed: Duration,
}

/// What should happen to a message, before any front end acts on it.
#[derive(Debug)]
pub enum Verdict {
    Reject { score: f64 },
    /// Pass the message on, tagged with the decision.
    Accept(Decision),
    TempFail(ParseError),
}

#[derive(Debug)]
pub enum FilterAction {
    Reject { score: f64 },
    Forward { message: Vec<u8>, decision: Decision },
    TempFail(ParseError),
}

pub struct FilterEngine {
    extractor: ContentExtractor,
    engine: Arc<DecisionEngine>,
    rewriter: MessageRewriter,
    block_spam: bool,
    message_timeout: Duration,
}

impl FilterEngine {
    pub fn new(engine: Arc<DecisionEngine>, config: &ServerConfig) -> Self {
        FilterEngine {
            extractor: ContentExtractor::new(),
            engine,
            rewriter: MessageRewriter::from_config(config),
            block_spam: config.block_spam,
            message_timeout: config.message_timeout(),
        }
    }

    /// Build the [`Email`] for a transaction. Headers win over the envelope.
    pub fn extract(&self, context: &MailContext, raw: &[u8]) -> Result<Email, ParseError> {
        let mut email = self.extractor.extract(raw)?;
        if email.from.is_empty() {
            email.from = extract_address(&context.sender);
        }
        if email.to.is_empty() {
            email.to = context.recipients.clone();
        }
        Ok(email)
    }

    /// Run the decision engine under the per-message deadline. Failures are
    /// folded into a fail-open result.
    pub async fn decide(&self, email: &Email) -> Decision {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.message_timeout, self.engine.analyze(email)).await;
        let (result, error) = match outcome {
            Ok(Ok(result)) => (result, None),
            Ok(Err(e)) => {
                let reason = e.to_string();
                (AnalysisResult::failed(&reason), Some(reason))
            }
            Err(_) => {
                let reason = format!(
                    "message processing exceeded {}s",
                    self.message_timeout.as_secs()
                );
                (AnalysisResult::failed(&reason), Some(reason))
            }
        };
        Decision {
            result,
            error,
            elapsed: started.elapsed(),
        }
    }

    pub fn rewriter(&self) -> &MessageRewriter {
        &self.rewriter
    }

    /// Extract, decide and apply the blocking policy.
    pub async fn judge(&self, context: &MailContext, raw: &[u8]) -> Verdict {
        let email = match self.extract(context, raw) {
            Ok(email) => email,
            Err(e) => {
                warn!(
                    "Failed to parse message sender={} size={} error={}",
                    context.sender,
                    raw.len(),
                    e
                );
                return Verdict::TempFail(e);
            }
        };

        let decision = self.decide(&email).await;
        let result = &decision.result;

        match &decision.error {
            Some(error) => warn!(
                "Spam analysis failed, passing message sender={} domain={} error={}",
                email.from,
                email.sender_domain(),
                error
            ),
            None => info!(
                "Email analyzed sender={} domain={} is_spam={} score={:.4} model={} elapsed_ms={}",
                email.from,
                email.sender_domain(),
                result.is_spam,
                result.score,
                result.model_used,
                decision.elapsed.as_millis()
            ),
        }

        if result.is_spam && self.block_spam && decision.error.is_none() {
            info!(
                "Rejecting spam sender={} score={:.4} reason={}",
                email.from, result.score, result.explanation
            );
            return Verdict::Reject {
                score: result.score,
            };
        }
        Verdict::Accept(decision)
    }

    /// Judge the message and build the copy to forward.
    pub async fn evaluate(&self, context: &MailContext, raw: &[u8]) -> FilterAction {
        let decision = match self.judge(context, raw).await {
            Verdict::Reject { score } => return FilterAction::Reject { score },
            Verdict::TempFail(e) => return FilterAction::TempFail(e),
            Verdict::Accept(decision) => decision,
        };
        match self
            .rewriter
            .rewrite(raw, &decision.result, decision.error.as_deref())
        {
            Ok(message) => FilterAction::Forward { message, decision },
            Err(e) => FilterAction::TempFail(e),
        }
    }
}
