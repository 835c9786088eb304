pub mod cache;
pub mod classifier;
pub mod config;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod filter;
pub mod headers;
pub mod milter;
pub mod model;
pub mod relay;
pub mod rewrite;
pub mod smtp;
pub mod whitelist;

pub use config::Config;
pub use engine::DecisionEngine;
pub use extractor::ContentExtractor;
pub use filter::{FilterAction, FilterEngine, MailContext};
pub use model::{AnalysisResult, CacheEntry, Email};
pub use smtp::SmtpServer;
pub use whitelist::WhitelistChecker;
