//! Decision pipeline: whitelist, then cache, then classifier.
//!
//! This is the only place the spam threshold is applied.

use crate::cache::{CacheLookup, CacheRepository};
use crate::classifier::Classifier;
use crate::error::ClassifierError;
use crate::model::{AnalysisResult, CacheEntry, Email};
use crate::whitelist::WhitelistChecker;
use chrono::Utc;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(10);

struct CacheSettings {
    repository: Arc<dyn CacheRepository>,
    ttl: chrono::Duration,
}

pub struct DecisionEngine {
    whitelist: WhitelistChecker,
    classifier: Arc<dyn Classifier>,
    cache: Option<CacheSettings>,
    threshold: f64,
    classifier_timeout: Duration,
}

impl DecisionEngine {
    pub fn new(classifier: Arc<dyn Classifier>, whitelist: WhitelistChecker, threshold: f64) -> Self {
        DecisionEngine {
            whitelist,
            classifier,
            cache: None,
            threshold,
            classifier_timeout: DEFAULT_CLASSIFIER_TIMEOUT,
        }
    }

    pub fn with_cache(mut self, repository: Arc<dyn CacheRepository>, ttl: chrono::Duration) -> Self {
        self.cache = Some(CacheSettings { repository, ttl });
        self
    }

    pub fn with_classifier_timeout(mut self, timeout: Duration) -> Self {
        self.classifier_timeout = timeout;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_spam(&self, score: f64) -> bool {
        score >= self.threshold
    }

    pub async fn analyze(&self, email: &Email) -> Result<AnalysisResult, ClassifierError> {
        if self.whitelist.is_whitelisted(&email.from) {
            info!(
                "Skipping spam check for whitelisted domain sender={} action=whitelist_bypass",
                email.from
            );
            return Ok(AnalysisResult::whitelisted());
        }

        if let Some(hit) = self.cached(&email.from).await {
            return Ok(hit);
        }

        let mut result =
            match tokio::time::timeout(self.classifier_timeout, self.classifier.analyze_email(email))
                .await
            {
                Ok(outcome) => outcome?,
                Err(_) => return Err(ClassifierError::Timeout(self.classifier_timeout)),
            };
        result.is_spam = self.is_spam(result.score);

        if let Some(cache) = &self.cache {
            let entry = CacheEntry::new(&email.from, result.is_spam, result.score, cache.ttl);
            if let Err(e) = cache.repository.set(&entry).await {
                error!("Failed to update cache sender={} error={}", email.from, e);
            }
        }

        Ok(result)
    }

    /// A live cache entry for `sender`. Backend failures count as a miss.
    async fn cached(&self, sender: &str) -> Option<AnalysisResult> {
        let cache = self.cache.as_ref()?;
        match cache.repository.get(sender).await {
            Ok(CacheLookup::Hit(entry)) => {
                debug!("Cache hit for sender={}", sender);
                Some(AnalysisResult {
                    is_spam: self.is_spam(entry.score),
                    score: entry.score,
                    confidence: 1.0,
                    explanation: "Result from cache".to_string(),
                    analyzed_at: Utc::now(),
                    model_used: AnalysisResult::CACHE_MODEL.to_string(),
                    processing_id: None,
                })
            }
            Ok(CacheLookup::Expired) => {
                debug!("Cache entry expired for sender={}", sender);
                None
            }
            Ok(CacheLookup::NotFound) => None,
            Err(e) => {
                log::warn!("Cache lookup failed, treating as miss sender={} error={}", sender, e);
                None
            }
        }
    }
}
