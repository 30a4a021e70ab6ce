//! Selector resolution.
//!
//! Maps a human-readable element description to a concrete selector using
//! a per-tenant cache in front of the chat backend. Execution outcomes feed
//! back into the cache so repeated lookups converge on selectors that
//! actually work.

use crate::ai::ChatPort;
use pilot_core::prompt::PromptSanitizer;
use pilot_core::{ActionStep, DomSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Prefix of the sentinel selector the bridge resolves with a text-based
/// fallback across iframes.
pub const CONSENT_FALLBACK_PREFIX: &str = "CONSENT_FALLBACK:";

/// Keywords that mark a target as a consent control.
const CONSENT_KEYWORDS: &[&str] = &["consent", "cookie", "accept", "agree", "privacy", "gdpr"];

const RESOLVER_SYSTEM_PROMPT: &str = "You locate elements in accessibility-tree snapshots. Given an element \
     description and a page snapshot, respond with a single CSS selector \
     (or ref locator like [ref=e12]) for the element, and nothing else. \
     Respond with NONE if the element is not present.";

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Step now carries a usable selector.
    Resolved(ActionStep),
    /// No selector could be produced; the reflector decides what happens.
    Unresolved,
}

#[derive(Debug, Default, Clone)]
struct CacheEntry {
    selector: String,
    successes: u32,
    failures: u32,
}

type CacheKey = (String, String, String);

/// Cache-backed resolver. Writes never block reads for long; the map lives
/// behind an async RwLock and entries are small.
pub struct SelectorResolver {
    chat: Arc<dyn ChatPort>,
    sanitizer: PromptSanitizer,
    cache: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl std::fmt::Debug for SelectorResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorResolver").finish_non_exhaustive()
    }
}

impl SelectorResolver {
    pub fn new(chat: Arc<dyn ChatPort>, sanitizer: PromptSanitizer) -> Self {
        Self {
            chat,
            sanitizer,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn cache_key(tenant: &str, description: &str, url: &str) -> CacheKey {
        (
            tenant.to_string(),
            description.trim().to_lowercase(),
            crate::safety::extract_host(url).unwrap_or_else(|| url.to_string()),
        )
    }

    fn looks_like_consent(target: &str) -> bool {
        let lowered = target.to_lowercase();
        CONSENT_KEYWORDS.iter().any(|kw| lowered.contains(kw))
    }

    /// Resolve a selector for `step` on the page described by `snapshot`.
    pub async fn resolve(
        &self,
        tenant: &str,
        step: &ActionStep,
        url: &str,
        snapshot: &DomSnapshot,
    ) -> Resolution {
        // Pre-resolved steps pass through untouched.
        if step
            .selector
            .as_deref()
            .map(str::trim)
            .is_some_and(|s| !s.is_empty())
        {
            return Resolution::Resolved(step.clone());
        }

        if step.target.trim().is_empty() {
            return Resolution::Unresolved;
        }

        let key = Self::cache_key(tenant, &step.target, url);
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key) {
                if entry.successes > entry.failures {
                    debug!(target = %step.target, selector = %entry.selector, "selector cache hit");
                    return Resolution::Resolved(step.with_selector(entry.selector.clone()));
                }
            }
        }

        match self.query_ai(step, snapshot).await {
            Some(selector) => Resolution::Resolved(step.with_selector(selector)),
            None if Self::looks_like_consent(&step.target) => {
                // The bridge handles this sentinel with a text-based search
                // across frames.
                let guess = step.target.trim();
                Resolution::Resolved(
                    step.with_selector(format!("{CONSENT_FALLBACK_PREFIX}{guess}")),
                )
            }
            None => Resolution::Unresolved,
        }
    }

    async fn query_ai(&self, step: &ActionStep, snapshot: &DomSnapshot) -> Option<String> {
        let wrapped = self
            .sanitizer
            .wrap_untrusted(&snapshot.content, Some("page snapshot"));
        let user_prompt = format!(
            "Element description: {}\nPage URL: {}\n\n{}",
            step.target, snapshot.url, wrapped.text
        );

        let response = self
            .chat
            .call(RESOLVER_SYSTEM_PROMPT, &user_prompt, None)
            .await
            .ok()?;
        let selector = response.trim();
        if selector.is_empty() || selector.eq_ignore_ascii_case("none") {
            return None;
        }
        Some(selector.to_string())
    }

    /// Feed an execution outcome back into the cache.
    pub async fn record_outcome(
        &self,
        tenant: &str,
        description: &str,
        url: &str,
        selector: &str,
        success: bool,
    ) {
        if selector.trim().is_empty() || selector.starts_with(CONSENT_FALLBACK_PREFIX) {
            return;
        }
        let key = Self::cache_key(tenant, description, url);
        let mut cache = self.cache.write().await;
        let entry = cache.entry(key).or_insert_with(|| CacheEntry {
            selector: selector.to_string(),
            ..CacheEntry::default()
        });
        if entry.selector != selector {
            // Newer selector takes over; old stats no longer apply.
            entry.selector = selector.to_string();
            entry.successes = 0;
            entry.failures = 0;
        }
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
    }
}
