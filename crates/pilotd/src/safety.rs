//! Target guard and plan sanitizer.
//!
//! The guard decides whether a candidate URL may be driven at all:
//! self-protection and cloud-metadata rules are unconditional, private
//! ranges are blocked under the production profile, and DNS-resolved
//! addresses re-run the range checks to defeat rebinding. The sanitizer
//! filters AI-generated plans and verifies they stay on the allowed
//! domain.

use pilot_core::{ActionKind, ActionStep, Config};
use std::net::IpAddr;
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Cloud metadata endpoints. Never reachable, regardless of allowlists.
const CLOUD_METADATA_HOSTS: &[&str] = &[
    "169.254.169.254",
    "metadata.google.internal",
    "metadata.goog",
    "100.100.100.200",
];

/// TLDs the runner refuses to target.
const BLOCKED_TLDS: &[&str] = &[
    ".gov", ".mil", ".bank", ".internal", ".local", ".corp", ".lan",
];

/// Identity/auth provider domains, blocked exactly or as subdomains.
const BLOCKED_DOMAINS: &[&str] = &[
    "accounts.google.com",
    "login.microsoftonline.com",
    "appleid.apple.com",
    "okta.com",
    "auth0.com",
];

/// Path patterns that indicate admin or credential surfaces.
const BLOCKED_PATH_PATTERNS: &[&str] = &[
    "/admin",
    "/wp-admin",
    "/administrator",
    "/.env",
    "/.git",
    "/.aws",
    "/.ssh",
    "/phpinfo",
    "/server-status",
    "/oauth/authorize",
    "/auth/realms",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardViolation {
    #[error("url is not parseable: {0}")]
    Unparseable(String),
    #[error("host targets own infrastructure: {0}")]
    SelfProtection(String),
    #[error("host is a cloud metadata endpoint: {0}")]
    CloudMetadata(String),
    #[error("host resolves into a blocked address range: {0}")]
    BlockedRange(String),
    #[error("host is not on the self-test allowlist: {0}")]
    NotAllowlisted(String),
    #[error("host has a blocked top-level domain: {0}")]
    BlockedTld(String),
    #[error("host matches a blocked domain: {0}")]
    BlockedDomain(String),
    #[error("path matches a blocked pattern: {0}")]
    BlockedPath(String),
}

pub type GuardResult = std::result::Result<(), GuardViolation>;

/// Extract the host from a URL, supporting bracketed IPv6 and stripping
/// any port.
pub fn extract_host(raw_url: &str) -> Option<String> {
    // The url crate handles brackets and ports; fall back to manual
    // splitting for scheme-less strings.
    if let Ok(parsed) = Url::parse(raw_url) {
        if let Some(host) = parsed.host_str() {
            return Some(host.trim_matches(|c| c == '[' || c == ']').to_string());
        }
    }
    let without_scheme = raw_url.split("://").last()?;
    let authority = without_scheme.split(['/', '?', '#']).next()?;
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6, optionally with a port after the bracket.
        return rest.split(']').next().map(str::to_string);
    }
    Some(authority.split(':').next().unwrap_or(authority).to_string())
}

/// Lower-case and strip a leading `www.`.
pub fn normalize_host(host: &str) -> String {
    let lowered = host.to_lowercase();
    lowered.strip_prefix("www.").unwrap_or(&lowered).to_string()
}

fn ip_in_blocked_range(ip: IpAddr, production_profile: bool) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_link_local() {
                // 169.254/16 covers the metadata service; always blocked.
                return true;
            }
            if production_profile && (v4.is_loopback() || v4.is_private()) {
                return true;
            }
            false
        }
        IpAddr::V6(v6) => {
            if production_profile && v6.is_loopback() {
                return true;
            }
            // Unique-local fc00::/7.
            production_profile && (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}

/// Guards candidate target URLs before any navigation happens.
#[derive(Debug, Clone)]
pub struct TargetGuard {
    ssrf_protection: bool,
    dns_rebinding_protection: bool,
    self_test_enabled: bool,
    allowed_hosts: Vec<String>,
    self_protection_hosts: Vec<String>,
    production_profile: bool,
}

impl TargetGuard {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ssrf_protection: config.security_ssrf_protection,
            dns_rebinding_protection: config.security_dns_rebinding_protection,
            self_test_enabled: config.security_self_test_enabled,
            allowed_hosts: config
                .security_allowed_hosts
                .iter()
                .map(|h| normalize_host(h))
                .collect(),
            self_protection_hosts: config
                .security_self_protection_hosts
                .iter()
                .map(|h| normalize_host(h))
                .collect(),
            production_profile: config.security_production_profile,
        }
    }

    /// Check one candidate URL. Rules are ordered strictest-first:
    /// self-protection and metadata rejections can never be overridden by
    /// the allowlist.
    pub async fn check(&self, raw_url: &str) -> GuardResult {
        let Some(host) = extract_host(raw_url) else {
            return Err(GuardViolation::Unparseable(raw_url.to_string()));
        };
        let host = normalize_host(&host);

        // Unconditional: own infrastructure, exact or as a subdomain.
        for protected in &self.self_protection_hosts {
            if host == *protected || host.ends_with(&format!(".{protected}")) {
                return Err(GuardViolation::SelfProtection(host));
            }
        }

        // Unconditional within SSRF protection: metadata endpoints and the
        // link-local range they live in.
        if self.ssrf_protection {
            if CLOUD_METADATA_HOSTS.contains(&host.as_str()) {
                return Err(GuardViolation::CloudMetadata(host));
            }
            if let Ok(ip) = host.parse::<IpAddr>() {
                if ip_in_blocked_range(ip, self.production_profile) {
                    return Err(GuardViolation::BlockedRange(host));
                }
            }
            if self.production_profile && host == "localhost" {
                return Err(GuardViolation::BlockedRange(host));
            }
        }

        // Self-test mode: only allowlisted hosts pass, after the rules above.
        if self.self_test_enabled {
            let allowed = self
                .allowed_hosts
                .iter()
                .any(|a| host == *a || host.ends_with(&format!(".{a}")));
            if !allowed {
                return Err(GuardViolation::NotAllowlisted(host));
            }
        }

        for tld in BLOCKED_TLDS {
            if host.ends_with(tld) {
                return Err(GuardViolation::BlockedTld(host));
            }
        }

        for blocked in BLOCKED_DOMAINS {
            if host == *blocked || host.ends_with(&format!(".{blocked}")) {
                return Err(GuardViolation::BlockedDomain(host));
            }
        }

        if let Ok(parsed) = Url::parse(raw_url) {
            let path = parsed.path().to_lowercase();
            for pattern in BLOCKED_PATH_PATTERNS {
                if path.contains(pattern) {
                    return Err(GuardViolation::BlockedPath(path));
                }
            }
        }

        // DNS rebinding: resolve and re-run the range checks on every
        // address the host answers with.
        if self.ssrf_protection
            && self.dns_rebinding_protection
            && host.parse::<IpAddr>().is_err()
        {
            if let Ok(addrs) = tokio::net::lookup_host((host.as_str(), 80)).await {
                for addr in addrs {
                    if ip_in_blocked_range(addr.ip(), self.production_profile) {
                        return Err(GuardViolation::BlockedRange(format!(
                            "{host} -> {}",
                            addr.ip()
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Filters AI-generated plans and verifies navigation stays on-domain.
#[derive(Debug, Clone)]
pub struct PlanSanitizer {
    max_input_length: usize,
    max_prompt_total_length: usize,
}

impl PlanSanitizer {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_input_length: config.orchestrator_max_input_length,
            max_prompt_total_length: config.prompt_max_total_length,
        }
    }

    /// Drop steps that cannot be executed safely: navigations with a blank
    /// URL and typed values over the input cap. Idempotent.
    pub fn sanitize(&self, steps: Vec<ActionStep>, allowed_domain: &str) -> Vec<ActionStep> {
        steps
            .into_iter()
            .filter(|step| {
                match step.action {
                    ActionKind::Navigate => {
                        let blank = step
                            .value
                            .as_deref()
                            .map(str::trim)
                            .unwrap_or_default()
                            .is_empty();
                        if blank {
                            warn!(
                                step_id = %step.id,
                                domain = allowed_domain,
                                "dropping navigate step with blank url"
                            );
                            return false;
                        }
                    }
                    ActionKind::Type => {
                        let too_long = step
                            .value
                            .as_deref()
                            .map(|v| v.chars().count() > self.max_input_length)
                            .unwrap_or(false);
                        if too_long {
                            warn!(
                                step_id = %step.id,
                                cap = self.max_input_length,
                                "dropping type step with oversized value"
                            );
                            return false;
                        }
                    }
                    _ => {}
                }
                true
            })
            .collect()
    }

    /// False when any navigation leaves the allowed domain. Relative URLs
    /// stay on-domain by construction and pass.
    pub fn is_safe(&self, steps: &[ActionStep], allowed_domain: &str) -> bool {
        let allowed = normalize_host(allowed_domain);
        for step in steps {
            if step.action != ActionKind::Navigate {
                continue;
            }
            let Some(target) = step.value.as_deref() else {
                continue;
            };
            let Some(host) = extract_host(target) else {
                // No host at all: a relative URL, allowed.
                continue;
            };
            let host = normalize_host(&host);
            if host != allowed && !host.ends_with(&format!(".{allowed}")) {
                warn!(
                    step_id = %step.id,
                    host = %host,
                    allowed = %allowed,
                    "plan navigates off the allowed domain"
                );
                return false;
            }
        }
        true
    }

    /// Guard on total planner input size (system prompt + goals).
    pub fn validate_prompt_size(&self, system_prompt: &str, goals: &[String]) -> bool {
        let total: usize = system_prompt.chars().count()
            + goals.iter().map(|g| g.chars().count()).sum::<usize>();
        total <= self.max_prompt_total_length
    }
}
