// packages/pool/src/pool/identity.rs
//! Per-session identity profiles
//!
//! A caller may hint which target it is about to visit. The hint is resolved
//! into an [`IdentityProfile`] that the driver applies to that one session.
//! The shared instance context is never touched, so concurrent sessions on the
//! same instance keep their own identities.

use serde::{Deserialize, Serialize};

pub const DESKTOP_CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const ANDROID_CHROME_UA: &str = "Mozilla/5.0 (Linux; Android 10; SM-G973F) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";
pub const IPHONE_SAFARI_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 14_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0 Mobile/15E148 Safari/604.1";
pub const WHATSAPP_UA: &str = "WhatsApp/2.23.2.72 A";

const ACCEPT_LANGUAGE: (&str, &str) = ("Accept-Language", "en-US,en;q=0.9");

/// User agent and extra headers applied to a single session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub user_agent: String,
    pub extra_headers: Vec<(String, String)>,
}

impl IdentityProfile {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            extra_headers: vec![],
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Profile suited to a target domain
    ///
    /// Storefronts that serve stripped-down pages to link-preview bots get the
    /// matching agent; everything else gets a desktop browser.
    pub fn for_domain(domain: &str) -> Self {
        let domain = domain.to_ascii_lowercase();

        let user_agent = if domain.contains("tokopedia.com") {
            ANDROID_CHROME_UA
        } else if ["shopee.co.id", "bukalapak.com", "blibli.com"]
            .iter()
            .any(|site| domain.contains(site))
        {
            WHATSAPP_UA
        } else if domain.contains("tiktok.com") {
            IPHONE_SAFARI_UA
        } else {
            DESKTOP_CHROME_UA
        };

        Self::new(user_agent).with_header(ACCEPT_LANGUAGE.0, ACCEPT_LANGUAGE.1)
    }
}

/// Advisory tag passed with a session request
///
/// Hints only customize the session. They never influence which instance
/// admits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHint {
    /// Resolve a profile from the target's domain
    Domain(String),
    /// Use this profile as-is
    Identity(IdentityProfile),
}

impl SessionHint {
    pub fn domain(domain: impl Into<String>) -> Self {
        Self::Domain(domain.into())
    }

    pub fn resolve(&self) -> IdentityProfile {
        match self {
            Self::Domain(domain) => IdentityProfile::for_domain(domain),
            Self::Identity(profile) => profile.clone(),
        }
    }
}

impl From<IdentityProfile> for SessionHint {
    fn from(profile: IdentityProfile) -> Self {
        Self::Identity(profile)
    }
}
