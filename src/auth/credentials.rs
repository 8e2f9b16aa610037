//! Session credential bundle and the runtime store that holds it.
//!
//! The engine never acquires credentials itself. It is handed a bundle of
//! cookies and headers, attaches it to every request, and flags the store as
//! stale the first time the remote answers with its session-expired status.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Opaque cookie and header bundle supplied by an external provider.
///
/// Values are sensitive: `Debug` prints names only.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    /// Cookie name to value.
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    /// Extra request header name to value.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl CredentialBundle {
    /// Creates an empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a cookie.
    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Adds or replaces a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Whether the bundle carries no cookies and no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.headers.is_empty()
    }

    /// Merges `other` into `self`; entries of `other` win.
    pub fn merge(&mut self, other: CredentialBundle) {
        self.cookies.extend(other.cookies);
        self.headers.extend(other.headers);
    }

    /// Renders the cookies as a `Cookie` header value, if any.
    #[must_use]
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Names from `required` that have no non-empty cookie or header value.
    #[must_use]
    pub fn missing(&self, required: &[String]) -> Vec<String> {
        required
            .iter()
            .filter(|name| {
                let present = |map: &BTreeMap<String, String>| {
                    map.get(name.as_str()).is_some_and(|v| !v.trim().is_empty())
                };
                !present(&self.cookies) && !present(&self.headers)
            })
            .cloned()
            .collect()
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Parses `a=b; c=d` cookie pairs. Malformed fragments are skipped.
#[must_use]
pub fn parse_cookie_pairs(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .filter_map(|fragment| {
            let (name, value) = fragment.split_once('=')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Current credential bundle of a run, replaceable at runtime.
#[derive(Debug, Default)]
pub struct CredentialStore {
    bundle: RwLock<Arc<CredentialBundle>>,
    stale: AtomicBool,
    expired_responses: AtomicU64,
}

impl CredentialStore {
    /// Creates a store holding `bundle`.
    #[must_use]
    pub fn new(bundle: CredentialBundle) -> Self {
        Self {
            bundle: RwLock::new(Arc::new(bundle)),
            stale: AtomicBool::new(false),
            expired_responses: AtomicU64::new(0),
        }
    }

    /// The bundle to attach to the next request.
    #[must_use]
    pub fn current(&self) -> Arc<CredentialBundle> {
        Arc::clone(&self.bundle.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Installs a fresh bundle and clears the stale flag.
    pub fn replace(&self, bundle: CredentialBundle) {
        *self.bundle.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(bundle);
        self.stale.store(false, Ordering::SeqCst);
        info!("credential bundle replaced");
    }

    /// Records a session-expired response.
    ///
    /// Returns `true` for the response that flipped the store to stale, so
    /// the loud warning is emitted once per bundle.
    pub fn mark_stale(&self) -> bool {
        self.expired_responses.fetch_add(1, Ordering::SeqCst);
        let first = !self.stale.swap(true, Ordering::SeqCst);
        if first {
            error!(
                "remote reports the session as expired: credentials are stale, \
                 refresh them and restart the run"
            );
        }
        first
    }

    /// Whether a session-expired response was seen since the last replace.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Total session-expired responses seen.
    #[must_use]
    pub fn expired_responses(&self) -> u64 {
        self.expired_responses.load(Ordering::SeqCst)
    }
}
