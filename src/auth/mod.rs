//! Session credentials.
//!
//! The engine consumes a cookie/header bundle produced elsewhere and detects
//! when the remote stops accepting it. Acquisition is delegated to an
//! optional external command whose output is cached on disk.

mod credentials;
mod provider;

pub use credentials::{CredentialBundle, CredentialStore, parse_cookie_pairs};
pub use provider::{
    COOKIES_ENV, CredentialError, CredentialSource, load_bundle_file, parse_pair,
    save_bundle_file,
};
