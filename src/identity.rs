//! Rotating pool of egress identities (proxy endpoints).
//!
//! Identities are loaded once, shuffled so parallel runs do not walk the
//! same order, and partitioned into fixed-size chunks. Each batch works
//! inside one chunk; [`IdentityPool::advance_chunk`] moves to the next chunk
//! at the batch boundary and [`IdentityPool::next`] round-robins within it.
//!
//! An empty pool is a pass-through: `next()` always returns `None` and
//! requests go out directly.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Default number of identities per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Lines starting with this marker are ignored in identity files.
const COMMENT_MARKER: char = '#';

/// Errors loading an identity source.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The identity file could not be read.
    #[error("failed to read identity file {path}: {source}")]
    Read {
        /// Path of the identity file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Chunk size must be at least one.
    #[error("identity chunk size must be at least 1")]
    InvalidChunkSize,
}

/// One egress identity: a proxy endpoint URL.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    /// Creates an identity, defaulting to `http://` when no scheme is given.
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        let endpoint = endpoint.trim();
        if endpoint.contains("://") {
            Self(endpoint.to_string())
        } else {
            Self(format!("http://{endpoint}"))
        }
    }

    /// The proxy URL.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The proxy URL with any `user:password@` part masked, for logs.
    #[must_use]
    pub fn redacted(&self) -> String {
        match (self.0.find("://"), self.0.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                format!("{}***{}", &self.0[..scheme_end + 3], &self.0[at..])
            }
            _ => self.0.clone(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identity").field(&self.redacted()).finish()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Parses a newline-delimited identity list, skipping blanks and comments.
#[must_use]
pub fn parse_identities(contents: &str) -> Vec<Identity> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with(COMMENT_MARKER))
        .map(Identity::new)
        .collect()
}

/// Rotating, chunked identity pool.
///
/// `next()` and `advance_chunk()` only touch atomics, so the pool is safe to
/// share behind an `Arc` and never blocks.
#[derive(Debug)]
pub struct IdentityPool {
    chunks: Vec<Vec<Identity>>,
    chunk_index: AtomicUsize,
    counter: AtomicUsize,
}

impl IdentityPool {
    /// Creates a pool from `identities`, shuffled with the thread RNG.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidChunkSize`] when `chunk_size` is zero.
    pub fn new(identities: Vec<Identity>, chunk_size: usize) -> Result<Self, IdentityError> {
        Self::with_rng(identities, chunk_size, &mut rand::thread_rng())
    }

    /// Creates a pool from `identities`, shuffled with the given RNG.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::InvalidChunkSize`] when `chunk_size` is zero.
    pub fn with_rng<R: Rng + ?Sized>(
        mut identities: Vec<Identity>,
        chunk_size: usize,
        rng: &mut R,
    ) -> Result<Self, IdentityError> {
        if chunk_size == 0 {
            return Err(IdentityError::InvalidChunkSize);
        }
        identities.shuffle(rng);
        let chunks = identities
            .chunks(chunk_size)
            .map(<[Identity]>::to_vec)
            .collect();
        Ok(Self {
            chunks,
            chunk_index: AtomicUsize::new(0),
            counter: AtomicUsize::new(0),
        })
    }

    /// Creates a pass-through pool with no identities.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            chunk_index: AtomicUsize::new(0),
            counter: AtomicUsize::new(0),
        }
    }

    /// Loads identities from a newline-delimited file.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Read`] when the file cannot be read and
    /// [`IdentityError::InvalidChunkSize`] when `chunk_size` is zero.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub fn from_file(path: &Path, chunk_size: usize) -> Result<Self, IdentityError> {
        let contents = std::fs::read_to_string(path).map_err(|source| IdentityError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let identities = parse_identities(&contents);
        info!(
            identities = identities.len(),
            chunk_size, "loaded egress identities"
        );
        Self::new(identities, chunk_size)
    }

    /// Whether the pool has no identities (pass-through mode).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total number of identities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    /// Number of chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Index of the chunk currently in use.
    #[must_use]
    pub fn current_chunk(&self) -> usize {
        self.chunk_index.load(Ordering::SeqCst)
    }

    /// Identities of the chunk currently in use.
    #[must_use]
    pub fn current_identities(&self) -> &[Identity] {
        self.chunks
            .get(self.current_chunk())
            .map_or(&[][..], Vec::as_slice)
    }

    /// Moves to the next chunk (wrapping) and resets the round-robin counter.
    ///
    /// No-op on an empty pool.
    pub fn advance_chunk(&self) {
        let count = self.chunks.len();
        if count == 0 {
            return;
        }
        let previous = self
            .chunk_index
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |index| {
                Some((index + 1) % count)
            })
            .unwrap_or(0);
        self.counter.store(0, Ordering::SeqCst);
        debug!(
            from = previous,
            to = (previous + 1) % count,
            "advanced identity chunk"
        );
    }

    /// Returns the next identity of the current chunk, round-robin.
    ///
    /// Returns `None` in pass-through mode.
    #[must_use]
    pub fn next(&self) -> Option<Identity> {
        let chunk = self.chunks.get(self.current_chunk())?;
        if chunk.is_empty() {
            return None;
        }
        let position = self.counter.fetch_add(1, Ordering::SeqCst);
        chunk.get(position % chunk.len()).cloned()
    }
}

impl Default for IdentityPool {
    fn default() -> Self {
        Self::empty()
    }
}
