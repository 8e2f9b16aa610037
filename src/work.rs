//! Work items and the scans that decide what still needs doing.
//!
//! Download items are ordinals mapped onto remote file names by a
//! [`DatasetLayout`]. Upload items are image paths relative to a source
//! root. Either way, the work set of a run is the requested items minus
//! everything the checkpoint or the destination already holds.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::hash::Hash;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

/// Identifier of one unit of work.
///
/// Blanket-implemented for anything that can be checkpointed and shared
/// across tasks.
pub trait WorkKey:
    Clone + Ord + Hash + Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> WorkKey for T where
    T: Clone + Ord + Hash + Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Default remote root of the document corpus.
pub const DEFAULT_BASE_URL: &str = "https://www.justice.gov/epstein/";
/// Default dataset folder below the base URL.
pub const DEFAULT_DATASET: &str = "files/DataSet%201/";
/// Default file name prefix.
pub const DEFAULT_PREFIX: &str = "EFTA";
/// Default zero-padded width of the ordinal.
pub const DEFAULT_WIDTH: usize = 8;
/// Default file extension.
pub const DEFAULT_EXTENSION: &str = "pdf";

/// Image extensions picked up in upload mode.
pub const IMAGE_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "bmp", "tiff"];

/// Deterministic mapping from ordinal to remote URL and local file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    /// Remote root, e.g. `https://www.justice.gov/epstein/`.
    pub base_url: String,
    /// Dataset folder appended to the base URL.
    pub dataset: String,
    /// File name prefix.
    pub prefix: String,
    /// Zero-padded width of the ordinal.
    pub width: usize,
    /// Extension without the dot.
    pub extension: String,
}

impl Default for DatasetLayout {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            dataset: DEFAULT_DATASET.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            width: DEFAULT_WIDTH,
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }
}

impl DatasetLayout {
    /// Layout for `dataset` under `base_url` with the default naming.
    #[must_use]
    pub fn new(base_url: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            dataset: dataset.into(),
            ..Self::default()
        }
    }

    /// Local and remote file name of `ordinal`, e.g. `EFTA00000042.pdf`.
    #[must_use]
    pub fn file_name(&self, ordinal: u64) -> String {
        format!(
            "{}{:0width$}.{}",
            self.prefix,
            ordinal,
            self.extension,
            width = self.width
        )
    }

    /// Remote URL of `ordinal`.
    #[must_use]
    pub fn url(&self, ordinal: u64) -> String {
        let mut url = self.base_url.clone();
        if !url.ends_with('/') {
            url.push('/');
        }
        let dataset = self.dataset.trim_start_matches('/');
        if !dataset.is_empty() {
            url.push_str(dataset);
            if !url.ends_with('/') {
                url.push('/');
            }
        }
        url.push_str(&self.file_name(ordinal));
        url
    }

    /// Inverse of [`DatasetLayout::file_name`].
    #[must_use]
    pub fn parse_file_name(&self, name: &str) -> Option<u64> {
        let digits = name
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix(self.extension.as_str())?
            .strip_suffix('.')?;
        if digits.len() < self.width || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}

/// Ordinals whose file exists in `dir` with a non-zero size.
///
/// A missing directory yields an empty set.
///
/// # Errors
///
/// Returns the IO error when the directory exists but cannot be listed.
#[instrument(skip(layout), fields(dir = %dir.display()))]
pub fn scan_existing(dir: &Path, layout: &DatasetLayout) -> std::io::Result<BTreeSet<u64>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(e),
    };

    let mut found = BTreeSet::new();
    for entry in entries {
        let entry = entry?;
        let Some(ordinal) = entry.file_name().to_str().and_then(|n| layout.parse_file_name(n))
        else {
            continue;
        };
        match entry.metadata() {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                found.insert(ordinal);
            }
            Ok(_) => {}
            Err(e) => warn!(file = %entry.path().display(), error = %e, "cannot stat file"),
        }
    }
    info!(existing = found.len(), "scanned destination");
    Ok(found)
}

/// Image files one directory level below `root`, as `<folder>/<file>` ids.
///
/// # Errors
///
/// Returns the IO error when `root` or one of its folders cannot be listed.
#[instrument(fields(root = %root.display()))]
pub fn collect_images(root: &Path) -> std::io::Result<BTreeSet<String>> {
    let mut images = BTreeSet::new();
    for folder in std::fs::read_dir(root)? {
        let folder = folder?;
        if !folder.file_type()?.is_dir() {
            continue;
        }
        let Some(folder_name) = folder.file_name().to_str().map(str::to_string) else {
            warn!(folder = %folder.path().display(), "skipping non UTF-8 folder");
            continue;
        };
        for file in std::fs::read_dir(folder.path())? {
            let file = file?;
            if !file.file_type()?.is_file() || !is_image(&file.path()) {
                continue;
            }
            if let Some(file_name) = file.file_name().to_str() {
                images.insert(format!("{folder_name}/{file_name}"));
            }
        }
    }
    info!(images = images.len(), "scanned upload source");
    Ok(images)
}

/// Whether `path` has one of the [`IMAGE_EXTENSIONS`], ignoring case.
#[must_use]
pub fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Absolute path of an upload id below `root`.
#[must_use]
pub fn image_path(root: &Path, id: &str) -> PathBuf {
    id.split('/').fold(root.to_path_buf(), |path, part| path.join(part))
}

/// Items of `requested` not contained in any of the `done` sets.
pub fn plan_work<K, I>(requested: I, done: &[&BTreeSet<K>]) -> Vec<K>
where
    K: Ord,
    I: IntoIterator<Item = K>,
{
    let mut skipped = 0usize;
    let pending: Vec<K> = requested
        .into_iter()
        .filter(|item| {
            let is_done = done.iter().any(|set| set.contains(item));
            skipped += usize::from(is_done);
            !is_done
        })
        .collect();
    debug!(pending = pending.len(), skipped, "planned work set");
    pending
}
