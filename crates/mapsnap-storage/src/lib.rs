//! Workspace layout, content fingerprints and HTTP fetch utilities for mapsnap.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mapsnap_core::RunLabel;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mapsnap-storage";

pub const DEFAULT_ARCHIVE_STEM: &str = "r6maps";
const STAGING_DIR_NAME: &str = "maps";
const REPORTS_DIR_NAME: &str = "reports";
const CANONICAL_DIGEST_NAME: &str = "hash.txt";
const DIGEST_CHUNK_SIZE: usize = 8192;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Streams a file through SHA-256 in fixed-size chunks and returns the lowercase hex digest.
pub fn sha256_file(path: impl AsRef<Path>) -> anyhow::Result<String> {
    let path = path.as_ref();
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; DIGEST_CHUNK_SIZE];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Replaces `path` with `bytes` via a sibling temp file and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let temp_path = temp_sibling(path)?;
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);
    rename_into_place(&temp_path, path).await
}

/// Copies `from` over `to` via a sibling temp file and rename.
pub async fn copy_atomic(from: &Path, to: &Path) -> anyhow::Result<()> {
    let temp_path = temp_sibling(to)?;
    if let Err(err) = fs::copy(from, &temp_path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!("copying {} -> {}", from.display(), temp_path.display())
        });
    }
    rename_into_place(&temp_path, to).await
}

fn temp_sibling(path: &Path) -> anyhow::Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    Ok(parent.join(format!(".{}.tmp", Uuid::new_v4())))
}

async fn rename_into_place(temp_path: &Path, path: &Path) -> anyhow::Result<()> {
    match fs::rename(temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

async fn remove_file_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}

async fn remove_dir_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
    }
}

/// Maps an arbitrary item name onto a single path component.
///
/// Reserved bytes are percent-escaped (`%` included), so the mapping is injective: two
/// distinct catalog names never share a staging directory.
pub fn sanitize_component(name: &str) -> String {
    match name {
        "" => return "%".to_string(),
        "." => return "%2E".to_string(),
        ".." => return "%2E%2E".to_string(),
        _ => {}
    }
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if is_reserved_in_component(c) {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn is_reserved_in_component(c: char) -> bool {
    matches!(c, '%' | '/' | '\\' | ':' | '<' | '>' | '"' | '|' | '?' | '*') || c.is_control()
}

/// On-disk layout of one harvest workspace.
///
/// Every path here is owned by a single invocation and gets cleared by
/// [`Workspace::clear_previous`]; the canonical pair is rewritten only on acceptance.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    archive_stem: String,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, archive_stem: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            archive_stem: archive_stem.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR_NAME)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join(REPORTS_DIR_NAME)
    }

    pub fn archive_path(&self, label: RunLabel) -> PathBuf {
        self.root
            .join(format!("{}_{}.zip", self.archive_stem, label.as_str()))
    }

    pub fn digest_path(&self, label: RunLabel) -> PathBuf {
        self.root.join(format!("hash_{}.txt", label.as_str()))
    }

    pub fn report_path(&self, label: RunLabel) -> PathBuf {
        self.reports_dir()
            .join(format!("run_{}.json", label.as_str()))
    }

    pub fn decision_report_path(&self) -> PathBuf {
        self.reports_dir().join("decision.json")
    }

    pub fn canonical_archive_path(&self) -> PathBuf {
        self.root.join(format!("{}.zip", self.archive_stem))
    }

    pub fn canonical_digest_path(&self) -> PathBuf {
        self.root.join(CANONICAL_DIGEST_NAME)
    }

    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating workspace {}", self.root.display()))
    }

    /// Removes leftovers of an earlier invocation, including the canonical pair, so a
    /// rejected reconcile never leaves a stale trusted artifact behind.
    pub async fn clear_previous(&self) -> anyhow::Result<()> {
        remove_file_if_exists(&self.canonical_archive_path()).await?;
        remove_file_if_exists(&self.canonical_digest_path()).await?;
        remove_dir_if_exists(&self.staging_dir()).await?;
        for label in [RunLabel::First, RunLabel::Second] {
            remove_file_if_exists(&self.archive_path(label)).await?;
            remove_file_if_exists(&self.digest_path(label)).await?;
            remove_file_if_exists(&self.report_path(label)).await?;
        }
        remove_file_if_exists(&self.decision_report_path()).await?;
        debug!(root = %self.root.display(), "cleared previous run artifacts");
        Ok(())
    }

    /// Deletes and recreates the staging directory, handing out the only handle to it.
    pub async fn reset_staging(&self) -> anyhow::Result<StagingArea> {
        let dir = self.staging_dir();
        remove_dir_if_exists(&dir).await?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating staging dir {}", dir.display()))?;
        Ok(StagingArea { dir })
    }

    pub async fn write_digest(&self, label: RunLabel, digest: &str) -> anyhow::Result<PathBuf> {
        let path = self.digest_path(label);
        write_atomic(&path, digest.as_bytes()).await?;
        Ok(path)
    }

    /// Copies a pass's archive over the canonical archive and records `digest` beside it.
    pub async fn promote(&self, label: RunLabel, digest: &str) -> anyhow::Result<()> {
        copy_atomic(&self.archive_path(label), &self.canonical_archive_path()).await?;
        write_atomic(&self.canonical_digest_path(), digest.as_bytes()).await?;
        Ok(())
    }
}

/// Exclusive handle on the staging directory for one pass.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn item_dir(&self, item_name: &str) -> PathBuf {
        self.dir.join(sanitize_component(item_name))
    }

    pub async fn release(self) -> anyhow::Result<()> {
        remove_dir_if_exists(&self.dir).await
    }
}

/// Statuses worth another attempt: the map CDN sheds load with 429/503 and times out
/// slow archive downloads with 408/504.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body()
}

/// How often and how patiently a single page or archive download is retried.
///
/// This is independent of the reconcile-level second pass, which re-runs the whole catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub first_pause: Duration,
    pub pause_ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_pause: Duration::from_secs(1),
            pause_ceiling: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Pause before retry number `retry` (zero-based): doubles each time up to the ceiling.
    pub fn pause_before(&self, retry: u32) -> Duration {
        let doubled = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.first_pause
            .saturating_mul(doubled)
            .min(self.pause_ceiling)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("mapsnap/", env!("CARGO_PKG_VERSION")).to_string(),
            max_in_flight: 2,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered {status}")]
    Status { status: u16, url: String },
}

/// Timeout-bounded HTTP client shared by catalog page and archive downloads.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0u32;
        loop {
            let permit = self.in_flight.acquire().await;
            let retries_left = retry < self.retry.retries;
            match self.try_once(url).await {
                Ok(response) => return Ok(response),
                Err(FetchError::Status { status, url: final_url })
                    if !retries_left
                        || !StatusCode::from_u16(status).is_ok_and(is_transient_status) =>
                {
                    return Err(FetchError::Status { status, url: final_url });
                }
                Err(FetchError::Transport { url, source })
                    if !retries_left || !is_transient_error(&source) =>
                {
                    return Err(FetchError::Transport { url, source });
                }
                Err(err) => debug!(error = %err, retry, "transient fetch failure; retrying"),
            }
            drop(permit);
            tokio::time::sleep(self.retry.pause_before(retry)).await;
            retry += 1;
        }
    }

    async fn try_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().await.map_err(transport)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await.map_err(transport)?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    #[test]
    fn fingerprint_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn streamed_file_digest_matches_in_memory_digest() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("blob.bin");
        let bytes: Vec<u8> = (0..(DIGEST_CHUNK_SIZE * 3 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        std::fs::write(&path, &bytes).expect("write blob");

        assert_eq!(sha256_file(&path).expect("digest"), sha256_hex(&bytes));
    }

    #[test]
    fn digest_of_missing_file_is_an_error() {
        let dir = tempdir().expect("tempdir");
        assert!(sha256_file(dir.path().join("missing.zip")).is_err());
    }

    #[test]
    fn sanitize_keeps_names_single_component() {
        assert_eq!(sanitize_component("Bank"), "Bank");
        assert_eq!(sanitize_component("Kafe Dostoyevsky"), "Kafe Dostoyevsky");
        assert_eq!(sanitize_component("../etc/passwd"), "..%2Fetc%2Fpasswd");
        assert_eq!(sanitize_component(".."), "%2E%2E");
        assert_eq!(sanitize_component("."), "%2E");
        assert_eq!(sanitize_component(""), "%");
        assert_eq!(sanitize_component("C:evil"), "C%3Aevil");
        assert_eq!(sanitize_component("tab\there"), "tab%09there");
    }

    #[test]
    fn distinct_item_names_get_distinct_directories() {
        let names = [
            "Club/House",
            "Club_House",
            "Club%2FHouse",
            "Club\\House",
            "Club:House",
            "Bank",
            "Bank ",
            " Bank",
            "",
            "%",
            ".",
            "%2E",
            "..",
        ];
        let dirs: HashSet<String> = names.iter().map(|n| sanitize_component(n)).collect();
        assert_eq!(dirs.len(), names.len());
        for dir in &dirs {
            assert_eq!(Path::new(dir).components().count(), 1, "{dir}");
        }
    }

    #[test]
    fn workspace_paths_follow_label_layout() {
        let ws = Workspace::new("/data", DEFAULT_ARCHIVE_STEM);
        assert_eq!(
            ws.archive_path(RunLabel::First),
            PathBuf::from("/data/r6maps_first.zip")
        );
        assert_eq!(
            ws.digest_path(RunLabel::Second),
            PathBuf::from("/data/hash_second.txt")
        );
        assert_eq!(ws.canonical_archive_path(), PathBuf::from("/data/r6maps.zip"));
        assert_eq!(ws.canonical_digest_path(), PathBuf::from("/data/hash.txt"));
        assert_eq!(ws.staging_dir(), PathBuf::from("/data/maps"));
    }

    #[tokio::test]
    async fn reset_staging_wipes_previous_contents() {
        let dir = tempdir().expect("tempdir");
        let ws = Workspace::new(dir.path(), DEFAULT_ARCHIVE_STEM);

        let staging = ws.reset_staging().await.expect("first reset");
        let leftover = staging.item_dir("Bank");
        std::fs::create_dir_all(&leftover).expect("item dir");
        std::fs::write(leftover.join("1F.png"), b"png").expect("write");

        let staging = ws.reset_staging().await.expect("second reset");
        assert!(staging.path().exists());
        assert!(!leftover.exists());

        staging.release().await.expect("release");
        assert!(!ws.staging_dir().exists());
    }

    #[tokio::test]
    async fn clear_previous_removes_every_invocation_artifact() {
        let dir = tempdir().expect("tempdir");
        let ws = Workspace::new(dir.path(), DEFAULT_ARCHIVE_STEM);
        ws.ensure_root().await.expect("root");

        for path in [
            ws.archive_path(RunLabel::First),
            ws.archive_path(RunLabel::Second),
            ws.canonical_archive_path(),
        ] {
            std::fs::write(path, b"zip").expect("write archive");
        }
        ws.write_digest(RunLabel::First, "aa").await.expect("digest");
        std::fs::write(ws.canonical_digest_path(), b"cc").expect("canonical digest");
        std::fs::write(dir.path().join("notes.txt"), b"keep me").expect("unrelated file");

        ws.clear_previous().await.expect("clear");

        assert!(!ws.archive_path(RunLabel::First).exists());
        assert!(!ws.archive_path(RunLabel::Second).exists());
        assert!(!ws.digest_path(RunLabel::First).exists());
        assert!(!ws.canonical_archive_path().exists());
        assert!(!ws.canonical_digest_path().exists());
        assert!(dir.path().join("notes.txt").exists());

        ws.clear_previous().await.expect("clearing an empty workspace is fine");
    }

    #[tokio::test]
    async fn promote_overwrites_canonical_pair() {
        let dir = tempdir().expect("tempdir");
        let ws = Workspace::new(dir.path(), "maps");
        ws.ensure_root().await.expect("root");
        std::fs::write(ws.canonical_archive_path(), b"old").expect("old archive");
        std::fs::write(ws.archive_path(RunLabel::First), b"new archive").expect("archive");

        ws.promote(RunLabel::First, "deadbeef").await.expect("promote");

        assert_eq!(std::fs::read(ws.canonical_archive_path()).unwrap(), b"new archive");
        assert_eq!(
            std::fs::read_to_string(ws.canonical_digest_path()).unwrap(),
            "deadbeef"
        );
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn default_retry_pauses_double_up_to_ceiling() {
        let policy = RetryPolicy::default();
        let pauses: Vec<u64> = (0..policy.retries + 2)
            .map(|retry| policy.pause_before(retry).as_secs())
            .collect();
        assert_eq!(pauses, vec![1, 2, 4, 8, 8]);
        assert_eq!(policy.pause_before(40), policy.pause_ceiling);
        assert_eq!(RetryPolicy::none().retries, 0);
    }

    #[test]
    fn cdn_throttling_and_timeouts_are_transient() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ] {
            assert!(is_transient_status(status), "{status}");
        }
        for status in [StatusCode::NOT_FOUND, StatusCode::FORBIDDEN, StatusCode::GONE] {
            assert!(!is_transient_status(status), "{status}");
        }
    }

    #[test]
    fn fetch_errors_name_the_url() {
        let err = FetchError::Status {
            status: 404,
            url: "https://maps.test/bank.zip".into(),
        };
        assert_eq!(err.to_string(), "https://maps.test/bank.zip answered 404");
    }
}
