#![forbid(unsafe_code)]

//! Thin async wrapper around the `yt-dlp` command line tool.
//!
//! Three invocations are supported: a metadata dump, a download into the
//! shared download directory, and a download written to stdout. The URL is
//! always passed after `--` so a value starting with a dash can never be read
//! as an option.

use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    process::Stdio,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::{ChildStderr, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::{
    artifact::TempArtifact,
    media::{RawVideoInfo, VideoMetadata},
    relay::{Guarded, ProcessGuard, TERMINATE_GRACE},
};

/// Retry count handed to yt-dlp for downloads.
pub const DOWNLOAD_RETRIES: u32 = 3;
/// Read size for file and pipe relays.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;
const STDERR_TAIL_LINES: usize = 20;

const UNAVAILABLE_MARKERS: &[&str] = &[
    "video unavailable",
    "this video is unavailable",
    "private video",
    "sign in to confirm your age",
    "age-restricted",
    "not available in your country",
    "has been removed",
    "members-only",
];

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("yt-dlp executable not found at {}", .0.display())]
    NotInstalled(PathBuf),
    #[error("running yt-dlp: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported URL: {detail}")]
    UnsupportedUrl { detail: String },
    #[error("video unavailable: {detail}")]
    Unavailable { detail: String },
    #[error("format not available: {detail}")]
    FormatUnavailable { detail: String },
    #[error("yt-dlp failed: {detail}")]
    Failed { detail: String },
    #[error("parsing yt-dlp output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("yt-dlp reported success but no output file was found")]
    MissingOutput,
    #[error("downloaded file {} is empty", .0.display())]
    EmptyOutput(PathBuf),
}

impl ExtractorError {
    /// Stable text for HTTP clients. Never contains paths or raw tool output.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::NotInstalled(_) => "Downloader is not available on this server",
            Self::Io(_) => "Internal error while running the downloader",
            Self::UnsupportedUrl { .. } => "Unsupported or invalid video URL",
            Self::Unavailable { .. } => {
                "Video unavailable. It may be private or restricted in this region"
            }
            Self::FormatUnavailable { .. } => "Requested format is not available for this video",
            Self::Failed { .. } => "Could not process this video",
            Self::Parse(_) => "Unexpected response from the downloader",
            Self::MissingOutput => "Download failed: file not found",
            Self::EmptyOutput(_) => "Download failed: file is empty",
        }
    }

    /// Failures caused by the requested URL or format rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedUrl { .. }
                | Self::Unavailable { .. }
                | Self::FormatUnavailable { .. }
                | Self::Failed { .. }
        )
    }
}

/// Maps yt-dlp's stderr to an error variant. The last `ERROR:` line is the
/// one that describes the failure; warnings and progress noise come before it.
pub fn classify_failure(stderr: &str) -> ExtractorError {
    let mut lines = stderr.lines().rev().map(str::trim);
    let line = lines
        .clone()
        .find(|line| line.starts_with("ERROR"))
        .or_else(|| lines.find(|line| !line.is_empty()))
        .unwrap_or_default();
    let detail = line
        .strip_prefix("ERROR:")
        .map(str::trim)
        .unwrap_or(line)
        .to_string();
    let detail = if detail.is_empty() {
        "yt-dlp exited without an error message".to_string()
    } else {
        detail
    };

    let lower = detail.to_ascii_lowercase();
    if lower.contains("unsupported url") || lower.contains("is not a valid url") {
        ExtractorError::UnsupportedUrl { detail }
    } else if lower.contains("requested format") {
        ExtractorError::FormatUnavailable { detail }
    } else if UNAVAILABLE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
    {
        ExtractorError::Unavailable { detail }
    } else {
        ExtractorError::Failed { detail }
    }
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    geo_bypass: bool,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            geo_bypass: true,
        }
    }

    pub fn with_geo_bypass(mut self, enabled: bool) -> Self {
        self.geo_bypass = enabled;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Base invocation shared by every mode.
    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(["--no-playlist", "--no-warnings", "--no-progress"])
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if self.geo_bypass {
            command.arg("--geo-bypass");
        }
        command
    }

    fn spawn_error(&self, err: io::Error) -> ExtractorError {
        if err.kind() == io::ErrorKind::NotFound {
            ExtractorError::NotInstalled(self.binary.clone())
        } else {
            ExtractorError::Io(err)
        }
    }

    /// Runs `yt-dlp --version`. Used as a startup probe.
    pub async fn version(&self) -> Result<String, ExtractorError> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| self.spawn_error(err))?;
        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn fetch_info(&self, url: &str) -> Result<VideoMetadata, ExtractorError> {
        let mut command = self.command();
        command
            .args(["--dump-single-json", "--skip-download", "--"])
            .arg(url);
        let output = command
            .output()
            .await
            .map_err(|err| self.spawn_error(err))?;

        if !output.status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
        }

        let raw: RawVideoInfo = serde_json::from_slice(&output.stdout)?;
        Ok(VideoMetadata::from_raw(raw))
    }

    /// Downloads `format_id` into `dir` under a fresh random name. On any
    /// failure every file carrying that name is removed before returning.
    pub async fn download(
        &self,
        dir: &Path,
        url: &str,
        format_id: &str,
    ) -> Result<DownloadedFile, ExtractorError> {
        let artifact = TempArtifact::new(dir);
        let mut command = self.command();
        command
            .arg(format!("--format={format_id}"))
            .arg("--output")
            .arg(artifact.output_template())
            .arg("--retries")
            .arg(DOWNLOAD_RETRIES.to_string())
            .args(["--print", "after_move:filepath", "--"])
            .arg(url);

        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!("downloading format {format_id} as {}", artifact.stem());
        let mut child = command.spawn().map_err(|err| self.spawn_error(err))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("yt-dlp stdout was not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("yt-dlp stderr was not captured"))?;
        // From here on the guard owns the artifact: if this future is
        // dropped, the files are removed only after the process group is gone.
        let label = format!("yt-dlp[{}]", child.id().unwrap_or_default());
        let mut guard = ProcessGuard::new(child, label).with_artifact(artifact);

        let mut printed = Vec::new();
        let mut errors = Vec::new();
        let (out, err) = tokio::join!(
            stdout.read_to_end(&mut printed),
            stderr.read_to_end(&mut errors)
        );
        out?;
        err?;
        let status = guard.wait().await?;
        let mut artifact = guard
            .take_artifact()
            .ok_or_else(|| io::Error::other("download artifact went missing"))?;

        if !status.success() {
            return Err(classify_failure(&String::from_utf8_lossy(&errors)));
        }

        let printed = String::from_utf8_lossy(&printed);
        let path = printed
            .lines()
            .rev()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .find(|path| artifact.owns(path) && path.is_file())
            .or_else(|| artifact.find_output())
            .ok_or(ExtractorError::MissingOutput)?;
        artifact.bind(path.clone());

        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|_| ExtractorError::MissingOutput)?
            .len();
        if size == 0 {
            return Err(ExtractorError::EmptyOutput(path));
        }

        Ok(DownloadedFile {
            artifact,
            path,
            size,
        })
    }

    /// Spawns yt-dlp writing `format_id` to stdout. The process is stopped
    /// when the returned stream is dropped.
    pub fn stream(&self, url: &str, format_id: &str) -> Result<StdoutStream, ExtractorError> {
        let mut command = self.command();
        command
            .arg(format!("--format={format_id}"))
            .args(["--output", "-", "--quiet"])
            .arg("--retries")
            .arg(DOWNLOAD_RETRIES.to_string())
            .arg("--")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| self.spawn_error(err))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("yt-dlp stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("yt-dlp stderr was not captured"))?;

        let label = format!("yt-dlp[{}]", child.id().unwrap_or_default());
        debug!("{label}: streaming format {format_id}");
        let reader = ReaderStream::with_capacity(stdout, STREAM_CHUNK_SIZE);

        Ok(StdoutStream {
            body: Guarded::new(reader, ProcessGuard::new(child, label.clone())),
            stderr: StderrTail::spawn(stderr, label),
        })
    }
}

/// A finished download owned by the request that created it.
#[derive(Debug)]
pub struct DownloadedFile {
    artifact: TempArtifact,
    path: PathBuf,
    size: u64,
}

impl DownloadedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|ext| ext.to_str())
    }

    /// Opens the file as a body stream. The file is deleted when the stream
    /// ends or is dropped.
    pub async fn into_stream(self) -> io::Result<Guarded<ReaderStream<File>, TempArtifact>> {
        let file = File::open(&self.path).await?;
        Ok(Guarded::new(
            ReaderStream::with_capacity(file, STREAM_CHUNK_SIZE),
            self.artifact,
        ))
    }
}

/// yt-dlp's stdout as a byte stream.
pub struct StdoutStream {
    body: Guarded<ReaderStream<ChildStdout>, ProcessGuard>,
    stderr: StderrTail,
}

impl StdoutStream {
    pub fn pid(&self) -> Option<u32> {
        self.body.guard().id()
    }

    /// Turns a stream that produced no data into the error yt-dlp reported.
    pub async fn into_failure(self) -> ExtractorError {
        let (reader, mut guard) = self.body.into_parts();
        drop(reader);

        match timeout(TERMINATE_GRACE, guard.wait()).await {
            Ok(Ok(status)) => debug!("yt-dlp exited with {status} before producing output"),
            Ok(Err(err)) => warn!("waiting for yt-dlp failed: {err}"),
            Err(_) => warn!("yt-dlp kept running without producing output"),
        }

        classify_failure(&self.stderr.finish().await)
    }
}

impl Stream for StdoutStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().body).poll_next(cx)
    }
}

/// Drains a child's stderr so it never blocks on a full pipe, keeping the
/// last few lines for error reporting.
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    task: JoinHandle<()>,
}

impl StderrTail {
    fn spawn(stderr: ChildStderr, label: String) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let sink = Arc::clone(&lines);
        let task = tokio::spawn(async move {
            let mut segments = BufReader::new(stderr).split(b'\n');
            loop {
                match segments.next_segment().await {
                    Ok(Some(raw)) => {
                        let line = String::from_utf8_lossy(&raw).trim_end().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        debug!("{label}: {line}");
                        let mut tail = sink.lock();
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!("{label}: stderr read failed: {err}");
                        break;
                    }
                }
            }
        });
        Self { lines, task }
    }

    async fn finish(self) -> String {
        if timeout(TERMINATE_GRACE, self.task).await.is_err() {
            debug!("stderr reader still open after exit");
        }
        self.lines.lock().iter().cloned().collect::<Vec<_>>().join("\n")
    }
}
