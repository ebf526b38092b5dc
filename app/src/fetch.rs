use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FetchError;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchProgress {
    pub percent: f32,
    pub eta: Option<String>,
}

/// Downloads (and transcodes) a remote video into a directory.
#[async_trait]
pub trait VideoFetcher: Send + Sync {
    /// Where `fetch` would write the finished file.
    async fn predict_output_path(&self, url: &str, target_dir: &Path) -> Result<PathBuf, FetchError>;

    /// Resolves with `Err(FetchError::Cancelled)` when the token fires while
    /// the tool is still running; a run that finishes right as the token fires
    /// may still resolve `Ok`.
    async fn fetch(
        &self,
        url: &str,
        target_dir: &Path,
        progress: mpsc::UnboundedSender<FetchProgress>,
        cancel: CancellationToken,
    ) -> Result<(), FetchError>;
}

const OUTPUT_TEMPLATE: &str = "%(title).120B [%(id)s].%(ext)s";
const PROGRESS_TEMPLATE: &str = "download:%(progress._percent_str)s|%(progress._eta_str)s";
const STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    binary: PathBuf,
    retries: u32,
}

impl YtDlpFetcher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            retries: 3,
        }
    }

    fn base_command(&self, url: &str, target_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.arg("--no-playlist")
            .arg("--no-colors")
            .arg("--restrict-filenames")
            .arg("-f")
            .arg("bv*+ba/b")
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("-P")
            .arg(target_dir)
            .arg("-o")
            .arg(OUTPUT_TEMPLATE);
        cmd.arg(url);
        cmd
    }

    fn spawn_error(&self, err: std::io::Error) -> FetchError {
        if err.kind() == std::io::ErrorKind::NotFound {
            FetchError::ToolMissing {
                tool: self.binary.to_string_lossy().into_owned(),
            }
        } else {
            FetchError::Io(err)
        }
    }
}

#[async_trait]
impl VideoFetcher for YtDlpFetcher {
    async fn predict_output_path(&self, url: &str, target_dir: &Path) -> Result<PathBuf, FetchError> {
        let mut cmd = self.base_command(url, target_dir);
        cmd.arg("--simulate").arg("--print").arg("filename");
        let output = cmd.output().await.map_err(|err| self.spawn_error(err))?;

        if !output.status.success() {
            return Err(FetchError::Tool {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(PathBuf::from)
            .ok_or(FetchError::NoPrediction)
    }

    async fn fetch(
        &self,
        url: &str,
        target_dir: &Path,
        progress: mpsc::UnboundedSender<FetchProgress>,
        cancel: CancellationToken,
    ) -> Result<(), FetchError> {
        let mut cmd = self.base_command(url, target_dir);
        cmd.arg("--newline")
            .arg("--progress-template")
            .arg(PROGRESS_TEMPLATE)
            .arg("--retries")
            .arg(self.retries.to_string())
            .arg("--fragment-retries")
            .arg(self.retries.to_string());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| self.spawn_error(err))?;
        info!(url, pid = ?child.id(), "yt-dlp started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Io(std::io::Error::other("yt-dlp stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| FetchError::Io(std::io::Error::other("yt-dlp stderr not captured")))?;

        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(update) = parse_progress_line(&line) {
                    let _ = progress.send(update);
                } else if !line.trim().is_empty() {
                    debug!("[yt-dlp] {}", line.trim());
                }
            }
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buf).await;
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                stop_child(&mut child).await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                info!(url, "yt-dlp stopped after cancellation");
                return Err(FetchError::Cancelled);
            }
        };

        let _ = stdout_task.await;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            warn!(url, code = ?status.code(), stderr = %stderr.trim(), "yt-dlp failed");
            return Err(FetchError::Tool {
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Interrupt first so yt-dlp can stop its ffmpeg children, kill if it lingers.
#[cfg(unix)]
async fn stop_child(child: &mut Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT);
    }
    if timeout(STOP_GRACE, child.wait()).await.is_err() {
        warn!("yt-dlp ignored SIGINT, killing");
        let _ = child.kill().await;
    }
}

#[cfg(not(unix))]
async fn stop_child(child: &mut Child) {
    if let Err(err) = child.kill().await {
        warn!("failed to kill yt-dlp: {err}");
    }
}

fn progress_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^download:\s*(\d{1,3}(?:\.\d+)?)%\s*\|\s*(.*)$").ok())
        .as_ref()
}

pub fn parse_progress_line(line: &str) -> Option<FetchProgress> {
    let caps = progress_regex()?.captures(line.trim())?;
    let percent = caps[1].parse::<f32>().ok()?.clamp(0.0, 100.0);
    let eta = caps
        .get(2)
        .map(|m| m.as_str().trim())
        .filter(|eta| !eta.is_empty() && !eta.eq_ignore_ascii_case("NA") && *eta != "Unknown")
        .map(str::to_string);
    Some(FetchProgress { percent, eta })
}

/// Best-effort identifier for a source URL, used when the output path can't
/// be predicted.
pub fn source_identifier(url: &str) -> String {
    let trimmed = url.trim();
    let without_query = trimmed.split(['?', '#']).next().unwrap_or(trimmed);

    let query_id = trimmed
        .split_once('?')
        .map(|(_, query)| query.split('#').next().unwrap_or_default())
        .and_then(|query| query.split('&').find_map(|pair| pair.strip_prefix("v=")))
        .filter(|id| !id.is_empty());

    let id = match query_id {
        Some(id) => id.to_string(),
        None => without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    let cleaned: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();
    if cleaned.trim_matches('_').is_empty() {
        "video".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_with_eta() {
        let update = parse_progress_line("download:  45.2%|00:31").unwrap();
        assert_eq!(update.percent, 45.2);
        assert_eq!(update.eta.as_deref(), Some("00:31"));
    }

    #[test]
    fn parses_progress_without_eta() {
        let update = parse_progress_line("download:100.0%|NA").unwrap();
        assert_eq!(update.percent, 100.0);
        assert_eq!(update.eta, None);
    }

    #[test]
    fn ignores_other_lines() {
        assert!(parse_progress_line("[info] Writing video subtitles").is_none());
        assert!(parse_progress_line("").is_none());
    }

    #[test]
    fn identifier_from_watch_url() {
        assert_eq!(
            source_identifier("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=10"),
            "dQw4w9WgXcQ"
        );
    }

    #[test]
    fn identifier_from_path_segment() {
        assert_eq!(source_identifier("https://youtu.be/abc123?si=xyz"), "abc123");
        assert_eq!(source_identifier("https://example.com/clips/my.video/"), "my_video");
    }

    #[test]
    fn identifier_never_empty() {
        assert_eq!(source_identifier("https://example.com/?"), "example_com");
        assert_eq!(source_identifier("???"), "video");
    }

    #[test]
    fn identifier_only_reads_v_from_the_query() {
        assert_eq!(source_identifier("https://x.example/dev=1/clip"), "clip");
        assert_eq!(source_identifier("https://x.example/watch?list=a&v=xyz9#t"), "xyz9");
        assert_eq!(source_identifier("https://x.example/play?nav=2"), "play");
    }

    #[tokio::test]
    async fn stopping_a_child_ends_it() {
        let mut child = Command::new(if cfg!(windows) { "ping" } else { "sleep" })
            .args(if cfg!(windows) { &["-n", "30", "127.0.0.1"][..] } else { &["30"][..] })
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), stop_child(&mut child))
            .await
            .unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }
}
