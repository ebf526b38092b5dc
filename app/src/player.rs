use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;

/// Reads whatever the external media player currently shows as its title.
#[async_trait]
pub trait TitleQuery: Send + Sync {
    /// `Ok(None)` when the player isn't running or shows no title.
    async fn raw_title(&self) -> Result<Option<String>>;
}

const DECORATIONS: &[&str] = &[
    " - VLC media player",
    "VLC media player",
    " - mpv",
    " — mpv",
    " - MPC-HC",
    " - Media Player Classic",
    " - Windows Media Player",
];

fn extension_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.[A-Za-z0-9]{2,4}$").ok()).as_ref()
}

/// Strips player decorations and a trailing file extension. `None` when
/// nothing usable remains.
pub fn clean_title(raw: &str) -> Option<String> {
    let mut title = raw.trim().to_string();
    for decoration in DECORATIONS {
        if let Some(stripped) = title.strip_suffix(decoration) {
            title = stripped.trim().to_string();
        }
    }
    if let Some(re) = extension_regex() {
        title = re.replace(&title, "").trim().to_string();
    }
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() || title.eq_ignore_ascii_case("vlc") || title.eq_ignore_ascii_case("mpv") {
        None
    } else {
        Some(title)
    }
}

/// Finds the player among the current user's processes in `/proc` and uses
/// the file name of the media it was started with.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct ProcTitleQuery {
    process_name: String,
}

#[cfg(target_os = "linux")]
impl ProcTitleQuery {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
        }
    }

    fn scan(&self) -> Result<Option<String>> {
        use anyhow::Context;

        let current_uid = unsafe { libc::getuid() };
        let proc_dir = std::fs::read_dir("/proc").context("Failed to read /proc")?;

        for entry in proc_dir.flatten() {
            let path = entry.path();
            let is_pid = path
                .file_name()
                .map(|name| name.to_string_lossy().chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false);
            if !is_pid {
                continue;
            }

            let Ok(comm) = std::fs::read_to_string(path.join("comm")) else {
                continue;
            };
            if comm.trim() != self.process_name {
                continue;
            }
            if !owned_by(&path, current_uid) {
                continue;
            }

            let Ok(cmdline) = std::fs::read(path.join("cmdline")) else {
                continue;
            };
            return Ok(media_argument(&cmdline));
        }
        Ok(None)
    }
}

#[cfg(target_os = "linux")]
fn owned_by(proc_path: &Path, uid: u32) -> bool {
    std::fs::read_to_string(proc_path.join("status"))
        .map(|status| {
            status.lines().any(|line| {
                line.starts_with("Uid:")
                    && line
                        .split_whitespace()
                        .nth(1)
                        .and_then(|uid_str| uid_str.parse::<u32>().ok())
                        .is_some_and(|found| found == uid)
            })
        })
        .unwrap_or(false)
}

/// Last non-option argument of a NUL-separated command line, reduced to its
/// file name.
pub fn media_argument(cmdline: &[u8]) -> Option<String> {
    let args = String::from_utf8_lossy(cmdline);
    args.split('\0')
        .skip(1)
        .filter(|arg| !arg.is_empty() && !arg.starts_with('-'))
        .last()
        .map(|arg| {
            let arg = arg.strip_prefix("file://").unwrap_or(arg);
            Path::new(arg)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| arg.to_string())
        })
}

#[cfg(target_os = "linux")]
#[async_trait]
impl TitleQuery for ProcTitleQuery {
    async fn raw_title(&self) -> Result<Option<String>> {
        let query = self.clone();
        tokio::task::spawn_blocking(move || query.scan()).await?
    }
}

/// Title query for the configured player process, if this platform has one.
pub fn for_process(process_name: &str) -> Option<Arc<dyn TitleQuery>> {
    #[cfg(target_os = "linux")]
    {
        Some(Arc::new(ProcTitleQuery::new(process_name)))
    }
    #[cfg(windows)]
    {
        Some(Arc::new(WindowTitleQuery::new(process_name)))
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        tracing::warn!(process_name, "player title lookup is not supported on this platform");
        None
    }
}

/// Reads the player's window title from `tasklist`.
#[cfg(windows)]
#[derive(Debug, Clone)]
pub struct WindowTitleQuery {
    image_name: String,
}

#[cfg(windows)]
impl WindowTitleQuery {
    pub fn new(process_name: impl Into<String>) -> Self {
        let mut image_name = process_name.into();
        if !image_name.to_ascii_lowercase().ends_with(".exe") {
            image_name.push_str(".exe");
        }
        Self { image_name }
    }
}

#[cfg(windows)]
#[async_trait]
impl TitleQuery for WindowTitleQuery {
    async fn raw_title(&self) -> Result<Option<String>> {
        let output = tokio::process::Command::new("tasklist")
            .args(["/v", "/fo", "csv", "/nh", "/fi"])
            .arg(format!("IMAGENAME eq {}", self.image_name))
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(|line| csv_fields(line).pop())
            .find(|title| !title.is_empty() && title != "N/A"))
    }
}

/// Splits one line of quoted CSV as printed by `tasklist /fo csv`.
pub fn csv_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.trim().chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    if !line.trim().is_empty() {
        fields.push(current);
    }
    fields
}
