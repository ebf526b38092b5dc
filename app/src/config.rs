use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::Parser;

use crate::script::ScriptPaths;

#[derive(Parser, Debug)]
#[command(author, version, about = "Community mode, vote and download controller for a chat channel")]
pub struct Cli {
    /// Bridge executable speaking the JSON-lines protocol on stdin/stdout
    #[arg(long = "bridge-bin", value_name = "CMD", env = "CHANNEL_BRIDGE_BIN")]
    pub bridge_bin: Option<PathBuf>,

    /// Extra argument passed to the bridge executable (repeatable)
    #[arg(long = "bridge-arg", value_name = "ARG", env = "CHANNEL_BRIDGE_ARGS", value_delimiter = ',')]
    pub bridge_args: Vec<String>,

    /// Speak the bridge protocol on this process's own stdin/stdout
    #[arg(long = "bridge-stdio", default_value_t = false, conflicts_with = "bridge_bin")]
    pub bridge_stdio: bool,

    /// Venue (voice channel) the scheduled event is attached to
    #[arg(long, value_name = "ID", env = "CHANNEL_VENUE")]
    pub venue: String,

    #[arg(long = "enter-custom-script", value_name = "PATH", env = "CHANNEL_ENTER_CUSTOM_SCRIPT")]
    pub enter_custom_script: Option<PathBuf>,

    #[arg(long = "exit-custom-script", value_name = "PATH", env = "CHANNEL_EXIT_CUSTOM_SCRIPT")]
    pub exit_custom_script: Option<PathBuf>,

    #[arg(long = "skip-script", value_name = "PATH", env = "CHANNEL_SKIP_SCRIPT")]
    pub skip_script: Option<PathBuf>,

    #[arg(long = "play-file-script", value_name = "PATH", env = "CHANNEL_PLAY_FILE_SCRIPT")]
    pub play_file_script: Option<PathBuf>,

    #[arg(long = "download-dir", value_name = "DIR", env = "CHANNEL_DOWNLOAD_DIR")]
    pub download_dir: PathBuf,

    /// Root of the files that may be played on request
    #[arg(long = "media-dir", value_name = "DIR", env = "CHANNEL_MEDIA_DIR")]
    pub media_dir: Option<PathBuf>,

    #[arg(long = "yt-dlp-bin", value_name = "CMD", default_value = "yt-dlp", env = "CHANNEL_YT_DLP_BIN")]
    pub yt_dlp: PathBuf,

    /// Process name of the media player whose title is mirrored in custom mode
    #[arg(long = "player-process", value_name = "NAME", env = "CHANNEL_PLAYER_PROCESS")]
    pub player_process: Option<String>,

    #[arg(long = "mode-vote-secs", default_value_t = 60, env = "CHANNEL_MODE_VOTE_SECS")]
    pub mode_vote_secs: u64,

    #[arg(long = "file-vote-secs", default_value_t = 30, env = "CHANNEL_FILE_VOTE_SECS")]
    pub file_vote_secs: u64,

    #[arg(long = "skip-vote-secs", default_value_t = 30, env = "CHANNEL_SKIP_VOTE_SECS")]
    pub skip_vote_secs: u64,

    #[arg(long = "skip-vote-decrement-secs", default_value_t = 5, env = "CHANNEL_SKIP_VOTE_DECREMENT_SECS")]
    pub skip_vote_decrement_secs: u64,

    #[arg(long = "skip-vote-floor-secs", default_value_t = 10, env = "CHANNEL_SKIP_VOTE_FLOOR_SECS")]
    pub skip_vote_floor_secs: u64,

    #[arg(long = "vote-refresh-secs", default_value_t = 5, env = "CHANNEL_VOTE_REFRESH_SECS")]
    pub vote_refresh_secs: u64,

    #[arg(long = "still-watching-mins", default_value_t = 120, env = "CHANNEL_STILL_WATCHING_MINS")]
    pub still_watching_mins: u64,

    #[arg(long = "still-watching-window-secs", default_value_t = 300, env = "CHANNEL_STILL_WATCHING_WINDOW_SECS")]
    pub still_watching_window_secs: u64,

    #[arg(long = "title-poll-secs", default_value_t = 15, env = "CHANNEL_TITLE_POLL_SECS")]
    pub title_poll_secs: u64,

    #[arg(long = "event-refresh-secs", default_value_t = 300, env = "CHANNEL_EVENT_REFRESH_SECS")]
    pub event_refresh_secs: u64,

    #[arg(long = "bridge-timeout-secs", default_value_t = 15, env = "CHANNEL_BRIDGE_TIMEOUT_SECS")]
    pub bridge_timeout_secs: u64,

    #[arg(long = "shutdown-grace-secs", default_value_t = 10, env = "CHANNEL_SHUTDOWN_GRACE_SECS")]
    pub shutdown_grace_secs: u64,

    #[arg(long = "custom-label", default_value = "Custom Mode", env = "CHANNEL_CUSTOM_LABEL")]
    pub custom_label: String,

    #[arg(long = "custom-prefix", default_value = "Custom: ", env = "CHANNEL_CUSTOM_PREFIX")]
    pub custom_prefix: String,

    #[arg(long = "placeholder-title", default_value = "Off Air", env = "CHANNEL_PLACEHOLDER_TITLE")]
    pub placeholder_title: String,
}

/// Every duration the core runs on.
#[derive(Debug, Clone)]
pub struct Timings {
    pub mode_vote: Duration,
    pub file_vote: Duration,
    pub skip_vote_base: Duration,
    pub skip_vote_decrement: Duration,
    pub skip_vote_floor: Duration,
    pub vote_refresh: Duration,
    pub still_watching_after: Duration,
    pub still_watching_window: Duration,
    pub title_poll: Duration,
    pub event_refresh_after: Duration,
    pub bridge_request_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            mode_vote: Duration::from_secs(60),
            file_vote: Duration::from_secs(30),
            skip_vote_base: Duration::from_secs(30),
            skip_vote_decrement: Duration::from_secs(5),
            skip_vote_floor: Duration::from_secs(10),
            vote_refresh: Duration::from_secs(5),
            still_watching_after: Duration::from_secs(120 * 60),
            still_watching_window: Duration::from_secs(300),
            title_poll: Duration::from_secs(15),
            event_refresh_after: Duration::from_secs(300),
            bridge_request_timeout: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Timings {
    /// Skip votes get shorter with every consecutive skip, down to the floor.
    pub fn skip_vote_duration(&self, streak: u32) -> Duration {
        self.skip_vote_base
            .saturating_sub(self.skip_vote_decrement.saturating_mul(streak))
            .max(self.skip_vote_floor)
    }
}

#[derive(Debug, Clone)]
pub struct Labels {
    pub custom_label: String,
    pub custom_prefix: String,
    pub placeholder_title: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            custom_label: "Custom Mode".to_string(),
            custom_prefix: "Custom: ".to_string(),
            placeholder_title: "Off Air".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BridgeTarget {
    Process { bin: PathBuf, args: Vec<String> },
    Stdio,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub bridge: BridgeTarget,
    pub venue: String,
    pub scripts: ScriptPaths,
    pub download_dir: PathBuf,
    pub media_dir: Option<PathBuf>,
    pub yt_dlp: PathBuf,
    pub player_process: Option<String>,
    pub timings: Timings,
    pub labels: Labels,
}

impl Cli {
    pub fn into_config(self) -> Result<ControllerConfig> {
        let bridge = match (self.bridge_bin, self.bridge_stdio) {
            (Some(bin), _) => {
                let bin = bin.canonicalize().context("bridge binary missing")?;
                ensure!(
                    bin.is_file(),
                    "bridge binary must be an executable file (got {:?})",
                    bin
                );
                BridgeTarget::Process {
                    bin,
                    args: self.bridge_args,
                }
            }
            (None, true) => BridgeTarget::Stdio,
            (None, false) => anyhow::bail!("either --bridge-bin or --bridge-stdio must be provided"),
        };

        ensure!(!self.venue.trim().is_empty(), "--venue must not be empty");

        if !self.download_dir.exists() {
            std::fs::create_dir_all(&self.download_dir)
                .with_context(|| format!("Creating download directory {:?}", self.download_dir))?;
        }
        let download_dir = self
            .download_dir
            .canonicalize()
            .context("download directory missing")?;
        ensure!(
            download_dir.is_dir(),
            "download directory must be a directory (got {:?})",
            download_dir
        );

        let media_dir = match self.media_dir {
            Some(dir) => {
                let dir = dir.canonicalize().context("media directory missing")?;
                ensure!(dir.is_dir(), "media directory must be a directory (got {:?})", dir);
                Some(dir)
            }
            None => None,
        };

        // Script paths stay optional here: an unset or missing script only
        // fails the action that needs it.
        let scripts = ScriptPaths {
            enter_custom: self.enter_custom_script,
            exit_custom: self.exit_custom_script,
            skip: self.skip_script,
            play_file: self.play_file_script,
        };

        let timings = Timings {
            mode_vote: Duration::from_secs(self.mode_vote_secs.max(1)),
            file_vote: Duration::from_secs(self.file_vote_secs.max(1)),
            skip_vote_base: Duration::from_secs(self.skip_vote_secs.max(1)),
            skip_vote_decrement: Duration::from_secs(self.skip_vote_decrement_secs),
            skip_vote_floor: Duration::from_secs(self.skip_vote_floor_secs.max(1)),
            vote_refresh: Duration::from_secs(self.vote_refresh_secs.max(1)),
            still_watching_after: Duration::from_secs(self.still_watching_mins.max(1) * 60),
            still_watching_window: Duration::from_secs(self.still_watching_window_secs.max(1)),
            title_poll: Duration::from_secs(self.title_poll_secs.max(1)),
            event_refresh_after: Duration::from_secs(self.event_refresh_secs),
            bridge_request_timeout: Duration::from_secs(self.bridge_timeout_secs.max(1)),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs.max(1)),
        };

        Ok(ControllerConfig {
            bridge,
            venue: self.venue,
            scripts,
            download_dir,
            media_dir,
            yt_dlp: self.yt_dlp,
            player_process: self.player_process.filter(|name| !name.trim().is_empty()),
            timings,
            labels: Labels {
                custom_label: self.custom_label,
                custom_prefix: self.custom_prefix,
                placeholder_title: self.placeholder_title,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_vote_shrinks_to_floor() {
        let timings = Timings::default();
        assert_eq!(timings.skip_vote_duration(0), Duration::from_secs(30));
        assert_eq!(timings.skip_vote_duration(2), Duration::from_secs(20));
        assert_eq!(timings.skip_vote_duration(4), Duration::from_secs(10));
        assert_eq!(timings.skip_vote_duration(50), Duration::from_secs(10));
    }

    #[test]
    fn cli_builds_config() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        let cli = Cli::parse_from([
            "channel-controller",
            "--bridge-stdio",
            "--venue",
            "1234",
            "--download-dir",
            downloads.to_str().unwrap(),
            "--skip-vote-secs",
            "40",
        ]);
        let config = cli.into_config().unwrap();
        assert!(matches!(config.bridge, BridgeTarget::Stdio));
        assert!(downloads.is_dir());
        assert_eq!(config.timings.skip_vote_base, Duration::from_secs(40));
        assert!(config.scripts.enter_custom.is_none());
        assert!(config.player_process.is_none());
    }

    #[test]
    fn cli_requires_a_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "channel-controller",
            "--venue",
            "1234",
            "--download-dir",
            dir.path().to_str().unwrap(),
        ]);
        assert!(cli.into_config().is_err());
    }
}
