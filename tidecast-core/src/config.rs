//! Centralized configuration for Tidecast.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all Tidecast components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct TidecastConfig {
    pub server: ServerConfig,
    pub library: LibraryConfig,
    pub acquisition: AcquisitionConfig,
    pub normalization: NormalizationConfig,
    pub cast: CastConfig,
    pub pipeline: PipelineConfig,
}

/// HTTP library server configuration.
///
/// The public address is what receivers use to reach the server, which is
/// usually not the address the listener binds to.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address advertised to receivers in playback URLs
    pub public_address: IpAddr,
    /// Address the HTTP listener binds to
    pub bind_address: IpAddr,
    /// Port for both binding and playback URLs
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_address: IpAddr::from([192, 168, 0, 129]),
            bind_address: IpAddr::from([0, 0, 0, 0]),
            port: 8008,
        }
    }
}

impl ServerConfig {
    /// Base URL under which library files are served to receivers.
    pub fn media_base_url(&self) -> String {
        format!("http://{}:{}/videos", self.public_address, self.port)
    }
}

/// Library store configuration.
#[derive(Debug, Clone)]
pub struct LibraryConfig {
    /// Directory holding playable media files
    pub directory: PathBuf,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./videos"),
        }
    }
}

/// Transfer acquisition configuration.
///
/// Controls where sessions download to, how often they are polled and how
/// the downloaded video file is recognized.
#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    /// Root directory for per-session private storage
    pub sessions_dir: PathBuf,
    /// aria2 JSON-RPC endpoint
    pub aria2_url: String,
    /// aria2 RPC secret (sent as `token:<secret>`)
    pub aria2_secret: Option<String>,
    /// Timeout for a single RPC call
    pub rpc_timeout: Duration,
    /// Suffixes (without dot, lowercase) recognized as playable video
    pub video_suffixes: Vec<String>,
    /// How often the session status is polled
    pub poll_interval: Duration,
    /// How often progress is reported to the log
    pub progress_interval: Duration,
    /// Upper bound for a whole transfer (None = unbounded)
    pub transfer_timeout: Option<Duration>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sessions_dir: PathBuf::from("./sessions"),
            aria2_url: "http://127.0.0.1:6800/jsonrpc".to_string(),
            aria2_secret: None,
            rpc_timeout: Duration::from_secs(10),
            video_suffixes: ["mkv", "mp4", "avi", "mov", "wmv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            poll_interval: Duration::from_secs(1),
            progress_interval: Duration::from_secs(3),
            transfer_timeout: None,
        }
    }
}

/// Format normalization configuration.
#[derive(Debug, Clone)]
pub struct NormalizationConfig {
    /// Container suffix receivers cannot play
    pub legacy_suffix: String,
    /// Container suffix legacy files are transcoded into
    pub compatible_suffix: String,
    /// Path or name of the ffmpeg binary
    pub ffmpeg_path: PathBuf,
    /// Path or name of the ffprobe binary
    pub ffprobe_path: PathBuf,
    /// How often transcode progress is reported to the log
    pub progress_interval: Duration,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            legacy_suffix: "mkv".to_string(),
            compatible_suffix: "mp4".to_string(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            progress_interval: Duration::from_secs(3),
        }
    }
}

/// Receiver discovery and playback configuration.
#[derive(Debug, Clone)]
pub struct CastConfig {
    /// Friendly name of the receiver playback is sent to
    pub receiver_name: String,
    /// mDNS service type browsed for receivers
    pub service_type: String,
    /// How long a dispatch waits for the target receiver
    pub discovery_timeout: Duration,
    /// TCP connect timeout for the receiver control channel
    pub connect_timeout: Duration,
    /// How long to wait for the receiver to acknowledge launch and load
    pub command_timeout: Duration,
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            receiver_name: "TV".to_string(),
            service_type: "_googlecast._tcp.local.".to_string(),
            discovery_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(6),
            command_timeout: Duration::from_secs(15),
        }
    }
}

/// Pipeline definition.
///
/// Decides which entry points run the normalization stage.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Normalize files requested by name before dispatch
    pub normalize_local_files: bool,
    /// Normalize files acquired through a transfer before dispatch
    pub normalize_transfers: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            normalize_local_files: true,
            normalize_transfers: true,
        }
    }
}

impl TidecastConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Server configuration overrides
        if let Ok(address) = std::env::var("TIDECAST_PUBLIC_ADDRESS")
            && let Ok(ip) = address.parse::<IpAddr>()
        {
            config.server.public_address = ip;
        }

        if let Ok(address) = std::env::var("TIDECAST_BIND_ADDRESS")
            && let Ok(ip) = address.parse::<IpAddr>()
        {
            config.server.bind_address = ip;
        }

        if let Ok(port) = std::env::var("TIDECAST_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            config.server.port = port;
        }

        // Storage locations
        if let Ok(dir) = std::env::var("TIDECAST_LIBRARY_DIR") {
            config.library.directory = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("TIDECAST_SESSIONS_DIR") {
            config.acquisition.sessions_dir = PathBuf::from(dir);
        }

        // Collaborators
        if let Ok(url) = std::env::var("TIDECAST_ARIA2_URL") {
            config.acquisition.aria2_url = url;
        }

        if let Ok(secret) = std::env::var("TIDECAST_ARIA2_SECRET")
            && !secret.is_empty()
        {
            config.acquisition.aria2_secret = Some(secret);
        }

        if let Ok(path) = std::env::var("TIDECAST_FFMPEG") {
            config.normalization.ffmpeg_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("TIDECAST_FFPROBE") {
            config.normalization.ffprobe_path = PathBuf::from(path);
        }

        // Receiver selection
        if let Ok(name) = std::env::var("TIDECAST_RECEIVER_NAME")
            && !name.is_empty()
        {
            config.cast.receiver_name = name;
        }

        if let Ok(timeout) = std::env::var("TIDECAST_DISCOVERY_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.cast.discovery_timeout = Duration::from_secs(seconds);
        }

        // Pipeline definition
        if let Ok(enabled) = std::env::var("TIDECAST_NORMALIZE_LOCAL") {
            config.pipeline.normalize_local_files = enabled.parse().unwrap_or(true);
        }

        if let Ok(enabled) = std::env::var("TIDECAST_NORMALIZE_TRANSFERS") {
            config.pipeline.normalize_transfers = enabled.parse().unwrap_or(true);
        }

        config
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short intervals keep polling loops fast; storage paths are expected
    /// to be replaced with temporary directories by the caller.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.server.public_address = IpAddr::from([127, 0, 0, 1]);
        config.acquisition.poll_interval = Duration::from_millis(10);
        config.acquisition.progress_interval = Duration::from_millis(20);
        config.normalization.progress_interval = Duration::from_millis(20);
        config.cast.discovery_timeout = Duration::from_millis(500);
        config
    }

    /// Points every storage location at `root`.
    pub fn with_storage_root(mut self, root: &std::path::Path) -> Self {
        self.library.directory = root.join("videos");
        self.acquisition.sessions_dir = root.join("sessions");
        self
    }
}
