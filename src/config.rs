//! Configuration for the orchestration core, loaded the way the teacher's
//! `CcswarmConfig` is loaded, but layered through the `config` crate so
//! environment variables (`CCORE_*`) can override a base file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Every environment/config key named in §6, plus the component defaults
/// named throughout §4, so `CoreConfig::default()` is already spec-compliant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Root of persisted state, e.g. `<home>/sessions/...`, `<home>/attachments/...`.
    pub home_directory: PathBuf,

    /// Optional OAuth brokering endpoint.
    pub proxy_url: Option<String>,

    /// §4.8 admission cap, per repository.
    pub max_concurrent_sessions: usize,

    /// §4.6 agent-restart retry budget (separate from validation iterations).
    pub max_retries: u32,

    /// §4.5 validation loop iteration cap.
    pub max_iterations: u32,

    /// §4.5/§8 P7: whether a validated subroutine that exhausts
    /// `max_iterations` still advances the procedure (`true`) or fails the
    /// whole session (`false`).
    pub continue_on_max_retries: bool,

    /// §4.2 per-prompt attachment count cap.
    pub max_attachments: usize,

    /// §4.2 per-attachment size cap, in bytes.
    pub max_attachment_bytes: u64,

    pub webhook_secret: String,
    pub oauth_client_id: Option<String>,
    pub oauth_client_secret: Option<String>,

    pub host: String,
    pub port: u16,
    /// Bind all interfaces instead of loopback only.
    pub host_external: bool,

    /// §4.8 bounded FIFO admission queue length.
    pub max_queue_depth: usize,

    /// §4.4 adapter event buffer before dropping non-tool events.
    pub event_buffer_high_watermark: usize,

    /// §4.6/§4.4 grace period waited for a terminal event after `stop`.
    pub stop_grace_period: Duration,

    /// §4.6 tracker-comment coalescing window for consecutive `text` activities.
    pub comment_batch_window: Duration,

    /// §4.7 sliding dedup window for webhook event ids.
    pub webhook_dedup_window: Duration,
    /// §4.7 dedup LRU capacity.
    pub webhook_dedup_capacity: usize,
    /// §4.7 max time `SessionManager.handleEvent` dispatch may take.
    pub webhook_ack_timeout: Duration,

    /// §4.7 OAuth pending-callback expiry.
    pub oauth_pending_timeout: Duration,
    /// §4.7 CSRF state expiry.
    pub oauth_state_timeout: Duration,
    /// Approval request expiry (§5).
    pub approval_timeout: Duration,

    /// Default network call timeout (§5), unless a collaborator overrides it.
    pub network_timeout: Duration,

    /// §4.8 grace period for shutdown to let supervisors finish.
    pub shutdown_grace: Duration,

    /// §1 debug-mode flag; both `--fake-data` and `--demo` style entrypoints
    /// collapse to this single boolean per the §9 open question.
    pub debug_mode: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            home_directory: PathBuf::from("."),
            proxy_url: None,
            max_concurrent_sessions: 1,
            max_retries: 3,
            max_iterations: 4,
            continue_on_max_retries: false,
            max_attachments: 10,
            max_attachment_bytes: 10 * 1024 * 1024,
            webhook_secret: String::new(),
            oauth_client_id: None,
            oauth_client_secret: None,
            host: "127.0.0.1".to_string(),
            port: 8787,
            host_external: false,
            max_queue_depth: 100,
            event_buffer_high_watermark: 1024,
            stop_grace_period: Duration::from_secs(5),
            comment_batch_window: Duration::from_millis(750),
            webhook_dedup_window: Duration::from_secs(600),
            webhook_dedup_capacity: 10_000,
            webhook_ack_timeout: Duration::from_secs(3),
            oauth_pending_timeout: Duration::from_secs(300),
            oauth_state_timeout: Duration::from_secs(600),
            approval_timeout: Duration::from_secs(1800),
            network_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            debug_mode: false,
        }
    }
}

impl CoreConfig {
    /// Loads configuration by layering `CoreConfig::default()`, an optional
    /// file (TOML/JSON/YAML, detected by extension), and `CCORE_`-prefixed
    /// environment variables, in that order of increasing precedence.
    pub fn load(file: Option<PathBuf>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&defaults)?,
        );

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(config::Environment::with_prefix("CCORE").separator("__"));

        let built = builder.build()?;
        let cfg: Self = built.try_deserialize()?;
        Ok(cfg)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.home_directory.join("sessions")
    }

    pub fn attachments_dir(&self, issue_id: &str) -> PathBuf {
        self.home_directory.join("attachments").join(issue_id)
    }

    pub fn bind_addr(&self) -> String {
        let host = if self.host_external {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        format!("{}:{}", host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_numbers() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.max_concurrent_sessions, 1);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.max_iterations, 4);
        assert_eq!(cfg.max_attachments, 10);
        assert_eq!(cfg.max_attachment_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.event_buffer_high_watermark, 1024);
        assert_eq!(cfg.stop_grace_period, Duration::from_secs(5));
        assert_eq!(cfg.comment_batch_window, Duration::from_millis(750));
        assert_eq!(cfg.webhook_dedup_window, Duration::from_secs(600));
        assert_eq!(cfg.webhook_dedup_capacity, 10_000);
        assert_eq!(cfg.max_queue_depth, 100);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn bind_addr_respects_host_external() {
        let mut cfg = CoreConfig {
            host: "127.0.0.1".into(),
            port: 9000,
            ..CoreConfig::default()
        };
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9000");
        cfg.host_external = true;
        assert_eq!(cfg.bind_addr(), "0.0.0.0:9000");
    }
}
