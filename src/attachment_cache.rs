//! Downloads, deduplicates, and caps attachments referenced by issues and
//! comments (§4.2). Grounded on the teacher's `utils::command` style of
//! wrapping I/O with `.context_op(...)`, with per-URL locking modeled after
//! the §5 "attachment cache filesystem: per-file write lock by URL hash".

use crate::config::CoreConfig;
use crate::error::ResultExt;
use crate::model::{ActivityKind, Attachment};
use dashmap::DashMap;
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tokio::sync::Mutex;
use tracing::warn;

/// Matches markdown image/link syntax `![alt](url)` or `[alt](url)` whose
/// URL is `http(s)`. Documented per the design note requiring the exact
/// regex instead of ad hoc scraping.
static MARKDOWN_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!?\[[^\]]*\]\((https?://[^\s)]+)\)").unwrap());

pub struct AttachmentOutcome {
    pub attachments: Vec<Attachment>,
    /// Non-fatal issues recorded as `warning` activities by the caller.
    pub warnings: Vec<ActivityKind>,
}

/// Downloads and caches attachments for one issue. One `AttachmentCache` is
/// shared across the process; per-URL locks serialize downloads of the same
/// URL while letting distinct URLs download in parallel (§5).
pub struct AttachmentCache {
    config: Arc<CoreConfig>,
    http: reqwest::Client,
    url_locks: DashMap<String, Arc<Mutex<()>>>,
    cached: DashMap<String, Attachment>,
}

impl AttachmentCache {
    pub fn new(config: Arc<CoreConfig>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            url_locks: DashMap::new(),
            cached: DashMap::new(),
        }
    }

    /// Extracts URLs referenced in `text` via markdown link syntax,
    /// preserving first-seen order and dropping duplicates.
    pub fn extract_urls(text: &str) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut urls = Vec::new();
        for cap in MARKDOWN_LINK.captures_iter(text) {
            let url = cap[1].to_string();
            if url::Url::parse(&url).is_ok() && seen.insert(url.clone()) {
                urls.push(url);
            }
        }
        urls
    }

    /// Resolves attachment URLs referenced by `text` for `issue_id`,
    /// downloading any not already cached, and returns them in encounter
    /// order. Enforces `maxAttachments` and `maxAttachmentBytes` (§4.2).
    pub async fn resolve(&self, issue_id: &str, text: &str) -> anyhow::Result<AttachmentOutcome> {
        let urls = Self::extract_urls(text);
        let mut attachments = Vec::new();
        let mut warnings = Vec::new();

        let total = urls.len();
        for (idx, url) in urls.into_iter().enumerate() {
            if attachments.len() >= self.config.max_attachments {
                warnings.push(ActivityKind::Warning {
                    message: format!(
                        "attachment cap reached: kept {} of {} referenced attachments",
                        self.config.max_attachments, total
                    ),
                });
                break;
            }

            match self.download_one(issue_id, &url, idx + 1).await {
                Ok(Some(attachment)) => attachments.push(attachment),
                Ok(None) => {
                    warnings.push(ActivityKind::Warning {
                        message: format!("attachment {} exceeds size cap, skipped", url),
                    });
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "attachment download failed");
                    warnings.push(ActivityKind::Warning {
                        message: format!("failed to download attachment {}: {}", url, e),
                    });
                }
            }
        }

        Ok(AttachmentOutcome {
            attachments,
            warnings,
        })
    }

    async fn download_one(
        &self,
        issue_id: &str,
        url: &str,
        insertion_order: usize,
    ) -> anyhow::Result<Option<Attachment>> {
        if let Some(existing) = self.cached.get(url) {
            return Ok(Some(existing.clone()));
        }

        let lock = self
            .url_locks
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check after acquiring the lock: another task may have finished
        // downloading this URL while we waited.
        if let Some(existing) = self.cached.get(url) {
            return Ok(Some(existing.clone()));
        }

        let response = self
            .http
            .get(url)
            .timeout(self.config.network_timeout)
            .send()
            .await
            .context_op("download attachment")?;

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        let bytes = response.bytes().await.context_op("read attachment body")?;
        if bytes.len() as u64 > self.config.max_attachment_bytes {
            return Ok(None);
        }

        let ext = guess_extension(url, &mime_type);
        let dir = self.config.attachments_dir(issue_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .context_path("create attachment directory", &dir)?;

        let file_name = format!("attachment_{:04}.{}", insertion_order, ext);
        let local_path: PathBuf = dir.join(&file_name);
        tokio::fs::write(&local_path, &bytes)
            .await
            .context_path("write attachment", &local_path)?;

        let attachment = Attachment {
            url: url.to_string(),
            local_path,
            mime_type,
            size_bytes: bytes.len() as u64,
            issue_id: issue_id.to_string(),
        };
        self.cached.insert(url.to_string(), attachment.clone());
        Ok(Some(attachment))
    }
}

fn guess_extension(url: &str, mime_type: &str) -> String {
    if let Some(ext) = std::path::Path::new(url).extension().and_then(|e| e.to_str()) {
        if ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return ext.to_lowercase();
        }
    }
    match mime_type {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        _ => "bin",
    }
    .to_string()
}
