#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tchap_engines::analytics::E2eAnalytics;
use tchap_kernel_contracts::utd::{DecryptionFailure, E2eErrorAnalyticsEvent};
use tracing::{info, warn};

/// Appends one JSON object per tracked failure to a file.
#[derive(Debug)]
pub struct JsonLinesAnalyticsSink {
    path: PathBuf,
    file: File,
}

impl JsonLinesAnalyticsSink {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, event: &E2eErrorAnalyticsEvent) -> io::Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.file, "{line}")
    }
}

impl E2eAnalytics for JsonLinesAnalyticsSink {
    fn track_e2ee_error(&mut self, failure: &DecryptionFailure) {
        let event = E2eErrorAnalyticsEvent::from_failure(failure);
        if let Err(err) = self.append(&event) {
            warn!(
                path = %self.path.display(),
                event_id = %failure.failed_event_id,
                error = %err,
                "failed to append utd analytics event"
            );
        }
    }
}

/// Emits each tracked failure as a structured log record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAnalyticsSink;

impl E2eAnalytics for TracingAnalyticsSink {
    fn track_e2ee_error(&mut self, failure: &DecryptionFailure) {
        let event = E2eErrorAnalyticsEvent::from_failure(failure);
        info!(
            target: "tchap_utd_analytics",
            domain = %event.domain,
            name = %event.name,
            event_id = %event.event_id,
            time_to_decrypt_millis = event.time_to_decrypt_millis,
            context = %event.context,
            "e2ee error"
        );
    }
}
