//! Notification sink appending JSON lines to a file.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use helmsman_rollout::NotificationSink;
use helmsman_state::Severity;

pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub async fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl NotificationSink for FileSink {
    fn post<'a>(
        &'a self,
        message: &'a str,
        severity: Severity,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let time = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let mut line = serde_json::json!({
                "time": time,
                "severity": severity,
                "message": message,
            })
            .to_string();
            line.push('\n');

            let mut file = self.file.lock().await;
            let written = match file.write_all(line.as_bytes()).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                warn!(error = %e, "failed to write notification");
            }
        })
    }
}
