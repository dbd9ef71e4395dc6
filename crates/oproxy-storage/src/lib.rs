//! Write-behind persistence for the gateway's mutable state.
//!
//! Every mutation schedules a whole-file rewrite ~500 ms out; further
//! mutations within the window coalesce into the latest snapshot. Shutdown
//! forces the pending write through. I/O failures are logged and swallowed:
//! persistence must never fail a request.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

pub const KEYS_FILE: &str = "keys.json";
pub const CHANNELS_FILE: &str = "channels.json";
pub const TOKENS_FILE: &str = "tokens.json";
pub const ACCESS_FILE: &str = "access.json";
pub const STATS_FILE: &str = "stats.json";

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

enum Command {
    Schedule(JsonValue),
    Flush(oneshot::Sender<()>),
}

/// Handle to one persisted JSON file with a debounced background writer.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
    tx: mpsc::UnboundedSender<Command>,
}

impl JsonFile {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    pub fn new(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        let path: PathBuf = path.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(path.clone(), debounce, rx));
        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the pending snapshot and (re-)arm the debounce timer.
    pub fn schedule(&self, snapshot: JsonValue) {
        let _ = self.tx.send(Command::Schedule(snapshot));
    }

    /// Force the pending snapshot (if any) to disk and wait for it.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn writer_task(
    path: PathBuf,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let mut pending: Option<JsonValue> = None;
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let command = match deadline {
            Some(when) => tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => Some(cmd),
                    None => break,
                },
                _ = tokio::time::sleep_until(when) => None,
            },
            None => match rx.recv().await {
                Some(cmd) => Some(cmd),
                None => break,
            },
        };

        match command {
            Some(Command::Schedule(snapshot)) => {
                pending = Some(snapshot);
                deadline = Some(tokio::time::Instant::now() + debounce);
            }
            Some(Command::Flush(ack)) => {
                if let Some(snapshot) = pending.take() {
                    write_file(&path, &snapshot).await;
                }
                deadline = None;
                let _ = ack.send(());
            }
            // Timer fired.
            None => {
                if let Some(snapshot) = pending.take() {
                    write_file(&path, &snapshot).await;
                }
                deadline = None;
            }
        }
    }

    // Channel closed with a write still pending: drain it.
    if let Some(snapshot) = pending.take() {
        write_file(&path, &snapshot).await;
    }
}

async fn write_file(path: &Path, snapshot: &JsonValue) {
    let body = match serde_json::to_string_pretty(snapshot) {
        Ok(body) => body,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to serialize snapshot");
            return;
        }
    };

    if let Some(parent) = path.parent() {
        if let Err(err) = tokio::fs::create_dir_all(parent).await {
            warn!(path = %path.display(), error = %err, "failed to create data dir");
            return;
        }
    }

    // Whole-file rewrite through a temp file so readers never see a torn write.
    let tmp = path.with_extension("json.tmp");
    if let Err(err) = tokio::fs::write(&tmp, body.as_bytes()).await {
        warn!(path = %path.display(), error = %err, "failed to write snapshot");
        return;
    }
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        warn!(path = %path.display(), error = %err, "failed to replace snapshot");
        return;
    }
    debug!(path = %path.display(), "persisted snapshot");
}

/// Synchronous boot-time loader; unreadable or malformed files are treated
/// as absent.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Option<T> {
    let path = path.as_ref();
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %err, "failed to read state file");
            }
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring malformed state file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("oproxy-storage-{}-{name}", std::process::id()))
    }

    #[tokio::test]
    async fn schedule_then_flush_writes_latest_snapshot() {
        let path = temp_path("flush.json");
        let file = JsonFile::new(&path, Duration::from_secs(60));
        file.schedule(json!({"v": 1}));
        file.schedule(json!({"v": 2}));
        file.flush().await;

        let loaded: serde_json::Value = load_json(&path).unwrap();
        assert_eq!(loaded, json!({"v": 2}));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn debounce_timer_writes_without_flush() {
        let path = temp_path("debounce.json");
        let file = JsonFile::new(&path, Duration::from_millis(20));
        file.schedule(json!({"v": 7}));
        tokio::time::sleep(Duration::from_millis(120)).await;

        let loaded: serde_json::Value = load_json(&path).unwrap();
        assert_eq!(loaded, json!({"v": 7}));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn flush_with_nothing_pending_is_a_no_op() {
        let path = temp_path("noop.json");
        let file = JsonFile::new(&path, DEFAULT_DEBOUNCE);
        file.flush().await;
        assert!(load_json::<serde_json::Value>(&path).is_none());
    }

    #[test]
    fn load_json_ignores_malformed_files() {
        let path = temp_path("malformed.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_json::<serde_json::Value>(&path).is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn pretty_output_uses_two_space_indent() {
        let body = serde_json::to_string_pretty(&json!({"keys": []})).unwrap();
        assert!(body.contains("\n  \"keys\""));
    }
}
