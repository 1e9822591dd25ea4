use crate::types::MessageClass;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Sink for gossip payloads that failed decoding or validation.
/// Implementations must return without doing I/O on the caller's task.
pub trait DebugDataDumper: Send + Sync {
    fn save_gossip_rejected(&self, class: MessageClass, topic: &str, payload: &[u8], reason: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDumper;

impl DebugDataDumper for NoopDumper {
    fn save_gossip_rejected(&self, _class: MessageClass, _topic: &str, _payload: &[u8], _reason: &str) {}
}

enum DumpJob {
    Write { class: MessageClass, topic: String, payload: Vec<u8>, reason: String },
    Flush(oneshot::Sender<()>),
}

/// Writes each rejected payload to
/// `<dir>/<class>/<unix-millis>_<sequence>_<reason>.bin` from a writer task.
#[derive(Debug, Clone)]
pub struct FileDumper {
    jobs: mpsc::UnboundedSender<DumpJob>,
}

impl FileDumper {
    /// Spawns the writer on the current tokio runtime. The writer exits
    /// once every handle is dropped.
    pub fn spawn(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let (jobs, mut rx) = mpsc::unbounded_channel::<DumpJob>();
        tokio::spawn(async move {
            let mut sequence: u64 = 0;
            while let Some(job) = rx.recv().await {
                match job {
                    DumpJob::Write { class, topic, payload, reason } => {
                        let path = dir.join(class.as_str()).join(file_name(sequence, &reason));
                        sequence += 1;
                        match write_dump(&path, &payload).await {
                            Ok(()) => debug!(%topic, path = %path.display(), "Saved rejected gossip payload"),
                            Err(e) => {
                                warn!(%topic, path = %path.display(), error = %e, "Could not save rejected gossip payload")
                            }
                        }
                    }
                    DumpJob::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { jobs }
    }

    /// Resolves once every payload queued before the call is on disk.
    pub async fn flush(&self) {
        let (done, rx) = oneshot::channel();
        if self.jobs.send(DumpJob::Flush(done)).is_ok() {
            let _ = rx.await;
        }
    }
}

fn file_name(sequence: u64, reason: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let tag: String = reason
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(48)
        .collect();
    format!("{millis}_{sequence:06}_{tag}.bin")
}

async fn write_dump(path: &Path, payload: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    fs::write(path, payload).await
}

impl DebugDataDumper for FileDumper {
    fn save_gossip_rejected(&self, class: MessageClass, topic: &str, payload: &[u8], reason: &str) {
        let job = DumpJob::Write {
            class,
            topic: topic.to_string(),
            payload: payload.to_vec(),
            reason: reason.to_string(),
        };
        if self.jobs.send(job).is_err() {
            warn!(%topic, "Debug dump writer stopped, dropping rejected payload");
        }
    }
}
