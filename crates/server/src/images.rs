//! Image pull coordination.
//!
//! At most one active pull per image. Progress lines fan out to every
//! subscribed channel in order; late subscribers see only lines produced
//! after they subscribed. Ready is a terminal state — once an image is
//! ready, `ensure_image` is a no-op forever.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub const PULL_DEADLINE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullStatus {
    Idle,
    Pulling,
    Ready,
    Error(String),
}

struct ImageEntry {
    status: PullStatus,
    subscribers: Vec<mpsc::Sender<String>>,
    ready_tx: watch::Sender<PullStatus>,
    ready_rx: watch::Receiver<PullStatus>,
}

impl ImageEntry {
    fn new() -> Self {
        let (ready_tx, ready_rx) = watch::channel(PullStatus::Idle);
        Self {
            status: PullStatus::Idle,
            subscribers: Vec::new(),
            ready_tx,
            ready_rx,
        }
    }
}

pub struct ImagePullCoordinator {
    bin: String,
    entries: Mutex<HashMap<String, Arc<Mutex<ImageEntry>>>>,
}

impl ImagePullCoordinator {
    pub fn new() -> Self {
        Self {
            bin: std::env::var("COMPANION_CONTAINER_BIN").unwrap_or_else(|_| "docker".into()),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, image: &str) -> Arc<Mutex<ImageEntry>> {
        let mut entries = self.entries.lock().expect("image entries poisoned");
        entries
            .entry(image.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ImageEntry::new())))
            .clone()
    }

    pub fn state(&self, image: &str) -> PullStatus {
        self.entry(image)
            .lock()
            .expect("image entry poisoned")
            .status
            .clone()
    }

    pub fn is_ready(&self, image: &str) -> bool {
        self.state(image) == PullStatus::Ready
    }

    /// Subscribe to progress lines for an image.
    pub fn on_progress(&self, image: &str, tx: mpsc::Sender<String>) {
        self.entry(image)
            .lock()
            .expect("image entry poisoned")
            .subscribers
            .push(tx);
    }

    /// Idempotent: idle or errored → start a pull; pulling or ready → no-op.
    pub fn ensure_image(self: &Arc<Self>, image: &str) {
        let entry = self.entry(image);
        {
            let mut guard = entry.lock().expect("image entry poisoned");
            match guard.status {
                PullStatus::Pulling | PullStatus::Ready => return,
                PullStatus::Idle | PullStatus::Error(_) => {
                    guard.status = PullStatus::Pulling;
                    let _ = guard.ready_tx.send(PullStatus::Pulling);
                }
            }
        }

        let coordinator = self.clone();
        let image = image.to_string();
        tokio::spawn(async move {
            coordinator.run_pull(&image, entry).await;
        });
    }

    /// Wait until the image reaches `Ready`, or the deadline passes.
    pub async fn wait_for_ready(&self, image: &str, deadline: Duration) -> bool {
        let mut rx = {
            let entry = self.entry(image);
            let guard = entry.lock().expect("image entry poisoned");
            if guard.status == PullStatus::Ready {
                return true;
            }
            guard.ready_rx.clone()
        };

        let wait = async {
            loop {
                match rx.borrow_and_update().clone() {
                    PullStatus::Ready => return true,
                    PullStatus::Error(_) => return false,
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(deadline, wait).await.unwrap_or(false)
    }

    async fn run_pull(&self, image: &str, entry: Arc<Mutex<ImageEntry>>) {
        info!(
            component = "images",
            event = "images.pull.start",
            image = %image,
            "Pulling image"
        );

        let child = Command::new(&self.bin)
            .args(["pull", image])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match child {
            Ok(c) => c,
            Err(e) => {
                Self::finish(&entry, PullStatus::Error(format!("spawn failed: {e}")));
                return;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        if let Some(stdout) = stdout {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = stderr {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(line_tx);

        let mut last_line = String::new();
        while let Some(line) = line_rx.recv().await {
            last_line = line.clone();
            Self::fan_out(&entry, &line);
        }

        match child.wait().await {
            Ok(status) if status.success() => {
                info!(
                    component = "images",
                    event = "images.pull.ready",
                    image = %image,
                    "Image ready"
                );
                Self::finish(&entry, PullStatus::Ready);
            }
            Ok(status) => {
                warn!(
                    component = "images",
                    event = "images.pull.failed",
                    image = %image,
                    exit_code = status.code().unwrap_or(-1),
                    "Pull failed"
                );
                Self::finish(&entry, PullStatus::Error(last_line));
            }
            Err(e) => {
                Self::finish(&entry, PullStatus::Error(e.to_string()));
            }
        }
    }

    /// Deliver one line to every live subscriber, pruning closed channels.
    fn fan_out(entry: &Arc<Mutex<ImageEntry>>, line: &str) {
        let mut guard = entry.lock().expect("image entry poisoned");
        guard.subscribers.retain(|tx| {
            if tx.is_closed() {
                return false;
            }
            tx.try_send(line.to_string()).is_ok()
        });
    }

    fn finish(entry: &Arc<Mutex<ImageEntry>>, status: PullStatus) {
        let mut guard = entry.lock().expect("image entry poisoned");
        guard.status = status.clone();
        let _ = guard.ready_tx.send(status);
        guard.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> Arc<ImagePullCoordinator> {
        Arc::new(ImagePullCoordinator::new())
    }

    #[tokio::test]
    async fn ready_is_terminal() {
        let c = coordinator();
        let entry = c.entry("img:1");
        ImagePullCoordinator::finish(&entry, PullStatus::Ready);
        assert!(c.is_ready("img:1"));

        // ensure_image on a ready image must not flip it back to pulling
        c.ensure_image("img:1");
        assert_eq!(c.state("img:1"), PullStatus::Ready);
    }

    #[tokio::test]
    async fn wait_for_ready_observes_transition() {
        let c = coordinator();
        let entry = c.entry("img:2");
        {
            let mut guard = entry.lock().unwrap();
            guard.status = PullStatus::Pulling;
            let _ = guard.ready_tx.send(PullStatus::Pulling);
        }
        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.wait_for_ready("img:2", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        ImagePullCoordinator::finish(&entry, PullStatus::Ready);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_ready_fails_on_error() {
        let c = coordinator();
        let entry = c.entry("img:3");
        ImagePullCoordinator::finish(&entry, PullStatus::Error("no such image".into()));
        assert!(!c.wait_for_ready("img:3", Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn subscribers_see_lines_in_order_from_subscription() {
        let c = coordinator();
        let entry = c.entry("img:4");
        ImagePullCoordinator::fan_out(&entry, "line-0");

        let (tx, mut rx) = mpsc::channel(16);
        c.on_progress("img:4", tx);
        ImagePullCoordinator::fan_out(&entry, "line-1");
        ImagePullCoordinator::fan_out(&entry, "line-2");

        assert_eq!(rx.recv().await.unwrap(), "line-1");
        assert_eq!(rx.recv().await.unwrap(), "line-2");
    }
}
