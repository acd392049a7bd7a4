//! Background-task process tracking and the system process listing.
//!
//! Backends announce long-running tasks through `system_event` payloads;
//! the registry keeps task_id → pid per session so browsers can kill a
//! runaway task (or all of them) without touching the backend itself.

use std::process::Stdio;

use dashmap::DashMap;
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedTask {
    pub task_id: String,
    pub pid: i32,
    pub command: Option<String>,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemProcess {
    pub pid: i32,
    pub ppid: i32,
    pub rss_kb: u64,
    pub elapsed: String,
    pub command: String,
}

pub struct ProcessRegistry {
    /// session id → list of tracked tasks
    tasks: DashMap<String, Vec<TrackedTask>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
        }
    }

    pub fn track(&self, session_id: &str, task_id: &str, pid: i32, command: Option<String>) {
        let task = TrackedTask {
            task_id: task_id.to_string(),
            pid,
            command,
            started_at: companion_protocol::now_iso(),
        };
        self.tasks.entry(session_id.to_string()).or_default().push(task);
    }

    pub fn untrack(&self, session_id: &str, task_id: &str) {
        if let Some(mut tasks) = self.tasks.get_mut(session_id) {
            tasks.retain(|t| t.task_id != task_id);
        }
    }

    pub fn list(&self, session_id: &str) -> Vec<TrackedTask> {
        self.tasks
            .get(session_id)
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// SIGTERM one tracked task. Returns false when unknown.
    pub async fn kill(&self, session_id: &str, task_id: &str) -> bool {
        let pid = {
            let Some(tasks) = self.tasks.get(session_id) else {
                return false;
            };
            match tasks.iter().find(|t| t.task_id == task_id) {
                Some(task) => task.pid,
                None => return false,
            }
        };
        self.untrack(session_id, task_id);
        terminate(pid);
        info!(
            component = "processes",
            event = "processes.task.killed",
            session_id = %session_id,
            task_id = %task_id,
            pid = pid,
            "Task terminated"
        );
        true
    }

    /// SIGTERM every tracked task for a session.
    pub async fn kill_all(&self, session_id: &str) -> usize {
        let Some((_, tasks)) = self.tasks.remove(session_id) else {
            return 0;
        };
        let count = tasks.len();
        for task in tasks {
            terminate(task.pid);
        }
        if count > 0 {
            info!(
                component = "processes",
                event = "processes.session.swept",
                session_id = %session_id,
                count = count,
                "Tracked tasks terminated"
            );
        }
        count
    }

    /// Current system processes via `ps` (argv form, parsed rows).
    pub async fn system_processes(&self) -> Vec<SystemProcess> {
        let output = Command::new("ps")
            .args(["-eo", "pid,ppid,rss,etime,comm"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        let output = match output {
            Ok(o) if o.status.success() => o,
            _ => {
                warn!(
                    component = "processes",
                    event = "processes.ps_failed",
                    "Could not list system processes"
                );
                return Vec::new();
            }
        };

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .skip(1)
            .filter_map(parse_ps_line)
            .collect()
    }
}

fn parse_ps_line(line: &str) -> Option<SystemProcess> {
    let mut parts = line.split_whitespace();
    let pid = parts.next()?.parse().ok()?;
    let ppid = parts.next()?.parse().ok()?;
    let rss_kb = parts.next()?.parse().ok()?;
    let elapsed = parts.next()?.to_string();
    let command = parts.collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        return None;
    }
    Some(SystemProcess {
        pid,
        ppid,
        rss_kb,
        elapsed,
        command,
    })
}

fn terminate(pid: i32) {
    // SIGTERM; the task owner is responsible for escalation.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_list_untrack() {
        let registry = ProcessRegistry::new();
        registry.track("s1", "t1", 12345, Some("npm run dev".into()));
        registry.track("s1", "t2", 12346, None);
        assert_eq!(registry.list("s1").len(), 2);

        registry.untrack("s1", "t1");
        let remaining = registry.list("s1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].task_id, "t2");
    }

    #[tokio::test]
    async fn kill_unknown_task_is_false() {
        let registry = ProcessRegistry::new();
        assert!(!registry.kill("s1", "missing").await);
    }

    #[test]
    fn ps_line_parses() {
        let proc = parse_ps_line("  1234  1 20480 01:02:03 node").unwrap();
        assert_eq!(proc.pid, 1234);
        assert_eq!(proc.ppid, 1);
        assert_eq!(proc.rss_kb, 20480);
        assert_eq!(proc.elapsed, "01:02:03");
        assert_eq!(proc.command, "node");
        assert!(parse_ps_line("garbage").is_none());
    }
}
