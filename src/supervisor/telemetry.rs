//! 监管者累计计数（随健康快照下发）

use std::sync::atomic::{AtomicU64, Ordering};

use crate::protocol::{TaskStatus, TelemetrySnapshot};

#[derive(Debug, Default)]
pub struct Telemetry {
    messages_received: AtomicU64,
    tasks_admitted: AtomicU64,
    tasks_rejected: AtomicU64,
    tasks_succeeded: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_cancelled: AtomicU64,
    streams_started: AtomicU64,
    streams_completed: AtomicU64,
    streams_cancelled: AtomicU64,
    partial_results: AtomicU64,
    transport_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_received(&self) {
        bump(&self.messages_received);
    }

    pub fn task_admitted(&self) {
        bump(&self.tasks_admitted);
    }

    pub fn task_rejected(&self) {
        bump(&self.tasks_rejected);
    }

    /// 按终态计数
    pub fn task_finished(&self, status: TaskStatus) {
        match status {
            TaskStatus::Success => bump(&self.tasks_succeeded),
            TaskStatus::Failed => bump(&self.tasks_failed),
            TaskStatus::Cancelled => bump(&self.tasks_cancelled),
        }
    }

    pub fn stream_started(&self) {
        bump(&self.streams_started);
    }

    pub fn stream_completed(&self) {
        bump(&self.streams_completed);
    }

    pub fn stream_cancelled(&self) {
        bump(&self.streams_cancelled);
    }

    pub fn partial_result(&self) {
        bump(&self.partial_results);
    }

    pub fn transport_error(&self) {
        bump(&self.transport_errors);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        TelemetrySnapshot {
            messages_received: load(&self.messages_received),
            tasks_admitted: load(&self.tasks_admitted),
            tasks_rejected: load(&self.tasks_rejected),
            tasks_succeeded: load(&self.tasks_succeeded),
            tasks_failed: load(&self.tasks_failed),
            tasks_cancelled: load(&self.tasks_cancelled),
            streams_started: load(&self.streams_started),
            streams_completed: load(&self.streams_completed),
            streams_cancelled: load(&self.streams_cancelled),
            partial_results: load(&self.partial_results),
            transport_errors: load(&self.transport_errors),
        }
    }
}
