use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Everything a unit task may tell the pool. All variants except `Log`
/// carry the pool generation that spawned the sender, so messages from
/// units killed by a pool rebuild are dropped instead of corrupting the
/// bookkeeping of their re-enqueued successors.
#[derive(Debug, Clone)]
pub enum PoolMessage {
    Progress {
        task_id: String,
        value: u32,
        generation: u64,
    },
    FinishAck {
        task_id: String,
        group_id: String,
        aborted: bool,
        generation: u64,
    },
    Log {
        task_id: String,
        level: LogLevel,
        content: String,
        stack: String,
    },
    /// The coordinator no longer knows this group; drop it and rebuild.
    Kill {
        group_id: String,
        generation: u64,
    },
}

/// Logger handed to unit tasks. Log records flow through the message
/// queue so the consumer loop is the only writer of the worker log.
#[derive(Debug, Clone)]
pub struct MessageLogger {
    task_id: String,
    stack: String,
    queue: mpsc::Sender<PoolMessage>,
}

impl MessageLogger {
    pub fn new(
        task_id: impl Into<String>,
        group_id: &str,
        log_stack: &str,
        queue: mpsc::Sender<PoolMessage>,
    ) -> Self {
        let task_id = task_id.into();
        Self {
            stack: format!("{}/{}/{}", log_stack, group_id, task_id),
            task_id,
            queue,
        }
    }

    pub async fn info(&self, content: impl Into<String>) {
        self.send(LogLevel::Info, content.into()).await;
    }

    pub async fn warn(&self, content: impl Into<String>) {
        self.send(LogLevel::Warn, content.into()).await;
    }

    pub async fn error(&self, content: impl Into<String>) {
        self.send(LogLevel::Error, content.into()).await;
    }

    async fn send(&self, level: LogLevel, content: String) {
        let _ = self
            .queue
            .send(PoolMessage::Log {
                task_id: self.task_id.clone(),
                level,
                content,
                stack: self.stack.clone(),
            })
            .await;
    }
}
