use anyhow::Context as _;
use async_trait::async_trait;
use cq_messages::types::Task;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Task records expire a day after their last update.
pub(crate) const TASK_TTL_SECS: u64 = 24 * 60 * 60;

/// Durable task record store, keyed by task id.
#[async_trait]
pub(crate) trait TaskStore: Send + Sync {
    /// Loads a task record; `None` when the id is unknown or expired.
    async fn task(&self, id: &str) -> anyhow::Result<Option<Task>>;

    /// Stores a task record, refreshing its TTL.
    async fn set_task(&self, task: &Task) -> anyhow::Result<()>;
}

/// Redis-backed store: one JSON string per task with an `EX` TTL.
pub(crate) struct RedisStorage {
    conn: ConnectionManager,
}

impl RedisStorage {
    pub(crate) async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url).context("parse redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl TaskStore for RedisStorage {
    async fn task(&self, id: &str) -> anyhow::Result<Option<Task>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(id).await.context("redis get")?;
        raw.map(|raw| serde_json::from_str(&raw).context("JSON unmarshal task"))
            .transpose()
    }

    async fn set_task(&self, task: &Task) -> anyhow::Result<()> {
        let raw = serde_json::to_string(task).context("JSON marshal task")?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(&task.id, raw, TASK_TTL_SECS)
            .await
            .context("redis set")?;
        Ok(())
    }
}
