//! NATS JetStream adapter: typed publishers and ack-aware consumers for
//! tasks and task results.
//!
//! Tasks live in one stream covering every `{geo}.{kind}.tasks` subject,
//! results in a second stream. Both use work-queue retention so
//! acknowledged messages are dropped, and unacknowledged ones are
//! redelivered after the ack deadline.

use std::time::Duration;

use anyhow::Context as _;
use async_nats::jetstream;
use async_nats::jetstream::stream;
use cq_messages::routing::TASK_RESULTS_SUBJECT;

pub mod consumer;
pub mod publisher;

pub use consumer::TaskConsumer;
pub use consumer::TaskHandler;
pub use consumer::TaskResultConsumer;
pub use consumer::TaskResultHandler;
pub use publisher::TaskPublisher;
pub use publisher::TaskResultPublisher;

const TASKS_STREAM: &str = "CQ_TASKS";
const TASK_RESULTS_STREAM: &str = "CQ_TASK_RESULTS";

/// Unacked messages are redelivered after this deadline.
const ACK_WAIT: Duration = Duration::from_secs(30);

/// Messages no consumer picked up are dropped after a day, matching the
/// task record TTL.
const MESSAGE_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Connects to the bus and returns the JetStream context all publishers
/// and consumers are built from.
pub async fn connect(url: &str) -> anyhow::Result<jetstream::Context> {
    let client = async_nats::connect(url)
        .await
        .with_context(|| format!("connecting to NATS at {url}"))?;
    Ok(jetstream::new(client))
}

/// Creates the task and task-result streams if they do not exist yet.
/// Safe to call from every process on startup.
pub async fn ensure_streams(context: &jetstream::Context) -> anyhow::Result<()> {
    context
        .get_or_create_stream(stream::Config {
            name: TASKS_STREAM.to_owned(),
            subjects: vec!["*.*.tasks".to_owned()],
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::WorkQueue,
            max_age: MESSAGE_MAX_AGE,
            ..Default::default()
        })
        .await
        .context("creating tasks stream")?;

    context
        .get_or_create_stream(stream::Config {
            name: TASK_RESULTS_STREAM.to_owned(),
            subjects: vec![TASK_RESULTS_SUBJECT.to_owned()],
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::WorkQueue,
            max_age: MESSAGE_MAX_AGE,
            ..Default::default()
        })
        .await
        .context("creating task results stream")?;

    Ok(())
}
