use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use async_nats::jetstream;
use async_nats::jetstream::consumer::pull;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use cq_messages::routing::tasks_queue_group;
use cq_messages::routing::tasks_subject;
use cq_messages::routing::TASK_RESULTS_SUBJECT;
use cq_messages::types::Task;
use cq_messages::types::TaskKind;
use cq_messages::types::TaskResult;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::error;

use crate::ACK_WAIT;
use crate::TASKS_STREAM;
use crate::TASK_RESULTS_STREAM;

/// Processes one decoded task. Returning `Err` means a transient failure:
/// the message is requeued and redelivered later. Semantic failures must
/// be reported as a `TaskResult` with `ok: false` and return `Ok`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle_task(&self, task: Task) -> anyhow::Result<()>;
}

/// Processes one decoded task result. Same error contract as
/// [`TaskHandler`].
#[async_trait]
pub trait TaskResultHandler: Send + Sync {
    async fn handle_task_result(&self, result: TaskResult) -> anyhow::Result<()>;
}

/// JetStream durable names may not contain dots; the queue group keeps
/// its dotted form, the durable consumer derives a dashed name from it.
fn durable_name(queue_group: &str) -> String {
    queue_group.replace('.', "-")
}

/// Consumes tasks of one kind for one geo location. All worker replicas
/// sharing the queue group pull from the same durable consumer, so each
/// task is handled by exactly one of them.
pub struct TaskConsumer {
    consumer: PullConsumer,
    subject: String,
    concurrency: usize,
}

impl TaskConsumer {
    pub async fn new(
        context: &jetstream::Context,
        geo_location: &str,
        kind: TaskKind,
        concurrency: usize,
    ) -> anyhow::Result<Self> {
        let subject = tasks_subject(geo_location, kind);
        let durable = durable_name(&tasks_queue_group(geo_location, kind));

        let stream = context
            .get_stream(TASKS_STREAM)
            .await
            .context("looking up tasks stream")?;
        let consumer = stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    filter_subject: subject.clone(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    max_ack_pending: concurrency as i64,
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("creating consumer {durable}"))?;

        Ok(Self {
            consumer,
            subject,
            concurrency,
        })
    }

    /// Runs the delivery loop until `shutdown` fires, then drains
    /// in-flight handlers.
    pub async fn run(
        self,
        handler: Arc<dyn TaskHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        run_consumer(
            self.consumer,
            self.subject,
            self.concurrency,
            move |task| {
                let handler = Arc::clone(&handler);
                async move { handler.handle_task(task).await }
            },
            shutdown,
        )
        .await
    }
}

/// Consumes completed task results for the coordinator. Coordinator
/// replicas share one durable consumer and load-balance.
pub struct TaskResultConsumer {
    consumer: PullConsumer,
    concurrency: usize,
}

impl TaskResultConsumer {
    pub async fn new(
        context: &jetstream::Context,
        concurrency: usize,
    ) -> anyhow::Result<Self> {
        let stream = context
            .get_stream(TASK_RESULTS_STREAM)
            .await
            .context("looking up task results stream")?;
        let consumer = stream
            .get_or_create_consumer(
                TASK_RESULTS_SUBJECT,
                pull::Config {
                    durable_name: Some(TASK_RESULTS_SUBJECT.to_owned()),
                    filter_subject: TASK_RESULTS_SUBJECT.to_owned(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    max_ack_pending: concurrency as i64,
                    ..Default::default()
                },
            )
            .await
            .context("creating task results consumer")?;

        Ok(Self {
            consumer,
            concurrency,
        })
    }

    pub async fn run(
        self,
        handler: Arc<dyn TaskResultHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        run_consumer(
            self.consumer,
            TASK_RESULTS_SUBJECT.to_owned(),
            self.concurrency,
            move |result| {
                let handler = Arc::clone(&handler);
                async move { handler.handle_task_result(result).await }
            },
            shutdown,
        )
        .await
    }
}

/// Shared delivery loop. At most `concurrency` messages are in flight;
/// each one is handled in its own task so a panicking handler only
/// poisons its own message.
async fn run_consumer<T, H, Fut>(
    consumer: PullConsumer,
    subject: String,
    concurrency: usize,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    T: DeserializeOwned + Send + 'static,
    H: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut messages = consumer
        .messages()
        .await
        .with_context(|| format!("subscribing to {subject}"))?;

    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut in_flight = JoinSet::new();

    debug!("Consuming messages. subject: {}", subject);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = messages.next() => {
                let Some(next) = next else {
                    break;
                };
                let message = match next {
                    Ok(message) => message,
                    Err(err) => {
                        error!("Receiving message failed. subject: {} err: {:?}", subject, err);
                        continue;
                    },
                };

                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .context("acquiring delivery permit")?;
                let handler = handler.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    handle_message(message, handler).await;
                });

                // Reap finished handlers so the set does not grow.
                while in_flight.try_join_next().is_some() {}
            },
        }
    }

    debug!("Draining in-flight handlers. subject: {}", subject);
    while in_flight.join_next().await.is_some() {}

    Ok(())
}

async fn handle_message<T, H, Fut>(
    message: jetstream::Message,
    handler: H,
) where
    T: DeserializeOwned + Send + 'static,
    H: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let decoded = match serde_json::from_slice::<T>(&message.payload) {
        Ok(decoded) => decoded,
        Err(err) => {
            // Poison message: requeueing it would loop forever.
            error!(
                "Dropping undecodable message. subject: {} err: {:?}",
                message.subject, err
            );
            if let Err(err) = message.ack().await {
                error!("Failed to ack poison message. err: {:?}", err);
            }
            return;
        },
    };

    // A panic inside the handler must not take down the delivery loop;
    // it is treated like any transient failure and the message requeued.
    let outcome = tokio::spawn(handler(decoded)).await;

    match outcome {
        Ok(Ok(())) => {
            if let Err(err) = message.ack().await {
                error!("Failed to ack message. err: {:?}", err);
            }
        },
        Ok(Err(err)) => {
            error!("Handler failed, requeueing message. err: {:?}", err);
            if let Err(err) = message.ack_with(AckKind::Nak(None)).await {
                error!("Failed to nak message. err: {:?}", err);
            }
        },
        Err(join_err) => {
            error!("Handler panicked, requeueing message. err: {:?}", join_err);
            if let Err(err) = message.ack_with(AckKind::Nak(None)).await {
                error!("Failed to nak message. err: {:?}", err);
            }
        },
    }
}
