use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use rdkafka::{
    config::ClientConfig,
    consumer::{Consumer, StreamConsumer},
    message::{BorrowedMessage, Headers},
    Message, Offset,
};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};

use super::PAYLOAD_TYPE_HEADER;
use crate::events::{codec, topic_for};
use crate::notifications::{DispatchError, InboundRecord, NotificationDispatcher, OffsetTracker};
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

// ============================================================================
// Broker consumption loop
// ============================================================================
//
// Up to `workers` messages are dispatched concurrently. Offsets are stored
// manually through the OffsetTracker, so a partition only advances past
// messages that have actually finished: at-least-once under concurrency.
//
// A message that still fails after its retries is never stored. Its partition
// is rewound and the consumer seeks back to it, so it and everything after it
// are read and dispatched again.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub brokers: String,
    pub group_id: String,
    pub namespace: String,
    pub workers: usize,
}

impl ConsumerSettings {
    /// One topic per event kind the dispatcher reacts to
    pub fn topics(&self) -> Vec<String> {
        [codec::FILE_DESCRIPTOR_CHANGED, codec::CONNECTION_CHANGED, codec::CLIENT_MESSAGE_RECEIVED]
            .iter()
            .map(|name| topic_for(&self.namespace, name))
            .collect()
    }
}

fn create_consumer(settings: &ConsumerSettings) -> Result<StreamConsumer> {
    ClientConfig::new()
        .set("bootstrap.servers", &settings.brokers)
        .set("group.id", &settings.group_id)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest")
        .create()
        .context("Failed to create Kafka consumer")
}

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a finished message came from, and whether it may be committed
struct Completion {
    topic: String,
    partition: i32,
    offset: i64,
    generation: u64,
    committable: bool,
}

/// What the consumer has to do after a message finished
#[derive(Debug, PartialEq, Eq)]
enum Settled {
    /// Store this offset (the next one to read)
    Store(i64),
    /// Seek the partition back to this offset
    Seek(i64),
    Nothing,
}

fn settle(tracker: &mut OffsetTracker, done: &Completion) -> Settled {
    if done.committable {
        match tracker.finish(&done.topic, done.partition, done.offset, done.generation) {
            Some(safe) => Settled::Store(safe + 1),
            None => Settled::Nothing,
        }
    } else if tracker.rewind(&done.topic, done.partition, done.offset, done.generation) {
        Settled::Seek(done.offset)
    } else {
        Settled::Nothing
    }
}

pub async fn run_consumer(
    settings: ConsumerSettings,
    dispatcher: Arc<NotificationDispatcher>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let consumer = create_consumer(&settings)?;
    let topics = settings.topics();
    let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
    consumer
        .subscribe(&topic_refs)
        .context("Failed to subscribe to event topics")?;

    tracing::info!(topics = ?topics, group = %settings.group_id, workers = settings.workers, "Consumer started");

    let workers = settings.workers.max(1);
    let mut tracker = OffsetTracker::new();
    let mut in_flight: JoinSet<Completion> = JoinSet::new();

    loop {
        if in_flight.len() >= workers {
            if let Some(joined) = in_flight.join_next().await {
                complete(&consumer, &mut tracker, joined)?;
            }
            continue;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                complete(&consumer, &mut tracker, joined)?;
            }
            message = consumer.recv() => match message {
                Ok(message) => {
                    let record = inbound_record(&message);
                    let generation = tracker.start(&record.topic, record.partition, record.offset);

                    let dispatcher = dispatcher.clone();
                    in_flight.spawn(async move {
                        let committable = AssertUnwindSafe(process(&dispatcher, &record))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                tracing::error!(topic = %record.topic, offset = record.offset, "Dispatch panicked");
                                false
                            });
                        Completion {
                            topic: record.topic,
                            partition: record.partition,
                            offset: record.offset,
                            generation,
                            committable,
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "Kafka consumer error"),
            }
        }
    }

    tracing::info!(in_flight = in_flight.len(), "Consumer stopping, draining in-flight messages");
    while let Some(joined) = in_flight.join_next().await {
        complete(&consumer, &mut tracker, joined)?;
    }

    Ok(())
}

fn complete(consumer: &StreamConsumer, tracker: &mut OffsetTracker, joined: Result<Completion, JoinError>) -> Result<()> {
    let done = match joined {
        Ok(done) => done,
        Err(e) => {
            // Panics are caught inside the task, so only a cancelled runtime gets here
            tracing::error!(error = %e, "Dispatch task cancelled");
            return Ok(());
        }
    };

    match settle(tracker, &done) {
        Settled::Store(next) => {
            if let Err(e) = consumer.store_offset(&done.topic, done.partition, next) {
                tracing::warn!(error = %e, topic = %done.topic, partition = done.partition, "Failed to store offset");
            }
        }
        Settled::Seek(offset) => {
            consumer
                .seek(&done.topic, done.partition, Offset::Offset(offset), SEEK_TIMEOUT)
                .with_context(|| format!("Failed to seek {}[{}] back to offset {}", done.topic, done.partition, offset))?;
            tracing::warn!(
                topic = %done.topic,
                partition = done.partition,
                offset = offset,
                "Rewound partition to redeliver failed message"
            );
        }
        Settled::Nothing => {}
    }
    Ok(())
}

fn inbound_record(message: &BorrowedMessage<'_>) -> InboundRecord {
    let type_name = message.headers().and_then(|headers| {
        headers
            .iter()
            .find(|header| header.key == PAYLOAD_TYPE_HEADER)
            .and_then(|header| header.value)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    });

    InboundRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(|key| String::from_utf8_lossy(key).into_owned()),
        type_name,
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

/// Dispatch one message with retries. Returns whether its offset may be
/// committed.
pub(crate) async fn process(dispatcher: &NotificationDispatcher, record: &InboundRecord) -> bool {
    let result = retry_on_transient(RetryConfig::conservative(), move |_attempt| dispatcher.handle(record)).await;

    match result {
        RetryResult::Success(outcome) => {
            tracing::debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                outcome = ?outcome,
                "Event dispatched"
            );
            true
        }
        RetryResult::PermanentFailure(DispatchError::Malformed(e)) => {
            tracing::error!(
                error = %e,
                topic = %record.topic,
                offset = record.offset,
                "Malformed event acknowledged without processing"
            );
            true
        }
        RetryResult::PermanentFailure(e) | RetryResult::Failed(e) => {
            tracing::error!(
                error = %e,
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Event processing failed, leaving offset uncommitted"
            );
            false
        }
    }
}
