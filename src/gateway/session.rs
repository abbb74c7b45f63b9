use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use sqlx::AnyPool;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::registry::ConnectionRegistry;
use super::repository::{ConnectionRecord, ConnectionRepository};
use super::SessionMessage;
use crate::db::{StoreError, UnitOfWork};
use crate::events::proto::{ClientMessageReceivedEvent, ConnectionChangedEvent};
use crate::events::OutboxWriter;
use crate::notifications::directory::SubscriptionDirectory;

// ============================================================================
// Session Gateway
// ============================================================================
//
// Connecting -> Open -> Closed, one call to `serve` per client session.
//
// Open:   connection record (owned by this node) + CREATED, one transaction,
//         then the in-memory context is registered.
// Served: outbound queue -> transport, and transport -> ClientMessageReceived
//         events through the outbox, until either side ends or fails.
// Closed: context removed first so no local delivery races teardown, then
//         record + subscriptions deleted and DELETED emitted, one transaction.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub session_id: String,
    pub user_name: String,
}

#[derive(Debug, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("publishing inbound message failed: {0}")]
    Publish(#[source] StoreError),

    #[error("inbound publish task aborted: {0}")]
    PublishAborted(String),
}

#[derive(Clone)]
pub struct SessionGateway {
    pool: AnyPool,
    registry: Arc<ConnectionRegistry>,
    connections: ConnectionRepository,
    directory: SubscriptionDirectory,
    outbox: OutboxWriter,
}

impl SessionGateway {
    pub fn new(pool: AnyPool, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            pool,
            registry,
            connections: ConnectionRepository::new(),
            directory: SubscriptionDirectory::new(),
            outbox: OutboxWriter::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Serve one session until the peer closes or either direction fails.
    /// Teardown runs on every exit path once the session was opened.
    pub async fn serve<I, O>(&self, handshake: Handshake, inbound: I, outbound: O) -> Result<(), SessionError>
    where
        I: Stream<Item = Result<SessionMessage, TransportError>> + Send + Unpin,
        O: Sink<SessionMessage, Error = TransportError> + Send + Unpin,
    {
        let record = self.open(&handshake).await?;
        let queue = self.registry.register(record.clone());

        tracing::info!(
            connection_id = record.id,
            session_id = %record.session_id,
            user = %record.user_name,
            "Session open"
        );

        let served = self.run(&record, queue, inbound, outbound).await;
        if let Err(e) = &served {
            tracing::warn!(connection_id = record.id, error = %e, "Session ended with error");
        }

        let closed = self.close(&record).await;
        if let Err(e) = &closed {
            tracing::error!(connection_id = record.id, error = %e, "Session teardown failed");
        }

        served.and(closed.map_err(SessionError::from))
    }

    async fn open(&self, handshake: &Handshake) -> Result<ConnectionRecord, StoreError> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let record = self
            .connections
            .insert(
                &mut uow,
                &handshake.session_id,
                &handshake.user_name,
                self.registry.local_node(),
            )
            .await?;
        self.outbox
            .publish(&mut uow, &[ConnectionChangedEvent::created(record.to_proto()).into()])
            .await?;
        uow.commit().await?;
        Ok(record)
    }

    async fn run<I, O>(
        &self,
        record: &ConnectionRecord,
        mut queue: mpsc::Receiver<SessionMessage>,
        mut inbound: I,
        mut outbound: O,
    ) -> Result<(), SessionError>
    where
        I: Stream<Item = Result<SessionMessage, TransportError>> + Send + Unpin,
        O: Sink<SessionMessage, Error = TransportError> + Send + Unpin,
    {
        let mut publishes = JoinSet::new();

        let served = loop {
            tokio::select! {
                message = queue.recv() => match message {
                    Some(message) => {
                        if let Err(e) = outbound.send(message).await {
                            break Err(SessionError::Transport(e));
                        }
                    }
                    None => break Ok(()),
                },
                frame = inbound.next() => match frame {
                    None | Some(Ok(SessionMessage::Close)) => break Ok(()),
                    Some(Err(e)) => break Err(SessionError::Transport(e)),
                    Some(Ok(SessionMessage::Text(text))) => {
                        publishes.spawn(publish_inbound(
                            self.pool.clone(),
                            self.outbox,
                            record.clone(),
                            text,
                        ));
                    }
                    Some(Ok(SessionMessage::Binary(bytes))) => {
                        tracing::debug!(connection_id = record.id, bytes = bytes.len(), "Ignoring binary frame");
                    }
                },
                Some(joined) = publishes.join_next(), if !publishes.is_empty() => {
                    if let Err(e) = settle(joined) {
                        break Err(e);
                    }
                }
            }
        };

        // Frames already read were accepted from the client; every publish
        // settles before the session closes, whichever side ended it.
        let mut failed = None;
        while let Some(joined) = publishes.join_next().await {
            if let Err(e) = settle(joined) {
                tracing::error!(connection_id = record.id, error = %e, "Inbound message not published");
                failed.get_or_insert(e);
            }
        }

        match (served, failed) {
            (Err(e), _) => Err(e),
            (Ok(()), Some(e)) => Err(e),
            (Ok(()), None) => Ok(()),
        }
    }

    async fn close(&self, record: &ConnectionRecord) -> Result<(), StoreError> {
        self.registry.remove(record.id);

        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let subscriptions = self.directory.delete_all_for_connection(&mut uow, record.id).await?;
        self.connections.delete(&mut uow, record.id).await?;
        self.outbox
            .publish(&mut uow, &[ConnectionChangedEvent::deleted(record.to_proto()).into()])
            .await?;
        uow.commit().await?;

        tracing::info!(connection_id = record.id, subscriptions = subscriptions, "Session closed");
        Ok(())
    }

    /// Close records this node owns but holds no live session for, e.g. after
    /// a restart. A record that fails to close is logged and left for the next
    /// run. Returns how many were closed.
    pub async fn reclaim_orphans(&self) -> Result<usize, StoreError> {
        let owned = self
            .connections
            .find_by_host(&self.pool, self.registry.local_node())
            .await?;

        let mut reclaimed = 0;
        for record in owned.iter().filter(|r| !self.registry.contains(r.id)) {
            match self.close(record).await {
                Ok(()) => reclaimed += 1,
                Err(e) => tracing::error!(connection_id = record.id, error = %e, "Failed to reclaim orphaned connection"),
            }
        }

        if reclaimed > 0 {
            tracing::info!(reclaimed, node = %self.registry.local_node(), "Reclaimed orphaned connections");
        }
        Ok(reclaimed)
    }
}

async fn publish_inbound(
    pool: AnyPool,
    outbox: OutboxWriter,
    record: ConnectionRecord,
    text: String,
) -> Result<(), StoreError> {
    let mut uow = UnitOfWork::begin(&pool).await?;
    outbox
        .publish(&mut uow, &[ClientMessageReceivedEvent::text(record.to_proto(), text).into()])
        .await?;
    uow.commit().await
}

fn settle(joined: Result<Result<(), StoreError>, tokio::task::JoinError>) -> Result<(), SessionError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SessionError::Publish(e)),
        Err(e) => Err(SessionError::PublishAborted(e.to_string())),
    }
}
