use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt, stream::BoxStream};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    dao::{keys, shared_store::SessionPointer},
    dto::{
        capture::{CaptureInboundMessage, CaptureOutboundMessage},
        job::{Job, ModifyTask},
    },
    error::ServiceError,
    services::event_queue::EventQueue,
    state::SharedState,
};

const IDENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while serving a capture connection.
#[derive(Debug, Error)]
enum CaptureError {
    /// Writer channel closed - connection should be terminated immediately.
    #[error("connection closed")]
    ConnectionClosed,
    /// Error from the queue or the store.
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
}

/// Handle the full lifecycle of one capture client WebSocket connection.
pub async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Dedicated writer task keeps outbound messages flowing even while we await inbound frames.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let initial_message = match tokio::time::timeout(IDENT_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(Message::Close(_)))) => {
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Ok(_))) => {
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(Some(Err(err))) => {
            warn!(error = %err, "websocket receive error");
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Ok(None) | Err(_) => {
            warn!("capture client did not send its connect code in time");
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let connect_code = match CaptureInboundMessage::from_json_str(&initial_message) {
        Ok(CaptureInboundMessage::Connect { connect_code }) => connect_code,
        Ok(_) => {
            warn!("first capture message was not a connect frame");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
        Err(err) => {
            warn!(error = %err, "failed to parse capture message");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    let known = match state.store().resolve(SessionPointer::ConnectCode(&connect_code)).await {
        Ok(session) => session.is_some(),
        Err(err) => {
            warn!(%connect_code, error = %err, "failed to resolve connect code");
            false
        }
    };
    if !known {
        warn!(%connect_code, "unknown connect code; closing capture connection");
        let _ = outbound_tx.send(Message::Close(None));
        finalize(writer_task, outbound_tx).await;
        return;
    }

    let queue = state.runtime().queue(&connect_code);
    let forwarder = match spawn_forwarder(&state, &queue, outbound_tx.clone()).await {
        Ok(task) => task,
        Err(err) => {
            warn!(%connect_code, error = %err, "failed to subscribe capture channels");
            let _ = outbound_tx.send(Message::Close(None));
            finalize(writer_task, outbound_tx).await;
            return;
        }
    };

    info!(%connect_code, "capture client connected");
    let connected = CaptureOutboundMessage::Connected {
        connect_code: connect_code.clone(),
    };
    if send_message_to_websocket(&outbound_tx, &connected).is_err() {
        forwarder.abort();
        finalize(writer_task, outbound_tx).await;
        return;
    }
    push_job(&queue, &Job::Connection(true)).await;

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                debug!(%connect_code, payload = %text, "received capture message");
                match CaptureInboundMessage::from_json_str(&text) {
                    Ok(inbound) => {
                        if let Err(err) = handle_inbound(&state, &queue, inbound).await {
                            warn!(%connect_code, error = %err, "failed to handle capture message");
                            if matches!(err, CaptureError::ConnectionClosed) {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%connect_code, error = %err, "failed to parse capture message");
                    }
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = outbound_tx.send(Message::Pong(payload));
            }
            Ok(Message::Close(frame)) => {
                info!(%connect_code, "capture client closed");
                let _ = outbound_tx.send(Message::Close(frame));
                break;
            }
            Ok(Message::Binary(_)) => {}
            Ok(Message::Pong(_)) => {}
            Err(err) => {
                warn!(%connect_code, error = %err, "websocket error");
                break;
            }
        }
    }

    forwarder.abort();
    push_job(&queue, &Job::Connection(false)).await;
    info!(%connect_code, "capture client disconnected");

    finalize(writer_task, outbound_tx).await;
}

async fn handle_inbound(
    state: &SharedState,
    queue: &EventQueue,
    inbound: CaptureInboundMessage,
) -> Result<(), CaptureError> {
    match inbound {
        CaptureInboundMessage::Job { job } => {
            queue.push(&job).await.map_err(ServiceError::from)?;
        }
        CaptureInboundMessage::TaskAck { task_id, success } => {
            state
                .store()
                .publish(
                    keys::task_ack(queue.connect_code(), &task_id),
                    success.to_string(),
                )
                .await
                .map_err(ServiceError::from)?;
        }
        CaptureInboundMessage::Connect { .. } => {
            warn!(connect_code = %queue.connect_code(), "ignoring duplicate connect frame");
        }
        CaptureInboundMessage::Unknown => {
            debug!(connect_code = %queue.connect_code(), "ignoring unknown capture message");
        }
    }
    Ok(())
}

async fn push_job(queue: &EventQueue, job: &Job) {
    if let Err(err) = queue.push_job(job).await {
        warn!(connect_code = %queue.connect_code(), error = %err, "failed to enqueue capture job");
    }
}

/// Relay liveness acks and modify tasks from the store to the socket.
async fn spawn_forwarder(
    state: &SharedState,
    queue: &EventQueue,
    tx: mpsc::UnboundedSender<Message>,
) -> Result<JoinHandle<()>, ServiceError> {
    let mut acks: BoxStream<'static, String> = queue.subscribe_ack().await?;
    let mut tasks = state
        .store()
        .subscribe(keys::tasks(queue.connect_code()))
        .await?;
    let connect_code = queue.connect_code().to_string();

    Ok(tokio::spawn(async move {
        loop {
            let outbound = tokio::select! {
                ack = acks.next() => match ack {
                    Some(_) => CaptureOutboundMessage::Listening,
                    None => break,
                },
                task = tasks.next() => match task {
                    Some(raw) => match serde_json::from_str::<ModifyTask>(&raw) {
                        Ok(task) => CaptureOutboundMessage::Modify(task),
                        Err(err) => {
                            warn!(%connect_code, error = %err, "dropping malformed modify task");
                            continue;
                        }
                    },
                    None => break,
                },
            };
            if send_message_to_websocket(&tx, &outbound).is_err() {
                break;
            }
        }
    }))
}

/// Serialize a payload and push it onto the provided WebSocket sender.
///
/// Serialization failures are logged and swallowed; a closed writer is reported.
fn send_message_to_websocket<T>(
    tx: &mpsc::UnboundedSender<Message>,
    value: &T,
) -> Result<(), CaptureError>
where
    T: ?Sized + serde::Serialize + std::fmt::Debug,
{
    let payload = match serde_json::to_string(value) {
        Ok(p) => p,
        Err(err) => {
            warn!(error = %err, "failed to serialize message `{value:?}`");
            return Ok(());
        }
    };

    tx.send(Message::Text(payload.into()))
        .map_err(|_| CaptureError::ConnectionClosed)
}

/// Ensure the writer task winds down before we return from the socket handler.
async fn finalize(writer_task: JoinHandle<()>, outbound_tx: mpsc::UnboundedSender<Message>) {
    drop(outbound_tx);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::AppConfig,
        dao::shared_store::MemoryBackend,
        dto::job::{JobEnvelope, JobType},
        state::AppState,
    };

    fn state() -> SharedState {
        AppState::new(
            AppConfig::default(),
            Arc::new(MemoryBackend::new()),
            None,
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn forwarder_relays_acks_and_tasks() {
        let state = state();
        let queue = state.runtime().queue("CODE");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let forwarder = spawn_forwarder(&state, &queue, tx).await.unwrap();

        queue.ack().await.unwrap();
        let task = ModifyTask {
            task_id: "t1".into(),
            guild_id: "g".into(),
            user_id: "u".into(),
            mute: true,
            deaf: false,
        };
        state
            .store()
            .publish(keys::tasks("CODE"), serde_json::to_string(&task).unwrap())
            .await
            .unwrap();

        let Some(Message::Text(first)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        assert_eq!(first.as_str(), r#"{"type":"listening"}"#);
        let Some(Message::Text(second)) = rx.recv().await else {
            panic!("expected a text frame");
        };
        assert!(second.as_str().contains(r#""taskId":"t1""#));
        forwarder.abort();
    }

    #[tokio::test]
    async fn inbound_jobs_and_acks_reach_the_store() {
        let state = state();
        let queue = state.runtime().queue("CODE");
        let mut acks = state
            .store()
            .subscribe(keys::task_ack("CODE", "t1"))
            .await
            .unwrap();

        handle_inbound(
            &state,
            &queue,
            CaptureInboundMessage::Job {
                job: JobEnvelope {
                    kind: JobType::Connection,
                    payload: "true".into(),
                },
            },
        )
        .await
        .unwrap();
        handle_inbound(
            &state,
            &queue,
            CaptureInboundMessage::TaskAck {
                task_id: "t1".into(),
                success: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(queue.pop().await.unwrap(), Job::Connection(true));
        assert_eq!(acks.next().await.as_deref(), Some("true"));
    }
}
