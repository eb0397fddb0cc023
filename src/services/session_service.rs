//! Administrative session commands: start, end, pause, resume, refresh and lookups.

use rand::Rng;
use tracing::{info, warn};

use crate::{
    dao::{
        keys,
        shared_store::{SessionPointer, SharedStateStore},
    },
    dto::session::{
        SessionActionResponse, SessionSummary, StartSessionRequest, StartSessionResponse,
    },
    error::ServiceError,
    services::{locking::lock_and_load, session_loop::SessionEventLoop},
    state::{SharedState, session::SessionRecord},
};

const MAX_CODE_ATTEMPTS: usize = 16;
const KILL_MESSAGE: &str = "kill";

fn random_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| char::from(rng.random_range(b'A'..=b'Z')))
        .collect()
}

async fn unique_code(store: &SharedStateStore, length: usize) -> Result<String, ServiceError> {
    for _ in 0..MAX_CODE_ATTEMPTS {
        let code = random_code(length);
        if store
            .resolve(SessionPointer::ConnectCode(&code))
            .await?
            .is_none()
        {
            return Ok(code);
        }
    }
    Err(ServiceError::InvalidState(
        "could not allocate a free connect code".into(),
    ))
}

/// Resolve a connect code or channel id to the canonical session id.
pub async fn resolve(
    state: &SharedState,
    pointer: SessionPointer<'_>,
) -> Result<String, ServiceError> {
    let store = state.require_store()?;
    store
        .resolve(pointer)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("no session for {pointer:?}")))
}

/// Start a session bound to the requested channels, replacing any session
/// already bound to one of them.
pub async fn start_session(
    state: &SharedState,
    request: StartSessionRequest,
) -> Result<StartSessionResponse, ServiceError> {
    let store = state.require_store()?;
    let connect_code = unique_code(store, state.config().connect_code_length).await?;

    let mut pointers = vec![SessionPointer::TextChannel(&request.text_channel_id)];
    if !request.voice_channel_id.is_empty() {
        pointers.push(SessionPointer::VoiceChannel(&request.voice_channel_id));
    }
    for pointer in pointers {
        if let Some(previous) = store.resolve(pointer).await? {
            info!(session_id = %previous, ?pointer, "replacing session bound to the same channel");
            stop_session(state, &previous).await?;
        }
    }

    let record = SessionRecord::new(
        request.guild_id,
        connect_code,
        request.text_channel_id,
        request.voice_channel_id,
    );
    store.put_session(&record, None).await?;
    SessionEventLoop::spawn(state.runtime().clone(), &record.session_id).await?;
    state.runtime().refresh(&record);

    info!(
        session_id = %record.session_id,
        guild_id = %record.guild_id,
        connect_code = %record.connect_code,
        "session started"
    );
    Ok(StartSessionResponse {
        session_id: record.session_id,
        connect_code: record.connect_code,
    })
}

/// End the session identified by its connect code.
pub async fn end_session(
    state: &SharedState,
    connect_code: &str,
) -> Result<SessionActionResponse, ServiceError> {
    let session_id = resolve(state, SessionPointer::ConnectCode(connect_code)).await?;
    stop_session(state, &session_id).await?;
    Ok(SessionActionResponse::new(session_id, "end"))
}

/// Signal the owning loop; without a listening loop the session is torn down here.
async fn stop_session(state: &SharedState, session_id: &str) -> Result<(), ServiceError> {
    let store = state.require_store()?;
    let receivers = store
        .publish(keys::kill(session_id), KILL_MESSAGE.to_string())
        .await?;
    if receivers > 0 {
        return Ok(());
    }

    warn!(session_id, "no loop owns the session; tearing it down directly");
    if let Some(record) = store.delete_session(session_id).await? {
        state.runtime().restore_voice(&record).await;
        if let Err(err) = state.runtime().queue(&record.connect_code).clear().await {
            warn!(session_id, error = %err, "failed to clear queue");
        }
    }
    Ok(())
}

/// Pause or resume voice enforcement.
///
/// Pausing un-mutes every tracked member, resuming schedules a voice pass for
/// the current phase.
pub async fn set_running(
    state: &SharedState,
    connect_code: &str,
    running: bool,
) -> Result<SessionActionResponse, ServiceError> {
    let session_id = resolve(state, SessionPointer::ConnectCode(connect_code)).await?;
    let runtime = state.runtime();
    let Some((mut record, lock)) =
        lock_and_load(runtime.store(), &session_id, runtime.retry_policy()).await?
    else {
        return Err(ServiceError::NotFound(format!("session {session_id}")));
    };
    record.running = running;
    runtime.store().put_session(&record, Some(lock)).await?;

    if running {
        // queued behind any batch already in flight
        let phase = record.game.phase;
        let scheduled = runtime
            .schedule_voice_update(&record, phase, phase, runtime.detached_shutdown())
            .await?;
        info!(%session_id, scheduled, "session enforcement resumed");
    } else {
        let report = runtime.restore_voice(&record).await;
        info!(
            %session_id,
            applied = report.counts.applied(),
            "session enforcement paused"
        );
    }
    runtime.refresh(&record);
    Ok(SessionActionResponse::new(
        session_id,
        if running { "resume" } else { "pause" },
    ))
}

/// Push a fresh snapshot to the presentation layer.
pub async fn refresh(
    state: &SharedState,
    connect_code: &str,
) -> Result<SessionActionResponse, ServiceError> {
    let record = load(state, connect_code).await?;
    state.runtime().refresh(&record);
    Ok(SessionActionResponse::new(record.session_id, "refresh"))
}

/// Read-only summary of a session.
pub async fn summary(state: &SharedState, connect_code: &str) -> Result<SessionSummary, ServiceError> {
    let record = load(state, connect_code).await?;
    Ok(SessionSummary::from(&record))
}

async fn load(state: &SharedState, connect_code: &str) -> Result<SessionRecord, ServiceError> {
    let session_id = resolve(state, SessionPointer::ConnectCode(connect_code)).await?;
    state
        .store()
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("session {session_id}")))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        config::AppConfig,
        dao::shared_store::MemoryBackend,
        state::AppState,
    };

    fn state() -> (SharedState, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let state = AppState::new(AppConfig::default(), backend.clone(), None, Vec::new());
        (state, backend)
    }

    fn request(text: &str, voice: &str) -> StartSessionRequest {
        StartSessionRequest {
            guild_id: "guild".into(),
            text_channel_id: text.into(),
            voice_channel_id: voice.into(),
        }
    }

    #[test]
    fn codes_are_uppercase_letters() {
        let code = random_code(8);
        assert_eq!(code.len(), 8);
        assert!(code.chars().all(|c| c.is_ascii_uppercase()));
    }

    #[tokio::test(start_paused = true)]
    async fn started_sessions_are_resolvable() {
        let (state, _) = state();
        let started = start_session(&state, request("text", "voice")).await.unwrap();
        assert_eq!(started.connect_code.len(), 8);

        let by_voice = resolve(&state, SessionPointer::VoiceChannel("voice"))
            .await
            .unwrap();
        assert_eq!(by_voice, started.session_id);

        let summary = summary(&state, &started.connect_code).await.unwrap();
        assert!(summary.running);
        assert_eq!(summary.match_id, -1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_game_replaces_the_session_on_the_same_channel() {
        let (state, _) = state();
        let first = start_session(&state, request("text", "voice")).await.unwrap();
        let second = start_session(&state, request("text", "other"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(state.store().get_session(&first.session_id).await.unwrap().is_none());
        let by_text = resolve(&state, SessionPointer::TextChannel("text"))
            .await
            .unwrap();
        assert_eq!(by_text, second.session_id);
        assert!(matches!(
            summary(&state, &first.connect_code).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ending_a_session_deletes_it() {
        let (state, _) = state();
        let started = start_session(&state, request("text", "voice")).await.unwrap();
        end_session(&state, &started.connect_code).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(
            state
                .store()
                .get_session(&started.session_id)
                .await
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            end_session(&state, &started.connect_code).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_toggle_enforcement() {
        let (state, _) = state();
        let started = start_session(&state, request("text", "voice")).await.unwrap();

        set_running(&state, &started.connect_code, false).await.unwrap();
        assert!(!summary(&state, &started.connect_code).await.unwrap().running);
        set_running(&state, &started.connect_code, true).await.unwrap();
        assert!(summary(&state, &started.connect_code).await.unwrap().running);
    }

    #[tokio::test]
    async fn degraded_store_rejects_commands() {
        let (state, _) = state();
        state.update_degraded(true);
        assert!(matches!(
            start_session(&state, request("text", "voice")).await,
            Err(ServiceError::Degraded)
        ));
    }
}
