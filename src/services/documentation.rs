use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for mutesync.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::sse::sessions_stream,
        crate::routes::capture::capture_handler,
        crate::routes::sessions::start_session,
        crate::routes::sessions::get_session,
        crate::routes::sessions::end_session,
        crate::routes::sessions::pause_session,
        crate::routes::sessions::resume_session,
        crate::routes::sessions::refresh_session,
        crate::routes::voice::update_presence,
        crate::routes::voice::remove_presence,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::health::HealthStatus,
            crate::dto::session::StartSessionRequest,
            crate::dto::session::StartSessionResponse,
            crate::dto::session::SessionActionResponse,
            crate::dto::session::SessionSummary,
            crate::dto::session::PlayerSummary,
            crate::dto::voice::VoicePresenceRequest,
            crate::dto::capture::CaptureInboundMessage,
            crate::dto::capture::CaptureOutboundMessage,
            crate::dto::job::JobEnvelope,
            crate::dto::job::JobType,
            crate::dto::job::ModifyTask,
            crate::dto::job::LobbyPayload,
            crate::dto::job::GameOverPayload,
            crate::dto::job::PlayerInfo,
            crate::dto::sse::SystemStatus,
            crate::dto::sse::GameOverEvent,
            crate::dto::sse::PlayerOutcome,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sessions", description = "Session administration"),
        (name = "sse", description = "Server-sent events streams"),
        (name = "capture", description = "WebSocket operations for capture clients"),
        (name = "voice", description = "Voice presence feed from the platform gateway"),
    )
)]
pub struct ApiDoc;
