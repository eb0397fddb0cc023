/// Capture client WebSocket handling.
pub mod capture_service;
/// Seams towards the voice platform, guild settings, stats and presentation.
pub mod collaborators;
/// OpenAPI documentation generation.
pub mod documentation;
/// Per-session job queue on the shared store.
pub mod event_queue;
/// Health check service.
pub mod health_service;
/// REST identity client for the voice platform.
#[cfg(feature = "http-identity")]
pub mod http_identity;
/// Primary and secondary identity bookkeeping.
pub mod identity_pool;
/// Session lock acquisition with backoff.
pub mod locking;
/// Fan-out of voice changes over the identity fallback chain.
pub mod mute_dispatcher;
/// Linking in-game players to platform users.
pub mod pairing;
/// Shared session engine used by loops and admin commands.
pub mod runtime;
/// One consumer loop per session.
pub mod session_loop;
/// Session administration commands.
pub mod session_service;
/// Server-Sent Events broadcasting service.
pub mod sse_service;
/// Shared store health supervision.
pub mod storage_supervisor;
/// Voice presence feed into the in-process roster.
pub mod voice_presence_service;
/// Voice rule evaluation and change planning.
pub mod voice_service;
