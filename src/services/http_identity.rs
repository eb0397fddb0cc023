//! Identity collaborator backed by the platform's REST API.

use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::debug;

use crate::{
    config::IdentityConfig,
    services::collaborators::{ApiError, IdentityClient},
};

#[derive(Serialize)]
struct VoiceStatePatch {
    mute: bool,
    deaf: bool,
}

/// One bot credential talking to the platform over HTTPS.
#[derive(Clone)]
pub struct HttpIdentityApi {
    id: Arc<str>,
    client: Client,
    base_url: Arc<str>,
    token: Arc<str>,
}

impl HttpIdentityApi {
    /// Build a client for `identity`; requests go to `base_url`.
    pub fn new(identity: &IdentityConfig, base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .build()
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        Ok(Self {
            id: Arc::from(identity.id.as_str()),
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            token: Arc::from(identity.token.as_str()),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        self.client
            .request(method, url)
            .header("Authorization", format!("Bot {}", self.token))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        builder
            .send()
            .await
            .map_err(|err| ApiError::Transport(err.to_string()))
    }
}

async fn rejected(response: Response) -> ApiError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    ApiError::Rejected { status, message }
}

impl IdentityClient for HttpIdentityApi {
    fn id(&self) -> &str {
        &self.id
    }

    fn set_voice_state(
        &self,
        guild_id: &str,
        user_id: &str,
        mute: bool,
        deaf: bool,
    ) -> BoxFuture<'static, Result<(), ApiError>> {
        let api = self.clone();
        let path = format!("guilds/{guild_id}/members/{user_id}");
        Box::pin(async move {
            let response = api
                .send(
                    api.request(Method::PATCH, &path)
                        .json(&VoiceStatePatch { mute, deaf }),
                )
                .await?;
            if response.status().is_success() {
                debug!(identity = %api.id, %path, mute, deaf, "voice state applied");
                Ok(())
            } else {
                Err(rejected(response).await)
            }
        })
    }

    fn is_guild_member(&self, guild_id: &str) -> BoxFuture<'static, Result<bool, ApiError>> {
        let api = self.clone();
        let path = format!("users/@me/guilds/{guild_id}/member");
        Box::pin(async move {
            let response = api.send(api.request(Method::GET, &path)).await?;
            match response.status() {
                status if status.is_success() => Ok(true),
                StatusCode::NOT_FOUND => Ok(false),
                _ => Err(rejected(response).await),
            }
        })
    }

    fn leave_guild(&self, guild_id: &str) -> BoxFuture<'static, Result<(), ApiError>> {
        let api = self.clone();
        let path = format!("users/@me/guilds/{guild_id}");
        Box::pin(async move {
            let response = api.send(api.request(Method::DELETE, &path)).await?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(rejected(response).await)
            }
        })
    }
}

/// Build the primary and secondary identities listed in the configuration.
pub fn identities_from_config(
    identities: &[IdentityConfig],
    base_url: &str,
) -> Result<Vec<Arc<dyn IdentityClient>>, ApiError> {
    identities
        .iter()
        .map(|identity| {
            HttpIdentityApi::new(identity, base_url)
                .map(|api| Arc::new(api) as Arc<dyn IdentityClient>)
        })
        .collect()
}
