use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use yup_oauth2::authenticator_delegate::InstalledFlowDelegate;
use yup_oauth2::storage::{TokenInfo, TokenStorage};
use yup_oauth2::{
    ApplicationSecret, InstalledFlowAuthenticator, InstalledFlowReturnMethod,
    read_application_secret,
};

use crate::db::MessageStore;

pub const SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/chat.spaces.readonly",
    "https://www.googleapis.com/auth/chat.messages",
    "https://www.googleapis.com/auth/chat.messages.create",
];

const TOKEN_KEY: &str = "oauth_token";

pub type ChatAuthenticator = yup_oauth2::authenticator::Authenticator<
    hyper_rustls::HttpsConnector<hyper::client::HttpConnector>,
>;

/// Keeps the OAuth token in the sidecar's own database so it survives restarts
/// alongside the message history.
#[derive(Clone)]
pub struct SqliteTokenStorage {
    store: MessageStore,
}

impl SqliteTokenStorage {
    pub fn new(store: MessageStore) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> Result<Option<TokenInfo>> {
        match self.store.get_auth(TOKEN_KEY).await? {
            Some(serialized) => {
                let token =
                    serde_json::from_str(&serialized).context("Failed to deserialize token")?;
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }

    /// True once a consent flow has produced a refresh token.
    pub async fn has_refresh_token(&self) -> bool {
        matches!(self.load().await, Ok(Some(TokenInfo { refresh_token: Some(_), .. })))
    }

    pub async fn clear_token(&self) -> Result<()> {
        self.store.delete_auth(TOKEN_KEY).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStorage for SqliteTokenStorage {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> Result<()> {
        // A refreshed token may come back without a refresh token; keep the old one.
        let mut token = token;
        if token.refresh_token.is_none() {
            if let Ok(Some(previous)) = self.load().await {
                token.refresh_token = previous.refresh_token;
            }
        }

        let serialized = serde_json::to_string(&token).context("Failed to serialize token")?;
        self.store.set_auth(TOKEN_KEY, &serialized).await?;
        Ok(())
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        self.load().await.ok().flatten()
    }
}

/// Refuses the interactive consent step. A running service has nobody to
/// approve it, so a revoked refresh token must fail fast instead of waiting
/// on a redirect that never arrives.
pub struct NoConsentDelegate;

pub const CONSENT_REFUSED: &str = "re-authentication required; run with --login";

impl InstalledFlowDelegate for NoConsentDelegate {
    fn present_user_url<'a>(
        &'a self,
        _url: &'a str,
        _need_code: bool,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<String, String>> + Send + 'a>> {
        Box::pin(async { Err(CONSENT_REFUSED.to_string()) })
    }
}

/// Whether the authenticator may fall back to the browser consent flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consent {
    Interactive,
    Refuse,
}

pub struct Authenticator;

impl Authenticator {
    pub async fn load_secret<P: AsRef<Path>>(path: P) -> Result<ApplicationSecret> {
        read_application_secret(path)
            .await
            .context("Failed to read application secret")
    }

    pub async fn authenticate(
        secret: ApplicationSecret,
        storage: SqliteTokenStorage,
        consent: Consent,
    ) -> Result<ChatAuthenticator> {
        let mut builder =
            InstalledFlowAuthenticator::builder(secret, InstalledFlowReturnMethod::HTTPRedirect)
                .with_storage(Box::new(storage));
        if consent == Consent::Refuse {
            builder = builder.flow_delegate(Box::new(NoConsentDelegate));
        }
        let auth = builder
            .build()
            .await
            .context("Failed to build authenticator")?;

        Ok(auth)
    }
}
