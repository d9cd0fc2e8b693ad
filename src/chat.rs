use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use hyper::client::HttpConnector;
use hyper::{Body, Method, Request, header};
use hyper_rustls::HttpsConnector;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::auth::{ChatAuthenticator, SCOPES, SqliteTokenStorage};
use crate::error::{ChatApiError, ChatApiErrorKind};
use crate::models::{NewMessage, Space};

const API_BASE: &str = "https://chat.googleapis.com/v1";

/// The upstream chat service, scoped to one space.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Messages created after `since`, all pages, oldest first.
    async fn list_messages(
        &self,
        since: DateTime<Utc>,
        page_size: u32,
    ) -> Result<Vec<NewMessage>, ChatApiError>;

    async fn send_message(&self, text: &str) -> Result<NewMessage, ChatApiError>;

    async fn get_space(&self) -> Result<Space, ChatApiError>;

    async fn is_authenticated(&self) -> bool;
}

/// Remembers whether the last upstream answer rejected our credentials.
#[derive(Debug, Clone, Default)]
struct AuthHealth {
    rejected: Arc<AtomicBool>,
}

impl AuthHealth {
    fn observe<T>(&self, result: &Result<T, ChatApiError>) {
        match result {
            Ok(_) => self.rejected.store(false, Ordering::Relaxed),
            Err(e) if e.kind == ChatApiErrorKind::AuthExpired => {
                self.rejected.store(true, Ordering::Relaxed)
            }
            Err(_) => {}
        }
    }

    fn is_rejected(&self) -> bool {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct GoogleChatClient {
    http: hyper::Client<HttpsConnector<HttpConnector>>,
    auth: ChatAuthenticator,
    storage: SqliteTokenStorage,
    space_id: String,
    health: AuthHealth,
}

impl GoogleChatClient {
    pub fn new(
        auth: ChatAuthenticator,
        storage: SqliteTokenStorage,
        space_id: String,
    ) -> anyhow::Result<Self> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()?
            .https_only()
            .enable_http1()
            .build();
        Ok(Self {
            http: hyper::Client::builder().build(connector),
            auth,
            storage,
            space_id,
            health: AuthHealth::default(),
        })
    }

    async fn access_token(&self) -> Result<String, ChatApiError> {
        // Never start a consent flow from here; that only happens via --login.
        if !self.storage.has_refresh_token().await {
            return Err(ChatApiError::auth_expired(
                "not authenticated; run with --login first",
            ));
        }
        let token = self
            .auth
            .token(SCOPES)
            .await
            .map_err(|e| ChatApiError::auth_expired(format!("token refresh failed: {}", e)))?;
        token
            .token()
            .map(str::to_string)
            .ok_or_else(|| ChatApiError::auth_expired("token response had no access token"))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ChatApiError> {
        let result = self.request(method, url, body).await;
        self.health.observe(&result);
        result
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ChatApiError> {
        let token = self.access_token().await?;
        let mut req = Request::builder()
            .method(method)
            .uri(url)
            .header(header::AUTHORIZATION, format!("Bearer {}", token));
        let body = match body {
            Some(json) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let req = req
            .body(body)
            .map_err(|e| ChatApiError::unknown(format!("invalid request: {}", e)))?;

        let resp = self
            .http
            .request(req)
            .await
            .map_err(|e| ChatApiError::network(e.to_string()))?;
        let status = resp.status();
        let bytes = hyper::body::to_bytes(resp.into_body())
            .await
            .map_err(|e| ChatApiError::network(e.to_string()))?;

        if !status.is_success() {
            return Err(ChatApiError::from_status(
                status.as_u16(),
                &String::from_utf8_lossy(&bytes),
            ));
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| ChatApiError::unknown(format!("unexpected response: {}", e)))
    }
}

#[async_trait]
impl ChatClient for GoogleChatClient {
    async fn list_messages(
        &self,
        since: DateTime<Utc>,
        page_size: u32,
    ) -> Result<Vec<NewMessage>, ChatApiError> {
        let filter = format!(
            "createTime > \"{}\"",
            since.to_rfc3339_opts(SecondsFormat::Micros, true)
        );
        let mut messages = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/{}/messages?pageSize={}&filter={}",
                API_BASE,
                self.space_id,
                page_size.min(1000),
                urlencoding::encode(&filter)
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
            }

            let page: ListMessagesResponse = self.call(Method::GET, &url, None).await?;
            debug!(count = page.messages.len(), "fetched message page");
            messages.extend(page.messages.into_iter().map(ApiMessage::normalize));

            page_token = page.next_page_token.filter(|t| !t.is_empty());
            if page_token.is_none() {
                break;
            }
        }

        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }

    async fn send_message(&self, text: &str) -> Result<NewMessage, ChatApiError> {
        let url = format!("{}/{}/messages", API_BASE, self.space_id);
        let sent: ApiMessage = self
            .call(Method::POST, &url, Some(serde_json::json!({ "text": text })))
            .await?;
        Ok(sent.normalize())
    }

    async fn get_space(&self) -> Result<Space, ChatApiError> {
        let url = format!("{}/{}", API_BASE, self.space_id);
        let space: ApiSpace = self.call(Method::GET, &url, None).await?;
        Ok(Space {
            id: space.name,
            display_name: space.display_name,
            space_type: space.space_type,
        })
    }

    async fn is_authenticated(&self) -> bool {
        !self.health.is_rejected() && self.storage.has_refresh_token().await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMessagesResponse {
    #[serde(default)]
    messages: Vec<ApiMessage>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiMessage {
    name: String,
    #[serde(default)]
    sender: Option<ApiUser>,
    #[serde(default)]
    text: Option<String>,
    create_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiUser {
    display_name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiSpace {
    name: String,
    display_name: Option<String>,
    space_type: Option<String>,
}

impl ApiMessage {
    fn normalize(self) -> NewMessage {
        let (sender_name, sender_email) = match self.sender {
            Some(user) => (user.display_name, user.email),
            None => (None, None),
        };
        NewMessage {
            id: self.name,
            sender_name: sender_name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            sender_email: sender_email.filter(|e| !e.is_empty()),
            text: self.text.unwrap_or_default(),
            created_at: self.create_time,
        }
    }
}
