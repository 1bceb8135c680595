use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::ConversationId,
    error::{ApiError, RemoteError},
    protocol::{
        ChannelEvent, ClientFrame, IncrementViewWrite, MarkReadWrite, MessageCursor,
        RealtimeFrame, RefreshRequest, RefreshResponse, RemoteMessage, SendMessageWrite,
        ToggleLikeWrite, UnreadCountEntry, UnreadCountQuery, WriteResponse,
    },
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::remote::{Credential, CredentialProvider, LiveChannel, RemoteStore, Subscription};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Base URLs for the HTTP API and its realtime websocket.
#[derive(Debug, Clone)]
pub struct Endpoints {
    http: Url,
    ws: Url,
}

impl Endpoints {
    pub fn new(server_url: &str) -> Result<Self, RemoteError> {
        let mut http = Url::parse(server_url.trim())
            .map_err(|err| RemoteError::Validation(format!("invalid server url '{server_url}': {err}")))?;
        if !http.path().ends_with('/') {
            let path = format!("{}/", http.path());
            http.set_path(&path);
        }
        let ws_scheme = match http.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => {
                return Err(RemoteError::Validation(format!(
                    "server url must use http or https, got '{other}'"
                )))
            }
        };
        let mut ws = http.clone();
        ws.set_scheme(ws_scheme)
            .map_err(|()| RemoteError::Validation("cannot derive websocket url".into()))?;
        Ok(Self { http, ws })
    }

    fn http(&self, path: &str) -> Result<Url, RemoteError> {
        self.http
            .join(path)
            .map_err(|err| RemoteError::Validation(format!("invalid endpoint '{path}': {err}")))
    }

    fn realtime(&self, conversations: &[ConversationId]) -> Result<Url, RemoteError> {
        let mut url = self
            .ws
            .join("realtime")
            .map_err(|err| RemoteError::Validation(format!("invalid realtime endpoint: {err}")))?;
        let ids: Vec<String> = conversations.iter().map(|id| id.0.to_string()).collect();
        url.query_pairs_mut()
            .append_pair("conversations", &ids.join(","));
        Ok(url)
    }
}

fn http_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|err| {
            warn!(error = %err, "transport: falling back to default http client");
            Client::new()
        })
}

/// Maps an HTTP failure onto the sync error taxonomy.
pub fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let message = serde_json::from_str::<ApiError>(body)
        .map(|err| err.message)
        .unwrap_or_else(|_| format!("{status}: {}", body.trim()));
    match status {
        StatusCode::UNAUTHORIZED => RemoteError::AuthExpired(message),
        StatusCode::CONFLICT => RemoteError::AlreadyExists(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => RemoteError::Network(message),
        status if status.is_server_error() => RemoteError::Network(message),
        _ => RemoteError::Validation(message),
    }
}

fn request_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(REQUEST_TIMEOUT)
    } else {
        RemoteError::Network(err.to_string())
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, RemoteError> {
    let response = request.send().await.map_err(request_error)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(status, &body));
    }
    response
        .json()
        .await
        .map_err(|err| RemoteError::Network(format!("invalid response body: {err}")))
}

/// Access token held in memory, replaced through `/auth/refresh`.
pub struct HttpCredentialProvider {
    http: Client,
    endpoints: Endpoints,
    refresh_token: Option<String>,
    current: RwLock<Option<Credential>>,
}

impl HttpCredentialProvider {
    pub fn new(
        server_url: &str,
        access_token: Option<String>,
        refresh_token: Option<String>,
    ) -> Result<Self, RemoteError> {
        Ok(Self {
            http: http_client(),
            endpoints: Endpoints::new(server_url)?,
            refresh_token,
            current: RwLock::new(access_token.map(|access_token| Credential {
                access_token,
                expires_at: None,
            })),
        })
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn current(&self) -> Option<Credential> {
        self.current.read().await.clone()
    }

    async fn refresh(&self) -> Result<Credential, RemoteError> {
        let Some(refresh_token) = self.refresh_token.clone() else {
            return Err(RemoteError::AuthExpired("no refresh token configured".into()));
        };
        let response: RefreshResponse = send_json(
            self.http
                .post(self.endpoints.http("auth/refresh")?)
                .json(&RefreshRequest { refresh_token }),
        )
        .await?;
        let credential = Credential {
            access_token: response.access_token,
            expires_at: response.expires_at,
        };
        *self.current.write().await = Some(credential.clone());
        info!(expires_at = ?credential.expires_at, "transport: access token refreshed");
        Ok(credential)
    }
}

#[derive(Serialize)]
struct FetchQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    after_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    after_ts: Option<String>,
    limit: u32,
}

fn wire_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// [`RemoteStore`] over the JSON HTTP API and the realtime websocket.
pub struct HttpRemoteStore {
    http: Client,
    endpoints: Endpoints,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpRemoteStore {
    pub fn new(
        server_url: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, RemoteError> {
        Ok(Self {
            http: http_client(),
            endpoints: Endpoints::new(server_url)?,
            credentials,
        })
    }

    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.credentials.current().await {
            Some(credential) => request.bearer_auth(credential.access_token),
            None => request,
        }
    }

    async fn post_writes<W: Serialize + Sync>(
        &self,
        path: &str,
        writes: &[W],
    ) -> Result<Vec<WriteResponse>, RemoteError> {
        let request = self.http.post(self.endpoints.http(path)?).json(writes);
        let responses: Vec<WriteResponse> = send_json(self.authorized(request).await).await?;
        debug!(path, writes = writes.len(), responses = responses.len(), "transport: batch written");
        Ok(responses)
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn subscribe(&self, conversations: &[ConversationId]) -> Result<Subscription, RemoteError> {
        let url = self.endpoints.realtime(conversations)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| RemoteError::Validation(format!("invalid realtime request: {err}")))?;
        if let Some(credential) = self.credentials.current().await {
            let value = HeaderValue::from_str(&format!("Bearer {}", credential.access_token))
                .map_err(|err| RemoteError::Validation(format!("invalid access token: {err}")))?;
            request.headers_mut().insert("authorization", value);
        }

        let (stream, _) = connect_async(request).await.map_err(ws_error)?;
        debug!(conversations = conversations.len(), "transport: realtime socket open");
        Ok(WsChannel::start(stream))
    }

    async fn fetch_since(
        &self,
        conversation_id: ConversationId,
        cursor: Option<MessageCursor>,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        let query = FetchQuery {
            after_id: cursor.map(|c| c.message_id.0),
            after_ts: cursor.map(|c| wire_timestamp(c.created_at)),
            limit,
        };
        let request = self
            .http
            .get(self
                .endpoints
                .http(&format!("conversations/{}/messages", conversation_id.0))?)
            .query(&query);
        send_json(self.authorized(request).await).await
    }

    async fn send_messages(
        &self,
        writes: Vec<SendMessageWrite>,
    ) -> Result<Vec<WriteResponse>, RemoteError> {
        self.post_writes("writes/messages", &writes).await
    }

    async fn toggle_likes(
        &self,
        writes: Vec<ToggleLikeWrite>,
    ) -> Result<Vec<WriteResponse>, RemoteError> {
        self.post_writes("writes/likes", &writes).await
    }

    async fn increment_views(
        &self,
        writes: Vec<IncrementViewWrite>,
    ) -> Result<Vec<WriteResponse>, RemoteError> {
        self.post_writes("writes/views", &writes).await
    }

    async fn mark_reads(
        &self,
        writes: Vec<MarkReadWrite>,
    ) -> Result<Vec<WriteResponse>, RemoteError> {
        self.post_writes("writes/read_marks", &writes).await
    }

    async fn fetch_unread_counts(
        &self,
        query: UnreadCountQuery,
    ) -> Result<Vec<UnreadCountEntry>, RemoteError> {
        let request = self
            .http
            .post(self.endpoints.http("unread_counts")?)
            .json(&query);
        send_json(self.authorized(request).await).await
    }
}

fn ws_error(err: tungstenite::Error) -> RemoteError {
    match err {
        tungstenite::Error::Http(response) => {
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            status_error(response.status(), &body)
        }
        other => RemoteError::Network(format!("realtime connect failed: {other}")),
    }
}

/// Live websocket: a reader task turns frames into [`ChannelEvent`]s and
/// counts heartbeat acks.
struct WsChannel {
    writer: Mutex<SplitSink<WsStream, Message>>,
    acks: watch::Receiver<u64>,
    reader: JoinHandle<()>,
}

impl WsChannel {
    fn start(stream: WsStream) -> Subscription {
        let (writer, mut reader) = stream.split();
        let (events_tx, events_rx) = mpsc::channel(256);
        let (acks_tx, acks_rx) = watch::channel(0u64);

        let reader = tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RealtimeFrame>(&text) {
                        Ok(RealtimeFrame::Subscribed { .. }) => ChannelEvent::Subscribed,
                        Ok(RealtimeFrame::Change { message }) => ChannelEvent::Change(message),
                        Ok(RealtimeFrame::Error(err)) => ChannelEvent::Error(err.message),
                        Ok(RealtimeFrame::HeartbeatAck) => {
                            acks_tx.send_modify(|count| *count += 1);
                            continue;
                        }
                        Err(err) => {
                            warn!(error = %err, "transport: unreadable realtime frame skipped");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = events_tx
                            .send(ChannelEvent::Error(format!("realtime receive failed: {err}")))
                            .await;
                        return;
                    }
                };
                if events_tx.send(event).await.is_err() {
                    return;
                }
            }
            let _ = events_tx.send(ChannelEvent::Closed).await;
        });

        Subscription {
            channel: Arc::new(WsChannel {
                writer: Mutex::new(writer),
                acks: acks_rx,
                reader,
            }),
            events: events_rx,
        }
    }
}

#[async_trait]
impl LiveChannel for WsChannel {
    async fn heartbeat(&self) -> Result<(), RemoteError> {
        let mut acks = self.acks.clone();
        let before = *acks.borrow_and_update();
        let frame = serde_json::to_string(&ClientFrame::Heartbeat)
            .map_err(|err| RemoteError::Validation(err.to_string()))?;
        self.writer
            .lock()
            .await
            .send(Message::Text(frame))
            .await
            .map_err(|err| RemoteError::Network(format!("heartbeat send failed: {err}")))?;
        acks.wait_for(|count| *count > before)
            .await
            .map_err(|_| RemoteError::Network("realtime socket closed".into()))?;
        Ok(())
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.send(Message::Close(None)).await {
            debug!(error = %err, "transport: close frame not sent");
        }
        self.reader.abort();
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
