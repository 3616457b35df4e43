use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use shared::protocol::ServerEvent;
use tokio::{net::TcpStream, sync::watch, task::JoinHandle};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, protocol::frame::coding::CloseCode, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{config::ReconnectPolicy, error::SyncError};

pub const CONNECTED: &str = "connected";
pub const NEW_MESSAGE: &str = "new-message";
pub const MESSAGES_READ: &str = "messages-read";
pub const TYPING: &str = "typing";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubStatus {
    Idle,
    Connecting,
    Open,
    Backoff { attempt: u32, delay: Duration },
    Exhausted,
    AuthRejected,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubClose {
    Normal,
    AuthRejected(String),
    Abnormal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubFrame {
    Text(String),
    Closed(HubClose),
}

#[async_trait]
pub trait HubConnection: Send {
    async fn next_frame(&mut self) -> HubFrame;
}

#[async_trait]
pub trait HubConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn HubConnection>, SyncError>;
}

pub fn hub_url(server_url: &str, token: &str) -> Result<Url, SyncError> {
    let mut url = Url::parse(server_url)
        .map_err(|e| SyncError::Transport(format!("invalid server url {server_url}: {e}")))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(SyncError::Transport(format!(
                "server url must be http or https, got {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::Transport("cannot switch url scheme".into()))?;
    url.set_path("/ws");
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

pub struct WsHubConnector {
    url: Url,
}

impl WsHubConnector {
    pub fn new(server_url: &str, token: &str) -> Result<Self, SyncError> {
        Ok(Self {
            url: hub_url(server_url, token)?,
        })
    }
}

#[async_trait]
impl HubConnector for WsHubConnector {
    async fn connect(&self) -> Result<Box<dyn HubConnection>, SyncError> {
        match connect_async(self.url.as_str()).await {
            Ok((stream, _)) => Ok(Box::new(WsHubConnection { stream })),
            Err(tungstenite::Error::Http(response))
                if response.status() == tungstenite::http::StatusCode::UNAUTHORIZED =>
            {
                Err(SyncError::Auth("hub handshake returned 401".into()))
            }
            Err(err) => Err(SyncError::Transport(format!("hub connect failed: {err}"))),
        }
    }
}

struct WsHubConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl HubConnection for WsHubConnection {
    async fn next_frame(&mut self) -> HubFrame {
        loop {
            let close = match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return HubFrame::Text(text),
                Some(Ok(Message::Close(Some(frame)))) => match frame.code {
                    CloseCode::Normal | CloseCode::Away => HubClose::Normal,
                    CloseCode::Policy => HubClose::AuthRejected(frame.reason.into_owned()),
                    code => HubClose::Abnormal(format!(
                        "closed with {}: {}",
                        u16::from(code),
                        frame.reason
                    )),
                },
                Some(Ok(Message::Close(None))) => HubClose::Abnormal("closed without code".into()),
                Some(Ok(_)) => continue,
                Some(Err(err)) => HubClose::Abnormal(err.to_string()),
                None => HubClose::Abnormal("stream ended".into()),
            };
            return HubFrame::Closed(close);
        }
    }
}

pub type HubHandler = Arc<dyn Fn(ServerEvent) + Send + Sync>;

struct HubShared {
    connector: Arc<dyn HubConnector>,
    policy: ReconnectPolicy,
    status: watch::Sender<HubStatus>,
    // bumped under the status lock on start and stop; stale loops stop publishing
    generation: AtomicU64,
    handlers: RwLock<HashMap<&'static str, Vec<HubHandler>>>,
}

impl HubShared {
    fn publish(&self, generation: u64, next: HubStatus) -> bool {
        self.status.send_if_modified(|status| {
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            *status = next;
            true
        })
    }
}

pub struct NotificationHubClient {
    shared: Arc<HubShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationHubClient {
    pub fn new(connector: Arc<dyn HubConnector>, policy: ReconnectPolicy) -> Self {
        let (status, _) = watch::channel(HubStatus::Idle);
        Self {
            shared: Arc::new(HubShared {
                connector,
                policy,
                status,
                generation: AtomicU64::new(0),
                handlers: RwLock::new(HashMap::new()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn on(&self, kind: &'static str, handler: impl Fn(ServerEvent) + Send + Sync + 'static) {
        if let Ok(mut handlers) = self.shared.handlers.write() {
            handlers.entry(kind).or_default().push(Arc::new(handler));
        }
    }

    pub fn status(&self) -> HubStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<HubStatus> {
        self.shared.status.subscribe()
    }

    pub fn start(&self) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        let mut generation = 0;
        let restart = self.shared.status.send_if_modified(|status| match status {
            HubStatus::Idle | HubStatus::Exhausted | HubStatus::Stopped => {
                generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *status = HubStatus::Connecting;
                true
            }
            _ => false,
        });
        if !restart {
            return;
        }
        if let Some(stale) = task.take() {
            stale.abort();
        }
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(run_hub(shared, generation)));
    }

    pub fn resume(&self) {
        self.start();
    }

    pub fn stop(&self) {
        if let Ok(mut task) = self.task.lock() {
            self.shared.status.send_modify(|status| {
                self.shared.generation.fetch_add(1, Ordering::SeqCst);
                *status = HubStatus::Stopped;
            });
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        info!("hub: stopped");
    }
}

impl Drop for NotificationHubClient {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn run_hub(shared: Arc<HubShared>, generation: u64) {
    let mut attempt: u32 = 0;
    loop {
        if !shared.publish(generation, HubStatus::Connecting) {
            return;
        }
        match shared.connector.connect().await {
            Ok(mut connection) => {
                shared.publish(generation, HubStatus::Open);
                info!("hub: connected");
                attempt = 0;
                match pump(&shared, connection.as_mut()).await {
                    HubClose::Normal => {
                        info!("hub: closed by server");
                        shared.publish(generation, HubStatus::Idle);
                        return;
                    }
                    HubClose::AuthRejected(reason) => {
                        warn!(%reason, "hub: credential rejected");
                        shared.publish(generation, HubStatus::AuthRejected);
                        return;
                    }
                    HubClose::Abnormal(reason) => {
                        warn!(%reason, "hub: connection lost");
                    }
                }
            }
            Err(SyncError::Auth(reason)) => {
                warn!(%reason, "hub: credential rejected");
                shared.publish(generation, HubStatus::AuthRejected);
                return;
            }
            Err(error) => {
                warn!(%error, attempt, "hub: connect failed");
            }
        }

        if attempt >= shared.policy.max_attempts {
            warn!(attempt, "hub: giving up until resumed");
            shared.publish(generation, HubStatus::Exhausted);
            return;
        }
        let delay = shared.policy.delay_for(attempt);
        attempt += 1;
        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "hub: reconnect scheduled"
        );
        if !shared.publish(generation, HubStatus::Backoff { attempt, delay }) {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}

async fn pump(shared: &HubShared, connection: &mut dyn HubConnection) -> HubClose {
    loop {
        match connection.next_frame().await {
            HubFrame::Text(text) => dispatch(shared, &text),
            HubFrame::Closed(close) => return close,
        }
    }
}

fn dispatch(shared: &HubShared, text: &str) {
    let event = match ServerEvent::decode(text) {
        Ok(Some(event)) => event,
        Ok(None) => {
            debug!("hub: ignoring unknown frame kind");
            return;
        }
        Err(error) => {
            warn!(%error, "hub: malformed frame");
            return;
        }
    };
    let handlers = match shared.handlers.read() {
        Ok(handlers) => handlers.get(event.kind()).cloned().unwrap_or_default(),
        Err(_) => return,
    };
    if handlers.is_empty() {
        debug!(kind = event.kind(), "hub: no handler registered");
    }
    for handler in handlers {
        handler(event.clone());
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
