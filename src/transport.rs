//! Relay transports: the seam the pool talks through, and its WebSocket
//! implementation speaking NIP-01.

use std::time::Duration;

use futures_util::{
    future::BoxFuture,
    stream::{self, BoxStream},
    SinkExt, StreamExt,
};
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::{
    client_async,
    tungstenite::{client::IntoClientRequest, Message},
    WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::{cache_meta::fingerprint, error::SyncError, event::Event, filter::Filter};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One item on a subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Candidate event, not yet validated.
    Event(Event),
    /// The relay has sent everything it had stored for the filter.
    EndOfStored,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, SyncError>>;

/// A way of reaching relays.
pub trait Transport: Send + Sync + 'static {
    /// Open a subscription for `filter` on `relay`. Dropping the stream
    /// closes the subscription.
    fn subscribe(&self, relay: &str, filter: &Filter) -> BoxFuture<'static, Result<DeliveryStream, SyncError>>;

    /// Send `event` to `relay`; resolves to whether the relay accepted it.
    fn publish(&self, relay: &str, event: &Event) -> BoxFuture<'static, Result<bool, SyncError>>;
}

/// Subscription id for `filter` on `relay`, stable across runs.
pub fn subscription_id(relay: &str, filter: &Filter) -> String {
    let mut hasher = Sha1::new();
    hasher.update(relay.as_bytes());
    let relay_hash = hex::encode(hasher.finalize());
    format!("bsync-{}-{}", &relay_hash[..8], fingerprint(filter))
}

/// NIP-01 over WebSocket, optionally through a SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct WsTransport {
    tor_socks: Option<String>,
    connect_timeout: Duration,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new(None, DEFAULT_CONNECT_TIMEOUT)
    }
}

pub(crate) type Ws = WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>;

impl WsTransport {
    pub fn new(tor_socks: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            tor_socks,
            connect_timeout,
        }
    }

    async fn connect(&self, relay: &str) -> Result<Ws, SyncError> {
        match timeout(self.connect_timeout, connect_ws(relay, self.tor_socks.as_deref())).await {
            Ok(res) => res,
            Err(_) => Err(SyncError::Transport(format!("connect to {relay} timed out"))),
        }
    }
}

impl Transport for WsTransport {
    fn subscribe(&self, relay: &str, filter: &Filter) -> BoxFuture<'static, Result<DeliveryStream, SyncError>> {
        let this = self.clone();
        let relay = relay.to_string();
        let filter = filter.clone();
        Box::pin(async move {
            let mut ws = this.connect(&relay).await?;
            let sub_id = subscription_id(&relay, &filter);
            let req = json!(["REQ", sub_id, Value::Object(filter.to_json())]);
            ws.send(Message::Text(req.to_string())).await.map_err(transport_err)?;
            debug!(%relay, %sub_id, "subscribed");
            Ok(deliveries(ws, sub_id))
        })
    }

    fn publish(&self, relay: &str, event: &Event) -> BoxFuture<'static, Result<bool, SyncError>> {
        let this = self.clone();
        let relay = relay.to_string();
        let event = event.clone();
        Box::pin(async move {
            let mut ws = this.connect(&relay).await?;
            let msg = json!(["EVENT", event]);
            ws.send(Message::Text(msg.to_string())).await.map_err(transport_err)?;
            let wait_ok = async {
                while let Some(msg) = ws.next().await {
                    let Message::Text(txt) = msg.map_err(transport_err)? else {
                        continue;
                    };
                    let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(&txt) else {
                        continue;
                    };
                    if arr.first().and_then(|v| v.as_str()) == Some("OK")
                        && arr.get(1).and_then(|v| v.as_str()) == Some(event.id.as_str())
                    {
                        let accepted = arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
                        if !accepted {
                            let reason = arr.get(3).and_then(|v| v.as_str()).unwrap_or("");
                            debug!(%relay, id = %event.id, reason, "event rejected");
                        }
                        return Ok(accepted);
                    }
                }
                Err(SyncError::Transport(format!("{relay} closed before acknowledging")))
            };
            let res = match timeout(this.connect_timeout, wait_ok).await {
                Ok(res) => res,
                Err(_) => Err(SyncError::Transport(format!("{relay} did not acknowledge in time"))),
            };
            let _ = ws.close(None).await;
            res
        })
    }
}

fn transport_err(e: impl std::fmt::Display) -> SyncError {
    SyncError::Transport(e.to_string())
}

/// Turn relay frames for `sub_id` into deliveries. The stream ends when the
/// relay closes the subscription or the connection.
fn deliveries(ws: Ws, sub_id: String) -> DeliveryStream {
    stream::unfold(Some((ws, sub_id)), |state| async move {
        let (mut ws, sub_id) = state?;
        while let Some(msg) = ws.next().await {
            let txt = match msg {
                Ok(Message::Text(txt)) => txt,
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some((Err(transport_err(e)), None)),
            };
            let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(&txt) else {
                continue;
            };
            let for_us = arr.get(1).and_then(|v| v.as_str()) == Some(sub_id.as_str());
            match arr.first().and_then(|v| v.as_str()) {
                Some("EVENT") if for_us && arr.len() >= 3 => {
                    match serde_json::from_value::<Event>(arr[2].clone()) {
                        Ok(ev) => return Some((Ok(Delivery::Event(ev)), Some((ws, sub_id)))),
                        Err(e) => debug!(%sub_id, "undecodable event: {e}"),
                    }
                }
                Some("EOSE") if for_us => {
                    return Some((Ok(Delivery::EndOfStored), Some((ws, sub_id))));
                }
                Some("CLOSED") if for_us => {
                    let reason = arr.get(2).and_then(|v| v.as_str()).unwrap_or("").to_string();
                    return Some((Err(SyncError::Transport(format!("subscription closed: {reason}"))), None));
                }
                Some("NOTICE") => {
                    debug!(%sub_id, notice = ?arr.get(1), "relay notice");
                }
                _ => {}
            }
        }
        None
    })
    .boxed()
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
pub(crate) async fn connect_ws(relay: &str, tor_socks: Option<&str>) -> Result<Ws, SyncError> {
    let url = Url::parse(relay)?;
    let host = url
        .host_str()
        .ok_or_else(|| SyncError::Transport(format!("{relay}: missing host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| SyncError::Transport(format!("{relay}: missing port")))?;
    let req = relay.into_client_request().map_err(transport_err)?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(Socks5Stream::connect(proxy, (host, port)).await.map_err(transport_err)?)
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream).await.map_err(transport_err)?;
    Ok(ws)
}

/// Check that a relay accepts WebSocket connections.
pub async fn test_connection(relay: &str, tor_socks: Option<&str>, wait: Duration) -> Result<(), SyncError> {
    let mut ws = match timeout(wait, connect_ws(relay, tor_socks)).await {
        Ok(res) => res?,
        Err(_) => return Err(SyncError::Transport(format!("connect to {relay} timed out"))),
    };
    let _ = ws.close(None).await;
    Ok(())
}

/// Blanket trait for boxed async read/write streams.
pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
