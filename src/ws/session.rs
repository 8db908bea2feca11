//! Framing-session boundary
//!
//! Opens tokio-tungstenite sessions for managed connections. Applies the
//! dial and handshake deadlines separately, sets the inbound size limit and
//! buffer sizes, attaches extra handshake headers, and disables Nagle on the
//! raw TCP stream.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::{client_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::ws::connection::ConnectionConfig;
use crate::{Result, WsError};

/// Underlying framing session
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
/// Write half of a split session
pub type WsSink = SplitSink<WsStream, Message>;
/// Read half of a split session
pub type WsSource = SplitStream<WsStream>;

/// Resolve host and port from a ws:// or wss:// URL
fn host_port(url: &Url) -> Result<(String, u16)> {
    let host = url
        .host_str()
        .ok_or_else(|| WsError::Config(format!("URL has no host: {}", url)))?;
    let port = url.port_or_known_default().ok_or_else(|| {
        WsError::Config(format!("URL has no port and no known default: {}", url))
    })?;
    Ok((host.to_string(), port))
}

fn framing_config(config: &ConnectionConfig) -> WebSocketConfig {
    WebSocketConfig::default()
        .read_buffer_size(config.read_buffer_size)
        .write_buffer_size(config.write_buffer_size)
        .max_message_size(Some(config.max_message_size))
        .max_frame_size(Some(config.max_message_size))
}

/// Open a framing session per the connection configuration
///
/// The TCP connect is bounded by `dial_timeout` and the WebSocket handshake
/// (including TLS for wss URLs) by `handshake_timeout`. Nagle's algorithm is
/// disabled so small frames leave immediately.
pub(crate) async fn dial(config: &ConnectionConfig) -> Result<WsStream> {
    let url = Url::parse(&config.url).map_err(|e| WsError::Config(e.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(WsError::Config(format!(
                "unsupported URL scheme {:?}: {}",
                other, url
            )))
        }
    }

    let (host, port) = host_port(&url)?;
    let tcp = timeout(
        effective(config.dial_timeout),
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    .map_err(|_| WsError::Dial(format!("dial {} timed out", config.url)))?
    .map_err(|e| WsError::Dial(e.to_string()))?;

    // Send frames immediately; the writer already batches by message
    tcp.set_nodelay(true)
        .map_err(|e| WsError::Dial(e.to_string()))?;

    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| WsError::Handshake(e.to_string()))?;
    for (name, value) in &config.headers {
        let name = HeaderName::try_from(name.as_str())
            .map_err(|e| WsError::Config(format!("bad header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| WsError::Config(format!("bad header value: {}", e)))?;
        request.headers_mut().insert(name, value);
    }

    let (stream, _response) = timeout(
        effective(config.handshake_timeout),
        client_async_tls_with_config(request, tcp, Some(framing_config(config)), None),
    )
    .await
    .map_err(|_| WsError::Handshake(format!("handshake with {} timed out", config.url)))?
    .map_err(|e| WsError::Handshake(e.to_string()))?;

    Ok(stream)
}

/// Zero means "no deadline"; keep select! arms simple by substituting a year
fn effective(configured: Duration) -> Duration {
    if configured.is_zero() {
        Duration::from_secs(365 * 24 * 3600)
    } else {
        configured
    }
}
