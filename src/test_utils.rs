//! Test utilities: in-process WebSocket servers
//!
//! Every async test talks to a real tokio-tungstenite server on a loopback
//! port instead of mocking the framing layer.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

/// ws:// URL for a spawned server
pub fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{}/ws", addr)
}

async fn bind() -> (SocketAddr, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener addr");
    (addr, listener)
}

/// Echoes every text/binary frame back and answers pings
pub async fn spawn_echo_server() -> (SocketAddr, JoinHandle<()>) {
    let (addr, listener) = bind().await;
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                let (mut sink, mut source) = ws.split();
                while let Some(Ok(msg)) = source.next().await {
                    match msg {
                        Message::Text(_) | Message::Binary(_) => {
                            if sink.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Message::Ping(payload) => {
                            if sink.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });
    (addr, handle)
}

/// Completes the handshake, then severs the TCP stream after `delay`
pub async fn spawn_drop_server(delay: Duration) -> (SocketAddr, JoinHandle<()>) {
    let (addr, listener) = bind().await;
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                tokio::time::sleep(delay).await;
                drop(ws);
            });
        }
    });
    (addr, handle)
}

/// Completes the handshake and then never reads or writes
///
/// Pings get no pongs and large writes eventually fill the TCP window.
pub async fn spawn_blackhole_server() -> (SocketAddr, JoinHandle<()>) {
    let (addr, listener) = bind().await;
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                // Hold the session open without ever polling it
                let _ws = ws;
                std::future::pending::<()>().await;
            });
        }
    });
    (addr, handle)
}

/// Poll `condition` until it holds or `limit` elapses
pub async fn wait_until(limit: Duration, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + limit;
    while !condition() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
