//! WebSocket transport for client connections.
//!
//! Clients speak the same frame format as service links, carried
//! inside WebSocket binary messages, one frame per message. The
//! writer task drives a [`Conn`] handle from the WebSocket sink, so
//! everything upstream (session registry, backpressure, idempotent
//! close) treats client connections exactly like TCP ones.

use std::net::SocketAddr;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::debug;

use cluster_core::conn::{Conn, ConnDriver, PING_PERIOD, PONG_WAIT};
use cluster_core::error::NetError;
use wire_proto::{decode_frame, encode_frame, FrameKind};

use crate::error::GatewayError;

/// Performs the WebSocket handshake and wires the connection's writer
/// task to the sink. Returns the shared handle and the read side.
pub async fn accept(
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(Conn, WsReader), GatewayError> {
    let ws_stream = accept_async(stream).await?;
    let (ws_sink, ws_receiver) = ws_stream.split();

    let (conn, driver) = Conn::channel(peer);
    tokio::spawn(ws_write_loop(ws_sink, driver, conn.clone()));

    Ok((conn, WsReader { inner: ws_receiver }))
}

/// Read side of an accepted client connection.
pub struct WsReader {
    inner: SplitStream<WebSocketStream<TcpStream>>,
}

impl WsReader {
    /// Reads the next frame, enforcing the traffic deadline.
    ///
    /// WebSocket control messages are consumed here; the caller only
    /// ever sees proper frames. Silence longer than the pong-wait
    /// window means the client is gone.
    pub async fn next_frame(&mut self) -> Result<(FrameKind, Vec<u8>), GatewayError> {
        loop {
            let message = timeout(PONG_WAIT, self.inner.next())
                .await
                .map_err(|_| GatewayError::Net(NetError::Closed))?;
            let message = match message {
                Some(message) => message?,
                None => return Ok((FrameKind::Close, Vec::new())),
            };
            match message {
                Message::Binary(data) => {
                    let (kind, payload) = decode_frame(&data)?;
                    return Ok((kind, payload.to_vec()));
                }
                Message::Close(_) => return Ok((FrameKind::Close, Vec::new())),
                // tungstenite answers pings on the next write; both
                // directions still count as traffic for the deadline.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Text(_) => {
                    return Err(wire_proto::ProtoError::InvalidFrame(
                        "text message on binary protocol",
                    )
                    .into())
                }
                Message::Frame(_) => {}
            }
        }
    }
}

async fn ws_write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut driver: ConnDriver,
    conn: Conn,
) {
    let mut ping = interval(PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.reset();

    loop {
        tokio::select! {
            frame = driver.outbound.recv() => {
                let Some(frame) = frame else { break };
                let buf = match encode_frame(frame.kind, &frame.payload) {
                    Ok(buf) => buf,
                    Err(err) => {
                        debug!("dropping unencodable frame for {}: {err}", conn.peer_addr());
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::binary(buf)).await {
                    debug!("write to {} failed: {err}", conn.peer_addr());
                    break;
                }
            }
            _ = ping.tick() => {
                let Ok(buf) = encode_frame(FrameKind::Ping, &[]) else { break };
                if sink.send(Message::binary(buf)).await.is_err() {
                    break;
                }
            }
            _ = driver.shutdown.recv() => {
                if let Ok(buf) = encode_frame(FrameKind::Close, &[]) {
                    let _ = sink.send(Message::binary(buf)).await;
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    conn.close();
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;

    async fn ws_pair() -> (
        (Conn, WsReader),
        WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            accept(stream, peer).await.unwrap()
        });
        let (client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        (server.await.unwrap(), client)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn frames_flow_both_ways() {
        let ((conn, mut reader), mut client) = ws_pair().await;

        // Client → gateway.
        let buf = encode_frame(FrameKind::Raw, b"{\"Id\":\"HeartBeat\"}").unwrap();
        client.send(Message::binary(buf)).await.unwrap();
        let (kind, payload) = reader.next_frame().await.unwrap();
        assert_eq!(kind, FrameKind::Raw);
        assert_eq!(payload, b"{\"Id\":\"HeartBeat\"}");

        // Gateway → client.
        conn.write(FrameKind::Raw, b"{\"Id\":\"S2C_Push\"}".to_vec())
            .unwrap();
        let message = client.next().await.unwrap().unwrap();
        let Message::Binary(data) = message else {
            panic!("expected binary message");
        };
        let (kind, payload) = decode_frame(&data).unwrap();
        assert_eq!(kind, FrameKind::Raw);
        assert_eq!(payload, b"{\"Id\":\"S2C_Push\"}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_reaches_the_client() {
        let ((conn, _reader), mut client) = ws_pair().await;

        conn.close();
        let mut saw_close_frame = false;
        while let Some(Ok(message)) = client.next().await {
            match message {
                Message::Binary(data) => {
                    let (kind, _) = decode_frame(&data).unwrap();
                    if kind == FrameKind::Close {
                        saw_close_frame = true;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        assert!(saw_close_frame);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_disconnect_ends_the_read() {
        let ((_conn, mut reader), client) = ws_pair().await;
        drop(client);

        // An abrupt drop may surface as a clean close or a transport
        // error; either way the read loop terminates.
        match reader.next_frame().await {
            Ok((kind, _)) => assert_eq!(kind, FrameKind::Close),
            Err(_) => {}
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn text_messages_violate_the_protocol() {
        let ((_conn, mut reader), mut client) = ws_pair().await;
        client
            .send(Message::text("{\"Id\":\"HeartBeat\"}"))
            .await
            .unwrap();
        assert!(reader.next_frame().await.is_err());
    }
}
