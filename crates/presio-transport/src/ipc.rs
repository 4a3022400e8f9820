//! Unix domain socket transport to the presence service.
//!
//! The service listens on one of ten well-known socket slots under the
//! runtime directory. Discovery probes the slots in order and the first
//! socket that accepts wins. After the handshake a background task owns
//! the read half of the stream, answers pings, and forwards dispatch
//! events to the engine.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use presio_protocol::{codec, Activity, Opcode, Packet, User};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

use crate::traits::{EventKind, Transport, TransportError, TransportEvent};

/// Number of socket slots probed during discovery.
const SOCKET_SLOTS: u32 = 10;

/// Transport over the presence service's local IPC socket.
pub struct IpcTransport {
    client_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    connected: Arc<AtomicBool>,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
    nonce: AtomicU64,
}

impl IpcTransport {
    /// Create a transport for the given application id.
    ///
    /// Events are pushed through `events` once [`Transport::connect`]
    /// succeeds.
    #[must_use]
    pub fn new(client_id: impl Into<String>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            client_id: client_id.into(),
            events,
            writer: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
            nonce: AtomicU64::new(0),
        }
    }

    /// Candidate socket paths, probed in order.
    fn socket_candidates() -> Vec<PathBuf> {
        let base = ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"]
            .iter()
            .find_map(|var| std::env::var_os(var))
            .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);

        (0..SOCKET_SLOTS)
            .map(|slot| base.join(format!("discord-ipc-{slot}")))
            .collect()
    }

    async fn discover() -> Result<UnixStream, TransportError> {
        for path in Self::socket_candidates() {
            match UnixStream::connect(&path).await {
                Ok(stream) => {
                    debug!(path = %path.display(), "Found presence service socket");
                    return Ok(stream);
                }
                Err(err) => trace!(path = %path.display(), %err, "Socket slot unavailable"),
            }
        }
        Err(TransportError::ServiceAbsent)
    }

    fn next_nonce(&self) -> String {
        self.nonce.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), TransportError> {
        let encoded = codec::encode(packet)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        writer.write_all(&encoded).await?;
        Ok(())
    }

    async fn send_command(&self, cmd: &str, args: Value) -> Result<(), TransportError> {
        let payload = json!({
            "cmd": cmd,
            "args": args,
            "nonce": self.next_nonce(),
        });
        trace!(%cmd, "Sending command");
        self.send_packet(&Packet::new(Opcode::Frame, payload)).await
    }

    fn spawn_reader(&self, read_half: OwnedReadHalf, buf: BytesMut) -> tokio::task::JoinHandle<()> {
        let events = self.events.clone();
        let writer = Arc::clone(&self.writer);
        let connected = Arc::clone(&self.connected);

        tokio::spawn(async move {
            let mut read_half = read_half;
            let mut buf = buf;
            loop {
                let packet = match read_packet(&mut read_half, &mut buf).await {
                    Ok(packet) => packet,
                    Err(err) => {
                        debug!(%err, "Pipe read failed");
                        connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Disconnected {
                            code: -1,
                            message: err.to_string(),
                        });
                        break;
                    }
                };

                match packet.opcode {
                    Opcode::Ping => {
                        let pong = Packet::new(Opcode::Pong, packet.payload);
                        if let Ok(encoded) = codec::encode(&pong) {
                            let mut guard = writer.lock().await;
                            if let Some(w) = guard.as_mut() {
                                let _ = w.write_all(&encoded).await;
                            }
                        }
                    }
                    Opcode::Pong => {}
                    Opcode::Close => {
                        let code = packet.payload["code"].as_i64().unwrap_or(-1);
                        let message = packet.payload["message"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string();
                        info!(code, "Presence service closed the pipe");
                        connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Disconnected { code, message });
                        break;
                    }
                    Opcode::Frame => {
                        if let Some(event) = dispatch(&packet.payload) {
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Opcode::Handshake => {
                        warn!("Unexpected handshake packet after connect");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Transport for IpcTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let stream = Self::discover().await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let handshake = Packet::new(
            Opcode::Handshake,
            json!({ "v": 1, "client_id": self.client_id }),
        );
        let encoded = codec::encode(&handshake)?;
        write_half.write_all(&encoded).await?;

        let mut buf = BytesMut::with_capacity(4096);
        let reply = read_packet(&mut read_half, &mut buf).await?;

        let user = match reply.opcode {
            Opcode::Frame if reply.payload["evt"] == "READY" => {
                serde_json::from_value::<User>(reply.payload["data"]["user"].clone())
                    .map_err(presio_protocol::ProtocolError::Payload)?
            }
            Opcode::Close => {
                let message = reply.payload["message"]
                    .as_str()
                    .unwrap_or("closed during handshake")
                    .to_string();
                return Err(TransportError::HandshakeFailed(message));
            }
            _ => {
                return Err(TransportError::HandshakeFailed(format!(
                    "unexpected reply: {:?}",
                    reply.opcode
                )));
            }
        };

        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);

        let handle = self.spawn_reader(read_half, buf);
        if let Some(old) = self.reader.lock().await.replace(handle) {
            old.abort();
        }

        info!(user = %user.username, "Presence pipe ready");
        let _ = self.events.send(TransportEvent::Ready { user });
        Ok(())
    }

    async fn subscribe(&self, kind: EventKind) -> Result<(), TransportError> {
        let payload = json!({
            "cmd": "SUBSCRIBE",
            "evt": kind.as_str(),
            "nonce": self.next_nonce(),
        });
        trace!(evt = kind.as_str(), "Subscribing");
        self.send_packet(&Packet::new(Opcode::Frame, payload)).await
    }

    async fn set_activity(&self, activity: Option<Activity>) -> Result<(), TransportError> {
        let args = json!({
            "pid": process::id(),
            "activity": activity,
        });
        self.send_command("SET_ACTIVITY", args).await
    }

    async fn respond_to_join_request(
        &self,
        user_id: &str,
        accept: bool,
    ) -> Result<(), TransportError> {
        let cmd = if accept {
            "SEND_ACTIVITY_JOIN_INVITE"
        } else {
            "CLOSE_ACTIVITY_JOIN_REQUEST"
        };
        self.send_command(cmd, json!({ "user_id": user_id })).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            let farewell = Packet::new(Opcode::Close, json!({}));
            let _ = self.send_packet(&farewell).await;
        }
        if let Some(handle) = self.reader.lock().await.take() {
            handle.abort();
        }
        self.writer.lock().await.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "ipc"
    }
}

/// Read one complete packet, growing the buffer as needed.
async fn read_packet(
    reader: &mut OwnedReadHalf,
    buf: &mut BytesMut,
) -> Result<Packet, TransportError> {
    loop {
        if let Some(packet) = codec::decode_from(buf)? {
            return Ok(packet);
        }
        let read = reader.read_buf(buf).await?;
        if read == 0 {
            return Err(TransportError::ConnectionClosed);
        }
    }
}

/// Map a dispatch frame to a transport event.
fn dispatch(payload: &Value) -> Option<TransportEvent> {
    let evt = payload["evt"].as_str()?;
    let data = &payload["data"];
    match evt {
        "ACTIVITY_JOIN" => Some(TransportEvent::JoinGame {
            secret: data["secret"].as_str()?.to_string(),
        }),
        "ACTIVITY_SPECTATE" => Some(TransportEvent::SpectateGame {
            secret: data["secret"].as_str()?.to_string(),
        }),
        "ACTIVITY_JOIN_REQUEST" => {
            let user = serde_json::from_value(data["user"].clone()).ok()?;
            Some(TransportEvent::JoinRequest { user })
        }
        "ERROR" => Some(TransportEvent::Error {
            code: data["code"].as_i64().unwrap_or(-1),
            message: data["message"].as_str().unwrap_or_default().to_string(),
        }),
        other => {
            trace!(evt = other, "Ignoring dispatch event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_candidates_cover_all_slots() {
        let candidates = IpcTransport::socket_candidates();
        assert_eq!(candidates.len(), SOCKET_SLOTS as usize);
        assert!(candidates[0].ends_with("discord-ipc-0"));
        assert!(candidates[9].ends_with("discord-ipc-9"));
    }

    #[test]
    fn test_dispatch_join_request() {
        let payload = json!({
            "cmd": "DISPATCH",
            "evt": "ACTIVITY_JOIN_REQUEST",
            "data": { "user": { "id": "42", "username": "visitor" } },
        });
        match dispatch(&payload) {
            Some(TransportEvent::JoinRequest { user }) => {
                assert_eq!(user.id, "42");
                assert_eq!(user.username, "visitor");
            }
            other => panic!("Expected JoinRequest, got {other:?}"),
        }
    }

    #[test]
    fn test_dispatch_secrets() {
        let join = json!({ "evt": "ACTIVITY_JOIN", "data": { "secret": "j-1" } });
        assert_eq!(
            dispatch(&join),
            Some(TransportEvent::JoinGame { secret: "j-1".into() })
        );

        let spectate = json!({ "evt": "ACTIVITY_SPECTATE", "data": { "secret": "s-1" } });
        assert_eq!(
            dispatch(&spectate),
            Some(TransportEvent::SpectateGame { secret: "s-1".into() })
        );
    }

    #[test]
    fn test_dispatch_ignores_unknown_events() {
        let payload = json!({ "evt": "VOICE_STATE_UPDATE", "data": {} });
        assert!(dispatch(&payload).is_none());
    }

    #[tokio::test]
    async fn test_connect_against_scripted_service() {
        let dir = std::env::temp_dir().join(format!("presio-ipc-test-{}", process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("discord-ipc-0");
        let _ = std::fs::remove_file(&path);
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let service = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut rx, mut tx) = stream.into_split();
            let mut buf = BytesMut::new();
            let handshake = read_packet(&mut rx, &mut buf).await.unwrap();
            assert_eq!(handshake.opcode, Opcode::Handshake);
            assert_eq!(handshake.payload["client_id"], "app-1");

            let ready = Packet::new(
                Opcode::Frame,
                json!({
                    "cmd": "DISPATCH",
                    "evt": "READY",
                    "data": { "user": { "id": "1", "username": "local" } },
                }),
            );
            tx.write_all(&codec::encode(&ready).unwrap()).await.unwrap();

            let frame = read_packet(&mut rx, &mut buf).await.unwrap();
            assert_eq!(frame.opcode, Opcode::Frame);
            assert_eq!(frame.payload["cmd"], "SET_ACTIVITY");
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = IpcTransport::new("app-1", events_tx);

        // Point discovery at the scripted service.
        std::env::set_var("XDG_RUNTIME_DIR", &dir);
        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        match events_rx.recv().await {
            Some(TransportEvent::Ready { user }) => assert_eq!(user.username, "local"),
            other => panic!("Expected Ready, got {other:?}"),
        }

        transport
            .set_activity(Some(Activity::new().with_details("Testing")))
            .await
            .unwrap();

        service.await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        let _ = std::fs::remove_file(&path);
    }
}
