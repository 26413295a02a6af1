//! MQTT 3.1.1 subscriber over WebSocket.
//!
//! The cloud relay delivers scanner replies by publishing them to a
//! per-account topic. The client only ever subscribes, so this module
//! implements the handful of packets a QoS 0 subscriber needs:
//!
//! | Packet | Direction | Use |
//! |--------|-----------|-----|
//! | `CONNECT` / `CONNACK` | out / in | Clean session, 60 s keep-alive |
//! | `SUBSCRIBE` / `SUBACK` | out / in | Account topic at QoS 0 |
//! | `PUBLISH` | in | Scanner reply envelope |
//! | `PUBACK` | out | Acknowledge a QoS 1 publish |
//! | `PINGREQ` / `PINGRESP` | out / in | Keep-alive |
//! | `DISCONNECT` | out | Shutdown |
//!
//! The broker URL from the account's `eventBroker` record is already
//! signed, so `CONNECT` carries no credentials.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Keep-alive advertised in `CONNECT`, in seconds.
const KEEP_ALIVE_SECS: u16 = 60;

/// How often `PINGREQ` is sent.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Packet identifier used for the single `SUBSCRIBE`.
const SUBSCRIBE_PACKET_ID: u16 = 1;

/// `SUBACK` return code for a refused subscription.
const SUBACK_FAILURE: u8 = 0x80;

// ============================================================================
// Types
// ============================================================================

/// Called with the payload of every inbound `PUBLISH`.
pub type PublishHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Called once when the link drops without being shut down.
pub type LostHandler = Box<dyn Fn(&str) + Send + Sync>;

// ============================================================================
// EventBrokerInfo
// ============================================================================

/// The `eventBroker` record of a cloud account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventBrokerInfo {
    /// Broker type, `mqtt` in practice.
    #[serde(rename = "type")]
    pub broker_type: String,
    /// Signed WebSocket URL.
    pub url: String,
    /// Topic replies are published to.
    pub topic: String,
}

// ============================================================================
// Packet Encoding
// ============================================================================

/// Encodes an MQTT remaining-length varint.
fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn push_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn packet(header: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(header);
    encode_remaining_length(body.len(), &mut out);
    out.extend_from_slice(body);
    out
}

/// `CONNECT` with a clean session and no credentials.
#[must_use]
pub fn encode_connect(client_id: &str, keep_alive_secs: u16) -> Vec<u8> {
    let mut body = Vec::new();
    push_str("MQTT", &mut body);
    body.push(0x04); // protocol level 3.1.1
    body.push(0x02); // clean session
    body.extend_from_slice(&keep_alive_secs.to_be_bytes());
    push_str(client_id, &mut body);
    packet(0x10, &body)
}

/// `SUBSCRIBE` to one topic.
#[must_use]
pub fn encode_subscribe(packet_id: u16, topic: &str, qos: u8) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&packet_id.to_be_bytes());
    push_str(topic, &mut body);
    body.push(qos);
    packet(0x82, &body)
}

/// `PUBACK` for a QoS 1 publish.
#[must_use]
pub fn encode_puback(packet_id: u16) -> Vec<u8> {
    packet(0x40, &packet_id.to_be_bytes())
}

/// `PINGREQ`.
#[must_use]
pub fn encode_pingreq() -> Vec<u8> {
    packet(0xC0, &[])
}

/// `DISCONNECT`.
#[must_use]
pub fn encode_disconnect() -> Vec<u8> {
    packet(0xE0, &[])
}

// ============================================================================
// Packet Decoding
// ============================================================================

/// An inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Reply to `CONNECT`.
    ConnAck {
        /// 0 on success.
        return_code: u8,
    },
    /// Reply to `SUBSCRIBE`.
    SubAck {
        /// Echoed packet ID.
        packet_id: u16,
        /// Granted QoS per topic, or `0x80` on failure.
        granted: Vec<u8>,
    },
    /// Application message.
    Publish {
        /// Topic it was published to.
        topic: String,
        /// Present for QoS 1 and 2.
        packet_id: Option<u16>,
        /// Message body.
        payload: Vec<u8>,
    },
    /// Reply to `PINGREQ`.
    PingResp,
    /// Anything else, by packet type.
    Other(u8),
}

/// Reassembles packets from WebSocket frames.
///
/// Frames may split or batch packets; bytes are buffered until a whole
/// packet is available.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buffer: Vec<u8>,
}

impl PacketDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Returns the next complete packet, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for a malformed length or packet body.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        let Some((len, header_len)) = self.remaining_length()? else {
            return Ok(None);
        };
        let total = header_len + len;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buffer.drain(..total).collect();
        decode_packet(frame[0], &frame[header_len..]).map(Some)
    }

    /// Reads the remaining length, returning it with the fixed header size.
    fn remaining_length(&self) -> Result<Option<(usize, usize)>> {
        let mut value = 0usize;
        let mut multiplier = 1usize;

        for (i, byte) in self.buffer.iter().skip(1).take(4).enumerate() {
            value += usize::from(byte & 0x7F) * multiplier;
            if byte & 0x80 == 0 {
                return Ok(Some((value, i + 2)));
            }
            multiplier *= 128;
        }

        if self.buffer.len() >= 5 {
            return Err(Error::protocol("MQTT remaining length exceeds 4 bytes"));
        }
        Ok(None)
    }
}

fn read_u16(body: &[u8], at: usize) -> Result<u16> {
    body.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| Error::protocol("MQTT packet too short"))
}

fn decode_packet(header: u8, body: &[u8]) -> Result<Packet> {
    match header >> 4 {
        2 => {
            let return_code = *body
                .get(1)
                .ok_or_else(|| Error::protocol("MQTT CONNACK too short"))?;
            Ok(Packet::ConnAck { return_code })
        }
        3 => {
            let qos = (header >> 1) & 0x03;
            let topic_len = usize::from(read_u16(body, 0)?);
            let topic_end = 2 + topic_len;
            let topic = body
                .get(2..topic_end)
                .ok_or_else(|| Error::protocol("MQTT PUBLISH topic truncated"))?;
            let topic = String::from_utf8_lossy(topic).into_owned();

            let (packet_id, payload_start) = if qos > 0 {
                (Some(read_u16(body, topic_end)?), topic_end + 2)
            } else {
                (None, topic_end)
            };

            Ok(Packet::Publish {
                topic,
                packet_id,
                payload: body[payload_start..].to_vec(),
            })
        }
        9 => Ok(Packet::SubAck {
            packet_id: read_u16(body, 0)?,
            granted: body.get(2..).unwrap_or_default().to_vec(),
        }),
        13 => Ok(Packet::PingResp),
        other => Ok(Packet::Other(other)),
    }
}

// ============================================================================
// MqttLink
// ============================================================================

/// Internal commands for the link loop.
enum LinkCommand {
    Shutdown,
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A live subscription to the account topic.
///
/// Dropping the link disconnects it.
pub struct MqttLink {
    command_tx: mpsc::UnboundedSender<LinkCommand>,
}

impl MqttLink {
    /// Connects, subscribes, and starts the receive loop.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if the handshake does not finish in time
    /// - [`Error::Connection`] if the broker refuses the connection or subscription
    /// - [`Error::WebSocket`] on a WebSocket failure
    pub async fn connect(
        info: &EventBrokerInfo,
        connect_timeout: Duration,
        on_publish: PublishHandler,
        on_lost: LostHandler,
    ) -> Result<Self> {
        let timeout_ms = connect_timeout.as_millis() as u64;
        timeout(connect_timeout, Self::handshake(info))
            .await
            .map_err(|_| Error::connection_timeout(timeout_ms))?
            .map(|(ws, decoder)| {
                let (command_tx, command_rx) = mpsc::unbounded_channel();
                tokio::spawn(Self::run_loop(ws, decoder, command_rx, on_publish, on_lost));
                Self { command_tx }
            })
    }

    /// Disconnects the link.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(LinkCommand::Shutdown);
    }

    async fn handshake(info: &EventBrokerInfo) -> Result<(WsStream, PacketDecoder)> {
        let mut request = info.url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));

        debug!(topic = %info.topic, "Connecting to event broker");
        let (mut ws, _) = tokio_tungstenite::connect_async(request).await?;
        let mut decoder = PacketDecoder::new();

        let client_id = format!("td{}", &Uuid::new_v4().simple().to_string()[..20]);
        ws.send(Message::Binary(encode_connect(&client_id, KEEP_ALIVE_SECS).into()))
            .await?;

        match Self::read_packet(&mut ws, &mut decoder).await? {
            Packet::ConnAck { return_code: 0 } => {}
            Packet::ConnAck { return_code } => {
                return Err(Error::connection(format!(
                    "Event broker refused connection: code {return_code}"
                )));
            }
            other => {
                return Err(Error::protocol(format!("Expected CONNACK, got {other:?}")));
            }
        }

        ws.send(Message::Binary(
            encode_subscribe(SUBSCRIBE_PACKET_ID, &info.topic, 0).into(),
        ))
        .await?;

        loop {
            match Self::read_packet(&mut ws, &mut decoder).await? {
                Packet::SubAck { granted, .. } if granted.contains(&SUBACK_FAILURE) => {
                    return Err(Error::connection(format!(
                        "Subscription to {} refused",
                        info.topic
                    )));
                }
                Packet::SubAck { .. } => break,
                other => trace!(?other, "Ignoring packet before SUBACK"),
            }
        }

        debug!(topic = %info.topic, "Subscribed to event broker topic");
        Ok((ws, decoder))
    }

    /// Reads frames until one complete packet is available.
    async fn read_packet(ws: &mut WsStream, decoder: &mut PacketDecoder) -> Result<Packet> {
        loop {
            if let Some(packet) = decoder.next_packet()? {
                return Ok(packet);
            }
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => decoder.push(&data),
                Some(Ok(Message::Close(_))) | None => return Err(Error::ConnectionClosed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Event loop that handles WebSocket I/O.
    async fn run_loop(
        ws: WsStream,
        mut decoder: PacketDecoder,
        mut command_rx: mpsc::UnboundedReceiver<LinkCommand>,
        on_publish: PublishHandler,
        on_lost: LostHandler,
    ) {
        let (mut ws_write, mut ws_read) = ws.split();
        let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

        let reason = loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Binary(data))) => {
                            decoder.push(&data);
                            if let Err(reason) = Self::drain_packets(&mut decoder, &mut ws_write, &on_publish).await {
                                break reason;
                            }
                        }

                        Some(Ok(Message::Close(_))) => break "closed by broker".to_string(),

                        Some(Err(e)) => {
                            error!(error = %e, "Event broker WebSocket error");
                            break e.to_string();
                        }

                        None => break "stream ended".to_string(),

                        // Ignore Text, Ping, Pong
                        _ => {}
                    }
                }

                _ = ping.tick() => {
                    trace!("PINGREQ");
                    if let Err(e) = ws_write.send(Message::Binary(encode_pingreq().into())).await {
                        break e.to_string();
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(LinkCommand::Shutdown) | None => {
                            debug!("Event broker link shutting down");
                            let _ = ws_write.send(Message::Binary(encode_disconnect().into())).await;
                            let _ = ws_write.close().await;
                            return;
                        }
                    }
                }
            }
        };

        warn!(%reason, "Event broker connection lost");
        on_lost(reason.as_str());
    }

    async fn drain_packets(
        decoder: &mut PacketDecoder,
        ws_write: &mut futures_util::stream::SplitSink<WsStream, Message>,
        on_publish: &PublishHandler,
    ) -> std::result::Result<(), String> {
        loop {
            let packet = match decoder.next_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => return Ok(()),
                Err(e) => return Err(e.to_string()),
            };

            match packet {
                Packet::Publish {
                    topic,
                    packet_id,
                    payload,
                } => {
                    trace!(%topic, len = payload.len(), "PUBLISH");
                    if let Some(packet_id) = packet_id {
                        ws_write
                            .send(Message::Binary(encode_puback(packet_id).into()))
                            .await
                            .map_err(|e| e.to_string())?;
                    }
                    on_publish(payload.as_slice());
                }
                Packet::PingResp => trace!("PINGRESP"),
                other => trace!(?other, "Ignoring packet"),
            }
        }
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
