//! # AP session
//!
//! A connected session over the framed cipher channel. The session owns the
//! TCP transport and splits it into two long-lived tasks:
//!
//! - a writer draining a bounded channel of outbound packets, and
//! - a reader fanning inbound packets out by command byte.
//!
//! The dispatcher answers `PING` in-band, records liveness, stores the
//! country code and product configuration, forwards audio-key packets to
//! the [`AudioKeyManager`](crate::audio_key::AudioKeyManager) and Mercury
//! frames to an opaque subscriber channel. A watchdog closes the session
//! when the access point goes silent.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures_util::{SinkExt, StreamExt};
use prost::Message;
use rsa::RsaPublicKey;
use tokio::{net::TcpStream, sync::mpsc, time::timeout};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, error, info, warn};

use crate::{
    audio_key::AudioKeyManager,
    codec::{ApCodec, ApPacket},
    error::{ApError, Login5Error},
    handshake::{self, default_server_key},
    proto,
};

pub const CMD_SECRET_BLOCK: u8 = 0x02;
pub const CMD_PING: u8 = 0x04;
pub const CMD_REQUEST_KEY: u8 = 0x0c;
pub const CMD_AES_KEY: u8 = 0x0d;
pub const CMD_AES_KEY_ERROR: u8 = 0x0e;
pub const CMD_COUNTRY_CODE: u8 = 0x1b;
pub const CMD_UNKNOWN_ALL_ZEROS: u8 = 0x1f;
pub const CMD_PONG: u8 = 0x49;
pub const CMD_PONG_ACK: u8 = 0x4a;
pub const CMD_PRODUCT_INFO: u8 = 0x50;
pub const CMD_LEGACY_WELCOME: u8 = 0x69;
pub const CMD_LICENSE_VERSION: u8 = 0x76;
pub const CMD_LOGIN: u8 = 0xab;
pub const CMD_AP_WELCOME: u8 = 0xac;
pub const CMD_AUTH_FAILURE: u8 = 0xad;
pub const CMD_MERCURY_REQ: u8 = 0xb2;
pub const CMD_MERCURY_SUB: u8 = 0xb3;
pub const CMD_MERCURY_UNSUB: u8 = 0xb4;
pub const CMD_MERCURY_EVENT: u8 = 0xb5;

/// Outbound queue depth; senders briefly back off when the writer lags.
const OUTBOUND_QUEUE: usize = 64;

/// User credential presented during authentication.
#[derive(Debug, Clone)]
pub enum Credentials {
    StoredCredential {
        username: String,
        auth_type: i32,
        auth_data: Vec<u8>,
    },
    AccessToken(String),
}

/// Session tunables; the defaults match the deployed service.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub device_id: String,
    pub connect_timeout: Duration,
    pub handshake_message_timeout: Duration,
    pub ping_timeout: Duration,
    pub server_key: Option<RsaPublicKey>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            connect_timeout: Duration::from_secs(10),
            handshake_message_timeout: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(60),
            server_key: None,
        }
    }
}

struct SessionShared {
    outbound: mpsc::Sender<ApPacket>,
    cancel: CancellationToken,
    audio_key: AudioKeyManager,
    country_code: Mutex<Option<String>>,
    product_info: Mutex<HashMap<String, String>>,
    canonical_username: Mutex<Option<String>>,
    reusable_credentials: Mutex<Option<Credentials>>,
    subscribers: Mutex<HashMap<u8, mpsc::Sender<ApPacket>>>,
    mercury: Mutex<Option<mpsc::Sender<ApPacket>>>,
    last_inbound: Mutex<Instant>,
    close_reason: Mutex<Option<String>>,
    ping_timeout: Duration,
}

/// Handle to a live AP session. Cloning shares the same connection.
#[derive(Clone)]
pub struct ApSession {
    shared: Arc<SessionShared>,
}

impl ApSession {
    /// Connects, handshakes and authenticates against an access point.
    pub async fn connect(
        addr: &str,
        credentials: Credentials,
        config: SessionConfig,
    ) -> Result<Self, ApError> {
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ApError::Timeout)??;
        info!(addr, "connected to access point");
        Self::from_stream(stream, credentials, config).await
    }

    /// Runs the session over an already established transport.
    pub async fn from_stream(
        mut stream: TcpStream,
        credentials: Credentials,
        config: SessionConfig,
    ) -> Result<Self, ApError> {
        let server_key = config
            .server_key
            .clone()
            .unwrap_or_else(default_server_key);
        let codec = handshake::perform(
            &mut stream,
            &server_key,
            config.handshake_message_timeout,
        )
        .await?;

        let mut framed = Framed::new(stream, codec);
        let welcome = authenticate(&mut framed, &credentials, &config.device_id).await?;
        info!(username = %welcome.canonical_username, "authenticated");

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);

        let shared = Arc::new(SessionShared {
            outbound: outbound_tx.clone(),
            cancel: cancel.clone(),
            audio_key: AudioKeyManager::new(outbound_tx, cancel.clone()),
            country_code: Mutex::new(None),
            product_info: Mutex::new(HashMap::new()),
            canonical_username: Mutex::new(Some(welcome.canonical_username.clone())),
            reusable_credentials: Mutex::new(Some(Credentials::StoredCredential {
                username: welcome.canonical_username,
                auth_type: welcome.reusable_auth_credentials_type,
                auth_data: welcome.reusable_auth_credentials,
            })),
            subscribers: Mutex::new(HashMap::new()),
            mercury: Mutex::new(None),
            last_inbound: Mutex::new(Instant::now()),
            close_reason: Mutex::new(None),
            ping_timeout: config.ping_timeout,
        });

        let (sink, source) = framed.split();
        tokio::spawn(write_loop(sink, outbound_rx, shared.clone()));
        tokio::spawn(read_loop(source, shared.clone()));
        tokio::spawn(watchdog(shared.clone()));

        Ok(Self { shared })
    }

    /// Enqueues a packet for the writer task.
    pub async fn send(&self, cmd: u8, payload: impl Into<bytes::Bytes>) -> Result<(), ApError> {
        self.shared
            .outbound
            .send(ApPacket::new(cmd, payload))
            .await
            .map_err(|_| ApError::SessionClosed)
    }

    /// The per-file audio key manager bound to this session.
    pub fn audio_key(&self) -> &AudioKeyManager {
        &self.shared.audio_key
    }

    /// Subscribes to every inbound packet with the given command byte.
    ///
    /// Commands claimed by the built-in dispatcher (ping, keys, country,
    /// product info, Mercury) are delivered there instead.
    pub fn subscribe(&self, cmd: u8) -> mpsc::Receiver<ApPacket> {
        let (tx, rx) = mpsc::channel(16);
        self.shared.subscribers.lock().unwrap().insert(cmd, tx);
        rx
    }

    /// Claims the Mercury frame stream (request/sub/unsub/event packets).
    pub fn mercury_packets(&self) -> mpsc::Receiver<ApPacket> {
        let (tx, rx) = mpsc::channel(32);
        *self.shared.mercury.lock().unwrap() = Some(tx);
        rx
    }

    /// ISO country code announced by the access point, once received.
    pub fn country_code(&self) -> Option<String> {
        self.shared.country_code.lock().unwrap().clone()
    }

    /// Product configuration map announced by the access point.
    pub fn product_info(&self) -> HashMap<String, String> {
        self.shared.product_info.lock().unwrap().clone()
    }

    /// Canonical username confirmed by the welcome packet.
    pub fn username(&self) -> Option<String> {
        self.shared.canonical_username.lock().unwrap().clone()
    }

    /// Credentials the service allows us to reuse for later logins.
    pub fn reusable_credentials(&self) -> Option<Credentials> {
        self.shared.reusable_credentials.lock().unwrap().clone()
    }

    /// Cancellation token tied to the session lifetime.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Why the session closed, if it has.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.close_reason.lock().unwrap().clone()
    }

    /// Shuts the session down. Idempotent; pending requests are cancelled.
    pub fn shutdown(&self) {
        self.shared.close("shutdown requested");
    }
}

impl SessionShared {
    fn close(&self, reason: &str) {
        let mut slot = self.close_reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason.to_string());
            info!(reason, "AP session closed");
        }
        drop(slot);
        self.cancel.cancel();
        self.audio_key.cancel_all();
    }

    fn touch(&self) {
        *self.last_inbound.lock().unwrap() = Instant::now();
    }
}

async fn authenticate(
    framed: &mut Framed<TcpStream, ApCodec>,
    credentials: &Credentials,
    device_id: &str,
) -> Result<proto::ApWelcome, ApError> {
    let login_credentials = match credentials {
        Credentials::StoredCredential {
            username,
            auth_type,
            auth_data,
        } => proto::LoginCredentials {
            username: Some(username.clone()),
            typ: *auth_type,
            auth_data: Some(auth_data.clone()),
        },
        Credentials::AccessToken(token) => proto::LoginCredentials {
            username: None,
            typ: proto::AuthenticationType::AccessToken as i32,
            auth_data: Some(token.as_bytes().to_vec()),
        },
    };

    let login = proto::ClientResponseEncrypted {
        login_credentials: Some(login_credentials),
        system_info: Some(proto::SystemInfo {
            system_information_string: Some(concat!("voxmusic/", env!("CARGO_PKG_VERSION")).to_string()),
            device_id: Some(device_id.to_string()),
        }),
        version_string: Some(env!("CARGO_PKG_VERSION").to_string()),
    };

    framed
        .send(ApPacket::new(CMD_LOGIN, login.encode_to_vec()))
        .await?;

    loop {
        let packet = framed.next().await.ok_or(ApError::UnexpectedEof)??;
        match packet.cmd {
            CMD_AP_WELCOME => {
                return proto::ApWelcome::decode(packet.payload.as_ref())
                    .map_err(|e| ApError::MalformedFrame(format!("bad welcome: {e}")));
            }
            CMD_AUTH_FAILURE => {
                let failure = proto::ApLoginFailed::decode(packet.payload.as_ref())
                    .map_err(|e| ApError::MalformedFrame(format!("bad auth failure: {e}")))?;
                return Err(ApError::AuthFailure(Login5Error::from_code(
                    failure.error_code,
                )));
            }
            other => {
                // The access point may push bookkeeping frames before the
                // welcome; they carry nothing we need during login.
                debug!(cmd = format!("{other:#04x}"), "packet before welcome, ignoring");
            }
        }
    }
}

async fn write_loop(
    mut sink: futures_util::stream::SplitSink<Framed<TcpStream, ApCodec>, ApPacket>,
    mut outbound: mpsc::Receiver<ApPacket>,
    shared: Arc<SessionShared>,
) {
    loop {
        let packet = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        if let Err(e) = sink.send(packet).await {
            shared.close(&format!("write failed: {e}"));
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut source: futures_util::stream::SplitStream<Framed<TcpStream, ApCodec>>,
    shared: Arc<SessionShared>,
) {
    loop {
        let packet = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = source.next() => match next {
                Some(Ok(packet)) => packet,
                Some(Err(e)) => {
                    shared.close(&format!("read failed: {e}"));
                    break;
                }
                None => {
                    shared.close("access point closed the connection");
                    break;
                }
            },
        };

        shared.touch();
        dispatch(&shared, packet).await;
    }
}

async fn dispatch(shared: &Arc<SessionShared>, packet: ApPacket) {
    match packet.cmd {
        CMD_PING => {
            debug!("ping, answering pong");
            let pong = ApPacket::new(CMD_PONG, packet.payload.clone());
            if shared.outbound.send(pong).await.is_err() {
                warn!("pong dropped, writer is gone");
            }
        }
        CMD_PONG_ACK => {
            // Liveness already recorded for every inbound packet.
            debug!("pong acknowledged");
        }
        CMD_COUNTRY_CODE => {
            let code = String::from_utf8_lossy(&packet.payload).into_owned();
            info!(country = %code, "country code received");
            *shared.country_code.lock().unwrap() = Some(code);
        }
        CMD_PRODUCT_INFO => {
            let xml = String::from_utf8_lossy(&packet.payload);
            match parse_product_info(&xml) {
                Ok(map) => {
                    debug!(entries = map.len(), "product info received");
                    *shared.product_info.lock().unwrap() = map;
                }
                Err(e) => warn!("ignoring malformed product info: {e}"),
            }
        }
        CMD_AES_KEY | CMD_AES_KEY_ERROR => shared.audio_key.dispatch(&packet),
        CMD_MERCURY_REQ | CMD_MERCURY_SUB | CMD_MERCURY_UNSUB | CMD_MERCURY_EVENT => {
            let tx = shared.mercury.lock().unwrap().clone();
            match tx {
                Some(tx) => {
                    if tx.send(packet).await.is_err() {
                        warn!("mercury subscriber dropped its channel");
                    }
                }
                None => debug!("mercury frame with no subscriber"),
            }
        }
        CMD_SECRET_BLOCK | CMD_LEGACY_WELCOME | CMD_LICENSE_VERSION | CMD_UNKNOWN_ALL_ZEROS => {
            debug!(cmd = format!("{:#04x}", packet.cmd), "ignoring bookkeeping packet");
        }
        cmd => {
            let tx = shared.subscribers.lock().unwrap().get(&cmd).cloned();
            match tx {
                Some(tx) => {
                    if tx.send(packet).await.is_err() {
                        shared.subscribers.lock().unwrap().remove(&cmd);
                    }
                }
                None => debug!(cmd = format!("{cmd:#04x}"), "unhandled packet"),
            }
        }
    }
}

async fn watchdog(shared: Arc<SessionShared>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tick.tick() => {}
        }
        let silent_for = shared.last_inbound.lock().unwrap().elapsed();
        if silent_for > shared.ping_timeout {
            error!(?silent_for, "access point went silent");
            shared.close("liveness timeout");
            return;
        }
    }
}

/// Parses the product-info XML payload into a flat key/value map.
///
/// The document is `<products><product><k>v</k>…</product></products>`;
/// leaf element names become keys.
fn parse_product_info(xml: &str) -> Result<HashMap<String, String>, quick_xml::Error> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(xml);
    let mut map = HashMap::new();
    let mut path: Vec<String> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(t) => {
                if path.len() >= 3 {
                    let value = t
                        .decode()
                        .ok()
                        .and_then(|s| quick_xml::escape::unescape(&s).ok().map(|v| v.into_owned()))
                        .unwrap_or_default()
                        .trim()
                        .to_string();
                    if !value.is_empty() {
                        map.insert(path.last().unwrap().clone(), value);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_info_flattens_leaves() {
        let xml = "<products><product>\
                   <type>premium</type>\
                   <head-files-url>https://heads-fa.example.com/head/</head-files-url>\
                   <autoplay>1</autoplay>\
                   </product></products>";
        let map = parse_product_info(xml).unwrap();
        assert_eq!(map.get("type").map(String::as_str), Some("premium"));
        assert_eq!(
            map.get("head-files-url").map(String::as_str),
            Some("https://heads-fa.example.com/head/")
        );
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn product_info_tolerates_junk() {
        assert!(parse_product_info("").unwrap().is_empty());
        assert!(parse_product_info("<a><b>x</b></a>").unwrap().is_empty());
    }
}
