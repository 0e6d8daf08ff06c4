//! Redis pub/sub adapter.
//!
//! A driver task owns the subscriber connection. Subscribe and unsubscribe
//! requests are queued to it and resolved when Redis confirms them; replies
//! arrive in command order, interleaved with `message` pushes. When the
//! connection drops, pending requests fail with [`BusError::Disconnected`],
//! the driver reconnects with backoff and emits [`BusEvent::Reconnected`].
//!
//! Publishing needs its own connection: a RESP2 connection in subscribed
//! mode only accepts (P)SUBSCRIBE-family commands.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use fanout_protocol::resp::{self, RespValue};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{take_events, BusError, BusEvent, BusEvents, UpstreamBus};
use crate::message::Message;
use crate::retry::RetryPolicy;

/// Redis connection settings.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Password for `AUTH`, if the server requires one.
    pub password: Option<String>,
    /// Timeout for establishing a TCP connection.
    pub connect_timeout: Duration,
    /// Timeout for a single command round-trip.
    pub command_timeout: Duration,
    /// Backoff between reconnect attempts (attempt count is ignored).
    pub reconnect: RetryPolicy,
    /// Capacity of the event stream.
    pub event_buffer: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            reconnect: RetryPolicy {
                attempts: u32::MAX,
                first: Duration::from_millis(100),
                max: Duration::from_secs(10),
                factor: 2.0,
            },
            event_buffer: 4096,
        }
    }
}

impl RedisConfig {
    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Subscribe,
    Unsubscribe,
}

impl Verb {
    fn command(self) -> &'static [u8] {
        match self {
            Verb::Subscribe => b"SUBSCRIBE",
            Verb::Unsubscribe => b"UNSUBSCRIBE",
        }
    }
}

struct Request {
    verb: Verb,
    channel: String,
    reply: oneshot::Sender<Result<(), BusError>>,
}

impl Request {
    fn fail(self, err: BusError) {
        let _ = self.reply.send(Err(err));
    }
}

/// A Redis-backed [`UpstreamBus`].
pub struct RedisBus {
    config: RedisConfig,
    requests: mpsc::UnboundedSender<Request>,
    events_rx: Mutex<Option<BusEvents>>,
    publisher: tokio::sync::Mutex<Option<RespConnection>>,
}

impl RedisBus {
    /// Connect to Redis and start the subscriber driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the first connection cannot be established;
    /// later connection losses are recovered internally.
    pub async fn connect(config: RedisConfig) -> Result<Self, BusError> {
        let conn = RespConnection::open(&config).await?;
        info!(addr = %config.addr(), "Connected to Redis");

        let (requests, request_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));

        tokio::spawn(drive(conn, config.clone(), request_rx, events_tx));

        Ok(Self {
            config,
            requests,
            events_rx: Mutex::new(Some(events_rx)),
            publisher: tokio::sync::Mutex::new(None),
        })
    }

    async fn request(&self, verb: Verb, channel: &str) -> Result<(), BusError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request {
                verb,
                channel: channel.to_string(),
                reply,
            })
            .map_err(|_| BusError::Closed)?;

        match tokio::time::timeout(self.config.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BusError::Disconnected),
            Err(_) => Err(BusError::Timeout(self.config.command_timeout)),
        }
    }
}

#[async_trait]
impl UpstreamBus for RedisBus {
    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        self.request(Verb::Subscribe, channel).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        self.request(Verb::Unsubscribe, channel).await
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, BusError> {
        let mut guard = self.publisher.lock().await;
        if guard.is_none() {
            *guard = Some(RespConnection::open(&self.config).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(BusError::Disconnected);
        };

        let round_trip = async {
            conn.write_command(&[b"PUBLISH", channel.as_bytes(), &payload[..]])
                .await?;
            conn.read_value().await
        };
        let reply = match tokio::time::timeout(self.config.command_timeout, round_trip).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                *guard = None;
                return Err(e);
            }
            Err(_) => {
                *guard = None;
                return Err(BusError::Timeout(self.config.command_timeout));
            }
        };

        match reply {
            RespValue::Integer(n) => Ok(n.max(0) as usize),
            RespValue::Error(e) => Err(BusError::Rejected(e)),
            other => Err(BusError::Rejected(format!(
                "unexpected PUBLISH reply: {:?}",
                other
            ))),
        }
    }

    fn events(&self) -> Result<BusEvents, BusError> {
        take_events(&self.events_rx)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// A raw RESP connection.
struct RespConnection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl RespConnection {
    async fn open(config: &RedisConfig) -> Result<Self, BusError> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr()))
            .await
            .map_err(|_| BusError::Timeout(config.connect_timeout))??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
        };

        if let Some(password) = &config.password {
            conn.write_command(&[b"AUTH", password.as_bytes()]).await?;
            if let RespValue::Error(e) = conn.read_value().await? {
                return Err(BusError::Rejected(e));
            }
        }

        Ok(conn)
    }

    async fn write_command(&mut self, args: &[&[u8]]) -> Result<(), BusError> {
        let frame = resp::encode_command(args);
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Read the next value. Cancel safe: partial reads stay in the buffer.
    async fn read_value(&mut self) -> Result<RespValue, BusError> {
        loop {
            if let Some(value) = resp::decode_from(&mut self.buffer)? {
                return Ok(value);
            }
            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err(BusError::Disconnected);
            }
        }
    }
}

/// A decoded pub/sub reply.
#[derive(Debug, PartialEq, Eq)]
enum Push {
    Message { channel: String, payload: Bytes },
    Confirm { verb: Verb, channel: String },
    Error(String),
    Other,
}

fn classify(value: RespValue) -> Push {
    match value {
        RespValue::Error(e) => Push::Error(e),
        RespValue::Array(Some(items)) => {
            let mut items = items.into_iter();
            let kind = items.next().and_then(RespValue::into_bytes);
            let channel = items
                .next()
                .and_then(RespValue::into_bytes)
                .map(|c| String::from_utf8_lossy(&c).into_owned());
            match (kind.as_deref(), channel) {
                (Some(b"message"), Some(channel)) => match items.next().and_then(RespValue::into_bytes) {
                    Some(payload) => Push::Message { channel, payload },
                    None => Push::Other,
                },
                (Some(b"subscribe"), Some(channel)) => Push::Confirm {
                    verb: Verb::Subscribe,
                    channel,
                },
                (Some(b"unsubscribe"), Some(channel)) => Push::Confirm {
                    verb: Verb::Unsubscribe,
                    channel,
                },
                _ => Push::Other,
            }
        }
        _ => Push::Other,
    }
}

enum ConnectionEnd {
    /// The adapter was dropped or nobody reads events any more.
    Shutdown,
    /// The connection failed and should be re-established.
    Lost(BusError),
}

async fn drive(
    mut conn: RespConnection,
    config: RedisConfig,
    mut requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::Sender<BusEvent>,
) {
    loop {
        match serve(&mut conn, &mut requests, &events).await {
            ConnectionEnd::Shutdown => {
                debug!("Redis driver stopped");
                return;
            }
            ConnectionEnd::Lost(e) => {
                warn!(error = %e, "Redis connection lost");
            }
        }

        conn = match reconnect(&config, &mut requests).await {
            Some(conn) => conn,
            None => return,
        };
        if events.send(BusEvent::Reconnected).await.is_err() {
            return;
        }
    }
}

async fn serve(
    conn: &mut RespConnection,
    requests: &mut mpsc::UnboundedReceiver<Request>,
    events: &mpsc::Sender<BusEvent>,
) -> ConnectionEnd {
    let mut pending: VecDeque<Request> = VecDeque::new();

    let end = loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    break ConnectionEnd::Shutdown;
                };
                let args: [&[u8]; 2] = [request.verb.command(), request.channel.as_bytes()];
                if let Err(e) = conn.write_command(&args).await {
                    request.fail(BusError::Disconnected);
                    break ConnectionEnd::Lost(e);
                }
                pending.push_back(request);
            }
            value = conn.read_value() => {
                let value = match value {
                    Ok(value) => value,
                    Err(e) => break ConnectionEnd::Lost(e),
                };
                match classify(value) {
                    Push::Message { channel, payload } => {
                        let event = BusEvent::Message(Message::new(channel, payload));
                        if events.send(event).await.is_err() {
                            break ConnectionEnd::Shutdown;
                        }
                    }
                    Push::Confirm { verb, channel } => match pending.pop_front() {
                        Some(request) => {
                            if request.verb != verb || request.channel != channel {
                                warn!(
                                    expected = %request.channel,
                                    got = %channel,
                                    "Out-of-order pub/sub confirmation"
                                );
                            }
                            let _ = request.reply.send(Ok(()));
                        }
                        None => debug!(channel = %channel, "Unsolicited pub/sub confirmation"),
                    },
                    Push::Error(e) => match pending.pop_front() {
                        Some(request) => request.fail(BusError::Rejected(e)),
                        None => error!(error = %e, "Redis error with no pending request"),
                    },
                    Push::Other => {}
                }
            }
        }
    };

    for request in pending.drain(..) {
        request.fail(BusError::Disconnected);
    }
    end
}

async fn reconnect(
    config: &RedisConfig,
    requests: &mut mpsc::UnboundedReceiver<Request>,
) -> Option<RespConnection> {
    let mut attempt = 0u32;
    loop {
        match RespConnection::open(config).await {
            Ok(conn) => {
                info!(addr = %config.addr(), attempt, "Reconnected to Redis");
                return Some(conn);
            }
            Err(e) => warn!(addr = %config.addr(), attempt, error = %e, "Redis reconnect failed"),
        }

        let sleep = tokio::time::sleep(config.reconnect.delay(attempt));
        tokio::pin!(sleep);
        attempt = attempt.saturating_add(1);

        // Nothing can be confirmed while disconnected
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                request = requests.recv() => match request {
                    Some(request) => request.fail(BusError::Disconnected),
                    None => return None,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn bulk(data: &[u8]) -> RespValue {
        RespValue::Bulk(Some(Bytes::copy_from_slice(data)))
    }

    fn test_config(port: u16) -> RedisConfig {
        RedisConfig {
            host: "127.0.0.1".into(),
            port,
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(2),
            reconnect: RetryPolicy {
                attempts: u32::MAX,
                first: Duration::from_millis(10),
                max: Duration::from_millis(50),
                factor: 2.0,
            },
            ..RedisConfig::default()
        }
    }

    /// Minimal fake Redis: confirms (un)subscribes and lets the test push messages.
    struct FakeServer {
        stream: TcpStream,
        buffer: BytesMut,
    }

    impl FakeServer {
        async fn accept(listener: &TcpListener) -> Self {
            let (stream, _) = listener.accept().await.unwrap();
            Self {
                stream,
                buffer: BytesMut::new(),
            }
        }

        async fn read_command(&mut self) -> Vec<Vec<u8>> {
            loop {
                if let Some(RespValue::Array(Some(items))) =
                    resp::decode_from(&mut self.buffer).unwrap()
                {
                    return items
                        .into_iter()
                        .map(|v| v.into_bytes().unwrap().to_vec())
                        .collect();
                }
                assert!(self.stream.read_buf(&mut self.buffer).await.unwrap() > 0);
            }
        }

        async fn write(&mut self, parts: &[&[u8]], count: Option<i64>) {
            let mut out = format!("*{}\r\n", parts.len() + count.is_some() as usize).into_bytes();
            for part in parts {
                out.extend_from_slice(format!("${}\r\n", part.len()).as_bytes());
                out.extend_from_slice(part);
                out.extend_from_slice(b"\r\n");
            }
            if let Some(n) = count {
                out.extend_from_slice(format!(":{}\r\n", n).as_bytes());
            }
            self.stream.write_all(&out).await.unwrap();
        }

        async fn confirm_next(&mut self) -> Vec<Vec<u8>> {
            let cmd = self.read_command().await;
            let verb = String::from_utf8_lossy(&cmd[0]).to_lowercase();
            self.write(&[verb.as_bytes(), &cmd[1]], Some(1)).await;
            cmd
        }
    }

    #[test]
    fn test_classify_pushes() {
        let msg = RespValue::Array(Some(vec![bulk(b"message"), bulk(b"a"), bulk(b"hi")]));
        assert_eq!(
            classify(msg),
            Push::Message {
                channel: "a".into(),
                payload: Bytes::from_static(b"hi"),
            }
        );

        let sub = RespValue::Array(Some(vec![bulk(b"subscribe"), bulk(b"a"), RespValue::Integer(1)]));
        assert_eq!(
            classify(sub),
            Push::Confirm {
                verb: Verb::Subscribe,
                channel: "a".into(),
            }
        );

        assert_eq!(
            classify(RespValue::Error("ERR nope".into())),
            Push::Error("ERR nope".into())
        );
        assert_eq!(classify(RespValue::Simple("PONG".into())), Push::Other);
    }

    #[tokio::test]
    async fn test_subscribe_receive_and_unsubscribe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (bus, server) = tokio::join!(RedisBus::connect(test_config(port)), FakeServer::accept(&listener));
        let bus = bus.unwrap();
        let mut server = server;
        let mut events = bus.events().unwrap();

        let (subscribed, cmd) = tokio::join!(bus.subscribe("metrics:dashboard"), server.confirm_next());
        subscribed.unwrap();
        assert_eq!(cmd, vec![b"SUBSCRIBE".to_vec(), b"metrics:dashboard".to_vec()]);

        server
            .write(&[b"message", b"metrics:dashboard", br#"{"cpu":"0.42"}"#], None)
            .await;
        match events.recv().await {
            Some(BusEvent::Message(msg)) => {
                assert_eq!(msg.channel, "metrics:dashboard");
                assert_eq!(&msg.payload[..], br#"{"cpu":"0.42"}"#);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let (unsubscribed, cmd) = tokio::join!(bus.unsubscribe("metrics:dashboard"), server.confirm_next());
        unsubscribed.unwrap();
        assert_eq!(cmd[0], b"UNSUBSCRIBE".to_vec());
    }

    #[tokio::test]
    async fn test_error_reply_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (bus, server) = tokio::join!(RedisBus::connect(test_config(port)), FakeServer::accept(&listener));
        let bus = bus.unwrap();
        let mut server = server;

        let reply = async {
            server.read_command().await;
            server.stream.write_all(b"-NOPERM no access\r\n").await.unwrap();
        };
        let (result, ()) = tokio::join!(bus.subscribe("secret"), reply);
        assert!(matches!(result, Err(BusError::Rejected(e)) if e.starts_with("NOPERM")));
    }

    #[tokio::test]
    async fn test_reconnect_emits_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (bus, server) = tokio::join!(RedisBus::connect(test_config(port)), FakeServer::accept(&listener));
        let bus = bus.unwrap();
        let mut events = bus.events().unwrap();

        drop(server);
        let mut server = FakeServer::accept(&listener).await;
        assert!(matches!(events.recv().await, Some(BusEvent::Reconnected)));

        let (subscribed, _) = tokio::join!(bus.subscribe("a"), server.confirm_next());
        subscribed.unwrap();
    }

    #[tokio::test]
    async fn test_first_connection_failure_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(RedisBus::connect(test_config(port)).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_uses_separate_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (bus, _subscriber) = tokio::join!(RedisBus::connect(test_config(port)), FakeServer::accept(&listener));
        let bus = bus.unwrap();

        let server = async {
            let mut publisher = FakeServer::accept(&listener).await;
            let cmd = publisher.read_command().await;
            publisher.stream.write_all(b":2\r\n").await.unwrap();
            cmd
        };
        let (receivers, cmd) = tokio::join!(bus.publish("events:1", Bytes::from_static(b"x")), server);
        assert_eq!(receivers.unwrap(), 2);
        assert_eq!(cmd, vec![b"PUBLISH".to_vec(), b"events:1".to_vec(), b"x".to_vec()]);
    }
}
