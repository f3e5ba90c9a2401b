//! XmppMITM: a loopback TLS server that relays the Riot client's chat
//! connection to the real chat host byte-for-byte, emitting every
//! top-level stanza it sees on the wire as an `incoming`/`outgoing` event.
//!
//! Each accepted client connection gets its own upstream TLS connection —
//! a `ProxyPair` — tracked in a mutex-guarded registry keyed by a
//! monotonic socket id. There is deliberately no process-wide singleton
//! here (see DESIGN.md): the registry is owned by `XmppMitm`, which callers
//! hold behind an `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};

use crate::config::VoiceConfig;
use crate::events::{Event, EventSink};
use crate::model::{ChatConfig, SocketId, TtsJob};
use crate::voice::TtsQueue;

use super::framing::drain_stanzas;
use super::router;
use super::stanzas::extract_element_text;

/// Backpressure cap on a direction's reassembly buffer. A well-formed
/// stanza stream never approaches this; hitting it means malformed or
/// hostile input and the pair is torn down.
const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

fn is_loopback_bind_addr(addr: &str) -> bool {
    addr == "127.0.0.1" || addr == "localhost" || addr.starts_with("127.")
}

/// Pulls the bare JID local-part out of a bind-result IQ, the only point
/// in a relayed session where XmppMITM learns the connecting client's own
/// identity (it never performs the handshake itself, unlike the bridge).
fn extract_own_puuid_from_bind_result(stanza_xml: &str) -> Option<String> {
    if !stanza_xml.contains("<bind") {
        return None;
    }
    let jid = extract_element_text(stanza_xml, "jid")?;
    Some(jid.split('@').next().unwrap_or("").to_string())
}

/// Handle to a live proxy pair, held only long enough to look it up; the
/// pair's own task owns the sockets.
struct PairHandle {
    abort: tokio::task::AbortHandle,
}

pub struct XmppMitm {
    bind_addr: String,
    port: u16,
    upstream_host: tokio::sync::watch::Receiver<Option<String>>,
    default_upstream_host: String,
    upstream_port: u16,
    events: EventSink,
    socket_ids: AtomicU64,
    pairs: Mutex<HashMap<SocketId, PairHandle>>,
    chat_config: watch::Receiver<ChatConfig>,
    tts_queue: Arc<TtsQueue>,
    voice: VoiceConfig,
}

impl XmppMitm {
    /// `upstream_host` is published by ConfigMITM as it observes the real
    /// chat host in clientconfig responses — it differs per shard
    /// (na/eu/jp1/...), so it is never hardcoded here.
    /// `default_upstream_host` is used only until the first clientconfig
    /// round trip has happened.
    pub fn new(
        bind_addr: String,
        port: u16,
        upstream_host: tokio::sync::watch::Receiver<Option<String>>,
        default_upstream_host: String,
        upstream_port: u16,
        events: EventSink,
        chat_config: watch::Receiver<ChatConfig>,
        tts_queue: Arc<TtsQueue>,
        voice: VoiceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bind_addr,
            port,
            upstream_host,
            default_upstream_host,
            upstream_port,
            events,
            socket_ids: AtomicU64::new(1),
            pairs: Mutex::new(HashMap::new()),
            chat_config,
            tts_queue,
            voice,
        })
    }

    /// Binds the loopback listener and accepts connections forever.
    /// Returns an error only if the bind itself fails — a non-loopback
    /// bind address is a startup-fatal condition.
    pub async fn run(self: Arc<Self>, tls_acceptor: tokio_native_tls::TlsAcceptor) -> anyhow::Result<()> {
        if !is_loopback_bind_addr(&self.bind_addr) {
            anyhow::bail!("XmppMITM refuses to bind outside loopback: {}", self.bind_addr);
        }

        let listener = TcpListener::bind((self.bind_addr.as_str(), self.port)).await?;
        self.events.emit(Event::security(format!(
            "XmppMITM bound to loopback {}:{}",
            self.bind_addr, self.port
        )));

        loop {
            let (stream, _addr) = listener.accept().await?;
            let this = self.clone();
            let acceptor = tls_acceptor.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, acceptor).await {
                    tracing::debug!("proxy pair ended: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        client: TcpStream,
        acceptor: tokio_native_tls::TlsAcceptor,
    ) -> anyhow::Result<()> {
        let client_tls = acceptor.accept(client).await?;

        let upstream_host = self
            .upstream_host
            .borrow()
            .clone()
            .unwrap_or_else(|| self.default_upstream_host.clone());
        let upstream = TcpStream::connect((upstream_host.as_str(), self.upstream_port)).await?;
        let connector = native_tls::TlsConnector::builder().build()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let upstream_tls = connector.connect(&upstream_host, upstream).await?;

        let socket_id = self.socket_ids.fetch_add(1, Ordering::SeqCst);
        self.events.emit(Event::open_valorant("127.0.0.1", self.port, socket_id));
        self.events.emit(Event::open_riot(socket_id));

        let handle = tokio::spawn(Self::relay(
            client_tls,
            upstream_tls,
            socket_id,
            self.events.clone(),
            self.chat_config.clone(),
            self.tts_queue.clone(),
            self.voice.clone(),
        ));
        self.pairs.lock().await.insert(
            socket_id,
            PairHandle { abort: handle.abort_handle() },
        );

        let _ = handle.await;
        self.pairs.lock().await.remove(&socket_id);
        self.events.emit(Event::close_valorant(socket_id));
        self.events.emit(Event::close_riot(socket_id));
        Ok(())
    }

    /// Relays bytes verbatim in both directions while feeding a per-
    /// direction reassembly buffer into the stanza tokenizer. An I/O
    /// error on either side tears down the whole pair.
    async fn relay(
        client: tokio_native_tls::TlsStream<TcpStream>,
        upstream: tokio_native_tls::TlsStream<TcpStream>,
        socket_id: SocketId,
        events: EventSink,
        chat_config: watch::Receiver<ChatConfig>,
        tts_queue: Arc<TtsQueue>,
        voice: VoiceConfig,
    ) {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

        let events_a = events.clone();
        let client_to_upstream = async move {
            let mut buffer = Vec::new();
            let mut read_buf = [0u8; 8192];
            loop {
                let n = match client_read.read(&mut read_buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if upstream_write.write_all(&read_buf[..n]).await.is_err() {
                    break;
                }
                buffer.extend_from_slice(&read_buf[..n]);
                for stanza in drain_stanzas(&mut buffer) {
                    if !stanza.is_stream_frame {
                        events_a.emit(Event::outgoing(stanza.xml));
                    }
                }
                if buffer.len() > MAX_STANZA_BUFFER_SIZE {
                    tracing::warn!(socket_id, "outgoing reassembly buffer exceeded cap, dropping pair");
                    break;
                }
            }
        };

        let events_b = events.clone();
        let upstream_to_client = async move {
            let mut buffer = Vec::new();
            let mut read_buf = [0u8; 8192];
            // Learned from the bind-result IQ the server sends back once the
            // real client authenticates; empty until then, in which case no
            // message classifies as this session's own.
            let mut own_puuid = String::new();
            loop {
                let n = match upstream_read.read(&mut read_buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if client_write.write_all(&read_buf[..n]).await.is_err() {
                    break;
                }
                buffer.extend_from_slice(&read_buf[..n]);
                for stanza in drain_stanzas(&mut buffer) {
                    if stanza.is_stream_frame {
                        continue;
                    }
                    if own_puuid.is_empty() {
                        if let Some(puuid) = extract_own_puuid_from_bind_result(&stanza.xml) {
                            own_puuid = puuid;
                        }
                    }
                    let config = chat_config.borrow().clone();
                    for message in router::parse_chat_messages(&stanza.xml, &own_puuid) {
                        if router::should_narrate(&config, &message) {
                            tts_queue.enqueue(TtsJob {
                                text: message.content.clone(),
                                voice: voice.voice.clone(),
                                rate: voice.rate,
                            });
                        }
                    }
                    events_b.emit(Event::incoming(stanza.xml));
                }
                if buffer.len() > MAX_STANZA_BUFFER_SIZE {
                    tracing::warn!(socket_id, "incoming reassembly buffer exceeded cap, dropping pair");
                    break;
                }
            }
        };

        tokio::select! {
            _ = client_to_upstream => {}
            _ = upstream_to_client => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_stanza_buffer_cap_is_at_least_one_mtu() {
        assert!(MAX_STANZA_BUFFER_SIZE >= 1500);
    }

    #[test]
    fn test_loopback_bind_guard() {
        assert!(is_loopback_bind_addr("127.0.0.1"));
        assert!(is_loopback_bind_addr("localhost"));
        assert!(!is_loopback_bind_addr("0.0.0.0"));
        assert!(!is_loopback_bind_addr("192.168.1.5"));
    }

    #[test]
    fn test_extract_own_puuid_from_bind_result() {
        let xml = "<iq type='result' id='_xmpp_bind1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>abc123@pvp.net/resource</jid></bind></iq>";
        assert_eq!(extract_own_puuid_from_bind_result(xml), Some("abc123".to_string()));
    }

    #[test]
    fn test_extract_own_puuid_ignores_non_bind_stanzas() {
        let xml = "<message from='x@ares-parties.jp1.pvp.net/x'><body>hi</body></message>";
        assert!(extract_own_puuid_from_bind_result(xml).is_none());
    }
}
