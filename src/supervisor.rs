//! Wires every component together and owns the top-level process
//! lifecycle: startup validation, the reconnect loop, and shutdown
//! coordination. A single reconnection loop generalized to this crate's
//! two-path (MITM / bridge) startup.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::backoff::Backoff;
use crate::config::{Config, ProxyMode};
use crate::error::ErrorKind;
use crate::events::{self, Event, EventSink};
use crate::model::ChatConfig;
use crate::voice::{self, NullPttController, NullTtsEngine, TtsQueue};
use crate::xmpp::{auth, bridge, mitm};
use crate::{config_mitm, tls};

/// Longest a fatal MITM startup error is allowed to surface within, before
/// the supervisor treats the process as healthy.
const STARTUP_VALIDATION_WINDOW: Duration = Duration::from_secs(3);

const MAX_RECONNECT_ATTEMPTS: u32 = 20;

pub async fn run(config: Config) -> anyhow::Result<()> {
    let (events, event_rx) = EventSink::new();
    let writer = tokio::spawn(events::run_writer(event_rx));

    events.emit(Event::startup(std::process::id(), env!("CARGO_PKG_VERSION")));

    // `chat_config_tx` is never sent on again (chat config is write-once,
    // resolved as an open question in DESIGN.md) but the sender must
    // outlive every `chat_config.changed()` waiter or those selects spin
    // forever on the resulting `Err`.
    let (chat_config_tx, chat_config_rx) = watch::channel(config.chat.clone());
    let _chat_config_tx = chat_config_tx;

    let (tts_queue, tts_rx) = TtsQueue::new();
    let tts_queue = Arc::new(tts_queue);
    let tts_lock = Arc::new(tokio::sync::Mutex::new(()));
    let tts_engine = Arc::new(NullTtsEngine::new(events.clone()));
    let ptt = Arc::new(NullPttController::new(events.clone()));
    tokio::spawn(voice::run(
        tts_rx,
        tts_engine,
        ptt,
        config.voice.ptt_enabled,
        events.clone(),
        tts_lock,
    ));

    // Flipped by any task that emits a `FatalStartup` error, so the 3s
    // startup-validation window below can abort early instead of always
    // waiting out the full window.
    let (fatal_tx, mut fatal_rx) = watch::channel(None::<String>);

    let (discovered_host_tx, discovered_host_rx) = watch::channel(None);
    let config_mitm_router = config_mitm::router(
        config.upstream.clientconfig_base.clone(),
        config.proxy.xmpp_mitm_port,
        events.clone(),
        discovered_host_tx,
    );
    let config_mitm_addr = (config.proxy.bind_addr.clone(), config.proxy.config_mitm_port);
    let config_mitm_events = events.clone();
    let config_mitm_fatal = fatal_tx.clone();
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(config_mitm_addr.clone()).await {
            Ok(listener) => {
                config_mitm_events.emit(Event::security(format!(
                    "ConfigMITM bound to loopback {}:{}",
                    config_mitm_addr.0, config_mitm_addr.1
                )));
                if let Err(e) = axum::serve(listener, config_mitm_router).await {
                    let reason = format!("ConfigMITM server died: {e}");
                    config_mitm_events.emit(Event::from_error_kind(&ErrorKind::FatalStartup { code: 500, reason: reason.clone() }));
                    let _ = config_mitm_fatal.send(Some(reason));
                }
            }
            Err(e) => {
                let reason = format!("ConfigMITM bind failed: {e}");
                config_mitm_events.emit(Event::from_error_kind(&ErrorKind::FatalStartup { code: 500, reason: reason.clone() }));
                let _ = config_mitm_fatal.send(Some(reason));
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    match config.proxy.mode {
        ProxyMode::Mitm => {
            run_mitm(
                &config,
                events.clone(),
                discovered_host_rx,
                fatal_tx.clone(),
                chat_config_rx,
                tts_queue.clone(),
            )
            .await?
        }
        ProxyMode::Bridge => {
            run_bridge(&config, events.clone(), chat_config_rx, shutdown_rx, tts_queue.clone()).await?
        }
    }

    let startup_check = tokio::time::sleep(STARTUP_VALIDATION_WINDOW);
    tokio::pin!(startup_check);

    tokio::select! {
        _ = &mut startup_check => {
            info!("startup validation window elapsed cleanly");
            if let Some(client_path) = &config.proxy.riot_client_path {
                launch_game_client(client_path, config.proxy.config_mitm_port, &events);
            }
        }
        _ = fatal_rx.changed() => {
            let reason = fatal_rx.borrow().clone().unwrap_or_default();
            let _ = shutdown_tx.send(true);
            events.emit(Event::shutdown("fatal startup error"));
            drop(events);
            let _ = writer.await;
            anyhow::bail!("fatal startup error: {reason}");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received during startup validation");
        }
    }

    tokio::select! {
        _ = fatal_rx.changed() => {
            let reason = fatal_rx.borrow().clone().unwrap_or_default();
            let _ = shutdown_tx.send(true);
            events.emit(Event::shutdown("fatal error"));
            drop(events);
            let _ = writer.await;
            anyhow::bail!("fatal error: {reason}");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    events.emit(Event::shutdown("process exiting"));
    drop(events);
    let _ = writer.await;
    Ok(())
}

/// Builds the CLI args the Riot client is launched with, pointing its
/// client-config lookups at ConfigMITM.
fn client_launch_args(config_mitm_port: u16) -> Vec<String> {
    vec![
        format!("--client-config-url=http://127.0.0.1:{config_mitm_port}"),
        "--launch-product=valorant".to_string(),
        "--launch-patchline=live".to_string(),
    ]
}

fn launch_game_client(client_path: &std::path::Path, config_mitm_port: u16, events: &EventSink) {
    let args = client_launch_args(config_mitm_port);
    match tokio::process::Command::new(client_path).args(&args).spawn() {
        Ok(child) => {
            events.emit(Event::info(format!(
                "launched Riot client (pid {:?}): {client_path:?} {}",
                child.id(),
                args.join(" ")
            )));
        }
        Err(e) => {
            error!("failed to launch Riot client at {client_path:?}: {e}");
        }
    }
}

async fn run_mitm(
    config: &Config,
    events: EventSink,
    discovered_host_rx: watch::Receiver<Option<String>>,
    fatal_tx: watch::Sender<Option<String>>,
    chat_config_rx: watch::Receiver<ChatConfig>,
    tts_queue: Arc<TtsQueue>,
) -> anyhow::Result<()> {
    let identity = tls::generate_self_signed_identity("chat-affinity.pvp.net")?;
    let acceptor = native_tls::TlsAcceptor::new(identity)?;
    let acceptor = tokio_native_tls::TlsAcceptor::from(acceptor);

    let mitm = mitm::XmppMitm::new(
        config.proxy.bind_addr.clone(),
        config.proxy.xmpp_mitm_port,
        discovered_host_rx,
        "127.0.0.1".to_string(),
        5223,
        events.clone(),
        chat_config_rx,
        tts_queue,
        config.voice.clone(),
    );

    tokio::spawn(async move {
        if let Err(e) = mitm.run(acceptor).await {
            let reason = format!("XmppMITM listener died: {e}");
            events.emit(Event::from_error_kind(&ErrorKind::FatalStartup { code: 500, reason: reason.clone() }));
            let _ = fatal_tx.send(Some(reason));
        }
    });

    Ok(())
}

async fn run_bridge(
    config: &Config,
    events: EventSink,
    chat_config_rx: watch::Receiver<ChatConfig>,
    shutdown_rx: watch::Receiver<bool>,
    tts_queue: Arc<TtsQueue>,
) -> anyhow::Result<()> {
    let lockfile_path = config.proxy.lockfile_path.clone();
    let upstream = config.upstream.clone();
    let voice_config = config.voice.clone();

    let events_for_loop = events.clone();
    let session_events = events.clone();
    let session_upstream = upstream.clone();

    tokio::spawn(async move {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(60), 2.0);

        loop {
            let lockfile = match auth::wait_for_lockfile(&lockfile_path).await {
                Ok(lf) => lf,
                Err(e) => {
                    events_for_loop.emit(Event::from_error_kind(&ErrorKind::FatalStartup {
                        code: 404,
                        reason: format!("{e}"),
                    }));
                    return;
                }
            };

            let setup = async {
                let (access_token, entitlement_token) = auth::fetch_entitlements(&lockfile).await?;
                let (puuid, region) = auth::poll_chat_session(&lockfile).await?;
                let pas_token =
                    auth::fetch_pas_token(&session_upstream, &access_token, &entitlement_token, &session_events)
                        .await?;
                let affinity = auth::decode_affinity_from_pas_token(&pas_token, &region);
                let binding = auth::fetch_affinity_binding(&session_upstream, &access_token, &affinity).await?;
                anyhow::Ok((
                    auth::credentials(access_token, entitlement_token, puuid, region),
                    binding,
                ))
            }
            .await;

            match setup {
                Ok((credentials, binding)) => {
                    backoff.reset();
                    let session_events = session_events.clone();
                    let chat_config_rx = chat_config_rx.clone();
                    let session_upstream = session_upstream.clone();
                    let shutdown_rx = shutdown_rx.clone();
                    let lockfile = lockfile.clone();
                    let tts_queue = tts_queue.clone();
                    let voice_config = voice_config.clone();
                    bridge::run(
                        move || bridge::BridgeSession {
                            credentials: credentials.clone(),
                            affinity_host: binding.xmpp_host.clone(),
                            affinity_domain: binding.xmpp_domain.clone(),
                            upstream: session_upstream.clone(),
                            events: session_events.clone(),
                            chat_config: chat_config_rx.clone(),
                            lockfile: lockfile.clone(),
                            tts_queue: tts_queue.clone(),
                            voice: voice_config.clone(),
                        },
                        shutdown_rx,
                    )
                    .await;
                    return;
                }
                Err(e) => {
                    warn!("bridge credential setup failed: {e}");
                    if backoff.exceeded_max_attempts(MAX_RECONNECT_ATTEMPTS) {
                        error!("exceeded {MAX_RECONNECT_ATTEMPTS} credential setup attempts, giving up");
                        return;
                    }
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    });

    Ok(())
}
