use crate::{config::WsConfig, link::LinkState, scheduler::TaskScheduler};
use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use sync_core::{
    now_ms, Backoff, ClientFrame, ConnectionEvent, ConnectionInfo, ConnectionState, Envelope,
    EventDispatcher, EventKind, Metrics, OwnerId, Source, Subscription, SyncResult,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    time::{interval_at, sleep, sleep_until, timeout, Duration, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Owns the push channel: connect, heartbeat, reconnect with backoff, shutdown.
#[derive(Clone)]
pub struct ConnectionManager {
    cfg: Arc<WsConfig>,
    link: LinkState,
    dispatcher: EventDispatcher,
    scheduler: TaskScheduler,
    metrics: Arc<Metrics>,
    owner: OwnerId,
    session: Uuid,
    outbound_tx: mpsc::Sender<String>,
    outbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    stop_tx: watch::Sender<bool>,
    task: Arc<Mutex<Option<u64>>>,
}

impl ConnectionManager {
    pub fn new(
        cfg: WsConfig,
        link: LinkState,
        dispatcher: EventDispatcher,
        scheduler: TaskScheduler,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(cfg.outbound_capacity.max(1));
        let (stop_tx, _) = watch::channel(false);
        Self {
            cfg: Arc::new(cfg),
            link,
            dispatcher,
            scheduler,
            metrics,
            owner: OwnerId::new("connection"),
            session: Uuid::new_v4(),
            outbound_tx,
            outbound_rx: Arc::new(tokio::sync::Mutex::new(outbound_rx)),
            stop_tx,
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts the background connection loop against `url`.
    pub fn connect(&self, url: &str) -> Result<()> {
        let url = Url::parse(url).context("parse ws url")?;
        {
            let mut task = self.task.lock();
            if let Some(id) = *task {
                if self.scheduler.is_scheduled(id) {
                    bail!("connection loop already running");
                }
            }
            self.link
                .apply(ConnectionEvent::Connect)
                .context("start connection")?;
            let this = self.clone();
            *task = Some(self.scheduler.spawn(&self.owner, "ws_conn", async move {
                this.run(url).await;
            }));
        }
        Ok(())
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SyncResult<Subscription>
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(kind, handler)
    }

    /// Queues a frame for the open socket. Returns `false` when the frame was
    /// dropped because the channel is not connected or the queue is full.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> Result<bool> {
        let text = serde_json::to_string(payload).context("serialize outbound frame")?;
        if self.link.state() != ConnectionState::Connected {
            tracing::debug!(target: "ws_conn", session = %self.session, "not connected, dropping outbound frame");
            return Ok(false);
        }
        match self.outbound_tx.try_send(text) {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(target: "ws_conn", session = %self.session, "outbound queue rejected frame: {}", e);
                Ok(false)
            }
        }
    }

    /// Asks the backend for an immediate `system_metrics` push.
    pub fn request_metrics(&self) -> Result<bool> {
        self.send(&ClientFrame::RequestMetrics)
    }

    /// Frames waiting for the socket writer.
    pub fn queued_frames(&self) -> usize {
        self.outbound_tx.max_capacity() - self.outbound_tx.capacity()
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.link.info()
    }

    pub fn link(&self) -> &LinkState {
        &self.link
    }

    /// Terminal: closes the socket and stops reconnecting.
    pub fn shutdown(&self) {
        if let Err(e) = self.link.apply(ConnectionEvent::Shutdown) {
            tracing::debug!(target: "ws_conn", session = %self.session, "shutdown: {}", e);
        }
        self.stop_tx.send_replace(true);
    }

    async fn run(self, url: Url) {
        let mut stop = self.stop_tx.subscribe();
        let mut outbound = self.outbound_rx.clone().lock_owned().await;
        let mut backoff = Backoff::new(
            Duration::from_millis(self.cfg.backoff_floor_ms),
            Duration::from_millis(self.cfg.backoff_cap_ms),
            self.cfg.backoff_jitter,
        );
        let mut rng = StdRng::from_entropy();
        loop {
            tracing::info!(target: "ws_conn", session = %self.session, "connecting to {}", url);
            let attempt = tokio::select! {
                r = connect_async(url.as_str()) => r,
                _ = stopped(&mut stop) => return,
            };
            let outcome = match attempt {
                Ok((mut stream, _)) => {
                    // Leftovers from the dead session go first; status handlers
                    // may queue frames while `Open` is dispatched.
                    while outbound.try_recv().is_ok() {}
                    if self.link.apply(ConnectionEvent::Open).is_err() {
                        let _ = stream.close(None).await;
                        return;
                    }
                    tracing::info!(target: "ws_conn", session = %self.session, "connected");
                    backoff.reset();
                    self.session_loop(&mut stream, &mut outbound, &mut stop).await
                }
                Err(e) => {
                    tracing::warn!(target: "ws_conn", session = %self.session, "connect failed: {}", e);
                    ConnectionEvent::Error
                }
            };
            if self.link.apply(outcome).is_err() {
                // shut down while the socket was open
                return;
            }
            self.metrics.reconnect_attempts.inc();
            let delay = backoff.next_delay(&mut rng);
            tracing::info!(target: "ws_conn", session = %self.session, "reconnecting in {:?}", delay);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = stopped(&mut stop) => return,
            }
            if self.link.apply(ConnectionEvent::BackoffElapsed).is_err() {
                return;
            }
        }
    }

    /// Pumps one open socket until it fails; returns the event that ended it.
    async fn session_loop(
        &self,
        stream: &mut WsStream,
        outbound: &mut mpsc::Receiver<String>,
        stop: &mut watch::Receiver<bool>,
    ) -> ConnectionEvent {
        let period = self.cfg.heartbeat_interval();
        let mut hb = interval_at(Instant::now() + period, period);
        let mut ping_sent: Option<Instant> = None;
        loop {
            let deadline = ping_sent.map(|t| t + self.cfg.heartbeat_timeout());
            tokio::select! {
                _ = hb.tick() => {
                    if ping_sent.is_some() {
                        continue;
                    }
                    let frame = ClientFrame::Ping { timestamp: now_ms() };
                    let text = match serde_json::to_string(&frame) {
                        Ok(t) => t,
                        Err(e) => {
                            tracing::warn!(target: "ws_conn", session = %self.session, "encode ping: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = stream.send(Message::Text(text)).await {
                        tracing::warn!(target: "ws_conn", session = %self.session, "ping send failed: {}", e);
                        return ConnectionEvent::Error;
                    }
                    ping_sent = Some(Instant::now());
                }
                _ = wait_until(deadline) => {
                    tracing::warn!(target: "ws_conn", session = %self.session, "pong timeout, forcing close");
                    self.metrics.heartbeat_timeouts.inc();
                    let _ = timeout(Duration::from_secs(1), stream.close(None)).await;
                    return ConnectionEvent::HeartbeatTimeout;
                }
                Some(text) = outbound.recv() => {
                    if let Err(e) = stream.send(Message::Text(text)).await {
                        tracing::warn!(target: "ws_conn", session = %self.session, "send failed: {}", e);
                        return ConnectionEvent::Error;
                    }
                }
                _ = stopped(stop) => {
                    let _ = timeout(Duration::from_secs(1), stream.close(None)).await;
                    return ConnectionEvent::Close;
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.on_frame(text.as_bytes(), &mut ping_sent),
                        Some(Ok(Message::Binary(bin))) => self.on_frame(&bin, &mut ping_sent),
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = stream.send(Message::Pong(payload)).await {
                                tracing::warn!(target: "ws_conn", session = %self.session, "pong send failed: {}", e);
                                return ConnectionEvent::Error;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => self.record_pong(&mut ping_sent),
                        Some(Ok(Message::Close(_))) => {
                            tracing::warn!(target: "ws_conn", session = %self.session, "server closed");
                            return ConnectionEvent::Close;
                        }
                        Some(Err(e)) => {
                            tracing::warn!(target: "ws_conn", session = %self.session, "recv error: {}", e);
                            return ConnectionEvent::Error;
                        }
                        Some(Ok(_)) => {}
                        None => {
                            tracing::warn!(target: "ws_conn", session = %self.session, "stream ended");
                            return ConnectionEvent::Close;
                        }
                    }
                }
            }
        }
    }

    fn on_frame(&self, bytes: &[u8], ping_sent: &mut Option<Instant>) {
        for parsed in Envelope::parse_frame(bytes, now_ms(), Source::Push) {
            match parsed {
                Ok(env) if env.kind == EventKind::Pong => self.record_pong(ping_sent),
                Ok(env) => {
                    self.dispatcher.dispatch(&env);
                }
                Err(err) => self.dispatcher.reject(&err, bytes),
            }
        }
    }

    fn record_pong(&self, ping_sent: &mut Option<Instant>) {
        if let Some(sent) = ping_sent.take() {
            let latency = sent.elapsed().as_millis() as u64;
            self.link.set_latency(latency);
            self.metrics.connection_latency_ms.set(latency as f64);
            tracing::debug!(target: "ws_conn", session = %self.session, latency_ms = latency, "pong");
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        let done = *stop.borrow_and_update();
        if done {
            return;
        }
        if stop.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
