//! Session-driven realtime WebSocket channel.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};

use crate::config::ClientConfig;
use crate::error::{LanewireError, Result};
use crate::session::{SessionManager, SessionState, SessionSubscription};

use super::fanout::Fanout;
use super::message::RealtimeMessage;

type ChannelSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state, derived from session state and socket health — never
/// the other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to reconnect after an unexpected close; carries the attempt
    /// count since the last successful connection.
    Backoff(u32),
}

struct ChannelRuntime {
    shutdown_tx: watch::Sender<bool>,
    outbound_tx: mpsc::UnboundedSender<RealtimeMessage>,
    task: JoinHandle<()>,
}

/// Everything the supervisor task needs, cloned out of the channel so the
/// task never holds the channel itself.
#[derive(Clone)]
struct SupervisorParams {
    session: Arc<SessionManager>,
    fanout: Arc<Fanout>,
    realtime_url: String,
    ping_interval: Duration,
    reconnect_base_delay: Duration,
    reconnect_max_delay: Duration,
    state_tx: watch::Sender<ChannelState>,
}

enum ConnectionOutcome {
    Shutdown,
    Lost,
}

/// The one live notification/chat connection.
///
/// Opens when the session becomes authenticated, closes on any transition
/// away from authenticated, and reconnects with jittered exponential
/// backoff on unexpected closes. Identity and access token are re-read from
/// the session manager on every connect attempt, so a refresh that rotated
/// them is reflected on the next reconnect. Must be created and driven
/// inside a tokio runtime.
pub struct RealtimeChannel {
    session: Arc<SessionManager>,
    fanout: Arc<Fanout>,
    realtime_url: String,
    ping_interval: Duration,
    reconnect_base_delay: Duration,
    reconnect_max_delay: Duration,
    state_tx: watch::Sender<ChannelState>,
    runtime: Mutex<Option<ChannelRuntime>>,
    session_subscription: Mutex<Option<SessionSubscription>>,
}

impl RealtimeChannel {
    /// Create the channel and bind its lifecycle to `session` transitions.
    ///
    /// If the session is already authenticated (e.g. restored from disk
    /// before the channel was built), the connection opens immediately.
    pub fn new(
        session: Arc<SessionManager>,
        fanout: Arc<Fanout>,
        config: &ClientConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let channel = Arc::new(Self {
            session: Arc::clone(&session),
            fanout,
            realtime_url: config.realtime_url.trim_end_matches('/').to_string(),
            ping_interval: config.ping_interval,
            reconnect_base_delay: config.reconnect_base_delay,
            reconnect_max_delay: config.reconnect_max_delay,
            state_tx,
            runtime: Mutex::new(None),
            session_subscription: Mutex::new(None),
        });

        let observer = Arc::downgrade(&channel);
        let subscription = session.on_session_change(move |change| {
            let Some(channel) = observer.upgrade() else { return };
            if change.to == SessionState::Authenticated {
                channel.open();
            } else {
                channel.close();
            }
        });
        *lock(&channel.session_subscription) = Some(subscription);

        if session.state() == SessionState::Authenticated {
            channel.open();
        }
        channel
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Watch stream of connection-state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Queue an outbound envelope on the live connection.
    pub fn send(&self, message: RealtimeMessage) -> Result<()> {
        match lock(&self.runtime).as_ref() {
            Some(runtime) => runtime.outbound_tx.send(message).map_err(|_| {
                LanewireError::InvalidState("realtime channel is shutting down".to_string())
            }),
            None => Err(LanewireError::InvalidState(
                "realtime channel is not connected".to_string(),
            )),
        }
    }

    /// Tear down the socket and cancel any pending reconnect timer.
    /// Idempotent; safe to call mid-backoff and from logout.
    pub fn close(&self) {
        let runtime = lock(&self.runtime).take();
        if let Some(runtime) = runtime {
            let _ = runtime.shutdown_tx.send(true);
        }
        let _ = self.state_tx.send(ChannelState::Disconnected);
    }

    fn open(&self) {
        let mut runtime = lock(&self.runtime);
        if runtime.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let params = SupervisorParams {
            session: Arc::clone(&self.session),
            fanout: Arc::clone(&self.fanout),
            realtime_url: self.realtime_url.clone(),
            ping_interval: self.ping_interval,
            reconnect_base_delay: self.reconnect_base_delay,
            reconnect_max_delay: self.reconnect_max_delay,
            state_tx: self.state_tx.clone(),
        };
        let task = tokio::spawn(run_supervisor(params, shutdown_rx, outbound_rx));
        *runtime = Some(ChannelRuntime {
            shutdown_tx,
            outbound_tx,
            task,
        });
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(runtime) = lock(&self.runtime).take() {
            let _ = runtime.shutdown_tx.send(true);
            runtime.task.abort();
        }
    }
}

async fn run_supervisor(
    params: SupervisorParams,
    mut shutdown_rx: watch::Receiver<bool>,
    mut outbound_rx: mpsc::UnboundedReceiver<RealtimeMessage>,
) {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        // Re-derived per attempt, never captured: a refresh that rotated the
        // token or identity is reflected on the next connect.
        let Some(identity) = params.session.identity() else {
            break;
        };
        let token = params.session.access_token();

        publish(&params, ChannelState::Connecting, &shutdown_rx);
        match connect(&params, &identity.user_id, token.as_deref()).await {
            Ok(socket) => {
                attempt = 0;
                publish(&params, ChannelState::Connected, &shutdown_rx);
                tracing::debug!(user_id = %identity.user_id, "realtime channel connected");
                let outcome =
                    run_connection(&params, socket, &mut shutdown_rx, &mut outbound_rx).await;
                if matches!(outcome, ConnectionOutcome::Shutdown) {
                    break;
                }
                tracing::debug!("realtime connection lost");
            }
            Err(error) => {
                tracing::warn!(error = %error, "realtime connect failed");
            }
        }
        if *shutdown_rx.borrow() {
            break;
        }

        attempt += 1;
        let delay = jittered(
            backoff_schedule(
                attempt,
                params.reconnect_base_delay,
                params.reconnect_max_delay,
            ),
            params.reconnect_max_delay,
        );
        publish(&params, ChannelState::Backoff(attempt), &shutdown_rx);
        let sleep = time::sleep(delay);
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    publish(&params, ChannelState::Disconnected, &shutdown_rx);
}

/// Publish a state transition unless the channel has been shut down (in
/// which case `close()` already published `Disconnected`).
fn publish(params: &SupervisorParams, state: ChannelState, shutdown_rx: &watch::Receiver<bool>) {
    if !*shutdown_rx.borrow() {
        let _ = params.state_tx.send(state);
    }
}

async fn connect(
    params: &SupervisorParams,
    user_id: &str,
    token: Option<&str>,
) -> Result<ChannelSocket> {
    let url = format!("{}/ws?user_id={}", params.realtime_url, user_id);
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| LanewireError::Configuration(format!("invalid realtime URL: {err}")))?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|err| {
            LanewireError::Configuration(format!("invalid realtime auth header: {err}"))
        })?;
        request.headers_mut().insert("Authorization", value);
    }
    let (socket, _) = connect_async(request)
        .await
        .map_err(|err| LanewireError::Network(err.to_string()))?;
    Ok(socket)
}

async fn run_connection(
    params: &SupervisorParams,
    mut socket: ChannelSocket,
    shutdown_rx: &mut watch::Receiver<bool>,
    outbound_rx: &mut mpsc::UnboundedReceiver<RealtimeMessage>,
) -> ConnectionOutcome {
    let mut keepalive = time::interval(params.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.tick().await;

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    let _ = socket.send(Message::Close(None)).await;
                    return ConnectionOutcome::Shutdown;
                }
            }
            _ = keepalive.tick() => {
                if socket.send(Message::Ping(Default::default())).await.is_err() {
                    return ConnectionOutcome::Lost;
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    return ConnectionOutcome::Shutdown;
                };
                match message.encode() {
                    Ok(frame) => {
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            return ConnectionOutcome::Lost;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(error = %error, "dropping unencodable outbound frame");
                    }
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(message)) => {
                        if handle_frame(params, &mut socket, message).await.is_err() {
                            return ConnectionOutcome::Lost;
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(error = %error, "realtime receive failed");
                        return ConnectionOutcome::Lost;
                    }
                    None => return ConnectionOutcome::Lost,
                }
            }
        }
    }
}

async fn handle_frame(
    params: &SupervisorParams,
    socket: &mut ChannelSocket,
    message: Message,
) -> std::result::Result<(), WsError> {
    match message {
        Message::Text(text) => dispatch_frame(params, text.as_ref()),
        Message::Binary(bytes) => {
            if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                dispatch_frame(params, &text);
            }
        }
        Message::Ping(payload) => socket.send(Message::Pong(payload)).await?,
        Message::Pong(_) => {}
        Message::Close(_) => return Err(WsError::ConnectionClosed),
        Message::Frame(_) => {}
    }
    Ok(())
}

/// Decode failures are logged and dropped; they are never fatal to the
/// connection.
fn dispatch_frame(params: &SupervisorParams, frame: &str) {
    match RealtimeMessage::decode(frame) {
        Ok(message) => params.fanout.dispatch(&message),
        Err(error) => {
            tracing::warn!(error = %error, "dropping malformed realtime frame");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deterministic exponential schedule: base doubling per attempt, capped.
fn backoff_schedule(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1)) as f64;
    let scaled = base.as_secs_f64() * multiplier;
    Duration::from_secs_f64(scaled.min(cap.as_secs_f64()))
}

/// Jitter: 75%–125% of the scheduled delay, still capped.
fn jittered(delay: Duration, cap: Duration) -> Duration {
    let factor = 0.75 + jitter_factor() * 0.5;
    Duration::from_secs_f64((delay.as_secs_f64() * factor).min(cap.as_secs_f64()))
}

/// Pseudo-random factor in [0, 1) without pulling in a rand crate.
fn jitter_factor() -> f64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);

    (hasher.finish() % 10_000) as f64 / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_monotone_and_capped() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(1);
        let delays: Vec<Duration> = (1..=6)
            .map(|attempt| backoff_schedule(attempt, base, cap))
            .collect();
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
        for window in delays.windows(2) {
            assert!(window[1] >= window[0]);
        }
        assert_eq!(delays[5], cap);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let delay = Duration::from_millis(400);
        let cap = Duration::from_secs(30);
        for _ in 0..50 {
            let jittered = jittered(delay, cap);
            assert!(jittered >= Duration::from_millis(300));
            assert!(jittered <= Duration::from_millis(500));
        }
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let delay = Duration::from_secs(30);
        let cap = Duration::from_secs(30);
        for _ in 0..50 {
            assert!(jittered(delay, cap) <= cap);
        }
    }
}
