//! Network Manager (C10): owns the retry/backoff loop around one CSMS
//! connection attempt, exposes a coarse connection-state machine to the
//! rest of the firmware, and runs a periodic health-check ping plus a
//! small re-armable task registry.
//!
//! Grounded on `examples/original_source/include/net/netmgr.h` (state
//! enum, callback/task shapes, `NETMGR_*` constants — already mirrored by
//! `config::NetworkConfig`) and `examples/original_source/src/net/netmgr.c`
//! (the `S0..S6` state machine collapsed here into [`NetworkState`], and
//! `retry_backoff`'s exponential-with-jitter formula). Unlike the
//! reference firmware this crate only ever manages a single uplink, so
//! `netmgr_register_iface`'s multi-interface priority list has no
//! counterpart here.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{error, info, warn};

use crate::config::NetworkConfig;
use crate::metrics::{self, Counter};
use crate::ocpp::client::{CsmsTransport, IncomingCall, TransportError};

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch, used to
/// convert an NTP timestamp's seconds field into Unix time.
const NTP_UNIX_EPOCH_OFFSET_SECS: i64 = 2_208_988_800;

/// Performs one SNTP (RFC 4330) request/response exchange against
/// `server_addr`, returning the server's reported wall-clock time. Mirrors
/// `ntp_start()`'s single round trip in the reference firmware, collapsed
/// into a one-shot async call instead of a registered completion callback.
async fn query_sntp(server_addr: &str) -> std::io::Result<DateTime<Utc>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server_addr).await?;

    let mut request = [0u8; 48];
    request[0] = 0x1B; // LI=0, VN=3, Mode=3 (client)
    socket.send(&request).await?;

    let mut response = [0u8; 48];
    let read = tokio::time::timeout(Duration::from_secs(5), socket.recv(&mut response))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "ntp request timed out"))??;
    if read < 48 {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "short ntp response"));
    }

    decode_sntp_transmit_timestamp(&response)
}

/// Decodes the transmit-timestamp field (bytes 40..48: whole seconds since
/// 1900-01-01, then a fractional-second fixed-point field) of an SNTP
/// response. Split out from [`query_sntp`] so the wire-format math is
/// testable without a socket.
fn decode_sntp_transmit_timestamp(response: &[u8; 48]) -> std::io::Result<DateTime<Utc>> {
    let secs = u32::from_be_bytes(response[40..44].try_into().unwrap()) as i64;
    let frac = u32::from_be_bytes(response[44..48].try_into().unwrap());
    let unix_secs = secs - NTP_UNIX_EPOCH_OFFSET_SECS;
    let nanos = ((frac as f64 / u32::MAX as f64) * 1_000_000_000.0) as u32;

    DateTime::from_timestamp(unix_secs, nanos)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "ntp timestamp out of range"))
}

/// Coarse connection state, collapsing the reference firmware's `S0..S6`
/// FSM plus its derived `NETMGR_STATE_*` events into one enum. `Exhausted`
/// is terminal until [`NetworkManager::enable`] is called again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Off,
    Connecting,
    Connected,
    Disconnected,
    Exhausted,
}

const STATE_OFF: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;
const STATE_DISCONNECTED: u8 = 3;
const STATE_EXHAUSTED: u8 = 4;

fn decode_state(raw: u8) -> NetworkState {
    match raw {
        STATE_CONNECTING => NetworkState::Connecting,
        STATE_CONNECTED => NetworkState::Connected,
        STATE_DISCONNECTED => NetworkState::Disconnected,
        STATE_EXHAUSTED => NetworkState::Exhausted,
        _ => NetworkState::Off,
    }
}

/// A task registered to run only while the connection is up, mirroring
/// `netmgr_register_task`. Returning `true` re-arms it for the next
/// connected tick; `false` deregisters it after this call.
pub type ConnectedTask =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

struct TaskEntry {
    task: ConnectedTask,
}

/// Retains `min_backoff`/`max_backoff`/`max_jitter` and the attempt count
/// needed to reproduce `retry_backoff()`'s doubling-plus-jitter schedule.
struct Backoff {
    attempt: u32,
    max_attempts: u32,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl Backoff {
    fn new(min_backoff: Duration, max_backoff: Duration, max_attempts: u32) -> Self {
        Self { attempt: 0, max_attempts, min_backoff, max_backoff }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Doubles `min_backoff` by the attempt count, caps at `max_backoff`,
    /// then adds uniform jitter in `[0, min_backoff)` — the same shape as
    /// `retry_backoff(&entry->retry, &backoff_time, board_random())`.
    fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        let exponent = self.attempt.saturating_sub(1).min(32);
        let scaled = self.min_backoff.as_millis().saturating_mul(1u128 << exponent.min(20));
        let capped = scaled.min(self.max_backoff.as_millis());
        let jitter_bound = self.min_backoff.as_millis().max(1) as u64;
        let jitter = rand::thread_rng().gen_range(0..jitter_bound);
        Duration::from_millis(capped as u64 + jitter)
    }
}

/// Network-wide connection events, broadcast to anyone interested (the
/// charger FSM uses `Connected`/`Disconnected` to gate CSMS-only actions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Connected,
    Disconnected,
    Exhausted,
}

pub struct NetworkManager {
    config: NetworkConfig,
    transport: Arc<CsmsTransport>,
    state: AtomicU8,
    enabled: std::sync::atomic::AtomicBool,
    backoff: Mutex<Backoff>,
    selftest_ping_requested: std::sync::atomic::AtomicBool,
    ping_failures: AtomicU32,
    events_tx: broadcast::Sender<NetworkEvent>,
    tasks: Mutex<Vec<TaskEntry>>,
}

impl NetworkManager {
    pub fn new(config: NetworkConfig, transport: Arc<CsmsTransport>) -> Self {
        let min_backoff = Duration::from_secs(config.connect_timeout_secs);
        let max_backoff = Duration::from_secs(config.max_backoff_secs);
        let max_attempts = config.max_attempts;
        let (events_tx, _rx) = broadcast::channel(16);
        Self {
            config,
            transport,
            state: AtomicU8::new(STATE_OFF),
            enabled: std::sync::atomic::AtomicBool::new(false),
            backoff: Mutex::new(Backoff::new(min_backoff, max_backoff, max_attempts)),
            selftest_ping_requested: std::sync::atomic::AtomicBool::new(false),
            ping_failures: AtomicU32::new(0),
            events_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> NetworkState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events_tx.subscribe()
    }

    fn set_state(&self, raw: u8, event: Option<NetworkEvent>) {
        let prev = self.state.swap(raw, Ordering::AcqRel);
        if prev != raw {
            info!(from = ?decode_state(prev), to = ?decode_state(raw), "network manager state changed");
        }
        match event {
            Some(NetworkEvent::Connected) => metrics::increase(Counter::NetMgrConnectCount),
            Some(NetworkEvent::Disconnected) => metrics::increase(Counter::NetMgrDisconnectCount),
            _ => {}
        }
        if let Some(event) = event {
            let _ = self.events_tx.send(event);
        }
    }

    /// Re-arms the manager after it reaches `Exhausted`, mirroring
    /// `netmgr_enable` resetting `retry` and `error_count`.
    pub async fn enable(&self) {
        self.backoff.lock().await.reset();
        self.enabled.store(true, Ordering::SeqCst);
        self.set_state(STATE_OFF, None);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.set_state(STATE_OFF, Some(NetworkEvent::Disconnected));
    }

    /// Registers a callback run once per connected tick; it deregisters
    /// itself the first time it returns `false`.
    pub async fn register_task(&self, task: ConnectedTask) {
        self.tasks.lock().await.push(TaskEntry { task });
    }

    pub fn request_selftest_ping(&self) {
        self.selftest_ping_requested.store(true, Ordering::SeqCst);
    }

    /// Runs forever: connects, backs off on failure, and serves registered
    /// tasks plus the health-check ping while connected. `incoming_tx`
    /// receives CSMS-initiated calls for the duration of each connection.
    pub async fn run(&self, incoming_tx: mpsc::Sender<IncomingCall>) {
        self.enable().await;

        loop {
            if !self.enabled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            if self.backoff.lock().await.exhausted() {
                self.set_state(STATE_EXHAUSTED, Some(NetworkEvent::Exhausted));
                warn!("network manager exhausted its retry budget; waiting for re-enable");
                while self.state() == NetworkState::Exhausted {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                continue;
            }

            self.set_state(STATE_CONNECTING, None);

            tokio::select! {
                result = self.transport.connect_and_run(incoming_tx.clone()) => {
                    match result {
                        Ok(()) => {
                            info!("csms connection closed gracefully");
                            self.backoff.lock().await.reset();
                        }
                        Err(e) => {
                            error!(error = %e, "csms connection attempt failed");
                        }
                    }
                }
                () = self.serve_connected() => {
                    unreachable!("serve_connected only returns when the caller cancels it");
                }
            }

            self.set_state(STATE_DISCONNECTED, Some(NetworkEvent::Disconnected));
            let delay = self.backoff.lock().await.next_delay();
            info!(?delay, "backing off before next csms connection attempt");
            tokio::time::sleep(delay).await;
        }
    }

    /// Runs the registered-task and health-check-ping loop for as long as
    /// the enclosing `select!` keeps this future alive, i.e. for the
    /// lifetime of one successful connection.
    async fn serve_connected(&self) {
        self.set_state(STATE_CONNECTED, Some(NetworkEvent::Connected));
        self.run_ntp_sync().await;

        let mut healthcheck = tokio::time::interval(Duration::from_secs(self.config.health_check_interval_secs.max(1)));
        healthcheck.tick().await;

        loop {
            tokio::select! {
                _ = healthcheck.tick() => {
                    self.request_selftest_ping();
                    self.run_ping().await;
                    self.run_tasks().await;
                }
            }
        }
    }

    /// Starts a time sync on entry to `Connected` (spec §4.7 "Time sync").
    /// Does not step the process clock — same limitation documented for
    /// `Supervisor::check_clock_drift`'s `Heartbeat.conf` handling, since
    /// stepping the system clock needs a platform syscall this crate does
    /// not assume it can make; the synced time and measured drift are only
    /// logged and counted.
    async fn run_ntp_sync(&self) {
        match query_sntp(&self.config.ntp_server_addr).await {
            Ok(server_time) => {
                let drift_ms = (server_time - Utc::now()).num_milliseconds();
                metrics::increase(Counter::NTPSyncCount);
                info!(%server_time, drift_ms, "ntp time sync completed");
            }
            Err(e) => {
                warn!(error = %e, server = %self.config.ntp_server_addr, "ntp time sync failed");
            }
        }
    }

    /// Pings the CSMS by issuing a `Heartbeat` round trip, the WebSocket
    /// analogue of `netmgr_ping`'s ICMP echo to the gateway.
    async fn run_ping(&self) {
        if !self.selftest_ping_requested.swap(false, Ordering::SeqCst) {
            return;
        }
        match self.transport.request(crate::ocpp::Action::Heartbeat, serde_json::json!({})).await {
            Ok(_) => {
                self.ping_failures.store(0, Ordering::SeqCst);
            }
            Err(TransportError::Remote { .. }) => {
                self.ping_failures.store(0, Ordering::SeqCst);
            }
            Err(e) => {
                let failures = self.ping_failures.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::increase(Counter::NetMgrPingFailureCount);
                warn!(error = %e, failures, "health-check ping failed");
            }
        }
    }

    async fn run_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        let mut remaining = Vec::with_capacity(tasks.len());
        for entry in tasks.drain(..) {
            if (entry.task)().await {
                remaining.push(entry);
            }
        }
        *tasks = remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_secs(10), Duration::from_secs(300), 200);
        let first = backoff.next_delay();
        assert!(first.as_secs() >= 10 && first.as_secs() < 20);
        for _ in 0..20 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped.as_secs() <= 300);
    }

    #[test]
    fn backoff_reports_exhausted_after_max_attempts() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(2), 3);
        assert!(!backoff.exhausted());
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert!(backoff.exhausted());
    }

    #[test]
    fn decode_state_round_trips_known_values() {
        assert_eq!(decode_state(STATE_CONNECTED), NetworkState::Connected);
        assert_eq!(decode_state(STATE_EXHAUSTED), NetworkState::Exhausted);
        assert_eq!(decode_state(99), NetworkState::Off);
    }

    #[test]
    fn decode_sntp_timestamp_matches_known_unix_time() {
        // 2024-01-01T00:00:00Z is 1704067200 s after the Unix epoch, i.e.
        // 1704067200 + NTP_UNIX_EPOCH_OFFSET_SECS seconds after the NTP epoch.
        let ntp_secs = (1_704_067_200i64 + NTP_UNIX_EPOCH_OFFSET_SECS) as u32;
        let mut response = [0u8; 48];
        response[40..44].copy_from_slice(&ntp_secs.to_be_bytes());
        response[44..48].copy_from_slice(&0u32.to_be_bytes());

        let decoded = decode_sntp_transmit_timestamp(&response).expect("valid ntp timestamp");
        assert_eq!(decoded.timestamp(), 1_704_067_200);
    }

    #[test]
    fn decode_sntp_timestamp_handles_zero_fraction() {
        let mut response = [0u8; 48];
        response[40..44].copy_from_slice(&(NTP_UNIX_EPOCH_OFFSET_SECS as u32).to_be_bytes());
        let decoded = decode_sntp_transmit_timestamp(&response).expect("valid ntp timestamp");
        assert_eq!(decoded.timestamp(), 0);
        assert_eq!(decoded.timestamp_subsec_nanos(), 0);
    }
}
