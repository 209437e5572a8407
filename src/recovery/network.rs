/// Network reachability tracking
///
/// `NetworkMonitor` owns the current `NetworkStatus`, updates it from
/// connectivity probes or externally reported events, and publishes a
/// `NetworkEvent` on every online/offline edge. Steady-state probes never
/// produce events.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

/// Default interval between probes while waiting for recovery
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default deadline for `wait_for_recovery`
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

const EVENT_CAPACITY: usize = 16;

/// Connection class derived from round-trip time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
}

impl EffectiveType {
    pub fn from_rtt(rtt_ms: u64) -> Self {
        match rtt_ms {
            2000.. => EffectiveType::Slow2g,
            1400.. => EffectiveType::TwoG,
            270.. => EffectiveType::ThreeG,
            _ => EffectiveType::FourG,
        }
    }
}

/// Point-in-time view of connectivity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub online: bool,
    pub effective_type: Option<EffectiveType>,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<u64>,
    pub last_checked_at: DateTime<Utc>,
}

impl NetworkStatus {
    fn assume_online() -> Self {
        Self {
            online: true,
            effective_type: None,
            downlink_mbps: None,
            rtt_ms: None,
            last_checked_at: Utc::now(),
        }
    }
}

/// Coarse connection quality, ordered worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Offline,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl NetworkQuality {
    /// Derive quality from latency and bandwidth; the worse signal wins
    pub fn assess(status: &NetworkStatus) -> Self {
        if !status.online {
            return NetworkQuality::Offline;
        }

        let by_rtt = status.rtt_ms.map(|rtt| match rtt {
            0..=50 => NetworkQuality::Excellent,
            51..=150 => NetworkQuality::Good,
            151..=400 => NetworkQuality::Fair,
            _ => NetworkQuality::Poor,
        });

        let by_downlink = status.downlink_mbps.map(|mbps| {
            if mbps >= 10.0 {
                NetworkQuality::Excellent
            } else if mbps >= 2.0 {
                NetworkQuality::Good
            } else if mbps >= 0.5 {
                NetworkQuality::Fair
            } else {
                NetworkQuality::Poor
            }
        });

        match (by_rtt, by_downlink) {
            (Some(a), Some(b)) => a.min(b),
            (Some(q), None) | (None, Some(q)) => q,
            // Nothing measured: online is all we know
            (None, None) => NetworkQuality::Good,
        }
    }
}

/// Online/offline transition
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    Online(NetworkStatus),
    Offline(NetworkStatus),
}

/// Result of one connectivity probe
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeResult {
    pub reachable: bool,
    pub rtt: Option<Duration>,
    pub downlink_mbps: Option<f64>,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn reachable(rtt: Duration) -> Self {
        Self {
            reachable: true,
            rtt: Some(rtt),
            ..Self::default()
        }
    }

    pub fn unreachable(error: impl Into<String>) -> Self {
        Self {
            reachable: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Cheap reachability check
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self) -> ProbeResult;
}

/// Resolves a host and opens a TCP connection to it
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    /// `target` is `host:port`, e.g. `dns.google:443`
    pub fn new(target: impl Into<String>, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn probe(&self) -> ProbeResult {
        let started = Instant::now();
        let attempt = async {
            let mut addrs = tokio::net::lookup_host(self.target.as_str()).await?;
            let addr = addrs.next().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved")
            })?;
            tokio::net::TcpStream::connect(addr).await.map(|_| ())
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(())) => ProbeResult::reachable(started.elapsed()),
            Ok(Err(e)) => ProbeResult::unreachable(e.to_string()),
            Err(_) => ProbeResult::unreachable(format!("probe of {} timed out", self.target)),
        }
    }
}

/// Issues a HEAD request against a health endpoint
pub struct HttpProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpProbe {
    pub fn new(url: &str, timeout: Duration) -> crate::StorageResult<Self> {
        let url = Url::parse(url).map_err(|e| {
            crate::StorageError::Config(format!("invalid probe URL '{}': {}", url, e))
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::StorageError::Config(format!("HTTP probe client: {}", e)))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    async fn probe(&self) -> ProbeResult {
        let started = Instant::now();
        match self.client.head(self.url.clone()).send().await {
            // Any response proves the network path works
            Ok(_) => ProbeResult::reachable(started.elapsed()),
            Err(e) => ProbeResult::unreachable(e.to_string()),
        }
    }
}

struct MonitorInner {
    status: Mutex<NetworkStatus>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    events: broadcast::Sender<NetworkEvent>,
    poll_interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Tracks connectivity and notifies subscribers of transitions
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    /// Monitor driven by a probe
    pub fn new(probe: Arc<dyn ConnectivityProbe>) -> Self {
        Self::build(Some(probe), DEFAULT_POLL_INTERVAL)
    }

    /// Monitor driven only by `set_online` reports
    pub fn without_probe() -> Self {
        Self::build(None, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self::build(self.inner.probe.clone(), poll_interval)
    }

    fn build(probe: Option<Arc<dyn ConnectivityProbe>>, poll_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                status: Mutex::new(NetworkStatus::assume_online()),
                probe,
                events,
                poll_interval,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        self.inner.status.lock().unwrap().clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.status.lock().unwrap().online
    }

    pub fn quality(&self) -> NetworkQuality {
        NetworkQuality::assess(&self.status())
    }

    /// Receive an event on every online/offline transition
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.inner.events.subscribe()
    }

    /// Record an externally observed connectivity change (OS event, failed request)
    pub fn set_online(&self, online: bool) {
        self.apply(online, None, None);
    }

    /// Fold a probe result into the current status
    pub fn record_probe(&self, result: &ProbeResult) {
        let rtt_ms = result.rtt.map(|rtt| rtt.as_millis() as u64);
        self.apply(result.reachable, rtt_ms, result.downlink_mbps);
    }

    fn apply(&self, online: bool, rtt_ms: Option<u64>, downlink_mbps: Option<f64>) {
        let (changed, snapshot) = {
            let mut status = self.inner.status.lock().unwrap();
            let changed = status.online != online;
            status.online = online;
            status.last_checked_at = Utc::now();
            if online {
                if rtt_ms.is_some() {
                    status.rtt_ms = rtt_ms;
                    status.effective_type = rtt_ms.map(EffectiveType::from_rtt);
                }
                if downlink_mbps.is_some() {
                    status.downlink_mbps = downlink_mbps;
                }
            } else {
                status.rtt_ms = None;
                status.downlink_mbps = None;
                status.effective_type = None;
            }
            (changed, status.clone())
        };

        if !changed {
            return;
        }

        let event = if online {
            tracing::info!(rtt_ms = ?snapshot.rtt_ms, "Network connection restored");
            NetworkEvent::Online(snapshot)
        } else {
            tracing::warn!("Network connection lost");
            NetworkEvent::Offline(snapshot)
        };

        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Probe now (if a probe is configured) and return the updated status
    pub async fn check_now(&self) -> NetworkStatus {
        if let Some(probe) = &self.inner.probe {
            let result = probe.probe().await;
            if let Some(error) = &result.error {
                tracing::debug!(error = %error, "Connectivity probe failed");
            }
            self.record_probe(&result);
        }
        self.status()
    }

    /// Wait until the network is back or `timeout` elapses
    ///
    /// Returns `true` immediately when already online. Otherwise polls every
    /// poll interval (and wakes early on an online event) until recovery, and
    /// returns `false` once the deadline passes.
    pub async fn wait_for_recovery(&self, timeout: Duration) -> bool {
        let mut events = self.subscribe();
        if self.is_online() {
            return true;
        }

        tracing::info!(
            timeout_ms = timeout.as_millis() as u64,
            "Waiting for network recovery"
        );

        let wait = async {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(NetworkEvent::Online(_)) => return true,
                        Ok(NetworkEvent::Offline(_)) => {}
                        Err(RecvError::Lagged(_)) => {
                            if self.is_online() {
                                return true;
                            }
                        }
                        Err(RecvError::Closed) => {
                            // Sender lives in `inner`; fall back to polling only
                            tokio::time::sleep(self.inner.poll_interval).await;
                            if self.check_now().await.online {
                                return true;
                            }
                        }
                    },
                    _ = tokio::time::sleep(self.inner.poll_interval) => {
                        if self.check_now().await.online {
                            return true;
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(recovered) => recovered,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Network did not recover before deadline"
                );
                false
            }
        }
    }

    /// Start probing periodically in the background
    pub fn start_monitoring(&self, interval: Duration) {
        let mut task = self.inner.task.lock().unwrap();
        if task.is_some() || self.inner.probe.is_none() {
            return;
        }

        let monitor = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                monitor.check_now().await;
            }
        }));
    }

    /// Stop background probing. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.task.lock().unwrap().take() {
            handle.abort();
            tracing::debug!("Network monitoring stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Unreachable for the first `failures` probes, reachable afterwards
    struct ScriptedProbe {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ConnectivityProbe for ScriptedProbe {
        async fn probe(&self) -> ProbeResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                ProbeResult::unreachable("no route to host")
            } else {
                ProbeResult::reachable(Duration::from_millis(40))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_immediately_when_online() {
        let monitor = NetworkMonitor::without_probe();
        let started = Instant::now();
        assert!(monitor.wait_for_recovery(Duration::from_secs(5)).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_when_offline() {
        let monitor = NetworkMonitor::without_probe();
        monitor.set_online(false);

        let started = Instant::now();
        let recovered = monitor.wait_for_recovery(Duration::from_millis(500)).await;

        assert!(!recovered);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_wakes_on_online_event() {
        let monitor = NetworkMonitor::without_probe();
        monitor.set_online(false);

        let reporter = monitor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            reporter.set_online(true);
        });

        let started = Instant::now();
        assert!(monitor.wait_for_recovery(Duration::from_secs(30)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_polls_probe_until_reachable() {
        let probe = Arc::new(ScriptedProbe {
            failures: 3,
            calls: AtomicUsize::new(0),
        });
        let monitor = NetworkMonitor::new(probe.clone());
        monitor.check_now().await;
        assert!(!monitor.is_online());

        assert!(monitor.wait_for_recovery(Duration::from_secs(30)).await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
        assert_eq!(monitor.status().rtt_ms, Some(40));
        assert_eq!(monitor.status().effective_type, Some(EffectiveType::FourG));
    }

    #[tokio::test]
    async fn test_events_only_on_transitions() {
        let monitor = NetworkMonitor::without_probe();
        let mut events = monitor.subscribe();

        monitor.set_online(true); // steady state, no event
        monitor.set_online(false);
        monitor.set_online(false);
        monitor.set_online(true);

        assert!(matches!(events.try_recv(), Ok(NetworkEvent::Offline(_))));
        assert!(matches!(events.try_recv(), Ok(NetworkEvent::Online(_))));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_quality_thresholds() {
        let mut status = NetworkStatus::assume_online();
        assert_eq!(NetworkQuality::assess(&status), NetworkQuality::Good);

        status.rtt_ms = Some(30);
        status.downlink_mbps = Some(50.0);
        assert_eq!(NetworkQuality::assess(&status), NetworkQuality::Excellent);

        status.downlink_mbps = Some(1.0);
        assert_eq!(NetworkQuality::assess(&status), NetworkQuality::Fair);

        status.rtt_ms = Some(900);
        assert_eq!(NetworkQuality::assess(&status), NetworkQuality::Poor);

        status.online = false;
        assert_eq!(NetworkQuality::assess(&status), NetworkQuality::Offline);
    }

    #[test]
    fn test_effective_type_from_rtt() {
        assert_eq!(EffectiveType::from_rtt(20), EffectiveType::FourG);
        assert_eq!(EffectiveType::from_rtt(300), EffectiveType::ThreeG);
        assert_eq!(EffectiveType::from_rtt(1500), EffectiveType::TwoG);
        assert_eq!(EffectiveType::from_rtt(2500), EffectiveType::Slow2g);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let probe = Arc::new(ScriptedProbe {
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let monitor = NetworkMonitor::new(probe);
        monitor.start_monitoring(Duration::from_secs(60));
        monitor.stop();
        monitor.stop();
    }

    #[test]
    fn test_http_probe_rejects_bad_url() {
        assert!(HttpProbe::new("not a url", Duration::from_secs(1)).is_err());
        assert!(HttpProbe::new("https://example.com/health", Duration::from_secs(1)).is_ok());
    }
}
