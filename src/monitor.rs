//! Channel monitor
//!
//! Orchestrates the pipeline: consume message events, extract address
//! candidates, enrich them, filter, and dispatch alerts. Per-message
//! work fans out under a concurrency bound; sends within one message
//! keep extraction order. Lifecycle is an explicit state machine and
//! misuse is reported, not swallowed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatchedWallet;
use crate::enrich::AddressEnricher;
use crate::error::{Error, Result};
use crate::extract::{AddressExtractor, Chain};
use crate::notify::{AlertEvent, NotificationSink};
use crate::stream::{ChannelMessage, MessageSource};

/// Monitor lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Filtering rules applied to enriched candidates, in order
#[derive(Debug, Clone)]
pub struct FilterSettings {
    /// Chains alerts may come from; checked against the resolved chain
    pub allowed_chains: HashSet<Chain>,
    pub min_price_usd: f64,
    pub min_liquidity_usd: f64,
    /// Drop alerts from messages that mention no watched wallet
    pub require_wallet_match: bool,
}

impl FilterSettings {
    /// First rule the token fails, if any
    fn rejects(&self, token: &crate::price::TokenInfo, matched: &[WatchedWallet]) -> Option<&'static str> {
        if !self.allowed_chains.contains(&token.chain) {
            return Some("chain not in allow-list");
        }
        if token.price_usd < self.min_price_usd {
            return Some("below price floor");
        }
        if token.liquidity_usd < self.min_liquidity_usd {
            return Some("below liquidity floor");
        }
        if self.require_wallet_match && matched.is_empty() {
            return Some("no watched wallet in message");
        }
        None
    }
}

/// Runtime limits for the consume loop
#[derive(Debug, Clone)]
pub struct MonitorLimits {
    /// Messages processed concurrently
    pub max_in_flight: usize,
    /// How long stop() waits for in-flight work before abandoning it
    pub shutdown_grace_ms: u64,
    /// Extraction scan bound per message
    pub max_scan_bytes: usize,
}

impl Default for MonitorLimits {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            shutdown_grace_ms: 5_000,
            max_scan_bytes: 16 * 1024,
        }
    }
}

/// Everything a per-message task needs, shared behind one Arc
struct MonitorInner {
    enricher: Arc<AddressEnricher>,
    sink: Arc<dyn NotificationSink>,
    extractor: AddressExtractor,
    filters: FilterSettings,
    wallets: Vec<WatchedWallet>,
}

pub struct ChannelMonitor {
    source: Arc<dyn MessageSource>,
    inner: Arc<MonitorInner>,
    limits: MonitorLimits,
    state: watch::Sender<MonitorState>,
    cancel: CancellationToken,
}

impl ChannelMonitor {
    pub fn new(
        source: Arc<dyn MessageSource>,
        enricher: Arc<AddressEnricher>,
        sink: Arc<dyn NotificationSink>,
        filters: FilterSettings,
        wallets: Vec<WatchedWallet>,
        limits: MonitorLimits,
    ) -> Self {
        let wallets: Vec<WatchedWallet> = wallets.into_iter().map(|w| w.normalized()).collect();
        let (state, _) = watch::channel(MonitorState::Idle);
        Self {
            source,
            inner: Arc::new(MonitorInner {
                enricher,
                sink,
                extractor: AddressExtractor::new(limits.max_scan_bytes),
                filters,
                wallets,
            }),
            limits,
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// Subscribe and consume until [`stop`](Self::stop) or the stream
    /// ends. Call once; a second call is a lifecycle error.
    pub async fn run(&self) -> Result<()> {
        self.transition(MonitorState::Idle, MonitorState::Running, "run()")?;
        info!(
            wallets = self.inner.wallets.len(),
            max_in_flight = self.limits.max_in_flight,
            "Channel monitor running"
        );

        let mut rx = match self.source.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                let _ = self.state.send(MonitorState::Stopped);
                return Err(e);
            }
        };

        let permits = Arc::new(Semaphore::new(self.limits.max_in_flight));
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                msg = rx.recv() => match msg {
                    Some(message) => {
                        // Reap whatever already finished
                        while tasks.try_join_next().is_some() {}

                        let permit = tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            permit = permits.clone().acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => break,
                            },
                        };

                        let inner = self.inner.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            process_message(inner, message).await;
                        });
                    }
                    None => {
                        warn!("Message stream ended");
                        break;
                    }
                }
            }
        }

        self.drain(&mut tasks).await;
        if let Err(e) = self.source.disconnect().await {
            warn!("Source disconnect failed: {}", e);
        }
        let _ = self.state.send(MonitorState::Stopped);
        info!("Channel monitor stopped");
        Ok(())
    }

    /// Request shutdown and wait until the consume loop has drained.
    ///
    /// Only legal while running; completes within the shutdown grace
    /// period plus bookkeeping, never hangs on stuck network calls.
    pub async fn stop(&self) -> Result<()> {
        self.transition(MonitorState::Running, MonitorState::Stopping, "stop()")?;
        info!("Channel monitor stopping");
        self.cancel.cancel();

        let mut rx = self.state.subscribe();
        rx.wait_for(|s| *s == MonitorState::Stopped)
            .await
            .map_err(|_| Error::Internal("monitor dropped before reaching Stopped".to_string()))?;
        Ok(())
    }

    fn transition(&self, from: MonitorState, to: MonitorState, op: &str) -> Result<()> {
        let mut moved = false;
        self.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                moved = true;
                true
            } else {
                false
            }
        });
        if moved {
            Ok(())
        } else {
            Err(Error::Lifecycle(format!(
                "{} not allowed from {:?} state",
                op,
                *self.state.borrow()
            )))
        }
    }

    /// Give in-flight messages the grace period, then abandon them
    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(in_flight = tasks.len(), "Draining in-flight messages");

        let grace = Duration::from_millis(self.limits.shutdown_grace_ms);
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                abandoned = tasks.len(),
                "Shutdown grace elapsed, abandoning stragglers"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

/// Full pipeline for one message. Candidates are handled sequentially
/// so alert order matches extraction order within the message.
async fn process_message(inner: Arc<MonitorInner>, message: ChannelMessage) {
    let candidates = inner.extractor.extract(&message.text);
    if candidates.is_empty() {
        return;
    }
    debug!(
        channel = %message.channel_id,
        candidates = candidates.len(),
        "Processing message"
    );

    let matched_wallets: Vec<WatchedWallet> = inner
        .wallets
        .iter()
        .filter(|w| candidates.iter().any(|c| c.address == w.address))
        .cloned()
        .collect();

    for candidate in &candidates {
        let Some(token) = inner.enricher.enrich(candidate).await else {
            continue;
        };

        if let Some(reason) = inner.filters.rejects(&token, &matched_wallets) {
            debug!(token = %candidate, reason, "Candidate filtered");
            continue;
        }

        let alert = AlertEvent {
            message: message.clone(),
            token,
            matched_wallets: matched_wallets.clone(),
            created_at: Utc::now(),
        };

        if let Err(e) = inner.sink.send(&alert).await {
            error!(
                channel = %message.channel_id,
                token = %candidate,
                "Alert delivery failed: {}", e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{TokenCacheConfig, TokenInfoCache};
    use crate::extract::ContractAddress;
    use crate::price::{PriceSource, TokenInfo};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const ETH_ADDR: &str = "0xABCDEF0123456789ABCDEF0123456789ABCDEF01";
    const ETH_ADDR_2: &str = "0x00000000219ab540356cBB839Cbe05303d7705Fa";
    const BSC_ADDR: &str = "0x1111111111111111111111111111111111111111";
    const WALLET_ADDR: &str = "0x2222222222222222222222222222222222222222";

    fn token(chain: Chain, address: &str, price: f64, liquidity: f64) -> TokenInfo {
        TokenInfo {
            chain,
            address: address.to_lowercase(),
            symbol: "TEST".to_string(),
            name: "Test Token".to_string(),
            price_usd: price,
            market_cap: 1_000_000.0,
            volume_24h: 42_000.0,
            liquidity_usd: liquidity,
            last_updated: Utc::now(),
            stale: false,
        }
    }

    /// Upstream that knows a fixed set of tokens and counts calls
    struct KnownTokens {
        tokens: HashMap<String, TokenInfo>,
        calls: AtomicUsize,
    }

    impl KnownTokens {
        fn new(tokens: Vec<TokenInfo>) -> Self {
            Self {
                tokens: tokens.into_iter().map(|t| (t.address.clone(), t)).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PriceSource for KnownTokens {
        async fn lookup(&self, address: &ContractAddress) -> crate::Result<TokenInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tokens
                .get(&address.address)
                .cloned()
                .ok_or_else(|| Error::TokenNotFound(address.to_string()))
        }

        async fn lookup_batch(
            &self,
            addresses: &[ContractAddress],
        ) -> crate::Result<Vec<TokenInfo>> {
            let mut infos = Vec::new();
            for address in addresses {
                if let Ok(info) = self.lookup(address).await {
                    infos.push(info);
                }
            }
            Ok(infos)
        }
    }

    /// Hands out one scripted receiver, then errors
    struct ScriptedSource {
        rx: Mutex<Option<mpsc::Receiver<ChannelMessage>>>,
        disconnects: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(rx: mpsc::Receiver<ChannelMessage>) -> Self {
            Self {
                rx: Mutex::new(Some(rx)),
                disconnects: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn subscribe(&self) -> crate::Result<mpsc::Receiver<ChannelMessage>> {
            self.rx
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| Error::Internal("already subscribed".to_string()))
        }

        async fn disconnect(&self) -> crate::Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Records delivered alerts; optionally fails the first send
    struct RecordingSink {
        alerts: Mutex<Vec<AlertEvent>>,
        fail_next: AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                alerts: Mutex::new(Vec::new()),
                fail_next: AtomicBool::new(false),
            }
        }

        fn count(&self) -> usize {
            self.alerts.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn send(&self, alert: &AlertEvent) -> crate::Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(Error::SinkDelivery("mock outage".to_string()));
            }
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    struct Harness {
        monitor: Arc<ChannelMonitor>,
        tx: mpsc::Sender<ChannelMessage>,
        sink: Arc<RecordingSink>,
        upstream: Arc<KnownTokens>,
        cache: Arc<TokenInfoCache>,
        _dir: tempfile::TempDir,
    }

    fn harness(tokens: Vec<TokenInfo>, filters: FilterSettings, wallets: Vec<WatchedWallet>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let upstream = Arc::new(KnownTokens::new(tokens));
        let cache = Arc::new(TokenInfoCache::new(
            TokenCacheConfig {
                cache_file: dir.path().join("cache.json"),
                update_interval_secs: 600,
            },
            upstream.clone(),
        ));
        let enricher = Arc::new(AddressEnricher::new(cache.clone()));
        let sink = Arc::new(RecordingSink::new());
        let (tx, rx) = mpsc::channel(64);
        let source = Arc::new(ScriptedSource::new(rx));

        let monitor = Arc::new(ChannelMonitor::new(
            source,
            enricher,
            sink.clone(),
            filters,
            wallets,
            MonitorLimits::default(),
        ));

        Harness {
            monitor,
            tx,
            sink,
            upstream,
            cache,
            _dir: dir,
        }
    }

    fn default_filters() -> FilterSettings {
        FilterSettings {
            allowed_chains: [Chain::Ethereum, Chain::Solana].into_iter().collect(),
            min_price_usd: 0.0,
            min_liquidity_usd: 0.0,
            require_wallet_match: false,
        }
    }

    fn message(text: &str) -> ChannelMessage {
        ChannelMessage {
            channel_id: "alpha-calls".to_string(),
            message_id: "42".to_string(),
            text: text.to_string(),
            received_at: Utc::now(),
        }
    }

    fn spawn_run(monitor: &Arc<ChannelMonitor>) -> tokio::task::JoinHandle<crate::Result<()>> {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.run().await })
    }

    async fn settle() {
        // Let spawned per-message tasks finish
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_for_alerts(sink: &RecordingSink, n: usize) {
        for _ in 0..200 {
            if sink.count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} alert(s), got {}", n, sink.count());
    }

    #[tokio::test]
    async fn test_cached_token_produces_one_alert() {
        let h = harness(
            vec![token(Chain::Ethereum, ETH_ADDR, 1.23, 90_000.0)],
            default_filters(),
            vec![],
        );
        // Pre-warm the cache so processing never hits upstream
        h.cache
            .refresh_one(&ContractAddress::new(Chain::Ethereum, ETH_ADDR))
            .await
            .unwrap();
        let seeded_calls = h.upstream.calls.load(Ordering::SeqCst);

        let run = spawn_run(&h.monitor);
        h.tx
            .send(message(&format!("check {} now", ETH_ADDR)))
            .await
            .unwrap();
        wait_for_alerts(&h.sink, 1).await;

        h.monitor.stop().await.unwrap();
        run.await.unwrap().unwrap();

        let alerts = h.sink.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].token.price_usd, 1.23);
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), seeded_calls);
        assert_eq!(h.monitor.state(), MonitorState::Stopped);
    }

    #[tokio::test]
    async fn test_duplicate_address_yields_one_alert() {
        let h = harness(
            vec![token(Chain::Ethereum, ETH_ADDR, 1.23, 90_000.0)],
            default_filters(),
            vec![],
        );

        let run = spawn_run(&h.monitor);
        let text = format!("{} is mooning, ape {}", ETH_ADDR, ETH_ADDR.to_lowercase());
        h.tx.send(message(&text)).await.unwrap();
        wait_for_alerts(&h.sink, 1).await;
        settle().await;

        h.monitor.stop().await.unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(h.sink.count(), 1);
    }

    #[tokio::test]
    async fn test_message_without_address_is_noop() {
        let h = harness(vec![], default_filters(), vec![]);

        let run = spawn_run(&h.monitor);
        h.tx.send(message("gm frens, nothing today")).await.unwrap();
        settle().await;

        h.monitor.stop().await.unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(h.sink.count(), 0);
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unresolvable_address_is_skipped() {
        let h = harness(vec![], default_filters(), vec![]);

        let run = spawn_run(&h.monitor);
        h.tx
            .send(message(&format!("what is {}", ETH_ADDR)))
            .await
            .unwrap();
        settle().await;

        h.monitor.stop().await.unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(h.sink.count(), 0);
        assert_eq!(h.upstream.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disallowed_chain_never_alerts() {
        // The address resolves to BSC, which is not allow-listed
        let h = harness(
            vec![token(Chain::Bsc, BSC_ADDR, 5.0, 500_000.0)],
            default_filters(),
            vec![],
        );

        let run = spawn_run(&h.monitor);
        h.tx
            .send(message(&format!("bsc gem {}", BSC_ADDR)))
            .await
            .unwrap();
        settle().await;

        h.monitor.stop().await.unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(h.sink.count(), 0);
    }

    #[tokio::test]
    async fn test_liquidity_floor_filters() {
        let mut filters = default_filters();
        filters.min_liquidity_usd = 50_000.0;
        let h = harness(
            vec![token(Chain::Ethereum, ETH_ADDR, 1.23, 10_000.0)],
            filters,
            vec![],
        );

        let run = spawn_run(&h.monitor);
        h.tx.send(message(ETH_ADDR)).await.unwrap();
        settle().await;

        h.monitor.stop().await.unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(h.sink.count(), 0);
    }

    #[tokio::test]
    async fn test_wallet_match_policy() {
        let mut filters = default_filters();
        filters.require_wallet_match = true;
        let wallet = WatchedWallet {
            chain: Chain::Ethereum,
            address: WALLET_ADDR.to_string(),
            label: "whale".to_string(),
        };
        let h = harness(
            vec![token(Chain::Ethereum, ETH_ADDR, 1.23, 90_000.0)],
            filters,
            vec![wallet],
        );

        let run = spawn_run(&h.monitor);

        // Token alone: dropped
        h.tx.send(message(&format!("ape {}", ETH_ADDR))).await.unwrap();
        settle().await;
        assert_eq!(h.sink.count(), 0);

        // Token plus the watched wallet in the same message: alerts
        h.tx
            .send(message(&format!("{} bought {}", WALLET_ADDR, ETH_ADDR)))
            .await
            .unwrap();
        wait_for_alerts(&h.sink, 1).await;

        h.monitor.stop().await.unwrap();
        run.await.unwrap().unwrap();

        let alerts = h.sink.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].matched_wallets.len(), 1);
        assert_eq!(alerts[0].matched_wallets[0].label, "whale");
    }

    #[tokio::test]
    async fn test_send_failure_does_not_abort_batch() {
        let h = harness(
            vec![
                token(Chain::Ethereum, ETH_ADDR, 1.23, 90_000.0),
                token(Chain::Ethereum, ETH_ADDR_2, 4.56, 80_000.0),
            ],
            default_filters(),
            vec![],
        );
        h.sink.fail_next.store(true, Ordering::SeqCst);

        let run = spawn_run(&h.monitor);
        h.tx
            .send(message(&format!("{} and {}", ETH_ADDR, ETH_ADDR_2)))
            .await
            .unwrap();
        wait_for_alerts(&h.sink, 1).await;

        h.monitor.stop().await.unwrap();
        run.await.unwrap().unwrap();

        // First send failed, second still delivered
        let alerts = h.sink.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].token.address, ETH_ADDR_2.to_lowercase());
    }

    #[tokio::test]
    async fn test_alert_order_matches_extraction_order() {
        let h = harness(
            vec![
                token(Chain::Ethereum, ETH_ADDR, 1.23, 90_000.0),
                token(Chain::Ethereum, ETH_ADDR_2, 4.56, 80_000.0),
            ],
            default_filters(),
            vec![],
        );

        let run = spawn_run(&h.monitor);
        h.tx
            .send(message(&format!("{} then {}", ETH_ADDR_2, ETH_ADDR)))
            .await
            .unwrap();
        wait_for_alerts(&h.sink, 2).await;

        h.monitor.stop().await.unwrap();
        run.await.unwrap().unwrap();

        let alerts = h.sink.alerts.lock().unwrap();
        assert_eq!(alerts[0].token.address, ETH_ADDR_2.to_lowercase());
        assert_eq!(alerts[1].token.address, ETH_ADDR.to_lowercase());
    }

    #[tokio::test]
    async fn test_run_twice_is_a_lifecycle_error() {
        let h = harness(vec![], default_filters(), vec![]);

        let run = spawn_run(&h.monitor);
        // Give the first run() the state transition
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            h.monitor.run().await,
            Err(Error::Lifecycle(_))
        ));

        h.monitor.stop().await.unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stop_before_run_is_a_lifecycle_error() {
        let h = harness(vec![], default_filters(), vec![]);
        assert!(matches!(h.monitor.stop().await, Err(Error::Lifecycle(_))));
        assert_eq!(h.monitor.state(), MonitorState::Idle);
    }

    #[tokio::test]
    async fn test_stream_end_stops_monitor() {
        let h = harness(vec![], default_filters(), vec![]);
        let run = spawn_run(&h.monitor);

        drop(h.tx);
        run.await.unwrap().unwrap();
        assert_eq!(h.monitor.state(), MonitorState::Stopped);
        assert_eq!(h.sink.count(), 0);
    }
}
