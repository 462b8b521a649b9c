// =============================================================================
// Market-data streams — refcounted symbols multiplexed over combined WebSockets
// =============================================================================
//
// Symbols are packed into stream groups; each group owns one WebSocket over
// the combined `markPrice@1s` + `bookTicker` streams. Growing a group tears
// it down and reopens it with the enlarged symbol set (the exchange does not
// support adding streams to a combined URL in place).
//
// Liveness: a 30 s heartbeat ping; two missed pongs terminate the connection
// and the group reconnects after 3 s. The caller drives idle cleanup.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Hard cap on symbols sharing one WebSocket connection.
pub const GROUP_SYMBOL_CAP: usize = 100;
/// Heartbeat interval; two missed pongs terminate the connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Delay before reconnecting a dropped group.
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Receiver of parsed market-data events (implemented by the connector).
pub trait MarketDataSink: Send + Sync + 'static {
    fn on_mark(&self, raw_symbol: &str, mark: f64);
    fn on_book(&self, raw_symbol: &str, bid: f64, ask: f64);
}

struct GroupHandle {
    id: u64,
    symbols: Vec<String>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// Owns every stream group and the per-symbol consumer refcounts.
pub struct StreamManager {
    ws_base: String,
    sink: Arc<dyn MarketDataSink>,
    groups: Mutex<Vec<GroupHandle>>,
    /// Raw symbol → number of consumers currently subscribed.
    refcounts: DashMap<String, usize>,
    next_group_id: AtomicU64,
}

impl StreamManager {
    pub fn new(ws_base: impl Into<String>, sink: Arc<dyn MarketDataSink>) -> Self {
        Self {
            ws_base: ws_base.into(),
            sink,
            groups: Mutex::new(Vec::new()),
            refcounts: DashMap::new(),
            next_group_id: AtomicU64::new(1),
        }
    }

    // -------------------------------------------------------------------------
    // Subscription management
    // -------------------------------------------------------------------------

    /// Register a consumer for each symbol, opening or enlarging groups for
    /// symbols not streaming yet.
    pub fn subscribe(&self, raw_symbols: &[String]) {
        let mut fresh: Vec<String> = Vec::new();
        for sym in raw_symbols {
            let mut count = self.refcounts.entry(sym.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                fresh.push(sym.clone());
            }
        }
        if fresh.is_empty() {
            return;
        }

        // Symbols already carried by a group (refcount had dropped to zero but
        // the idle sweep has not run) need no topology change.
        let mut groups = self.groups.lock();
        fresh.retain(|s| !groups.iter().any(|g| g.symbols.contains(s)));
        if fresh.is_empty() {
            return;
        }

        debug!(new_symbols = fresh.len(), "allocating symbols to stream groups");

        let mut remaining = fresh;
        while !remaining.is_empty() {
            // Prefer enlarging an existing group with capacity; the group is
            // torn down and reopened with the bigger set.
            if let Some(idx) = groups.iter().position(|g| g.symbols.len() < GROUP_SYMBOL_CAP) {
                let group = groups.swap_remove(idx);
                let capacity = GROUP_SYMBOL_CAP - group.symbols.len();
                let take = capacity.min(remaining.len());
                let mut symbols = group.symbols.clone();
                symbols.extend(remaining.drain(..take));
                Self::teardown(group);
                groups.push(self.spawn_group(symbols));
            } else {
                let take = GROUP_SYMBOL_CAP.min(remaining.len());
                let symbols: Vec<String> = remaining.drain(..take).collect();
                groups.push(self.spawn_group(symbols));
            }
        }
    }

    /// Drop one consumer reference per symbol. Groups are not torn down here;
    /// the periodic idle sweep reclaims fully-unreferenced groups.
    pub fn unsubscribe(&self, raw_symbols: &[String]) {
        for sym in raw_symbols {
            if let Some(mut count) = self.refcounts.get_mut(sym) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Every subscribed (refcount > 0) raw symbol.
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.refcounts
            .iter()
            .filter(|e| *e.value() > 0)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Tear down and rebuild the group carrying `raw_symbol`.
    pub fn force_resubscribe(&self, raw_symbol: &str) {
        let mut groups = self.groups.lock();
        if let Some(idx) = groups
            .iter()
            .position(|g| g.symbols.iter().any(|s| s == raw_symbol))
        {
            let group = groups.swap_remove(idx);
            let symbols = group.symbols.clone();
            warn!(symbol = raw_symbol, group = group.id, "force-resubscribing stream group");
            Self::teardown(group);
            groups.push(self.spawn_group(symbols));
        }
    }

    /// Tear down groups whose symbols are all unreferenced. Run every 60 s.
    pub fn idle_sweep(&self) {
        self.refcounts.retain(|_, count| *count > 0);

        let mut groups = self.groups.lock();
        let mut idx = 0;
        while idx < groups.len() {
            let idle = groups[idx]
                .symbols
                .iter()
                .all(|s| !self.refcounts.contains_key(s));
            if idle {
                let group = groups.swap_remove(idx);
                info!(group = group.id, symbols = group.symbols.len(), "tearing down idle stream group");
                Self::teardown(group);
            } else {
                idx += 1;
            }
        }
    }

    /// Close every group (process shutdown).
    pub fn shutdown_all(&self) {
        let mut groups = self.groups.lock();
        for group in groups.drain(..) {
            Self::teardown(group);
        }
        self.refcounts.clear();
        info!("all stream groups closed");
    }

    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    // -------------------------------------------------------------------------
    // Group lifecycle
    // -------------------------------------------------------------------------

    fn spawn_group(&self, symbols: Vec<String>) -> GroupHandle {
        let id = self.next_group_id.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let url = combined_url(&self.ws_base, &symbols);
        let sink = self.sink.clone();

        info!(group = id, symbols = symbols.len(), "opening stream group");

        let task = tokio::spawn(run_group(id, url, sink, shutdown_rx));
        GroupHandle {
            id,
            symbols,
            shutdown: shutdown_tx,
            task,
        }
    }

    fn teardown(group: GroupHandle) {
        let _ = group.shutdown.send(true);
        group.task.abort();
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("groups", &self.groups.lock().len())
            .field("symbols", &self.refcounts.len())
            .finish()
    }
}

/// Build the combined-stream URL for a symbol set.
fn combined_url(ws_base: &str, raw_symbols: &[String]) -> String {
    let streams: Vec<String> = raw_symbols
        .iter()
        .flat_map(|s| {
            let lower = s.to_lowercase();
            [format!("{lower}@markPrice@1s"), format!("{lower}@bookTicker")]
        })
        .collect();
    format!("{}/stream?streams={}", ws_base, streams.join("/"))
}

// ---------------------------------------------------------------------------
// Connection loop
// ---------------------------------------------------------------------------

async fn run_group(
    id: u64,
    url: String,
    sink: Arc<dyn MarketDataSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        match connect_async(&url).await {
            Ok((ws, _resp)) => {
                info!(group = id, "stream group connected");
                if run_connection(id, ws, &sink, &mut shutdown).await {
                    return; // shutdown requested
                }
            }
            Err(e) => {
                error!(group = id, error = %e, "stream group connect failed");
            }
        }

        // Reconnect delay, responsive to shutdown.
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Pump one connection until it drops (returns `false`) or shutdown is
/// requested (returns `true`).
async fn run_connection(
    id: u64,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    sink: &Arc<dyn MarketDataSink>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (mut write, mut read) = ws.split();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut pending_pings: u32 = 0;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = dispatch_message(&text, sink) {
                            warn!(group = id, error = %e, "failed to parse stream message");
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pending_pings = 0;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!(group = id, "stream group connection closed");
                        return false;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(group = id, error = %e, "stream group read error");
                        return false;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if pending_pings >= 2 {
                    warn!(group = id, "two heartbeats unanswered — terminating connection");
                    return false;
                }
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    return false;
                }
                pending_pings += 1;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return true;
                }
            }
        }
    }
}

/// Parse one combined-stream frame and feed the sink.
///
/// Frames look like `{"stream": "btcusdt@bookTicker", "data": {...}}` where
/// `data.e` is `markPriceUpdate` (field `p`) or the bookTicker shape
/// (`b`/`a` best bid/ask).
fn dispatch_message(text: &str, sink: &Arc<dyn MarketDataSink>) -> anyhow::Result<()> {
    let frame: serde_json::Value = serde_json::from_str(text)?;
    let data = frame
        .get("data")
        .ok_or_else(|| anyhow::anyhow!("frame missing data"))?;

    let symbol = data["s"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("frame missing symbol"))?;

    match data["e"].as_str() {
        Some("markPriceUpdate") => {
            let mark: f64 = data["p"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("markPriceUpdate missing p"))?
                .parse()?;
            sink.on_mark(symbol, mark);
        }
        // bookTicker frames omit the event type on some stream versions; the
        // presence of b/a identifies them.
        Some("bookTicker") | None => {
            let bid: f64 = data["b"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("bookTicker missing b"))?
                .parse()?;
            let ask: f64 = data["a"]
                .as_str()
                .ok_or_else(|| anyhow::anyhow!("bookTicker missing a"))?
                .parse()?;
            sink.on_book(symbol, bid, ask);
        }
        Some(other) => {
            debug!(event = other, "ignoring unhandled stream event");
        }
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct RecordingSink {
        marks: PlMutex<Vec<(String, f64)>>,
        books: PlMutex<Vec<(String, f64, f64)>>,
    }

    impl MarketDataSink for RecordingSink {
        fn on_mark(&self, raw_symbol: &str, mark: f64) {
            self.marks.lock().push((raw_symbol.to_string(), mark));
        }
        fn on_book(&self, raw_symbol: &str, bid: f64, ask: f64) {
            self.books.lock().push((raw_symbol.to_string(), bid, ask));
        }
    }

    #[test]
    fn combined_url_interleaves_mark_and_book_streams() {
        let url = combined_url(
            "wss://fstream.binance.com",
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        );
        assert_eq!(
            url,
            "wss://fstream.binance.com/stream?streams=btcusdt@markPrice@1s/btcusdt@bookTicker/ethusdt@markPrice@1s/ethusdt@bookTicker"
        );
    }

    #[test]
    fn dispatch_routes_mark_and_book_frames() {
        let recording = Arc::new(RecordingSink::default());
        let sink: Arc<dyn MarketDataSink> = recording.clone();

        let mark = r#"{"stream":"btcusdt@markPrice@1s","data":{"e":"markPriceUpdate","s":"BTCUSDT","p":"50123.45"}}"#;
        dispatch_message(mark, &sink).unwrap();

        let book = r#"{"stream":"btcusdt@bookTicker","data":{"s":"BTCUSDT","b":"50120.10","B":"1.5","a":"50120.20","A":"0.7"}}"#;
        dispatch_message(book, &sink).unwrap();

        assert_eq!(recording.marks.lock()[0], ("BTCUSDT".to_string(), 50123.45));
        assert_eq!(
            recording.books.lock()[0],
            ("BTCUSDT".to_string(), 50120.10, 50120.20)
        );
    }

    #[tokio::test]
    async fn refcounts_gate_group_membership() {
        let sink: Arc<dyn MarketDataSink> = Arc::new(RecordingSink::default());
        let mgr = StreamManager::new("wss://localhost.invalid", sink);

        let syms = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        mgr.subscribe(&syms);
        mgr.subscribe(&syms[..1].to_vec());
        assert_eq!(mgr.group_count(), 1);
        assert_eq!(mgr.subscribed_symbols().len(), 2);

        // One consumer left on BTC; group must survive the sweep.
        mgr.unsubscribe(&syms);
        mgr.idle_sweep();
        assert_eq!(mgr.group_count(), 1);
        assert_eq!(mgr.subscribed_symbols(), vec!["BTCUSDT".to_string()]);

        // Last reference gone -> the sweep reclaims the group.
        mgr.unsubscribe(&syms[..1].to_vec());
        mgr.idle_sweep();
        assert_eq!(mgr.group_count(), 0);
        assert!(mgr.subscribed_symbols().is_empty());
        mgr.shutdown_all();
    }

    #[tokio::test]
    async fn groups_split_at_the_symbol_cap() {
        let sink: Arc<dyn MarketDataSink> = Arc::new(RecordingSink::default());
        let mgr = StreamManager::new("wss://localhost.invalid", sink);

        let syms: Vec<String> = (0..150).map(|i| format!("SYM{i}USDT")).collect();
        mgr.subscribe(&syms);
        assert_eq!(mgr.group_count(), 2);
        mgr.shutdown_all();
    }
}
