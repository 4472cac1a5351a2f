//! Per-client outbound pipeline: priority batching, deduplication, rate
//! limiting and gzip compression.
//!
//! The pipeline itself is a synchronous state machine so it can be tested
//! without sockets; the connection's writer task drives it with wall-clock
//! instants and owns the actual WebSocket sender.

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::collections::VecDeque;
use std::io::Write;
use std::time::{Duration, Instant};

/// Flush caps per batch; residue re-schedules.
const MAX_NORMAL_PER_FLUSH: usize = 10;
const MAX_LOW_PER_FLUSH: usize = 5;
/// Rolling one-second budget per client.
const RATE_LIMIT_PER_SEC: usize = 100;
const RATE_WINDOW: Duration = Duration::from_secs(1);
/// Compression kicks in above this serialized size, and only when it saves
/// at least a tenth.
const COMPRESSION_THRESHOLD: usize = 1024;
/// Bandwidth monitoring: warn after this many consecutive hot seconds.
const BYTES_PER_SEC_WARN: u64 = 1024 * 1024;
const HOT_SECONDS_BEFORE_WARN: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Priority by wire event type: terminal/error traffic jumps the queue,
/// background progress yields to everything else.
pub fn classify_priority(event_type: &str) -> Priority {
    match event_type {
        "streaming_error" | "streaming_complete" | "streaming_cancelled" | "run_cancelled"
        | "rate_limit_warning" => Priority::High,
        t if t.ends_with("_progress") => Priority::Low,
        _ => Priority::Normal,
    }
}

/// Latency tiers derived from ping/pong round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LatencyTier {
    Excellent,
    Good,
    Fair,
    Poor,
    Bad,
}

impl LatencyTier {
    pub fn from_rtt_ms(rtt_ms: u64) -> Self {
        match rtt_ms {
            0..=29 => LatencyTier::Excellent,
            30..=79 => LatencyTier::Good,
            80..=149 => LatencyTier::Fair,
            150..=299 => LatencyTier::Poor,
            _ => LatencyTier::Bad,
        }
    }

    pub fn batch_interval(self) -> Duration {
        Duration::from_millis(match self {
            LatencyTier::Excellent => 16,
            LatencyTier::Good => 32,
            LatencyTier::Fair => 50,
            LatencyTier::Poor => 100,
            LatencyTier::Bad => 200,
        })
    }

    fn worse(self) -> Self {
        match self {
            LatencyTier::Excellent => LatencyTier::Good,
            LatencyTier::Good => LatencyTier::Fair,
            LatencyTier::Fair => LatencyTier::Poor,
            LatencyTier::Poor | LatencyTier::Bad => LatencyTier::Bad,
        }
    }

    fn better(self) -> Self {
        match self {
            LatencyTier::Excellent | LatencyTier::Good => LatencyTier::Excellent,
            LatencyTier::Fair => LatencyTier::Good,
            LatencyTier::Poor => LatencyTier::Fair,
            LatencyTier::Bad => LatencyTier::Poor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trend {
    Flat,
    Rising,
    Falling,
}

/// What the caller should do after handing an event to the pipeline.
#[derive(Debug)]
pub enum EnqueueAction {
    /// Send this batch on the socket right now.
    FlushNow(Vec<Value>),
    /// Arm (or re-arm) the flush timer for this delay.
    ScheduleIn(Duration),
    /// A timer is already armed; nothing to do.
    Pending,
    /// Deduplicated or rate-limited away.
    Dropped,
}

/// Frames ready for the socket.
#[derive(Debug)]
pub enum WireFrames {
    Text(String),
    /// Control frame announcing gzip, followed by the binary payload.
    Compressed { control: String, payload: Vec<u8> },
}

impl WireFrames {
    pub fn wire_len(&self) -> usize {
        match self {
            WireFrames::Text(s) => s.len(),
            WireFrames::Compressed { control, payload } => control.len() + payload.len(),
        }
    }
}

pub struct OutboundPipeline {
    tier: LatencyTier,
    trend: Trend,
    last_rtt_ms: Option<u64>,
    normal: VecDeque<Value>,
    low: VecDeque<Value>,
    last_enqueued: Option<String>,
    timer_armed: bool,
    rate_window: VecDeque<Instant>,
    last_rate_warn: Option<Instant>,
    bytes_window_start: Instant,
    bytes_in_window: u64,
    hot_seconds: u8,
}

impl OutboundPipeline {
    pub fn new(now: Instant) -> Self {
        Self {
            tier: LatencyTier::Good,
            trend: Trend::Flat,
            last_rtt_ms: None,
            normal: VecDeque::new(),
            low: VecDeque::new(),
            last_enqueued: None,
            timer_armed: false,
            rate_window: VecDeque::new(),
            last_rate_warn: None,
            bytes_window_start: now,
            bytes_in_window: 0,
            hot_seconds: 0,
        }
    }

    /// Feed one wire event through dedup, rate limiting, prioritization and
    /// batching.
    pub fn enqueue(&mut self, event: Value, now: Instant) -> EnqueueAction {
        let serialized = event.to_string();
        if self.last_enqueued.as_ref() == Some(&serialized) {
            return EnqueueAction::Dropped;
        }

        let priority = event
            .get("type")
            .and_then(Value::as_str)
            .map_or(Priority::Normal, classify_priority);

        while let Some(front) = self.rate_window.front() {
            if now.duration_since(*front) >= RATE_WINDOW {
                self.rate_window.pop_front();
            } else {
                break;
            }
        }
        if self.rate_window.len() >= RATE_LIMIT_PER_SEC && priority != Priority::High {
            if self
                .last_rate_warn
                .is_none_or(|t| now.duration_since(t) >= RATE_WINDOW)
            {
                tracing::warn!("Client over {RATE_LIMIT_PER_SEC} msg/s; dropping tail messages");
                self.last_rate_warn = Some(now);
            }
            return EnqueueAction::Dropped;
        }

        self.last_enqueued = Some(serialized);
        self.rate_window.push_back(now);

        match priority {
            Priority::High => {
                // High priority flushes immediately, carrying along whatever
                // was waiting (up to the per-class caps).
                let mut batch = vec![event];
                Self::drain_into(&mut batch, &mut self.normal, MAX_NORMAL_PER_FLUSH);
                Self::drain_into(&mut batch, &mut self.low, MAX_LOW_PER_FLUSH);
                EnqueueAction::FlushNow(batch)
            }
            Priority::Normal => {
                self.normal.push_back(event);
                self.schedule()
            }
            Priority::Low => {
                self.low.push_back(event);
                self.schedule()
            }
        }
    }

    /// The flush timer fired: emit one batch. Residue stays queued; call
    /// `reschedule` afterwards to re-arm.
    pub fn flush_due(&mut self) -> Vec<Value> {
        self.timer_armed = false;
        let mut batch = Vec::new();
        Self::drain_into(&mut batch, &mut self.normal, MAX_NORMAL_PER_FLUSH);
        Self::drain_into(&mut batch, &mut self.low, MAX_LOW_PER_FLUSH);
        batch
    }

    /// Re-arm the timer when messages remain queued.
    pub fn reschedule(&mut self) -> Option<Duration> {
        if self.has_pending() && !self.timer_armed {
            self.timer_armed = true;
            Some(self.flush_interval())
        } else {
            None
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.normal.is_empty() || !self.low.is_empty()
    }

    /// Tier interval, shifted one step by the RTT trend.
    pub fn flush_interval(&self) -> Duration {
        let effective = match self.trend {
            Trend::Rising => self.tier.worse(),
            Trend::Falling => self.tier.better(),
            Trend::Flat => self.tier,
        };
        effective.batch_interval()
    }

    pub fn tier(&self) -> LatencyTier {
        self.tier
    }

    /// Fold a ping/pong round trip into the tier and trend.
    pub fn record_rtt(&mut self, rtt_ms: u64) {
        self.trend = match self.last_rtt_ms {
            Some(last) if rtt_ms > last.saturating_add(last / 5) => Trend::Rising,
            Some(last) if rtt_ms.saturating_add(rtt_ms / 5) < last => Trend::Falling,
            Some(_) => Trend::Flat,
            None => Trend::Flat,
        };
        self.tier = LatencyTier::from_rtt_ms(rtt_ms);
        self.last_rtt_ms = Some(rtt_ms);
    }

    /// Track outbound bandwidth; warns after a sustained burst.
    pub fn record_sent_bytes(&mut self, bytes: usize, now: Instant) {
        if now.duration_since(self.bytes_window_start) >= Duration::from_secs(1) {
            if self.bytes_in_window > BYTES_PER_SEC_WARN {
                self.hot_seconds = self.hot_seconds.saturating_add(1);
                if self.hot_seconds >= HOT_SECONDS_BEFORE_WARN {
                    tracing::warn!(
                        bytes_per_sec = self.bytes_in_window,
                        "Sustained high outbound bandwidth to client"
                    );
                    self.hot_seconds = 0;
                }
            } else {
                self.hot_seconds = 0;
            }
            self.bytes_window_start = now;
            self.bytes_in_window = 0;
        }
        self.bytes_in_window += bytes as u64;
    }

    fn schedule(&mut self) -> EnqueueAction {
        if self.timer_armed {
            EnqueueAction::Pending
        } else {
            self.timer_armed = true;
            EnqueueAction::ScheduleIn(self.flush_interval())
        }
    }

    fn drain_into(batch: &mut Vec<Value>, queue: &mut VecDeque<Value>, cap: usize) {
        for _ in 0..cap {
            match queue.pop_front() {
                Some(v) => batch.push(v),
                None => break,
            }
        }
    }
}

/// Serialize a batch for the wire: a single object goes bare, several go as
/// a JSON array. Large batches are gzipped when that saves at least 10%.
pub fn encode_batch(batch: &[Value]) -> WireFrames {
    let text = if batch.len() == 1 {
        batch[0].to_string()
    } else {
        Value::Array(batch.to_vec()).to_string()
    };

    if text.len() > COMPRESSION_THRESHOLD {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(text.as_bytes()).is_ok() {
            if let Ok(compressed) = encoder.finish() {
                let max_useful = text.len() - text.len() / 10;
                if compressed.len() <= max_useful {
                    return WireFrames::Compressed {
                        control: r#"{"type":"_compressed","encoding":"gzip"}"#.to_string(),
                        payload: compressed,
                    };
                }
            }
        }
    }

    WireFrames::Text(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline() -> OutboundPipeline {
        OutboundPipeline::new(Instant::now())
    }

    #[test]
    fn priorities_by_event_type() {
        assert_eq!(classify_priority("streaming_error"), Priority::High);
        assert_eq!(classify_priority("streaming_complete"), Priority::High);
        assert_eq!(classify_priority("streaming_cancelled"), Priority::High);
        assert_eq!(classify_priority("run_cancelled"), Priority::High);
        assert_eq!(classify_priority("model_progress"), Priority::Low);
        assert_eq!(classify_priority("streaming_chunk"), Priority::Normal);
        assert_eq!(classify_priority("queue_status"), Priority::Normal);
    }

    #[test]
    fn duplicate_payload_is_dropped() {
        let mut p = pipeline();
        let now = Instant::now();
        let ev = json!({"type": "queue_status", "length": 1});
        assert!(matches!(
            p.enqueue(ev.clone(), now),
            EnqueueAction::ScheduleIn(_)
        ));
        assert!(matches!(p.enqueue(ev, now), EnqueueAction::Dropped));
    }

    #[test]
    fn high_priority_flushes_immediately_with_pending() {
        let mut p = pipeline();
        let now = Instant::now();
        p.enqueue(json!({"type": "streaming_chunk", "sequence": 0}), now);
        p.enqueue(json!({"type": "streaming_chunk", "sequence": 1}), now);

        let action = p.enqueue(json!({"type": "streaming_error", "error": "x"}), now);
        let EnqueueAction::FlushNow(batch) = action else {
            panic!("expected immediate flush");
        };
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0]["type"], "streaming_error");
        assert!(!p.has_pending());
    }

    #[test]
    fn second_normal_event_is_pending_not_rescheduled() {
        let mut p = pipeline();
        let now = Instant::now();
        assert!(matches!(
            p.enqueue(json!({"type": "streaming_chunk", "sequence": 0}), now),
            EnqueueAction::ScheduleIn(_)
        ));
        assert!(matches!(
            p.enqueue(json!({"type": "streaming_chunk", "sequence": 1}), now),
            EnqueueAction::Pending
        ));
    }

    #[test]
    fn flush_caps_and_residue() {
        let mut p = pipeline();
        let now = Instant::now();
        for i in 0..12 {
            p.enqueue(json!({"type": "streaming_chunk", "sequence": i}), now);
        }
        for i in 0..7 {
            p.enqueue(json!({"type": "model_progress", "step": i}), now);
        }

        let batch = p.flush_due();
        assert_eq!(batch.len(), 15); // 10 normal + 5 low
        let normals = batch
            .iter()
            .filter(|v| v["type"] == "streaming_chunk")
            .count();
        assert_eq!(normals, 10);

        // Residue (2 normal + 2 low) re-schedules
        assert!(p.has_pending());
        assert!(p.reschedule().is_some());
        let rest = p.flush_due();
        assert_eq!(rest.len(), 4);
        assert!(p.reschedule().is_none());
    }

    #[test]
    fn order_preserved_within_priority_class() {
        let mut p = pipeline();
        let now = Instant::now();
        for i in 0..5 {
            p.enqueue(json!({"type": "streaming_chunk", "sequence": i}), now);
        }
        let batch = p.flush_due();
        let seqs: Vec<i64> = batch.iter().map(|v| v["sequence"].as_i64().unwrap()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn rate_limit_drops_tail_but_keeps_high() {
        let mut p = pipeline();
        let now = Instant::now();
        for i in 0..RATE_LIMIT_PER_SEC {
            let action = p.enqueue(json!({"type": "streaming_chunk", "sequence": i}), now);
            assert!(!matches!(action, EnqueueAction::Dropped));
        }
        // Over budget: normal dropped
        assert!(matches!(
            p.enqueue(json!({"type": "streaming_chunk", "sequence": 999}), now),
            EnqueueAction::Dropped
        ));
        // High still goes through
        assert!(matches!(
            p.enqueue(json!({"type": "streaming_error", "error": "x"}), now),
            EnqueueAction::FlushNow(_)
        ));
        // Window slides: a second later traffic flows again
        let later = now + Duration::from_millis(1100);
        assert!(!matches!(
            p.enqueue(json!({"type": "streaming_chunk", "sequence": 1000}), later),
            EnqueueAction::Dropped
        ));
    }

    #[test]
    fn tier_intervals_and_trend_adjustment() {
        let mut p = pipeline();
        p.record_rtt(10);
        assert_eq!(p.tier(), LatencyTier::Excellent);
        assert_eq!(p.flush_interval(), Duration::from_millis(16));

        // Sharp rise: one step worse than the measured tier
        p.record_rtt(60);
        assert_eq!(p.tier(), LatencyTier::Good);
        assert_eq!(p.flush_interval(), Duration::from_millis(50));

        // Falling: one step better
        p.record_rtt(40);
        assert_eq!(p.flush_interval(), Duration::from_millis(16));
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(LatencyTier::from_rtt_ms(0), LatencyTier::Excellent);
        assert_eq!(LatencyTier::from_rtt_ms(30), LatencyTier::Good);
        assert_eq!(LatencyTier::from_rtt_ms(80), LatencyTier::Fair);
        assert_eq!(LatencyTier::from_rtt_ms(150), LatencyTier::Poor);
        assert_eq!(LatencyTier::from_rtt_ms(5000), LatencyTier::Bad);
    }

    #[test]
    fn small_batches_stay_text() {
        let frames = encode_batch(&[json!({"type": "queue_status", "length": 1})]);
        assert!(matches!(frames, WireFrames::Text(_)));
    }

    #[test]
    fn large_compressible_batch_is_gzipped() {
        let big = "x".repeat(4096);
        let frames = encode_batch(&[json!({"type": "streaming_chunk", "payload": big})]);
        match frames {
            WireFrames::Compressed { control, payload } => {
                assert!(control.contains("_compressed"));
                assert!(control.contains("gzip"));
                assert!(!payload.is_empty());
            }
            WireFrames::Text(_) => panic!("expected compression"),
        }
    }

    #[test]
    fn batch_of_many_serializes_as_array() {
        let frames = encode_batch(&[json!({"a": 1}), json!({"b": 2})]);
        let WireFrames::Text(text) = frames else {
            panic!("expected text");
        };
        assert!(text.starts_with('['));
    }
}
