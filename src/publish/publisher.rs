//! Per-stream result ordering and dual-sink delivery.
//!
//! Results for a stream must reach the sinks in non-decreasing start-sequence
//! order even when inference completes out of order. Each dispatched job gets
//! a per-stream ordinal at submission; completed outcomes wait in a bounded
//! reorder buffer until every earlier ordinal has reported. A stream whose
//! buffer outgrows the bound has its stuck head skipped with a typed failure,
//! trading completeness for liveness.
//!
//! Delivery runs on a single worker task fed through one queue, so release
//! order is exactly delivery order. The live channel and the broker topic are
//! independent failure domains: an error on one is logged and never touches
//! the other.

use crate::audio::frame::StreamId;
use crate::defaults;
use crate::error::Result;
use crate::publish::sink::{BrokerSink, LiveSink};
use crate::publish::{FailureEvent, FailureKind, LiveEvent, TranscriptResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Configuration for the publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Maximum pending results held per stream before the stuck head is
    /// skipped.
    pub reorder_buffer_bound: usize,
    /// Broker routing key for transcript and failure events.
    pub transcript_topic: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            reorder_buffer_bound: defaults::REORDER_BUFFER_BOUND,
            transcript_topic: defaults::TRANSCRIPT_TOPIC.to_string(),
        }
    }
}

/// What the scheduler reports back for a dispatched segment.
#[derive(Debug, Clone)]
pub enum SegmentOutcome {
    Transcript { text: String, confidence: f32 },
    Failure { kind: FailureKind, message: String },
}

/// A registered, not-yet-released result slot.
#[derive(Debug)]
struct Slot {
    start_sequence: u64,
    end_sequence: u64,
    partial: bool,
    outcome: Option<SegmentOutcome>,
}

/// Per-stream ordering state.
#[derive(Debug)]
struct StreamOrdering {
    frame_ms: u32,
    next_ordinal: u64,
    pending: BTreeMap<u64, Slot>,
}

/// One unit of work for the delivery worker.
enum Delivery {
    /// An event on its way to the sinks.
    Event {
        stream: StreamId,
        event: LiveEvent,
        broker_bound: bool,
    },
    /// Flush marker: acknowledged once everything queued before it went out.
    Barrier(oneshot::Sender<()>),
}

/// Orders, deduplicates and forwards results to both sinks.
pub struct ResultPublisher {
    config: PublisherConfig,
    ordering: Mutex<HashMap<StreamId, StreamOrdering>>,
    sinks: Arc<Mutex<HashMap<StreamId, Arc<dyn LiveSink>>>>,
    tx: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Signaled whenever a stream's pending set shrinks; `drain_stream` waits
    /// on it.
    released: Notify,
}

impl ResultPublisher {
    /// Creates the publisher and spawns its delivery worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PublisherConfig, broker: Arc<dyn BrokerSink>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let sinks: Arc<Mutex<HashMap<StreamId, Arc<dyn LiveSink>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let topic = config.transcript_topic.clone();
        let worker = tokio::spawn(deliver_loop(rx, broker, sinks.clone(), topic));

        Self {
            config,
            ordering: Mutex::new(HashMap::new()),
            sinks,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            released: Notify::new(),
        }
    }

    /// Registers a stream and its live sink. Must precede any `expect` call
    /// for the stream.
    pub fn register_stream(&self, stream: StreamId, frame_ms: u32, live: Arc<dyn LiveSink>) {
        if let Ok(mut ordering) = self.ordering.lock() {
            ordering.insert(
                stream.clone(),
                StreamOrdering {
                    frame_ms,
                    next_ordinal: 0,
                    pending: BTreeMap::new(),
                },
            );
        }
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.insert(stream, live);
        }
    }

    /// Closes a stream: pending results are dropped, later completions for it
    /// are discarded rather than delivered.
    pub fn close_stream(&self, stream: &StreamId) {
        let dropped = self
            .ordering
            .lock()
            .ok()
            .and_then(|mut ordering| ordering.remove(stream))
            .map(|state| state.pending.len())
            .unwrap_or(0);
        if dropped > 0 {
            debug!(%stream, dropped, "discarded pending results of closed stream");
        }
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.remove(stream);
        }
        // Wake drain waiters: a closed stream counts as drained.
        self.released.notify_waiters();
    }

    /// Reserves the next ordering slot for a dispatched segment.
    ///
    /// Returns `None` if the stream is already closed.
    pub fn expect(
        &self,
        stream: &StreamId,
        start_sequence: u64,
        end_sequence: u64,
        partial: bool,
    ) -> Option<u64> {
        let mut ordering = self.ordering.lock().ok()?;
        let state = ordering.get_mut(stream)?;
        let ordinal = state.next_ordinal;
        state.next_ordinal += 1;
        state.pending.insert(
            ordinal,
            Slot {
                start_sequence,
                end_sequence,
                partial,
                outcome: None,
            },
        );
        Some(ordinal)
    }

    /// Records the outcome for a reserved slot and releases everything that
    /// is now in order.
    pub fn complete(&self, stream: &StreamId, ordinal: u64, outcome: SegmentOutcome) {
        let mut deliveries = Vec::new();
        {
            let Ok(mut ordering) = self.ordering.lock() else {
                return;
            };
            let Some(state) = ordering.get_mut(stream) else {
                debug!(%stream, ordinal, "dropping result for closed stream");
                return;
            };
            match state.pending.get_mut(&ordinal) {
                Some(slot) if slot.outcome.is_none() => slot.outcome = Some(outcome),
                _ => {
                    warn!(%stream, ordinal, "duplicate or unknown completion ignored");
                    return;
                }
            }
            Self::drain_ready(
                stream,
                state,
                self.config.reorder_buffer_bound,
                &mut deliveries,
            );
        }
        if !deliveries.is_empty() {
            self.released.notify_waiters();
        }
        self.enqueue(deliveries);
    }

    /// Number of dispatched-but-unreleased results for a stream.
    pub fn pending(&self, stream: &StreamId) -> usize {
        self.ordering
            .lock()
            .ok()
            .and_then(|ordering| ordering.get(stream).map(|state| state.pending.len()))
            .unwrap_or(0)
    }

    /// Waits until every dispatched result for the stream has been released,
    /// or the timeout elapses. Returns whether the stream fully drained.
    ///
    /// Used by graceful stream close: the final segment's transcript should
    /// still reach the sinks before the stream is deregistered.
    pub async fn drain_stream(&self, stream: &StreamId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before re-checking so a release landing in between
            // cannot be missed.
            released.as_mut().enable();
            if self.pending(stream) == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return self.pending(stream) == 0;
            }
        }
    }

    /// Waits until every delivery queued so far has gone out to the sinks.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(vec![Delivery::Barrier(ack_tx)]);
        let _ = ack_rx.await;
    }

    /// Forwards a connection-level event (ready, speech boundaries, discards)
    /// straight to the live channel, outside the ordering machinery.
    pub fn live_event(&self, stream: &StreamId, event: LiveEvent) {
        self.enqueue(vec![Delivery::Event {
            stream: stream.clone(),
            event,
            broker_bound: false,
        }]);
    }

    /// Stops accepting deliveries and waits for queued ones to flush.
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().ok().and_then(|mut tx| tx.take());
        drop(tx);
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    fn enqueue(&self, deliveries: Vec<Delivery>) {
        let Ok(tx) = self.tx.lock() else { return };
        let Some(tx) = tx.as_ref() else {
            debug!("publisher shut down; dropping {} deliveries", deliveries.len());
            return;
        };
        for delivery in deliveries {
            let _ = tx.send(delivery);
        }
    }

    fn drain_ready(
        stream: &StreamId,
        state: &mut StreamOrdering,
        bound: usize,
        out: &mut Vec<Delivery>,
    ) {
        loop {
            // Release every completed slot at the head.
            while let Some(entry) = state.pending.first_entry() {
                if entry.get().outcome.is_none() {
                    break;
                }
                let (_, slot) = entry.remove_entry();
                out.push(Self::delivery_for(stream, state.frame_ms, slot));
            }

            // Liveness over completeness: past the bound, the stuck head is
            // treated as failed and skipped.
            if state.pending.len() > bound
                && let Some(entry) = state.pending.first_entry()
            {
                let (ordinal, slot) = entry.remove_entry();
                warn!(%stream, ordinal, "reorder buffer bound exceeded; skipping stuck job");
                out.push(Delivery::Event {
                    stream: stream.clone(),
                    broker_bound: true,
                    event: LiveEvent::Failure(FailureEvent {
                        stream: stream.clone(),
                        start_sequence: slot.start_sequence,
                        end_sequence: slot.end_sequence,
                        kind: FailureKind::Skipped,
                        message: "result held back past the reorder bound".to_string(),
                    }),
                });
                continue;
            }
            break;
        }
    }

    fn delivery_for(stream: &StreamId, frame_ms: u32, slot: Slot) -> Delivery {
        match slot.outcome {
            Some(SegmentOutcome::Transcript { text, confidence }) => Delivery::Event {
                stream: stream.clone(),
                // Partial snapshots are live-only; the broker topic carries
                // finals and failures.
                broker_bound: !slot.partial,
                event: LiveEvent::Transcript(TranscriptResult {
                    stream: stream.clone(),
                    start_sequence: slot.start_sequence,
                    end_sequence: slot.end_sequence,
                    start_ms: slot.start_sequence * frame_ms as u64,
                    end_ms: (slot.end_sequence + 1) * frame_ms as u64,
                    text,
                    confidence,
                    partial: slot.partial,
                }),
            },
            Some(SegmentOutcome::Failure { kind, message }) => Delivery::Event {
                stream: stream.clone(),
                broker_bound: true,
                event: LiveEvent::Failure(FailureEvent {
                    stream: stream.clone(),
                    start_sequence: slot.start_sequence,
                    end_sequence: slot.end_sequence,
                    kind,
                    message,
                }),
            },
            // drain_ready only builds deliveries for decided slots.
            None => unreachable!("undecided slot released"),
        }
    }
}

/// Single delivery worker: one queue in, both sinks out.
async fn deliver_loop(
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    broker: Arc<dyn BrokerSink>,
    sinks: Arc<Mutex<HashMap<StreamId, Arc<dyn LiveSink>>>>,
    topic: String,
) {
    while let Some(delivery) = rx.recv().await {
        let (stream, event, broker_bound) = match delivery {
            Delivery::Barrier(ack) => {
                let _ = ack.send(());
                continue;
            }
            Delivery::Event {
                stream,
                event,
                broker_bound,
            } => (stream, event, broker_bound),
        };

        if broker_bound {
            match serde_json::to_vec(&event) {
                Ok(payload) => {
                    if let Err(error) = broker.publish(&topic, &payload).await {
                        // Isolated failure domain: log and keep going.
                        warn!(stream = %stream, %error, "broker publish failed");
                    }
                }
                Err(error) => {
                    warn!(stream = %stream, %error, "failed to serialize event");
                }
            }
        }

        // A deregistered live sink means the connection is gone; the broker
        // leg above is unaffected.
        let live = sinks.lock().ok().and_then(|map| map.get(&stream).cloned());
        let Some(live) = live else {
            debug!(stream = %stream, "no live sink; event delivered to broker only");
            continue;
        };
        if let Err(error) = live.deliver(event).await {
            warn!(stream = %stream, %error, "live delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::sink::{ChannelLiveSink, FailingBroker, MemoryBroker};
    use std::time::Duration;

    fn outcome(text: &str) -> SegmentOutcome {
        SegmentOutcome::Transcript {
            text: text.to_string(),
            confidence: 0.9,
        }
    }

    async fn recv_timeout(rx: &mut mpsc::Receiver<LiveEvent>) -> Option<LiveEvent> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn setup(
        bound: usize,
        broker: Arc<dyn BrokerSink>,
    ) -> (ResultPublisher, StreamId, mpsc::Receiver<LiveEvent>) {
        let publisher = ResultPublisher::new(
            PublisherConfig {
                reorder_buffer_bound: bound,
                transcript_topic: "stt.transcripts".to_string(),
            },
            broker,
        );
        let stream = StreamId::new("pub-test");
        let (sink, rx) = ChannelLiveSink::new(32);
        publisher.register_stream(stream.clone(), 20, Arc::new(sink));
        (publisher, stream, rx)
    }

    #[tokio::test]
    async fn test_in_order_release() {
        let (publisher, stream, mut rx) = setup(16, Arc::new(MemoryBroker::new()));

        let o0 = publisher.expect(&stream, 0, 10, false).unwrap();
        let o1 = publisher.expect(&stream, 11, 20, false).unwrap();
        assert_eq!((o0, o1), (0, 1));

        publisher.complete(&stream, o0, outcome("first"));
        publisher.complete(&stream, o1, outcome("second"));

        let first = recv_timeout(&mut rx).await.unwrap();
        let second = recv_timeout(&mut rx).await.unwrap();
        match (first, second) {
            (LiveEvent::Transcript(a), LiveEvent::Transcript(b)) => {
                assert_eq!(a.text, "first");
                assert_eq!(b.text, "second");
                assert!(a.start_sequence <= b.start_sequence);
            }
            other => panic!("unexpected events: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_out_of_order_completion_held_back() {
        let (publisher, stream, mut rx) = setup(16, Arc::new(MemoryBroker::new()));

        let o0 = publisher.expect(&stream, 0, 10, false).unwrap();
        let o1 = publisher.expect(&stream, 11, 20, false).unwrap();

        // Later job finishes first: nothing may be delivered yet.
        publisher.complete(&stream, o1, outcome("second"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        publisher.complete(&stream, o0, outcome("first"));
        let texts: Vec<String> = [
            recv_timeout(&mut rx).await.unwrap(),
            recv_timeout(&mut rx).await.unwrap(),
        ]
        .into_iter()
        .map(|e| match e {
            LiveEvent::Transcript(t) => t.text,
            other => panic!("unexpected event: {:?}", other),
        })
        .collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_reorder_bound_skips_stuck_job() {
        let (publisher, stream, mut rx) = setup(2, Arc::new(MemoryBroker::new()));

        let o0 = publisher.expect(&stream, 0, 5, false).unwrap();
        let o1 = publisher.expect(&stream, 6, 10, false).unwrap();
        let o2 = publisher.expect(&stream, 11, 15, false).unwrap();
        let _ = o0; // never completes: the stuck job

        publisher.complete(&stream, o1, outcome("one"));
        publisher.complete(&stream, o2, outcome("two"));

        // Head skipped with a typed failure, then the held results flow.
        let first = recv_timeout(&mut rx).await.unwrap();
        match first {
            LiveEvent::Failure(f) => {
                assert_eq!(f.kind, FailureKind::Skipped);
                assert_eq!(f.start_sequence, 0);
            }
            other => panic!("expected skip failure, got {:?}", other),
        }
        let second = recv_timeout(&mut rx).await.unwrap();
        assert!(matches!(second, LiveEvent::Transcript(t) if t.text == "one"));
        let third = recv_timeout(&mut rx).await.unwrap();
        assert!(matches!(third, LiveEvent::Transcript(t) if t.text == "two"));
    }

    #[tokio::test]
    async fn test_closed_stream_discards_results() {
        let (publisher, stream, mut rx) = setup(16, Arc::new(MemoryBroker::new()));

        let o0 = publisher.expect(&stream, 0, 10, false).unwrap();
        publisher.close_stream(&stream);
        publisher.complete(&stream, o0, outcome("late"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        // New slots are refused too.
        assert!(publisher.expect(&stream, 11, 20, false).is_none());
    }

    #[tokio::test]
    async fn test_broker_receives_finals_and_failures_only() {
        let broker = Arc::new(MemoryBroker::new());
        let (publisher, stream, mut rx) = setup(16, broker.clone());

        publisher.live_event(&stream, LiveEvent::SpeechStart { sequence: 0 });

        let o0 = publisher.expect(&stream, 0, 10, true).unwrap(); // partial
        publisher.complete(&stream, o0, outcome("partial text"));

        let o1 = publisher.expect(&stream, 0, 20, false).unwrap();
        publisher.complete(&stream, o1, outcome("final text"));

        let o2 = publisher.expect(&stream, 21, 30, false).unwrap();
        publisher.complete(
            &stream,
            o2,
            SegmentOutcome::Failure {
                kind: FailureKind::Rejected,
                message: "bad audio".to_string(),
            },
        );

        // Live channel sees everything, in order.
        for _ in 0..4 {
            assert!(recv_timeout(&mut rx).await.is_some());
        }

        let broker_events = broker.json_messages();
        assert_eq!(broker_events.len(), 2);
        assert_eq!(broker_events[0]["type"], "transcript");
        assert_eq!(broker_events[0]["text"], "final text");
        assert_eq!(broker_events[1]["type"], "failure");
        assert_eq!(broker_events[1]["kind"], "rejected");
    }

    #[tokio::test]
    async fn test_broker_failure_never_blocks_live_delivery() {
        let (publisher, stream, mut rx) = setup(16, Arc::new(FailingBroker));

        let o0 = publisher.expect(&stream, 0, 10, false).unwrap();
        publisher.complete(&stream, o0, outcome("still delivered"));

        let event = recv_timeout(&mut rx).await.unwrap();
        assert!(matches!(event, LiveEvent::Transcript(t) if t.text == "still delivered"));
    }

    #[tokio::test]
    async fn test_independent_streams_do_not_interfere() {
        let publisher = ResultPublisher::new(
            PublisherConfig::default(),
            Arc::new(MemoryBroker::new()),
        );
        let (sink_a, mut rx_a) = ChannelLiveSink::new(8);
        let (sink_b, mut rx_b) = ChannelLiveSink::new(8);
        let a = StreamId::new("a");
        let b = StreamId::new("b");
        publisher.register_stream(a.clone(), 20, Arc::new(sink_a));
        publisher.register_stream(b.clone(), 20, Arc::new(sink_b));

        // Stream A has an outstanding earlier job; stream B must not be held.
        let _a0 = publisher.expect(&a, 0, 10, false).unwrap();
        let b0 = publisher.expect(&b, 0, 10, false).unwrap();
        publisher.complete(&b, b0, outcome("b text"));

        let event = recv_timeout(&mut rx_b).await.unwrap();
        assert!(matches!(event, LiveEvent::Transcript(t) if t.text == "b text"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drain_stream_waits_for_release() {
        let (publisher, stream, mut rx) = setup(16, Arc::new(MemoryBroker::new()));
        let publisher = Arc::new(publisher);

        let o0 = publisher.expect(&stream, 0, 10, false).unwrap();
        assert_eq!(publisher.pending(&stream), 1);

        let drainer = {
            let publisher = publisher.clone();
            let stream = stream.clone();
            tokio::spawn(async move {
                publisher.drain_stream(&stream, Duration::from_secs(2)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.complete(&stream, o0, outcome("done"));

        assert!(drainer.await.unwrap());
        assert_eq!(publisher.pending(&stream), 0);
        assert!(recv_timeout(&mut rx).await.is_some());
    }

    #[tokio::test]
    async fn test_drain_stream_times_out_on_stuck_job() {
        let (publisher, stream, _rx) = setup(16, Arc::new(MemoryBroker::new()));

        let _o0 = publisher.expect(&stream, 0, 10, false).unwrap();
        assert!(
            !publisher
                .drain_stream(&stream, Duration::from_millis(50))
                .await
        );
    }

    #[tokio::test]
    async fn test_flush_delivers_everything_queued() {
        let broker = Arc::new(MemoryBroker::new());
        let (publisher, stream, _rx) = setup(16, broker.clone());

        let o0 = publisher.expect(&stream, 0, 10, false).unwrap();
        publisher.complete(&stream, o0, outcome("flushed"));
        publisher.flush().await;

        assert_eq!(broker.json_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_broker_leg_survives_missing_live_sink() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher =
            ResultPublisher::new(PublisherConfig::default(), broker.clone());
        let stream = StreamId::new("no-sink");
        let (sink, rx) = ChannelLiveSink::new(4);
        publisher.register_stream(stream.clone(), 20, Arc::new(sink));

        let o0 = publisher.expect(&stream, 0, 10, false).unwrap();
        // Connection goes away but the stream is still open.
        drop(rx);
        if let Ok(mut sinks) = publisher.sinks.lock() {
            sinks.remove(&stream);
        }
        publisher.complete(&stream, o0, outcome("durable"));
        publisher.flush().await;

        assert_eq!(broker.json_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queue() {
        let broker = Arc::new(MemoryBroker::new());
        let (publisher, stream, _rx) = setup(16, broker.clone());

        let o0 = publisher.expect(&stream, 0, 10, false).unwrap();
        publisher.complete(&stream, o0, outcome("flushed"));
        publisher.shutdown().await;

        assert_eq!(broker.json_messages().len(), 1);
    }
}
