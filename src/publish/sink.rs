//! Outbound sinks: the per-connection live channel and the durable broker topic.
//!
//! The two sinks are independent failure domains. A broker outage must never
//! block or drop live delivery, and a gone connection must never affect the
//! broker; the publisher treats every sink error as isolated.

use crate::error::{Result, VoxflowError};
use crate::publish::LiveEvent;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Per-connection push channel for live transcript events.
#[async_trait]
pub trait LiveSink: Send + Sync {
    /// Delivers one event to the connection.
    ///
    /// Delivering to a connection that is already gone is a no-op, not an
    /// error; only genuine delivery faults should be reported.
    async fn deliver(&self, event: LiveEvent) -> Result<()>;
}

/// Durable topic publish with at-least-once expectations downstream.
#[async_trait]
pub trait BrokerSink: Send + Sync {
    /// Publishes one serialized event under a routing key.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;
}

/// Live sink backed by a tokio channel, as handed out by transports.
pub struct ChannelLiveSink {
    tx: mpsc::Sender<LiveEvent>,
}

impl ChannelLiveSink {
    /// Creates the sink and the receiving half the transport reads from.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<LiveEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl LiveSink for ChannelLiveSink {
    async fn deliver(&self, event: LiveEvent) -> Result<()> {
        // A dropped receiver means the connection is gone: no-op by contract.
        let _ = self.tx.send(event).await;
        Ok(())
    }
}

/// Live sink that drops everything. For streams nobody is watching.
pub struct NullLiveSink;

#[async_trait]
impl LiveSink for NullLiveSink {
    async fn deliver(&self, _event: LiveEvent) -> Result<()> {
        Ok(())
    }
}

/// In-memory broker for tests: records every publish.
#[derive(Default)]
pub struct MemoryBroker {
    messages: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// All published (topic, payload) pairs so far.
    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Published payloads decoded as JSON values.
    pub fn json_messages(&self) -> Vec<serde_json::Value> {
        self.messages()
            .iter()
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }
}

#[async_trait]
impl BrokerSink for MemoryBroker {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((topic.to_string(), payload.to_vec()));
        }
        Ok(())
    }
}

/// Broker that always fails. For sink-isolation tests.
pub struct FailingBroker;

#[async_trait]
impl BrokerSink for FailingBroker {
    async fn publish(&self, _topic: &str, _payload: &[u8]) -> Result<()> {
        Err(VoxflowError::DeliveryFailure {
            sink: "broker".to_string(),
            message: "broker unavailable".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelLiveSink::new(4);
        sink.deliver(LiveEvent::SpeechStart { sequence: 1 })
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, LiveEvent::SpeechStart { sequence: 1 }));
    }

    #[tokio::test]
    async fn test_channel_sink_noop_after_receiver_dropped() {
        let (sink, rx) = ChannelLiveSink::new(4);
        drop(rx);
        // Gone connection: publish succeeds as a no-op.
        assert!(sink
            .deliver(LiveEvent::SpeechEnd { sequence: 2 })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_memory_broker_records() {
        let broker = MemoryBroker::new();
        broker.publish("stt.transcripts", b"{\"a\":1}").await.unwrap();
        let messages = broker.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "stt.transcripts");
        assert_eq!(broker.json_messages()[0]["a"], 1);
    }

    #[tokio::test]
    async fn test_failing_broker_fails() {
        let broker = FailingBroker;
        let result = broker.publish("t", b"x").await;
        assert!(matches!(
            result,
            Err(VoxflowError::DeliveryFailure { .. })
        ));
    }
}
