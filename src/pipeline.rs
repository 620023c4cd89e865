//! Pipeline orchestrator.
//!
//! Wires the shared stages (scheduler, publisher, engine) to per-stream
//! sessions. Each open stream gets one lightweight task that drives intake,
//! VAD and assembly; inference runs in the scheduler's bounded worker pool.
//! The intake channel is bounded and segment submission is awaited, so
//! scheduler backpressure propagates to the transport instead of growing
//! buffers.

use crate::audio::frame::{StreamFormat, StreamId};
use crate::config::Config;
use crate::defaults;
use crate::engine::InferenceEngine;
use crate::error::{Result, VoxflowError};
use crate::publish::publisher::ResultPublisher;
use crate::publish::sink::{BrokerSink, ChannelLiveSink, LiveSink};
use crate::publish::LiveEvent;
use crate::schedule::TranscriptionScheduler;
use crate::segment::{AssemblerConfig, AssemblerEvent};
use crate::session::StreamSession;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum StreamInput {
    Bytes(Vec<u8>),
    Close,
}

/// Writing half of an open stream, held by the transport.
///
/// Dropping the handle without `close()` counts as a connection abort: the
/// accumulating segment is cancelled and in-flight results are discarded.
pub struct StreamHandle {
    id: StreamId,
    tx: mpsc::Sender<StreamInput>,
    done: oneshot::Receiver<()>,
}

impl StreamHandle {
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    /// Pushes one raw byte chunk. Applies backpressure by awaiting channel
    /// space when the stream's task is stalled on the scheduler.
    pub async fn push(&self, bytes: Vec<u8>) -> Result<()> {
        self.tx
            .send(StreamInput::Bytes(bytes))
            .await
            .map_err(|_| VoxflowError::StreamClosed {
                stream: self.id.to_string(),
            })
    }

    /// Signals end-of-stream and waits for the final segment's results to be
    /// delivered (bounded by the close drain grace).
    pub async fn close(self) -> Result<()> {
        self.tx
            .send(StreamInput::Close)
            .await
            .map_err(|_| VoxflowError::StreamClosed {
                stream: self.id.to_string(),
            })?;
        let _ = self.done.await;
        Ok(())
    }
}

struct StreamEntry {
    tx: mpsc::WeakSender<StreamInput>,
    task: JoinHandle<()>,
}

type StreamRegistry = Arc<Mutex<HashMap<StreamId, StreamEntry>>>;

/// The assembled transcription service.
pub struct Pipeline {
    config: Config,
    scheduler: Arc<TranscriptionScheduler>,
    publisher: Arc<ResultPublisher>,
    streams: StreamRegistry,
    closed: AtomicBool,
}

impl Pipeline {
    /// Builds the pipeline around an engine and a broker sink.
    ///
    /// Must be called from within a tokio runtime; the scheduler and
    /// publisher spawn their worker tasks here.
    pub fn new(
        config: Config,
        engine: Arc<dyn InferenceEngine>,
        broker: Arc<dyn BrokerSink>,
    ) -> Result<Self> {
        config.validate()?;
        info!(engine = engine.name(), "starting pipeline");

        let publisher = Arc::new(ResultPublisher::new(config.publisher_config(), broker));
        let scheduler = Arc::new(TranscriptionScheduler::new(
            config.scheduler_config(),
            engine,
            publisher.clone(),
        ));

        Ok(Self {
            config,
            scheduler,
            publisher,
            streams: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        })
    }

    /// Opens a stream with a channel-backed live sink and returns the
    /// receiving half alongside the handle.
    pub fn open_stream(
        &self,
        format: StreamFormat,
    ) -> Result<(StreamHandle, mpsc::Receiver<LiveEvent>)> {
        let (sink, rx) = ChannelLiveSink::new(defaults::LIVE_CHANNEL_DEPTH);
        let handle = self.open_stream_with_sink(format, Arc::new(sink))?;
        Ok((handle, rx))
    }

    /// Opens a stream whose live events go to a transport-provided sink.
    pub fn open_stream_with_sink(
        &self,
        format: StreamFormat,
        live: Arc<dyn LiveSink>,
    ) -> Result<StreamHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoxflowError::Pipeline {
                message: "pipeline is shutting down".to_string(),
            });
        }

        let id = StreamId::generate();
        let session = StreamSession::new(
            id.clone(),
            format,
            self.config.vad_config(),
            self.assembler_config_for(&format),
        )?;

        self.publisher.register_stream(id.clone(), format.frame_ms, live);
        self.publisher.live_event(
            &id,
            LiveEvent::Ready {
                stream: id.clone(),
                sample_rate: format.sample_rate,
                frame_ms: format.frame_ms,
            },
        );

        let (tx, rx) = mpsc::channel(defaults::INTAKE_CHANNEL_DEPTH);
        let (done_tx, done_rx) = oneshot::channel();
        let task = tokio::spawn(stream_task(
            id.clone(),
            session,
            rx,
            done_tx,
            self.scheduler.clone(),
            self.publisher.clone(),
            self.streams.clone(),
        ));

        if let Ok(mut streams) = self.streams.lock() {
            streams.insert(
                id.clone(),
                StreamEntry {
                    tx: tx.downgrade(),
                    task,
                },
            );
        }
        debug!(stream = %id, sample_rate = format.sample_rate, "stream opened");

        Ok(StreamHandle {
            id,
            tx,
            done: done_rx,
        })
    }

    /// Number of currently open streams.
    pub fn active_streams(&self) -> usize {
        self.streams.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Stops intake, drains in-flight work up to the grace period, then
    /// force-cancels whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + grace;

        let entries: Vec<(StreamId, StreamEntry)> = self
            .streams
            .lock()
            .map(|mut streams| streams.drain().collect())
            .unwrap_or_default();

        for (_, entry) in &entries {
            if let Some(tx) = entry.tx.upgrade() {
                // A full intake channel means the stream is already wedged on
                // backpressure; the abort below will get it.
                let _ = tx.try_send(StreamInput::Close);
            }
        }
        for (id, entry) in entries {
            let abort = entry.task.abort_handle();
            if tokio::time::timeout_at(deadline, entry.task).await.is_err() {
                warn!(stream = %id, "stream did not drain in time; cancelled");
                abort.abort();
            }
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if tokio::time::timeout(remaining, self.scheduler.shutdown())
            .await
            .is_err()
        {
            warn!("scheduler did not drain in time; in-flight jobs abandoned");
        }
        self.publisher.shutdown().await;
        info!("pipeline stopped");
    }

    /// Stream-specific assembler settings: shared thresholds, the stream's
    /// declared clock.
    fn assembler_config_for(&self, format: &StreamFormat) -> AssemblerConfig {
        AssemblerConfig {
            sample_rate: format.sample_rate,
            frame_ms: format.frame_ms,
            partial_interval_frames: self
                .config
                .partials
                .enabled
                .then(|| (self.config.partials.interval_ms / format.frame_ms).max(1)),
            ..self.config.assembler_config()
        }
    }
}

/// Per-stream task: intake, assembly, submission.
async fn stream_task(
    id: StreamId,
    mut session: StreamSession,
    mut rx: mpsc::Receiver<StreamInput>,
    done: oneshot::Sender<()>,
    scheduler: Arc<TranscriptionScheduler>,
    publisher: Arc<ResultPublisher>,
    streams: StreamRegistry,
) {
    let mut graceful = false;
    while let Some(input) = rx.recv().await {
        match input {
            StreamInput::Bytes(bytes) => {
                let events = session.ingest(&bytes);
                handle_events(&id, events, &scheduler, &publisher).await;
            }
            StreamInput::Close => {
                graceful = true;
                break;
            }
        }
    }

    if graceful {
        // End-of-stream force-closes the accumulating segment; its result
        // still reaches the sinks before the stream is deregistered.
        match session.finish() {
            Ok(events) => handle_events(&id, events, &scheduler, &publisher).await,
            Err(error) => {
                warn!(stream = %id, %error, "malformed audio at end of stream");
                publisher.live_event(
                    &id,
                    LiveEvent::Error {
                        stage: "audio".to_string(),
                        message: error.to_string(),
                    },
                );
            }
        }
        let grace = Duration::from_millis(defaults::CLOSE_DRAIN_GRACE_MS);
        if !publisher.drain_stream(&id, grace).await {
            warn!(stream = %id, "results still outstanding after close grace");
        }
        publisher.flush().await;
    } else {
        // Handle dropped without close: connection abort. The assembler
        // state is cancelled and any in-flight results will be discarded.
        debug!(stream = %id, "stream aborted");
    }

    publisher.close_stream(&id);
    if let Ok(mut streams) = streams.lock() {
        streams.remove(&id);
    }
    debug!(stream = %id, "stream closed");
    let _ = done.send(());
}

/// Routes assembler events: boundaries and discards to the live channel,
/// segments to the scheduler.
async fn handle_events(
    id: &StreamId,
    events: Vec<AssemblerEvent>,
    scheduler: &TranscriptionScheduler,
    publisher: &ResultPublisher,
) {
    for event in events {
        match event {
            AssemblerEvent::SpeechStart { sequence } => {
                publisher.live_event(id, LiveEvent::SpeechStart { sequence });
            }
            AssemblerEvent::SpeechEnd { sequence } => {
                publisher.live_event(id, LiveEvent::SpeechEnd { sequence });
            }
            AssemblerEvent::Discarded {
                start_sequence,
                end_sequence,
                speech_ms,
            } => {
                publisher.live_event(
                    id,
                    LiveEvent::Discarded {
                        start_sequence,
                        end_sequence,
                        speech_ms,
                    },
                );
            }
            AssemblerEvent::Closed(segment) | AssemblerEvent::Partial(segment) => {
                match scheduler.submit(segment).await {
                    Ok(_) => {}
                    Err(VoxflowError::Overloaded { waited_ms }) => {
                        // The scheduler already surfaced a typed failure for
                        // this segment; the stream itself stays alive.
                        warn!(stream = %id, waited_ms, "segment shed under overload");
                    }
                    Err(error) => {
                        warn!(stream = %id, %error, "segment submission failed");
                    }
                }
            }
        }
    }
}
