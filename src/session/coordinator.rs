//! # Session Coordinator
//!
//! Owns one session from connection upgrade to close. It runs the read loop,
//! feeds the framer, launches the transcoder and both forwarders once the
//! header is accepted, and runs the teardown sequence when the termination
//! signal fires.
//!
//! ## State Machine:
//! ```text
//! Created -> HeaderPending -> Streaming -> Terminating -> Closed
//! ```
//! Transitions only move forward. A session that never gets a valid header
//! goes straight from `HeaderPending` (or `Created`) to `Terminating`.
//!
//! ## Teardown Order:
//! 1. close the input queue
//! 2. wait for the input forwarder to drain it and close the transcoder input (EOF)
//! 3. stop the transcoder (grace period, then kill)
//! 4. wait for the output forwarder to deliver what the transcoder flushed
//! 5. send an error frame if the session failed, then close the connection
//!
//! Every step runs even if an earlier one failed.

use crate::audio::{ContainerHeader, Ingested, StreamFramer};
use crate::config::{StreamConfig, TranscoderConfig};
use crate::error::SessionError;
use crate::session::connection::{Frame, Inbound, Outbound};
use crate::session::input::InputForwarder;
use crate::session::output::OutputForwarder;
use crate::session::queue::{Enqueue, InputQueue, QueueReceiver};
use crate::session::signal::{Termination, TerminationSignal};
use crate::transcoder::{StopOutcome, TranscoderProcess};

use bytes::Bytes;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    HeaderPending,
    Streaming,
    Terminating,
    Closed,
}

/// Summary of a finished session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub reason: Termination,
    pub header: Option<ContainerHeader>,
    /// Payload bytes received after the header, including any rejected by the ceiling
    pub bytes_received: u64,
    /// Bytes written to the transcoder input
    pub bytes_forwarded: u64,
    /// Chunks discarded because the input queue was full
    pub chunks_dropped: u64,
    /// Transcoded bytes sent back to the client
    pub bytes_delivered: u64,
    pub exit: Option<StopOutcome>,
    pub duration: Duration,
}

pub struct Coordinator<I> {
    id: String,
    transcoder: TranscoderConfig,
    stream: StreamConfig,
    inbound: I,
    outbound: Arc<dyn Outbound>,
    signal: TerminationSignal,
    state: SessionState,
    framer: StreamFramer,
    header: Option<ContainerHeader>,
    queue: InputQueue,
    queue_rx: Option<QueueReceiver>,
    process: Option<TranscoderProcess>,
    input_task: Option<JoinHandle<()>>,
    output_task: Option<JoinHandle<()>>,
    bytes_received: u64,
    forwarded: Arc<AtomicU64>,
    delivered: Arc<AtomicU64>,
}

impl<I> Coordinator<I>
where
    I: Inbound,
{
    /// Create a session. The configuration is a snapshot; later config
    /// updates do not reach a running session.
    pub fn new(
        id: impl Into<String>,
        transcoder: TranscoderConfig,
        stream: StreamConfig,
        inbound: I,
        outbound: Arc<dyn Outbound>,
    ) -> Self {
        let (queue, queue_rx) = InputQueue::new(stream.input_queue_capacity);

        Self {
            id: id.into(),
            transcoder,
            stream,
            inbound,
            outbound,
            signal: TerminationSignal::new(),
            state: SessionState::Created,
            framer: StreamFramer::new(),
            header: None,
            queue,
            queue_rx: Some(queue_rx),
            process: None,
            input_task: None,
            output_task: None,
            bytes_received: 0,
            forwarded: Arc::new(AtomicU64::new(0)),
            delivered: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run the session to completion.
    pub async fn run(mut self) -> SessionReport {
        let started = Instant::now();
        debug!(session_id = %self.id, "Session started");

        self.read_loop().await;

        let reason = self.signal.get().unwrap_or(Termination::ClientClosed);
        let exit = self.teardown().await;
        let reason = classify_exit(reason, exit);

        self.finish(&reason).await;

        let report = SessionReport {
            session_id: self.id.clone(),
            reason,
            header: self.header.clone(),
            bytes_received: self.bytes_received,
            bytes_forwarded: self.forwarded.load(Ordering::Relaxed),
            chunks_dropped: self.queue.dropped(),
            bytes_delivered: self.delivered.load(Ordering::Relaxed),
            exit,
            duration: started.elapsed(),
        };

        match &report.reason {
            Termination::Failed(err) => warn!(
                session_id = %report.session_id,
                code = err.code(),
                error = %err,
                bytes_forwarded = report.bytes_forwarded,
                bytes_delivered = report.bytes_delivered,
                "Session failed"
            ),
            reason => info!(
                session_id = %report.session_id,
                reason = %reason,
                bytes_forwarded = report.bytes_forwarded,
                bytes_delivered = report.bytes_delivered,
                chunks_dropped = report.chunks_dropped,
                duration_ms = report.duration.as_millis() as u64,
                "Session closed"
            ),
        }

        report
    }

    /// Read messages until the termination signal fires.
    async fn read_loop(&mut self) {
        let signal = self.signal.clone();

        loop {
            let frame = tokio::select! {
                biased;
                _ = signal.fired() => return,
                frame = self.inbound.recv() => frame,
            };

            match frame {
                None | Some(Ok(Frame::Close)) => {
                    debug!(session_id = %self.id, "Client closed the connection");
                    self.signal.fire(Termination::ClientClosed);
                    return;
                }
                Some(Err(err)) => {
                    self.signal.fail(err);
                    return;
                }
                Some(Ok(Frame::Text(_))) => {
                    debug!(
                        session_id = %self.id,
                        header_validated = self.framer.is_validated(),
                        "Ignoring text message"
                    );
                }
                Some(Ok(Frame::Binary(data))) => {
                    if let Err(err) = self.ingest(data) {
                        self.signal.fail(err);
                    }
                    if self.signal.is_fired() {
                        return;
                    }
                }
            }
        }
    }

    fn ingest(&mut self, data: Bytes) -> Result<(), SessionError> {
        self.transition(SessionState::HeaderPending);

        match self.framer.ingest(data)? {
            Ingested::Pending => Ok(()),
            Ingested::Header { header, payload } => {
                info!(
                    session_id = %self.id,
                    header = %header,
                    byte_rate = header.byte_rate,
                    block_align = header.block_align,
                    "Container header accepted"
                );
                self.header = Some(header.clone());
                self.start_streaming(&header)?;
                self.enqueue(payload);
                Ok(())
            }
            Ingested::Payload(chunk) => {
                self.enqueue(chunk);
                Ok(())
            }
        }
    }

    /// Launch the transcoder and both forwarders.
    fn start_streaming(&mut self, header: &ContainerHeader) -> Result<(), SessionError> {
        let mut process = TranscoderProcess::start(header, &self.transcoder)?;

        let missing = || SessionError::ProcessStart("transcoder pipes unavailable".to_string());
        let sink = process.take_input().ok_or_else(missing)?;
        let source = process.take_output().ok_or_else(missing)?;
        let rx = self.queue_rx.take().ok_or_else(missing)?;

        let input = InputForwarder::new(rx, sink, self.signal.clone(), self.forwarded.clone());
        self.input_task = Some(tokio::spawn(input.run().in_current_span()));

        let output = OutputForwarder::new(
            source,
            self.outbound.clone(),
            self.signal.clone(),
            self.stream.buffer_size,
            self.delivered.clone(),
        );
        self.output_task = Some(tokio::spawn(output.run().in_current_span()));

        self.process = Some(process);
        self.transition(SessionState::Streaming);
        Ok(())
    }

    fn enqueue(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }

        self.bytes_received += chunk.len() as u64;
        if self.bytes_received > self.stream.max_session_bytes {
            warn!(
                session_id = %self.id,
                received = self.bytes_received,
                limit = self.stream.max_session_bytes,
                "Session byte limit exceeded"
            );
            self.signal.fire(Termination::ByteLimit);
            return;
        }

        if self.queue.try_enqueue(chunk) == Enqueue::Closed {
            debug!(session_id = %self.id, "Input forwarder gone, chunk discarded");
        }
    }

    /// Steps 1-4 of teardown. Returns how the transcoder ended, if one ran.
    async fn teardown(&mut self) -> Option<StopOutcome> {
        self.transition(SessionState::Terminating);
        let grace = self.stream.stop_grace();

        // Nothing reads the connection from here on
        self.inbound.close();

        self.queue.close();
        if let Some(task) = self.input_task.take() {
            join_or_abort("input forwarder", task, grace).await;
        }

        let exit = match self.process.as_mut() {
            Some(process) => Some(process.stop(grace).await),
            None => None,
        };

        if let Some(task) = self.output_task.take() {
            join_or_abort("output forwarder", task, grace).await;
        }

        exit
    }

    /// Step 5: report a failure to the client and close the connection.
    async fn finish(&mut self, reason: &Termination) {
        if let Some(err) = reason.error() {
            let frame = json!({
                "type": "error",
                "code": err.code(),
                "message": err.to_string(),
            });
            if let Err(send_err) = self.outbound.send_text(frame.to_string()).await {
                debug!(session_id = %self.id, error = %send_err, "Could not send error frame");
            }
        }

        self.outbound.close().await;
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, next: SessionState) {
        if next <= self.state {
            return;
        }
        debug!(session_id = %self.id, from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }
}

/// A transcoder that exited unsuccessfully crashed. The crash shows up first
/// either as end of output or as a broken input pipe, whichever worker noticed.
fn classify_exit(reason: Termination, exit: Option<StopOutcome>) -> Termination {
    let failed = exit
        .and_then(|outcome| outcome.status())
        .filter(|status| !status.success());

    match (reason, failed) {
        (Termination::Completed, Some(status))
        | (Termination::Failed(SessionError::InputPipe(_)), Some(status)) => {
            Termination::Failed(SessionError::ProcessExit(status.to_string()))
        }
        (reason, _) => reason,
    }
}

async fn join_or_abort(worker: &str, mut task: JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(worker, error = %err, "Session worker panicked"),
        Err(_) => {
            warn!(worker, "Session worker did not finish in time, aborting");
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::connection::testing::RecordingOutbound;
    use crate::session::connection::ChannelInbound;

    fn shell(script: &str) -> TranscoderConfig {
        TranscoderConfig {
            wrapper_args: vec!["sh".into(), "-c".into(), script.into()],
            ..TranscoderConfig::default()
        }
    }

    fn stream() -> StreamConfig {
        StreamConfig {
            buffer_size: 4096,
            stop_grace_ms: 3000,
            ..StreamConfig::default()
        }
    }

    fn header() -> Vec<u8> {
        ContainerHeader::encode(2, 44100, 16, 0)
    }

    fn binary(bytes: Vec<u8>) -> Result<Frame, SessionError> {
        Ok(Frame::Binary(Bytes::from(bytes)))
    }

    /// Feed `frames`, then close the client side, and run the session.
    async fn run_closed(
        frames: Vec<Result<Frame, SessionError>>,
        transcoder: TranscoderConfig,
        stream: StreamConfig,
    ) -> (SessionReport, Arc<RecordingOutbound>) {
        let (tx, inbound) = ChannelInbound::new();
        for frame in frames {
            tx.send(frame).unwrap();
        }
        drop(tx);

        let outbound = Arc::new(RecordingOutbound::default());
        let coordinator = Coordinator::new("test", transcoder, stream, inbound, outbound.clone());
        let report = tokio::time::timeout(Duration::from_secs(20), coordinator.run())
            .await
            .expect("session did not finish");
        (report, outbound)
    }

    #[tokio::test]
    async fn test_two_payload_messages_pass_through_unchanged() {
        let first: Vec<u8> = (0..8192).map(|i| (i % 256) as u8).collect();
        let second: Vec<u8> = (0..8192).map(|i| (255 - i % 256) as u8).collect();

        let (report, outbound) = run_closed(
            vec![binary(header()), binary(first.clone()), binary(second.clone())],
            shell("exec cat"),
            stream(),
        )
        .await;

        assert_eq!(report.reason, Termination::ClientClosed);
        assert_eq!(report.header.as_ref().unwrap().sample_rate, 44100);
        assert_eq!(report.bytes_received, 16384);
        assert_eq!(report.bytes_forwarded, 16384);
        assert_eq!(report.chunks_dropped, 0);

        // Closing the input let the echo transcoder flush everything back
        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(outbound.delivered(), expected);
        assert_eq!(report.bytes_delivered, 16384);
        assert!(matches!(report.exit, Some(StopOutcome::Exited(s)) if s.success()));
        assert!(outbound.texts().is_empty());
        assert_eq!(outbound.close_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_header_split_and_payload_in_same_message() {
        let bytes = header();
        let mut tail = bytes[20..].to_vec();
        tail.extend_from_slice(b"abcdef");

        let (report, outbound) = run_closed(
            vec![
                Ok(Frame::Text("hello".into())),
                binary(bytes[..20].to_vec()),
                binary(tail),
                Ok(Frame::Text("ignored".into())),
                binary(b"ghij".to_vec()),
            ],
            shell("exec cat"),
            stream(),
        )
        .await;

        assert_eq!(report.reason, Termination::ClientClosed);
        assert_eq!(outbound.delivered(), b"abcdefghij");
    }

    #[tokio::test]
    async fn test_invalid_header_forwards_nothing() {
        let mut bad = header();
        bad[8..12].copy_from_slice(b"WAVX");
        bad.extend_from_slice(&[9u8; 512]);

        let (report, outbound) = run_closed(
            vec![binary(bad), binary(vec![1u8; 512])],
            shell("exec cat"),
            stream(),
        )
        .await;

        assert!(matches!(
            report.reason,
            Termination::Failed(SessionError::InvalidFormat(_))
        ));
        assert!(report.exit.is_none());
        assert_eq!(report.bytes_forwarded, 0);
        assert!(outbound.delivered().is_empty());

        let texts = outbound.texts();
        assert_eq!(texts.len(), 1);
        let frame: serde_json::Value = serde_json::from_str(&texts[0]).unwrap();
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["code"], "invalid_format");
        assert!(outbound.is_closed());
    }

    #[tokio::test]
    async fn test_byte_ceiling_stops_forwarding() {
        let limited = StreamConfig {
            max_session_bytes: 10_000,
            ..stream()
        };

        let (report, outbound) = run_closed(
            vec![
                binary(header()),
                binary(vec![1u8; 8192]),
                binary(vec![2u8; 8192]),
                binary(vec![3u8; 8192]),
            ],
            shell("exec cat"),
            limited,
        )
        .await;

        assert_eq!(report.reason, Termination::ByteLimit);
        assert_eq!(report.bytes_forwarded, 8192);
        assert_eq!(outbound.delivered(), vec![1u8; 8192]);
        assert!(outbound.texts().is_empty());
    }

    #[tokio::test]
    async fn test_missing_transcoder_is_process_start_error() {
        let transcoder = TranscoderConfig {
            ffmpeg_path: "/nonexistent/ffmpeg".into(),
            ..TranscoderConfig::default()
        };

        let (report, outbound) = run_closed(
            vec![binary(header()), binary(vec![0u8; 64])],
            transcoder,
            stream(),
        )
        .await;

        assert!(matches!(
            report.reason,
            Termination::Failed(SessionError::ProcessStart(_))
        ));
        assert!(report.exit.is_none());
        assert_eq!(report.bytes_forwarded, 0);
        assert!(outbound.texts()[0].contains("process_start_error"));
    }

    #[tokio::test]
    async fn test_transcoder_crash_is_process_exit_error() {
        let (tx, inbound) = ChannelInbound::new();
        tx.send(binary(header())).unwrap();

        let outbound = Arc::new(RecordingOutbound::default());
        let coordinator =
            Coordinator::new("crash", shell("exit 3"), stream(), inbound, outbound.clone());
        let report = tokio::time::timeout(Duration::from_secs(20), coordinator.run())
            .await
            .expect("session did not finish");
        drop(tx);

        assert!(matches!(
            report.reason,
            Termination::Failed(SessionError::ProcessExit(_))
        ));
        assert!(outbound.texts()[0].contains("process_exit_error"));
    }

    #[tokio::test]
    async fn test_transcoder_crash_mid_stream_is_process_exit_error() {
        let (tx, inbound) = ChannelInbound::new();
        tx.send(binary(header())).unwrap();
        for i in 0..64u8 {
            tx.send(binary(vec![i; 8192])).unwrap();
        }

        let outbound = Arc::new(RecordingOutbound::default());
        let coordinator = Coordinator::new(
            "crash-mid-stream",
            shell("head -c 100 >/dev/null; exit 3"),
            stream(),
            inbound,
            outbound.clone(),
        );
        let report = tokio::time::timeout(Duration::from_secs(20), coordinator.run())
            .await
            .expect("session did not finish");

        assert!(matches!(
            report.reason,
            Termination::Failed(SessionError::ProcessExit(_))
        ));
        assert!(matches!(report.exit, Some(StopOutcome::Exited(s)) if s.code() == Some(3)));
        assert!(report.bytes_forwarded < report.bytes_received);
        assert!(outbound.texts()[0].contains("process_exit_error"));
        drop(tx);
    }

    #[test]
    fn test_broken_pipe_without_failed_exit_keeps_its_reason() {
        use std::os::unix::process::ExitStatusExt;

        let pipe = Termination::Failed(SessionError::InputPipe("broken pipe".into()));
        let ok = Some(StopOutcome::Exited(std::process::ExitStatus::from_raw(0)));
        assert_eq!(classify_exit(pipe.clone(), ok), pipe);
        assert_eq!(classify_exit(pipe.clone(), Some(StopOutcome::Killed)), pipe);

        let crashed = Some(StopOutcome::Exited(std::process::ExitStatus::from_raw(3 << 8)));
        assert!(matches!(
            classify_exit(pipe, crashed),
            Termination::Failed(SessionError::ProcessExit(_))
        ));
        assert_eq!(
            classify_exit(Termination::ClientClosed, crashed),
            Termination::ClientClosed
        );
    }

    #[tokio::test]
    async fn test_clean_transcoder_exit_completes_session() {
        let (tx, inbound) = ChannelInbound::new();
        tx.send(binary(header())).unwrap();

        let outbound = Arc::new(RecordingOutbound::default());
        let coordinator = Coordinator::new(
            "done",
            shell("printf fragment"),
            stream(),
            inbound,
            outbound.clone(),
        );
        let report = tokio::time::timeout(Duration::from_secs(20), coordinator.run())
            .await
            .expect("session did not finish");
        drop(tx);

        assert_eq!(report.reason, Termination::Completed);
        assert_eq!(outbound.delivered(), b"fragment");
        assert!(outbound.is_closed());
    }

    #[tokio::test]
    async fn test_connection_error_ends_session() {
        let (report, outbound) = run_closed(
            vec![
                binary(header()),
                Err(SessionError::Connection("protocol violation".into())),
                binary(vec![5u8; 128]),
            ],
            shell("exec cat"),
            stream(),
        )
        .await;

        assert_eq!(
            report.reason,
            Termination::Failed(SessionError::Connection("protocol violation".into()))
        );
        assert_eq!(report.bytes_forwarded, 0);
        assert!(outbound.texts()[0].contains("connection_error"));
    }

    #[tokio::test]
    async fn test_output_delivery_failure_ends_session() {
        let (tx, inbound) = ChannelInbound::new();
        tx.send(binary(header())).unwrap();
        tx.send(binary(vec![7u8; 1024])).unwrap();

        let outbound = Arc::new(RecordingOutbound::default());
        outbound.fail_binary.store(true, Ordering::SeqCst);
        let coordinator =
            Coordinator::new("deliver", shell("exec cat"), stream(), inbound, outbound.clone());
        let report = tokio::time::timeout(Duration::from_secs(20), coordinator.run())
            .await
            .expect("session did not finish");
        drop(tx);

        assert!(matches!(
            report.reason,
            Termination::Failed(SessionError::OutputDelivery(_))
        ));
        assert_eq!(report.bytes_delivered, 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_chunks_but_keeps_order() {
        const CHUNK: usize = 4096;
        let tight = StreamConfig {
            input_queue_capacity: 1,
            ..stream()
        };

        let mut frames = vec![binary(header())];
        for i in 0..60u8 {
            frames.push(binary(vec![i; CHUNK]));
        }

        let (report, outbound) = run_closed(frames, shell("sleep 0.3; exec cat"), tight).await;

        assert_eq!(report.reason, Termination::ClientClosed);
        assert!(report.chunks_dropped > 0);
        assert_eq!(
            report.bytes_forwarded + report.chunks_dropped * CHUNK as u64,
            report.bytes_received
        );

        let delivered = outbound.delivered();
        assert_eq!(delivered.len() as u64, report.bytes_forwarded);
        let order: Vec<u8> = delivered.chunks(CHUNK).map(|c| c[0]).collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
        for chunk in delivered.chunks(CHUNK) {
            assert!(chunk.iter().all(|&b| b == chunk[0]));
        }
    }

    /// Channel inbound that remembers whether the session closed it.
    struct TrackedInbound {
        inner: ChannelInbound,
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Inbound for TrackedInbound {
        async fn recv(&mut self) -> Option<Result<Frame, SessionError>> {
            self.inner.recv().await
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
            self.inner.close();
        }
    }

    #[tokio::test]
    async fn test_teardown_stops_accepting_client_frames() {
        let (tx, inner) = ChannelInbound::new();
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        tx.send(binary(header())).unwrap();
        tx.send(Ok(Frame::Close)).unwrap();

        let inbound = TrackedInbound {
            inner,
            closed: closed.clone(),
        };
        let outbound = Arc::new(RecordingOutbound::default());
        let coordinator =
            Coordinator::new("tracked", shell("exec cat"), stream(), inbound, outbound.clone());
        let report = tokio::time::timeout(Duration::from_secs(20), coordinator.run())
            .await
            .expect("session did not finish");

        assert_eq!(report.reason, Termination::ClientClosed);
        assert!(closed.load(Ordering::SeqCst));
        assert!(tx.send(binary(vec![1u8; 16])).is_err());
    }

    #[test]
    fn test_states_only_move_forward() {
        assert!(SessionState::Created < SessionState::HeaderPending);
        assert!(SessionState::HeaderPending < SessionState::Streaming);
        assert!(SessionState::Streaming < SessionState::Terminating);
        assert!(SessionState::Terminating < SessionState::Closed);
    }
}
