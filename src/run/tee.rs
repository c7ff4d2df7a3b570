//! Stream fan-out.
//!
//! A [`StreamTee`] copies one readable stream to any number of sinks in
//! background threads until EOF or an explicit stop. Every sink is fed
//! through a small bounded ring queue drained by its own writer thread, so a
//! slow or broken sink cannot stall the pump; when the queue overflows the
//! oldest chunk is dropped and counted, and the counters are reported on
//! completion.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// A writable target shared between the caller and the pump threads.
pub(crate) type Sink = Arc<Mutex<dyn Write + Send>>;

/// Wraps any writer into a [`Sink`].
pub(crate) fn sink<W: Write + Send + 'static>(writer: W) -> Sink {
    Arc::new(Mutex::new(writer))
}

/// Chunk size for binary-mode copies.
pub(crate) const BINARY_CHUNK: usize = 4096;

/// Bound on the per-sink ring queue, in chunks.
const QUEUE_CHUNKS: usize = 64;

/// How a stream is chopped into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum StreamMode {
    /// Line by line.
    #[default]
    Text,
    /// Fixed buffers of [`BINARY_CHUNK`] bytes.
    Binary,
}

// -------------------------------------------------------------------------------------------------
// CaptureSink
// -------------------------------------------------------------------------------------------------

/// In-memory sink used for the stdout/stderr capture buffers.
#[derive(Clone, Default)]
pub(crate) struct CaptureSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CaptureSink {
    pub(crate) fn new() -> Self {
        CaptureSink::default()
    }

    /// Takes the captured bytes as a lossily-decoded string.
    pub(crate) fn take_string(&self) -> String {
        let mut buf = self
            .buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&std::mem::take(&mut *buf)).into_owned()
    }
}

impl Write for CaptureSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------
// LineSink
// -------------------------------------------------------------------------------------------------

/// Line-buffered sink forwarding complete lines to tracing.
///
/// Used by the `log_to` run scope to route a child's output into the log
/// stream with a `[stdout]` / `[stderr]` tag.
pub(crate) struct LineSink {
    tag: &'static str,
    level: tracing::Level,
    buf: Vec<u8>,
}

impl LineSink {
    pub(crate) fn new(tag: &'static str, level: tracing::Level) -> Self {
        LineSink {
            tag,
            level,
            buf: Vec::new(),
        }
    }

    fn emit(&self, line: &str) {
        match self.level {
            tracing::Level::ERROR => tracing::error!("{} {}", self.tag, line),
            tracing::Level::WARN => tracing::warn!("{} {}", self.tag, line),
            tracing::Level::INFO => tracing::info!("{} {}", self.tag, line),
            tracing::Level::DEBUG => tracing::debug!("{} {}", self.tag, line),
            tracing::Level::TRACE => tracing::trace!("{} {}", self.tag, line),
        }
    }
}

impl Write for LineSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.emit(String::from_utf8_lossy(&line).trim_end_matches(['\n', '\r']));
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineSink {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.emit(String::from_utf8_lossy(&rest).trim_end_matches(['\n', '\r']));
        }
    }
}

// -------------------------------------------------------------------------------------------------
// Ring queue
// -------------------------------------------------------------------------------------------------

struct QueueState {
    chunks: VecDeque<Vec<u8>>,
    dropped: u64,
    closed: bool,
}

struct RingQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl RingQueue {
    fn new() -> Arc<Self> {
        Arc::new(RingQueue {
            state: Mutex::new(QueueState {
                chunks: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        })
    }

    /// Enqueues a chunk, discarding the oldest one when the bound is hit.
    fn push(&self, chunk: Vec<u8>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.chunks.len() >= QUEUE_CHUNKS {
            state.chunks.pop_front();
            state.dropped += 1;
        }
        state.chunks.push_back(chunk);
        self.ready.notify_one();
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        self.ready.notify_one();
    }

    /// Blocks for the next chunk; `None` once closed and drained.
    fn pop(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(chunk) = state.chunks.pop_front() {
                return Some(chunk);
            }
            if state.closed {
                return None;
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn dropped(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dropped
    }
}

// -------------------------------------------------------------------------------------------------
// StreamTee
// -------------------------------------------------------------------------------------------------

/// Completion summary of one tee.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TeeReport {
    /// Total chunks discarded across all sink queues.
    pub(crate) dropped: u64,
}

/// Background copy of a reader into N sinks.
pub(crate) struct StreamTee {
    pump: Option<JoinHandle<io::Result<()>>>,
    writers: Vec<JoinHandle<u64>>,
    stop: Arc<AtomicBool>,
}

impl StreamTee {
    /// Starts the pump thread plus one writer thread per sink.
    pub(crate) fn spawn<R>(source: R, sinks: Vec<Sink>, mode: StreamMode) -> Self
    where
        R: Read + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let queues: Vec<Arc<RingQueue>> = sinks.iter().map(|_| RingQueue::new()).collect();

        let writers = sinks
            .into_iter()
            .zip(queues.iter().cloned())
            .map(|(sink, queue)| thread::spawn(move || drain(queue, sink)))
            .collect();

        let pump_stop = Arc::clone(&stop);
        let pump = thread::spawn(move || pump(source, queues, mode, pump_stop));

        StreamTee {
            pump: Some(pump),
            writers,
            stop,
        }
    }

    /// Requests termination at the next read boundary.
    pub(crate) fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Awaits the pump and all writers, returning the drop counters.
    pub(crate) fn join(mut self) -> TeeReport {
        if let Some(pump) = self.pump.take() {
            match pump.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "stream pump halted on read error"),
                Err(_) => warn!("stream pump thread panicked"),
            }
        }
        let mut report = TeeReport::default();
        for writer in self.writers.drain(..) {
            match writer.join() {
                Ok(dropped) => report.dropped += dropped,
                Err(_) => warn!("sink writer thread panicked"),
            }
        }
        if report.dropped > 0 {
            debug!(dropped = report.dropped, "slow sinks dropped chunks");
        }
        report
    }
}

/// Reads the source chunk by chunk and feeds every queue.
///
/// A read failure halts the pump; the queues are always closed so the
/// writers can drain and exit.
fn pump<R: Read>(
    source: R,
    queues: Vec<Arc<RingQueue>>,
    mode: StreamMode,
    stop: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut reader = BufReader::new(source);
    let result = loop {
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }
        let chunk = match read_chunk(&mut reader, mode) {
            Ok(None) => break Ok(()),
            Ok(Some(chunk)) => chunk,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        };
        for queue in &queues {
            queue.push(chunk.clone());
        }
    };
    for queue in &queues {
        queue.close();
    }
    result
}

fn read_chunk<R: BufRead>(reader: &mut R, mode: StreamMode) -> io::Result<Option<Vec<u8>>> {
    match mode {
        StreamMode::Text => {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line)? {
                0 => Ok(None),
                _ => Ok(Some(line)),
            }
        }
        StreamMode::Binary => {
            let mut buf = vec![0u8; BINARY_CHUNK];
            match reader.read(&mut buf)? {
                0 => Ok(None),
                n => {
                    buf.truncate(n);
                    Ok(Some(buf))
                }
            }
        }
    }
}

/// Writer loop for one sink. Write failures are logged and do not halt the
/// pump; the dropped-chunk count is returned at the end.
fn drain(queue: Arc<RingQueue>, sink: Sink) -> u64 {
    while let Some(chunk) = queue.pop() {
        let mut writer = sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writer.write_all(&chunk).and_then(|_| writer.flush()) {
            warn!(error = %e, "sink write failed, output chunk lost");
        }
    }
    queue.dropped()
}

// -------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------
