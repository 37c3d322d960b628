//! Tor stream management
//!
//! Opens streams through a circuit and provides an AsyncRead/AsyncWrite
//! interface over them. Each open stream runs its own task that owns the
//! stream-level windows (500-cell initial window, 50-cell SENDME
//! increments) and moves bytes between the application and the circuit.

use super::circuit::{next_when, ready_when, stall, Circuit, StreamTable};
use super::flow_control::StreamFlowControl;
use super::relay_cell::{EndReason, RelayCell, RelayMsg, StreamId, RELAY_PAYLOAD_MAX};
use super::cell::CircId;
use crate::error::{Result, TorError};
use crate::signal::CloseSignal;
use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncWrite};
use futures::{future, select_biased, FutureExt, SinkExt, StreamExt};
use parking_lot::RwLock;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;

/// What a new stream connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    /// The relay's own directory service (BEGIN_DIR)
    Directory,
    /// A TCP destination reached through the exit (BEGIN)
    Exit { host: String, port: u16 },
}

impl StreamKind {
    fn begin_msg(&self) -> RelayMsg {
        match self {
            StreamKind::Directory => RelayMsg::BeginDir,
            StreamKind::Exit { host, port } => RelayMsg::Begin {
                target: format!("{}:{}", host, port),
                flags: 0,
            },
        }
    }
}

/// Lifecycle of a stream
///
/// OPENING until the relay answers CONNECTED, OPEN while data flows, and
/// CLOSED for good after an END either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    Opening = 0,
    Open = 1,
    Closed = 2,
}

impl From<u8> for StreamState {
    fn from(v: u8) -> Self {
        match v {
            0 => StreamState::Opening,
            1 => StreamState::Open,
            _ => StreamState::Closed,
        }
    }
}

/// State visible to both a stream's handle and its task
struct StreamShared {
    id: StreamId,
    circ_id: CircId,
    state: AtomicU8,
    closed: CloseSignal,
}

impl StreamShared {
    fn state(&self) -> StreamState {
        self.state.load(Ordering::Acquire).into()
    }

    /// OPENING -> OPEN; fails if the stream already closed
    fn mark_open(&self) -> bool {
        self.state
            .compare_exchange(
                StreamState::Opening as u8,
                StreamState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Enter CLOSED and wake everything waiting on the stream
    fn close(&self) -> bool {
        self.state.store(StreamState::Closed as u8, Ordering::Release);
        self.closed.fire()
    }
}

/// Allocate a stream on `circuit` and send its BEGIN
pub(crate) async fn begin(circuit: &Circuit, kind: StreamKind) -> Result<PendingStream> {
    let msg = kind.begin_msg();
    // Reject a target that cannot be encoded before it reaches the circuit
    msg.encode_body()?;

    let (inbound_tx, inbound) = mpsc::channel(circuit.config().mailbox_capacity);
    let closed = CloseSignal::new();
    let id = circuit.streams().write().register(inbound_tx, closed.clone())?;

    let pending = PendingStream {
        shared: Arc::new(StreamShared {
            id,
            circ_id: circuit.id(),
            state: AtomicU8::new(StreamState::Opening as u8),
            closed,
        }),
        circuit: circuit.clone(),
        inbound: Some(inbound),
    };

    log::debug!("circ {:#x}: stream {}: opening {:?}", circuit.id(), id, kind);
    circuit
        .submit()
        .send(RelayCell::new(id, msg))
        .await
        .map_err(|_| TorError::CircuitClosed)?;

    Ok(pending)
}

/// A stream whose BEGIN has been sent but not yet answered
///
/// Dropping it abandons the stream.
pub struct PendingStream {
    shared: Arc<StreamShared>,
    circuit: Circuit,
    inbound: Option<mpsc::Receiver<RelayMsg>>,
}

impl PendingStream {
    pub fn stream_id(&self) -> StreamId {
        self.shared.id
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Wait for CONNECTED and start moving data
    ///
    /// Any other reply, a closed circuit, or no reply within the configured
    /// open timeout fails the open and unregisters the stream.
    pub async fn connect(mut self) -> Result<DataStream> {
        let mut inbound = self.inbound.take().ok_or(TorError::StreamNotOpen)?;
        let timeout = self.circuit.config().stream_open_timeout;

        let reply = match tokio::time::timeout(timeout, inbound.next()).await {
            Err(_) => Err((TorError::Timeout("CONNECTED"), true)),
            Ok(None) => Err((TorError::CircuitClosed, false)),
            Ok(Some(RelayMsg::Connected(_))) => Ok(()),
            Ok(Some(RelayMsg::End { reason })) => Err((
                TorError::StreamOpenFailed(format!("relay ended the stream, reason {}", reason.0)),
                false,
            )),
            Ok(Some(other)) => Err((
                TorError::StreamOpenFailed(format!("unexpected {:?}", other.command())),
                true,
            )),
        };

        if let Err((e, send_end)) = reply {
            log::debug!(
                "circ {:#x}: stream {}: open failed: {}",
                self.shared.circ_id,
                self.shared.id,
                e
            );
            self.abandon();
            if send_end {
                let end = self.end_cell();
                if self.circuit.submit().send(end).await.is_err() {
                    log::debug!(
                        "circ {:#x}: stream {}: circuit gone before END",
                        self.shared.circ_id,
                        self.shared.id
                    );
                }
            }
            return Err(e);
        }

        if !self.shared.mark_open() {
            self.abandon();
            return Err(TorError::StreamNotOpen);
        }
        log::debug!(
            "circ {:#x}: stream {}: open",
            self.shared.circ_id,
            self.shared.id
        );

        let config = self.circuit.config();
        let (writes_tx, writes) = mpsc::channel(config.mailbox_capacity);
        let (pipe, reads) = mpsc::channel(config.mailbox_capacity);

        let reactor = StreamReactor {
            shared: Arc::clone(&self.shared),
            flow: StreamFlowControl::new(),
            inbound,
            writes,
            pipe,
            submit: self.circuit.submit(),
            outgoing: None,
            undelivered: None,
            streams: Arc::clone(self.circuit.streams()),
            window_timeout: config.window_timeout,
            stalled_at: None,
        };
        tokio::spawn(reactor.run());

        Ok(DataStream {
            shared: Arc::clone(&self.shared),
            writes: writes_tx,
            reads,
            chunk: Vec::new(),
            pos: 0,
        })
    }

    /// Close the stream and forget its id
    fn abandon(&self) {
        self.shared.close();
        self.circuit.streams().write().remove(self.shared.id);
    }

    fn end_cell(&self) -> RelayCell {
        RelayCell::new(self.shared.id, RelayMsg::End { reason: EndReason::DONE })
    }
}

impl Drop for PendingStream {
    fn drop(&mut self) {
        if self.shared.state() != StreamState::Opening {
            return;
        }
        self.abandon();

        let (circ_id, id) = (self.shared.circ_id, self.shared.id);
        let mut submit = self.circuit.submit();
        match submit.try_send(self.end_cell()) {
            Ok(()) => {}
            Err(e) if e.is_full() => match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let end = e.into_inner();
                    // Queue full; wait for room off the dropping thread
                    runtime.spawn(async move {
                        if submit.send(end).await.is_err() {
                            log::debug!("circ {:#x}: stream {}: circuit gone", circ_id, id);
                        }
                    });
                }
                Err(_) => log::warn!(
                    "circ {:#x}: stream {}: circuit queue full, END not sent",
                    circ_id,
                    id
                ),
            },
            Err(_) => log::debug!("circ {:#x}: stream {}: circuit gone before END", circ_id, id),
        }
    }
}

impl std::fmt::Debug for PendingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingStream")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// An open application stream
///
/// Reads return 0 once the relay has ended the stream. Dropping the
/// handle closes the stream.
pub struct DataStream {
    shared: Arc<StreamShared>,
    writes: mpsc::Sender<Vec<u8>>,
    reads: mpsc::Receiver<Vec<u8>>,
    /// Partly consumed DATA payload
    chunk: Vec<u8>,
    pos: usize,
}

impl DataStream {
    pub fn stream_id(&self) -> StreamId {
        self.shared.id
    }

    pub fn circuit_id(&self) -> CircId {
        self.shared.circ_id
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state() == StreamState::Closed
    }

    /// Queue `data` for sending as DATA cells of at most 498 bytes
    ///
    /// If the stream closes part way, the error carries how many bytes had
    /// already been queued.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.shared.state() != StreamState::Open {
            return Err(TorError::StreamNotOpen);
        }

        let mut written = 0;
        for chunk in data.chunks(RELAY_PAYLOAD_MAX) {
            let mut closed = self.shared.closed.wait();
            let sent = select_biased! {
                _ = closed => false,
                r = self.writes.send(chunk.to_vec()).fuse() => r.is_ok(),
            };
            if !sent {
                return Err(TorError::StreamClosed { written });
            }
            written += chunk.len();
        }
        Ok(written)
    }

    /// Read into `buf`, waiting until data arrives or the stream ends
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(future::poll_fn(|cx| self.poll_fill(cx, buf)).await)
    }

    /// Send END and close the stream; further writes fail
    pub fn close(&mut self) {
        if self.shared.close() {
            log::debug!(
                "circ {:#x}: stream {}: closed locally",
                self.shared.circ_id,
                self.shared.id
            );
        }
        self.reads.close();
    }

    /// Wait until the stream is closed from either end
    pub async fn wait_closed(&self) {
        self.shared.closed.wait().await
    }

    fn poll_fill(&mut self, cx: &mut Context<'_>, buf: &mut [u8]) -> Poll<usize> {
        if buf.is_empty() {
            return Poll::Ready(0);
        }

        while self.pos == self.chunk.len() {
            match self.reads.poll_next_unpin(cx) {
                Poll::Ready(Some(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Poll::Ready(None) => return Poll::Ready(0),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Poll::Ready(n)
    }
}

impl Drop for DataStream {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for DataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStream")
            .field("circuit", &format_args!("{:#x}", self.shared.circ_id))
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .finish()
    }
}

fn io_error(e: TorError) -> io::Error {
    let kind = match e {
        TorError::StreamNotOpen => io::ErrorKind::NotConnected,
        TorError::StreamClosed { .. } => io::ErrorKind::BrokenPipe,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

impl AsyncRead for DataStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().poll_fill(cx, buf).map(Ok)
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.shared.state() != StreamState::Open {
            return Poll::Ready(Err(io_error(TorError::StreamNotOpen)));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        match this.writes.poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(io_error(TorError::StreamClosed { written: 0 })))
            }
            Poll::Ready(Ok(())) => {}
        }

        let n = buf.len().min(RELAY_PAYLOAD_MAX);
        this.writes
            .start_send(buf[..n].to_vec())
            .map_err(|_| io_error(TorError::StreamClosed { written: 0 }))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().close();
        Poll::Ready(Ok(()))
    }
}

enum Event {
    Closed,
    /// The circuit can take the cell in hand
    Submit(bool),
    /// The application can take the payload in hand
    Pipe(bool),
    Inbound(Option<RelayMsg>),
    Write(Option<Vec<u8>>),
    Stalled,
}

/// How a stream's task came to stop
enum Ending {
    /// Closed by the application
    Local,
    /// The relay sent END
    Remote(EndReason),
    /// The circuit went away underneath us
    CircuitGone,
    Failed(TorError),
}

/// The task behind a [`DataStream`]
///
/// Never waits outside its select: a full circuit queue or a slow reader
/// holds one cell back while inbound messages, close and the window
/// timer stay live.
struct StreamReactor {
    shared: Arc<StreamShared>,
    flow: StreamFlowControl,
    inbound: mpsc::Receiver<RelayMsg>,
    /// Application writes waiting to become DATA cells
    writes: mpsc::Receiver<Vec<u8>>,
    /// DATA payloads waiting to be read by the application
    pipe: mpsc::Sender<Vec<u8>>,
    submit: mpsc::Sender<RelayCell>,
    /// Message waiting for room in the circuit's queue
    outgoing: Option<RelayMsg>,
    /// Payload waiting for room in the read pipe
    undelivered: Option<Vec<u8>>,
    streams: Arc<RwLock<StreamTable>>,
    window_timeout: Duration,
    /// When the send window last hit zero
    stalled_at: Option<Instant>,
}

impl StreamReactor {
    async fn run(mut self) {
        let ending = self.run_loop().await;
        self.finish(ending).await;
    }

    async fn run_loop(&mut self) -> Ending {
        let (circ_id, id) = (self.shared.circ_id, self.shared.id);
        let mut closed = self.shared.closed.wait();
        loop {
            if self.outgoing.is_none() && self.flow.needs_sendme() {
                self.outgoing = Some(RelayMsg::Sendme { digest: None });
                self.flow.on_sendme_sent();
                log::debug!("circ {:#x}: stream {}: SENDME queued", circ_id, id);
            }

            let deadline = self.stalled_at.map(|t| t + self.window_timeout);
            let (submit, writes) = match self.outgoing {
                Some(_) => (Some(&mut self.submit), None),
                None if self.flow.can_send() => (None, Some(&mut self.writes)),
                None => (None, None),
            };
            // Payloads stay in order behind one the reader has not taken
            let (pipe, inbound) = match self.undelivered {
                Some(_) => (Some(&mut self.pipe), None),
                None => (None, Some(&mut self.inbound)),
            };

            let event = select_biased! {
                _ = closed => Event::Closed,
                ready = ready_when(submit).fuse() => Event::Submit(ready),
                ready = ready_when(pipe).fuse() => Event::Pipe(ready),
                msg = next_when(inbound).fuse() => Event::Inbound(msg),
                data = next_when(writes).fuse() => Event::Write(data),
                _ = stall(deadline).fuse() => Event::Stalled,
            };

            match event {
                // The circuit shuts its submission queue before closing streams
                Event::Closed if self.submit.is_closed() => return Ending::CircuitGone,
                Event::Closed | Event::Write(None) => return Ending::Local,
                Event::Submit(ready) => {
                    let sent = match self.outgoing.take() {
                        Some(msg) if ready => {
                            self.submit.start_send(RelayCell::new(id, msg)).is_ok()
                        }
                        _ => ready,
                    };
                    if !sent {
                        return Ending::CircuitGone;
                    }
                }
                Event::Pipe(ready) => {
                    let delivered = match self.undelivered.take() {
                        Some(data) if ready => self.pipe.start_send(data).is_ok(),
                        _ => ready,
                    };
                    // Nobody left to read
                    if !delivered {
                        return Ending::Local;
                    }
                }
                Event::Inbound(None) => return Ending::CircuitGone,
                Event::Inbound(Some(msg)) => match self.handle(msg) {
                    Ok(None) => {}
                    Ok(Some(ending)) => return ending,
                    Err(e) => return Ending::Failed(e),
                },
                Event::Write(Some(data)) => {
                    if let Err(e) = self.queue_data(data) {
                        return Ending::Failed(e);
                    }
                }
                Event::Stalled => return Ending::Failed(TorError::Timeout("stream SENDME")),
            }
        }
    }

    /// Handle one relay message routed from the circuit
    fn handle(&mut self, msg: RelayMsg) -> Result<Option<Ending>> {
        match msg {
            RelayMsg::Data(data) => {
                self.flow.on_receive()?;
                if data.is_empty() {
                    return Ok(None);
                }
                match self.pipe.try_send(data) {
                    Ok(()) => {}
                    Err(e) if e.is_full() => self.undelivered = Some(e.into_inner()),
                    Err(_) => return Ok(Some(Ending::Local)),
                }
                Ok(None)
            }
            RelayMsg::End { reason } => Ok(Some(Ending::Remote(reason))),
            RelayMsg::Sendme { .. } => {
                let window = self.flow.on_sendme_received(None)?;
                self.stalled_at = None;
                log::debug!(
                    "circ {:#x}: stream {}: SENDME received, send window {}",
                    self.shared.circ_id,
                    self.shared.id,
                    window
                );
                Ok(None)
            }
            other => {
                log::warn!(
                    "circ {:#x}: stream {}: ignoring unexpected {:?}",
                    self.shared.circ_id,
                    self.shared.id,
                    other.command()
                );
                Ok(None)
            }
        }
    }

    /// Take `data` as the next DATA cell, charging the send window
    fn queue_data(&mut self, data: Vec<u8>) -> Result<()> {
        if self.flow.on_send(None)? == 0 {
            log::debug!(
                "circ {:#x}: stream {}: send window exhausted",
                self.shared.circ_id,
                self.shared.id
            );
            self.stalled_at = Some(Instant::now());
        }
        self.outgoing = Some(RelayMsg::Data(data));
        Ok(())
    }

    async fn feed(&mut self, msg: RelayMsg) -> Result<()> {
        self.submit
            .feed(RelayCell::new(self.shared.id, msg))
            .await
            .map_err(|_| TorError::CircuitClosed)
    }

    async fn finish(&mut self, ending: Ending) {
        let (circ_id, id) = (self.shared.circ_id, self.shared.id);
        // Releases anything the circuit still holds for us
        self.inbound.close();
        let outgoing = self.outgoing.take();

        let end = match ending {
            Ending::Local => {
                // Data the application queued before closing still goes out
                self.writes.close();
                let mut pending = outgoing;
                loop {
                    if let Some(msg) = pending.take() {
                        if self.feed(msg).await.is_err() {
                            break;
                        }
                    }
                    if !self.flow.can_send() {
                        break;
                    }
                    match self.writes.try_recv() {
                        Ok(data) if self.flow.on_send(None).is_ok() => {
                            pending = Some(RelayMsg::Data(data))
                        }
                        _ => break,
                    }
                }
                log::debug!("circ {:#x}: stream {}: closed locally", circ_id, id);
                Some(EndReason::DONE)
            }
            Ending::Remote(reason) => {
                log::debug!(
                    "circ {:#x}: stream {}: ended by relay, reason {}",
                    circ_id,
                    id,
                    reason.0
                );
                None
            }
            Ending::CircuitGone => {
                log::debug!("circ {:#x}: stream {}: circuit closed", circ_id, id);
                None
            }
            Ending::Failed(e) => {
                log::warn!("circ {:#x}: stream {}: {}", circ_id, id, e);
                Some(match e {
                    TorError::Timeout(_) => EndReason::TIMEOUT,
                    _ => EndReason::TORPROTOCOL,
                })
            }
        };

        if let Some(reason) = end {
            let _ = self.feed(RelayMsg::End { reason }).await;
        }

        self.shared.close();
        self.streams.write().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_messages() {
        assert_eq!(StreamKind::Directory.begin_msg(), RelayMsg::BeginDir);
        assert_eq!(
            StreamKind::Exit {
                host: "example.com".into(),
                port: 443
            }
            .begin_msg(),
            RelayMsg::Begin {
                target: "example.com:443".into(),
                flags: 0
            }
        );
    }

    #[test]
    fn test_state_machine() {
        let shared = StreamShared {
            id: 1,
            circ_id: 0x8000_0001,
            state: AtomicU8::new(StreamState::Opening as u8),
            closed: CloseSignal::new(),
        };
        assert_eq!(shared.state(), StreamState::Opening);

        assert!(shared.mark_open());
        assert_eq!(shared.state(), StreamState::Open);
        assert!(!shared.mark_open());

        assert!(shared.close());
        assert_eq!(shared.state(), StreamState::Closed);
        assert!(shared.closed.is_fired());

        // Nothing leaves CLOSED
        assert!(!shared.mark_open());
        assert!(!shared.close());
        assert_eq!(shared.state(), StreamState::Closed);
    }

    #[test]
    fn test_io_error_kinds() {
        assert_eq!(
            io_error(TorError::StreamNotOpen).kind(),
            io::ErrorKind::NotConnected
        );
        assert_eq!(
            io_error(TorError::StreamClosed { written: 3 }).kind(),
            io::ErrorKind::BrokenPipe
        );
    }
}
