//! Circuit handle and circuit reactor
//!
//! Each circuit runs as one task that owns the hop's relay crypto and the
//! circuit-level windows. Streams reach it only through its submission
//! queue; the link reaches it only through its inbound cell mailbox.

use super::cell::{Cell, ChanMsg, CircId, DestroyReason};
use super::crypto::{CircuitKeys, RelayCrypto};
use super::flow_control::{CircuitFlowControl, StreamWindow, WindowParams};
use super::link::LinkShared;
use super::relay_cell::{RelayCell, RelayMsg, StreamId};
use super::stream::{self, DataStream, PendingStream, StreamKind};
use crate::config::LinkConfig;
use crate::error::{Result, TorError};
use crate::signal::CloseSignal;
use futures::channel::mpsc;
use futures::{future, select_biased, FutureExt, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;

/// Most messages a circuit holds back for one stream
///
/// A relay that honours the stream window never has more than a window of
/// DATA unacknowledged, plus the odd control message.
const BACKLOG_LIMIT: usize =
    (StreamWindow::INITIAL_WINDOW + StreamWindow::WINDOW_INCREMENT) as usize;

/// Routing entry for one stream
pub(crate) struct StreamSlot {
    inbound: mpsc::Sender<RelayMsg>,
    closed: CloseSignal,
}

/// A circuit's streams, keyed by stream id
pub(crate) struct StreamTable {
    /// Next id to hand out; 0 once the id space is used up
    next_id: StreamId,
    entries: HashMap<StreamId, StreamSlot>,
    closed: bool,
}

impl StreamTable {
    fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
            closed: false,
        }
    }

    /// Allocate the next stream id and route its relay messages to `inbound`
    ///
    /// Ids are never reused, even after the stream closes.
    pub(crate) fn register(
        &mut self,
        inbound: mpsc::Sender<RelayMsg>,
        closed: CloseSignal,
    ) -> Result<StreamId> {
        if self.closed {
            return Err(TorError::CircuitClosed);
        }
        if self.next_id == 0 {
            return Err(TorError::ResourceExhausted("stream ids".into()));
        }

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.insert(id, StreamSlot { inbound, closed });
        Ok(id)
    }

    pub(crate) fn remove(&mut self, id: StreamId) {
        self.entries.remove(&id);
    }

    /// Hand `msg` to stream `id` without waiting
    fn deliver(&mut self, id: StreamId, msg: RelayMsg) -> Delivery {
        let Some(slot) = self.entries.get_mut(&id) else {
            return Delivery::Unknown;
        };
        match slot.inbound.try_send(msg) {
            Ok(()) => Delivery::Sent,
            Err(e) if e.is_full() => Delivery::Full(e.into_inner()),
            Err(_) => Delivery::Gone,
        }
    }

    /// Ready once stream `id` can take a message; `false` if it is gone
    fn poll_ready(&mut self, id: StreamId, cx: &mut Context<'_>) -> Poll<bool> {
        match self.entries.get_mut(&id) {
            Some(slot) => slot.inbound.poll_ready(cx).map(|r| r.is_ok()),
            None => Poll::Ready(false),
        }
    }

    /// Refuse new streams and hand back every registered one
    fn close_all(&mut self) -> Vec<StreamSlot> {
        self.closed = true;
        self.entries.drain().map(|(_, slot)| slot).collect()
    }
}

/// Handle to an open circuit
///
/// Cheap to clone. The circuit closes on [`Circuit::close`], or once the
/// last handle and every stream on it are gone.
#[derive(Clone)]
pub struct Circuit {
    id: CircId,
    submit: mpsc::Sender<RelayCell>,
    streams: Arc<RwLock<StreamTable>>,
    closed: CloseSignal,
    /// Fired once teardown has finished and `fate` is set
    done: CloseSignal,
    fate: Arc<Mutex<Option<TorError>>>,
    config: LinkConfig,
}

impl Circuit {
    /// Circuit id on the link
    pub fn id(&self) -> CircId {
        self.id
    }

    /// Whether the circuit has been torn down or asked to close
    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }

    /// Send DESTROY and tear the circuit down, with every stream on it
    pub fn close(&self) {
        if self.closed.fire() {
            log::debug!("circ {:#x}: close requested", self.id);
        }
    }

    /// Why the circuit went down, once it has
    pub fn close_reason(&self) -> Option<TorError> {
        self.fate.lock().clone()
    }

    /// Wait for the circuit to go down and report why
    pub async fn wait_closed(&self) -> TorError {
        self.done.wait().await;
        self.close_reason().unwrap_or(TorError::CircuitClosed)
    }

    /// Number of streams currently open or opening
    pub fn stream_count(&self) -> usize {
        self.streams.read().entries.len()
    }

    /// Send the BEGIN for a new stream without waiting for the reply
    pub async fn begin_stream(&self, kind: StreamKind) -> Result<PendingStream> {
        stream::begin(self, kind).await
    }

    /// Open a stream and wait for the relay to accept it
    pub async fn open_stream(&self, kind: StreamKind) -> Result<DataStream> {
        self.begin_stream(kind).await?.connect().await
    }

    /// Open a directory stream (BEGIN_DIR)
    pub async fn begin_dir(&self) -> Result<DataStream> {
        self.open_stream(StreamKind::Directory).await
    }

    /// Open an exit stream to `host:port` (BEGIN)
    pub async fn begin(&self, host: &str, port: u16) -> Result<DataStream> {
        self.open_stream(StreamKind::Exit {
            host: host.to_string(),
            port,
        })
        .await
    }

    pub(crate) fn submit(&self) -> mpsc::Sender<RelayCell> {
        self.submit.clone()
    }

    pub(crate) fn streams(&self) -> &Arc<RwLock<StreamTable>> {
        &self.streams
    }

    pub(crate) fn config(&self) -> &LinkConfig {
        &self.config
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &format_args!("{:#x}", self.id))
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Wait for the next item of `stream`, or forever if there is none to poll
pub(super) async fn next_when<S>(stream: Option<&mut S>) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    match stream {
        Some(s) => s.next().await,
        None => future::pending().await,
    }
}

/// Wait until `sender` has room, or forever if there is none to poll
///
/// Resolves to `false` once the receiving side is gone.
pub(super) async fn ready_when<T>(sender: Option<&mut mpsc::Sender<T>>) -> bool {
    match sender {
        Some(s) => future::poll_fn(|cx| s.poll_ready(cx)).await.is_ok(),
        None => future::pending().await,
    }
}

/// Wait until one of the streams in `backlog` can take a message
async fn backlog_ready(
    streams: &RwLock<StreamTable>,
    backlog: &HashMap<StreamId, VecDeque<RelayMsg>>,
) -> StreamId {
    if backlog.is_empty() {
        return future::pending().await;
    }
    future::poll_fn(|cx| {
        let mut table = streams.write();
        for &id in backlog.keys() {
            if table.poll_ready(id, cx).is_ready() {
                return Poll::Ready(id);
            }
        }
        Poll::Pending
    })
    .await
}

/// Sleep until `deadline`, or forever if there is none
pub(super) async fn stall(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => future::pending().await,
    }
}

/// Outcome of handing a relay message to a stream
enum Delivery {
    Sent,
    /// The stream's mailbox is full; the message comes back
    Full(RelayMsg),
    /// The stream's task has exited
    Gone,
    Unknown,
}

enum Event {
    Closed,
    Backlog(StreamId),
    Inbound(Option<Cell>),
    Submit(Option<RelayCell>),
    Stalled,
}

/// The task behind a [`Circuit`]
#[must_use = "a circuit does nothing until its reactor runs"]
pub(crate) struct CircuitReactor {
    id: CircId,
    crypto: RelayCrypto,
    flow: CircuitFlowControl,
    inbound: mpsc::Receiver<Cell>,
    submit: mpsc::Receiver<RelayCell>,
    outbound: mpsc::Sender<Cell>,
    streams: Arc<RwLock<StreamTable>>,
    /// Messages for streams whose mailbox was full, in arrival order
    backlog: HashMap<StreamId, VecDeque<RelayMsg>>,
    closed: CloseSignal,
    done: CloseSignal,
    fate: Arc<Mutex<Option<TorError>>>,
    link: Arc<LinkShared>,
    window_timeout: Duration,
    /// When the send window last hit zero
    stalled_at: Option<Instant>,
}

impl CircuitReactor {
    /// Install the hop's keys and build the handle/reactor pair
    pub(crate) fn new(
        id: CircId,
        keys: &CircuitKeys,
        inbound: mpsc::Receiver<Cell>,
        closed: CloseSignal,
        link: Arc<LinkShared>,
    ) -> (Circuit, CircuitReactor) {
        let config = link.config().clone();
        let (submit_tx, submit) = mpsc::channel(config.mailbox_capacity);
        let streams = Arc::new(RwLock::new(StreamTable::new()));
        let fate = Arc::new(Mutex::new(None));
        let done = CloseSignal::new();

        let circuit = Circuit {
            id,
            submit: submit_tx,
            streams: Arc::clone(&streams),
            closed: closed.clone(),
            done: done.clone(),
            fate: Arc::clone(&fate),
            config: config.clone(),
        };

        let reactor = CircuitReactor {
            id,
            crypto: RelayCrypto::client(keys),
            flow: CircuitFlowControl::new(),
            inbound,
            submit,
            outbound: link.outbound(),
            streams,
            backlog: HashMap::new(),
            closed,
            done,
            fate,
            link,
            window_timeout: config.window_timeout,
            stalled_at: None,
        };

        (circuit, reactor)
    }

    /// Run until the circuit closes, then tear it down
    pub(crate) async fn run(mut self) {
        let result = self.run_loop().await;
        self.teardown(result).await;
    }

    async fn run_loop(&mut self) -> Result<()> {
        let mut closed = self.closed.wait();
        loop {
            if self.flow.needs_sendme() {
                self.send_sendme().await?;
                continue;
            }

            let deadline = self.stalled_at.map(|t| t + self.window_timeout);
            // No new submissions while the send window is empty
            let submit = if self.flow.can_send() {
                Some(&mut self.submit)
            } else {
                None
            };

            // Inbound cells keep flowing while a slow stream is held back,
            // so SENDMEs still land and the stall timer still runs
            let event = select_biased! {
                _ = closed => Event::Closed,
                id = backlog_ready(&self.streams, &self.backlog).fuse() => Event::Backlog(id),
                cell = self.inbound.next() => Event::Inbound(cell),
                cell = next_when(submit).fuse() => Event::Submit(cell),
                _ = stall(deadline).fuse() => Event::Stalled,
            };

            match event {
                Event::Closed => return Ok(()),
                Event::Backlog(id) => self.flush_backlog(id),
                Event::Inbound(None) => return Err(TorError::LinkClosed),
                Event::Inbound(Some(cell)) => self.handle_cell(cell)?,
                Event::Submit(None) => return Ok(()),
                Event::Submit(Some(cell)) => self.send_relay(cell).await?,
                Event::Stalled => return Err(TorError::Timeout("circuit SENDME")),
            }
        }
    }

    fn handle_cell(&mut self, cell: Cell) -> Result<()> {
        match ChanMsg::decode(&cell)? {
            ChanMsg::Relay(mut body) => {
                let relay = self.crypto.unmarshal(&mut body)?;
                log::trace!(
                    "circ {:#x}: stream {}: received {:?}",
                    self.id,
                    relay.stream_id,
                    relay.msg.command()
                );
                self.dispatch(relay)
            }
            ChanMsg::Destroy { reason } => Err(TorError::circuit_destroyed(reason.0)),
            ChanMsg::Padding => Ok(()),
            other => Err(TorError::Protocol(format!(
                "unexpected {:?} cell on an open circuit",
                other.command()
            ))),
        }
    }

    fn dispatch(&mut self, cell: RelayCell) -> Result<()> {
        let RelayCell { stream_id, msg } = cell;

        if stream_id == 0 {
            return match msg {
                RelayMsg::Sendme { digest } => {
                    let window = self.flow.on_sendme_received(digest)?;
                    self.stalled_at = None;
                    log::debug!("circ {:#x}: SENDME received, send window {}", self.id, window);
                    Ok(())
                }
                RelayMsg::Drop => Ok(()),
                other => Err(TorError::Protocol(format!(
                    "{:?} on stream 0",
                    other.command()
                ))),
            };
        }

        if matches!(msg, RelayMsg::Data(_)) {
            self.flow.on_receive()?;
        }

        // Nothing overtakes what is already held back for this stream
        if let Some(queue) = self.backlog.get_mut(&stream_id) {
            if queue.len() >= BACKLOG_LIMIT {
                return Err(TorError::Protocol(format!(
                    "stream {} overran its receive window",
                    stream_id
                )));
            }
            queue.push_back(msg);
            return Ok(());
        }

        let command = msg.command();
        match self.streams.write().deliver(stream_id, msg) {
            Delivery::Sent => {}
            Delivery::Full(msg) => {
                log::trace!("circ {:#x}: stream {}: mailbox full", self.id, stream_id);
                self.backlog.entry(stream_id).or_default().push_back(msg);
            }
            Delivery::Gone => {
                log::debug!("circ {:#x}: stream {} already gone", self.id, stream_id);
            }
            // The relay may race a stream we already closed
            Delivery::Unknown => log::warn!(
                "circ {:#x}: no stream {}, dropping {:?}",
                self.id,
                stream_id,
                command
            ),
        }
        Ok(())
    }

    /// Move held-back messages to stream `id` until its mailbox fills again
    fn flush_backlog(&mut self, id: StreamId) {
        let Some(mut queue) = self.backlog.remove(&id) else {
            return;
        };
        let mut table = self.streams.write();
        while let Some(msg) = queue.pop_front() {
            match table.deliver(id, msg) {
                Delivery::Sent => {}
                Delivery::Full(msg) => {
                    queue.push_front(msg);
                    self.backlog.insert(id, queue);
                    return;
                }
                Delivery::Gone | Delivery::Unknown => {
                    log::debug!(
                        "circ {:#x}: stream {} gone, dropping {} held messages",
                        self.id,
                        id,
                        queue.len() + 1
                    );
                    return;
                }
            }
        }
    }

    /// Emit a circuit SENDME acknowledging the cell just received
    async fn send_sendme(&mut self) -> Result<()> {
        let digest = self.crypto.inbound_digest();
        self.send_relay(RelayCell::new(0, RelayMsg::Sendme { digest: Some(digest) }))
            .await?;
        self.flow.on_sendme_sent();
        log::debug!(
            "circ {:#x}: SENDME sent, receive window {}",
            self.id,
            self.flow.recv_window()
        );
        Ok(())
    }

    async fn send_relay(&mut self, cell: RelayCell) -> Result<()> {
        let is_data = matches!(cell.msg, RelayMsg::Data(_));
        let (body, digest) = self.crypto.marshal(&cell, &mut rand::thread_rng())?;

        if is_data && self.flow.on_send(Some(digest))? == 0 {
            log::debug!("circ {:#x}: send window exhausted", self.id);
            self.stalled_at = Some(Instant::now());
        }

        log::trace!(
            "circ {:#x}: stream {}: sending {:?}",
            self.id,
            cell.stream_id,
            cell.msg.command()
        );
        let cell = ChanMsg::Relay(body).into_cell(self.id)?;
        self.outbound
            .send(cell)
            .await
            .map_err(|_| TorError::LinkClosed)
    }

    async fn teardown(&mut self, result: Result<()>) {
        let link_closed = self.link.closed().is_fired();
        let (destroy, cause) = match result {
            _ if link_closed => (None, TorError::LinkClosed),
            Ok(()) => (Some(DestroyReason::NONE), TorError::CircuitClosed),
            Err(e @ (TorError::CircuitDestroyed { .. } | TorError::LinkClosed)) => (None, e),
            Err(e @ TorError::Timeout(_)) => (Some(DestroyReason::TIMEOUT), e),
            Err(e) => {
                log::warn!("circ {:#x}: protocol violation: {}", self.id, e);
                (Some(DestroyReason::PROTOCOL), e)
            }
        };

        if let Some(reason) = destroy {
            if let Ok(cell) = (ChanMsg::Destroy { reason }).into_cell(self.id) {
                let _ = self.outbound.send(cell).await;
            }
        }

        self.fate.lock().get_or_insert_with(|| cause.clone());
        self.closed.fire();
        self.submit.close();
        self.link.unregister(self.id);

        let streams = self.streams.write().close_all();
        for slot in &streams {
            slot.closed.fire();
        }
        log::info!(
            "circ {:#x}: closed ({}), {} streams torn down",
            self.id,
            cause,
            streams.len()
        );
        self.done.fire();
    }
}
