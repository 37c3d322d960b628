//! Test support: an in-memory transport and a scripted relay
//!
//! [`duplex`] gives two connected byte streams. [`FakeRelay`] sits on one
//! end and plays the relay side of the link protocol well enough to build
//! circuits, open streams, echo data and keep flow control honest, so a
//! [`Link`] can be exercised without a network.

use crate::config::LinkConfig;
use crate::error::{Result, TorError};
use crate::protocol::{
    Cell, CellCommand, ChanMsg, CircId, CircuitFlowControl, CreateFastServer, DestroyReason,
    EndReason, Link, RelayCell, RelayCrypto, RelayMsg, StreamFlowControl, StreamId,
};
use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::{select_biased, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// One end of an in-memory byte stream
///
/// Writes never block; reads see the peer's writes in order, then EOF
/// once the peer is closed or dropped.
pub struct LocalStream {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

/// Two connected [`LocalStream`]s
pub fn duplex() -> (LocalStream, LocalStream) {
    let (a_tx, b_rx) = mpsc::unbounded();
    let (b_tx, a_rx) = mpsc::unbounded();
    (
        LocalStream {
            tx: a_tx,
            rx: a_rx,
            buf: Vec::new(),
            pos: 0,
        },
        LocalStream {
            tx: b_tx,
            rx: b_rx,
            buf: Vec::new(),
            pos: 0,
        },
    )
}

impl AsyncRead for LocalStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        while this.pos == this.buf.len() {
            match this.rx.poll_next_unpin(cx) {
                Poll::Ready(Some(data)) => {
                    this.buf = data;
                    this.pos = 0;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = out.len().min(this.buf.len() - this.pos);
        out[..n].copy_from_slice(&this.buf[this.pos..this.pos + n]);
        this.pos += n;
        Poll::Ready(Ok(n))
    }
}

impl AsyncWrite for LocalStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.tx.unbounded_send(data.to_vec()) {
            Ok(()) => Poll::Ready(Ok(data.len())),
            Err(_) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.tx.close_channel();
        Poll::Ready(Ok(()))
    }
}

/// How a [`FakeRelay`] behaves
#[derive(Debug, Clone)]
pub struct FakeRelayOptions {
    /// Answer CREATE_FAST with this Y instead of a random one
    pub fixed_y: Option<[u8; 20]>,
    /// Answer BEGIN and BEGIN_DIR with END instead of CONNECTED
    pub refuse_streams: bool,
    /// Never answer BEGIN or BEGIN_DIR at all
    pub ignore_begins: bool,
    /// Send every DATA payload back on the same stream
    pub echo: bool,
    /// Acknowledge received DATA with SENDMEs
    pub sendmes: bool,
}

impl Default for FakeRelayOptions {
    fn default() -> Self {
        Self {
            fixed_y: None,
            refuse_streams: false,
            ignore_begins: false,
            echo: true,
            sendmes: true,
        }
    }
}

/// Something the relay saw or did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A circuit was created; `kh` is what the relay sent back
    Created { circ_id: CircId, kh: [u8; 20] },
    /// A BEGIN or BEGIN_DIR arrived (`target` is `None` for BEGIN_DIR)
    StreamRequested {
        circ_id: CircId,
        stream_id: StreamId,
        target: Option<String>,
    },
    /// The client ended a stream
    StreamEnded {
        circ_id: CircId,
        stream_id: StreamId,
        reason: EndReason,
    },
    /// A SENDME arrived; stream 0 is the circuit
    SendmeReceived { circ_id: CircId, stream_id: StreamId },
    /// The client destroyed a circuit
    Destroyed { circ_id: CircId, reason: DestroyReason },
    /// A cell failed to decrypt, verify or decode
    Violation { circ_id: CircId, error: String },
}

enum Command {
    Destroy(CircId, DestroyReason),
    End(CircId, StreamId, EndReason),
    Data(CircId, StreamId, Vec<u8>),
    Raw(Cell),
}

/// Relay side of a link, running as its own task
pub struct FakeRelay {
    commands: mpsc::UnboundedSender<Command>,
    events: mpsc::UnboundedReceiver<RelayEvent>,
}

impl FakeRelay {
    /// Serve the relay end of `transport`; must be called within a tokio runtime
    pub fn spawn<T>(transport: T, options: FakeRelayOptions) -> FakeRelay
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = transport.split();
        let (cells_tx, cells) = mpsc::unbounded();
        let (commands, commands_rx) = mpsc::unbounded();
        let (events_tx, events) = mpsc::unbounded();

        tokio::spawn(read_cells(reader, cells_tx));
        let relay = RelayTask {
            options,
            writer,
            circuits: HashMap::new(),
            events: events_tx,
        };
        tokio::spawn(relay.run(cells, commands_rx));

        FakeRelay { commands, events }
    }

    /// Send DESTROY on `circ_id`
    pub fn destroy(&self, circ_id: CircId, reason: DestroyReason) {
        let _ = self.commands.unbounded_send(Command::Destroy(circ_id, reason));
    }

    /// End a stream, after any data already queued on it
    pub fn end_stream(&self, circ_id: CircId, stream_id: StreamId, reason: EndReason) {
        let _ = self
            .commands
            .unbounded_send(Command::End(circ_id, stream_id, reason));
    }

    /// Send `data` to the client on a stream
    pub fn send_data(&self, circ_id: CircId, stream_id: StreamId, data: &[u8]) {
        let _ = self
            .commands
            .unbounded_send(Command::Data(circ_id, stream_id, data.to_vec()));
    }

    /// Write a cell to the link as-is
    pub fn send_raw(&self, cell: Cell) {
        let _ = self.commands.unbounded_send(Command::Raw(cell));
    }

    /// Wait for the next event
    pub async fn next_event(&mut self) -> Option<RelayEvent> {
        self.events.next().await
    }

    /// Wait for the next event matching `pred`, skipping the rest
    pub async fn wait_for<F>(&mut self, mut pred: F) -> Option<RelayEvent>
    where
        F: FnMut(&RelayEvent) -> bool,
    {
        while let Some(event) = self.events.next().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    }
}

/// A client [`Link`] wired to a [`FakeRelay`]
pub fn link_with_relay(config: LinkConfig, options: FakeRelayOptions) -> (Link, FakeRelay) {
    let (client, relay) = duplex();
    (Link::launch(client, config), FakeRelay::spawn(relay, options))
}

async fn read_cells<R: AsyncRead + Unpin>(mut reader: R, cells: mpsc::UnboundedSender<Cell>) {
    loop {
        let mut header = [0u8; Cell::HEADER_SIZE];
        let mut body = vec![0u8; Cell::PAYLOAD_SIZE];
        if reader.read_exact(&mut header).await.is_err()
            || reader.read_exact(&mut body).await.is_err()
        {
            return;
        }
        match Cell::from_parts(&header, &body) {
            Ok(cell) => {
                if cells.unbounded_send(cell).is_err() {
                    return;
                }
            }
            Err(e) => log::warn!("fake relay: dropping cell: {}", e),
        }
    }
}

/// Relay-side state for one circuit
struct RelayCircuit {
    crypto: RelayCrypto,
    flow: CircuitFlowControl,
    streams: HashMap<StreamId, StreamFlowControl>,
    /// Relay cells waiting for window space, in order
    backlog: VecDeque<RelayCell>,
}

struct RelayTask<W> {
    options: FakeRelayOptions,
    writer: W,
    circuits: HashMap<CircId, RelayCircuit>,
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl<W: AsyncWrite + Unpin> RelayTask<W> {
    async fn run(
        mut self,
        mut cells: mpsc::UnboundedReceiver<Cell>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        loop {
            let out = self.flush();
            if self.write(out).await.is_err() {
                return;
            }

            let out = select_biased! {
                cell = cells.next() => match cell {
                    Some(cell) => self.handle_cell(cell),
                    None => return,
                },
                cmd = commands.select_next_some() => self.handle_command(cmd),
            };
            if self.write(out).await.is_err() {
                return;
            }
        }
    }

    async fn write(&mut self, cells: Vec<Cell>) -> Result<()> {
        for cell in cells {
            self.writer.write_all(&cell.to_bytes()?).await?;
        }
        self.writer.flush().await?;
        Ok(())
    }

    fn emit(&self, event: RelayEvent) {
        let _ = self.events.unbounded_send(event);
    }

    fn handle_command(&mut self, cmd: Command) -> Vec<Cell> {
        match cmd {
            Command::Destroy(circ_id, reason) => {
                self.circuits.remove(&circ_id);
                chan_cell(ChanMsg::Destroy { reason }, circ_id)
            }
            Command::End(circ_id, stream_id, reason) => {
                self.queue(circ_id, RelayCell::new(stream_id, RelayMsg::End { reason }));
                Vec::new()
            }
            Command::Data(circ_id, stream_id, data) => {
                for chunk in data.chunks(crate::protocol::RELAY_PAYLOAD_MAX) {
                    self.queue(circ_id, RelayCell::new(stream_id, RelayMsg::Data(chunk.to_vec())));
                }
                Vec::new()
            }
            Command::Raw(cell) => vec![cell],
        }
    }

    fn queue(&mut self, circ_id: CircId, cell: RelayCell) {
        if let Some(circ) = self.circuits.get_mut(&circ_id) {
            circ.backlog.push_back(cell);
        }
    }

    fn handle_cell(&mut self, cell: Cell) -> Vec<Cell> {
        let circ_id = cell.circuit_id;
        let msg = match ChanMsg::decode(&cell) {
            Ok(msg) => msg,
            Err(e) => {
                self.emit(RelayEvent::Violation {
                    circ_id,
                    error: e.to_string(),
                });
                return Vec::new();
            }
        };

        match msg {
            ChanMsg::CreateFast { x } => self.create_fast(circ_id, &x),
            ChanMsg::Destroy { reason } => {
                self.circuits.remove(&circ_id);
                self.emit(RelayEvent::Destroyed { circ_id, reason });
                Vec::new()
            }
            ChanMsg::Relay(mut body) | ChanMsg::RelayEarly(mut body) => {
                match self.handle_relay(circ_id, &mut body) {
                    Ok(out) => out,
                    Err(e) => {
                        self.emit(RelayEvent::Violation {
                            circ_id,
                            error: e.to_string(),
                        });
                        self.circuits.remove(&circ_id);
                        chan_cell(
                            ChanMsg::Destroy {
                                reason: DestroyReason::PROTOCOL,
                            },
                            circ_id,
                        )
                    }
                }
            }
            _ => Vec::new(),
        }
    }

    fn create_fast(&mut self, circ_id: CircId, x: &[u8; 20]) -> Vec<Cell> {
        let reply = match self.options.fixed_y {
            Some(y) => CreateFastServer::respond_with(x, &y),
            None => CreateFastServer::respond(&mut rand::thread_rng(), x),
        };
        let (keys, reply) = match reply {
            Ok(r) => r,
            Err(e) => {
                log::warn!("fake relay: CREATE_FAST failed: {}", e);
                return Vec::new();
            }
        };

        if let ChanMsg::CreatedFast { kh, .. } = &reply {
            self.emit(RelayEvent::Created { circ_id, kh: *kh });
        }
        self.circuits.insert(
            circ_id,
            RelayCircuit {
                crypto: RelayCrypto::relay(&keys),
                flow: CircuitFlowControl::new(),
                streams: HashMap::new(),
                backlog: VecDeque::new(),
            },
        );
        chan_cell(reply, circ_id)
    }

    fn handle_relay(&mut self, circ_id: CircId, body: &mut [u8]) -> Result<Vec<Cell>> {
        let events = &self.events;
        let emit = |event| {
            let _ = events.unbounded_send(event);
        };
        let Some(circ) = self.circuits.get_mut(&circ_id) else {
            return Ok(Vec::new());
        };
        let RelayCell { stream_id, msg } = circ.crypto.unmarshal(body)?;
        let mut out = Vec::new();

        match msg {
            RelayMsg::Sendme { digest } => {
                if stream_id == 0 {
                    circ.flow.on_sendme_received(digest)?;
                } else if let Some(flow) = circ.streams.get_mut(&stream_id) {
                    flow.on_sendme_received(None)?;
                }
                emit(RelayEvent::SendmeReceived { circ_id, stream_id });
            }
            RelayMsg::BeginDir | RelayMsg::Begin { .. } => {
                let target = match msg {
                    RelayMsg::Begin { target, .. } => Some(target),
                    _ => None,
                };
                emit(RelayEvent::StreamRequested {
                    circ_id,
                    stream_id,
                    target,
                });
                if self.options.ignore_begins {
                    return Ok(out);
                }
                let reply = if self.options.refuse_streams {
                    RelayMsg::End {
                        reason: EndReason::EXITPOLICY,
                    }
                } else {
                    circ.streams.insert(stream_id, StreamFlowControl::new());
                    RelayMsg::Connected(Vec::new())
                };
                circ.backlog.push_back(RelayCell::new(stream_id, reply));
            }
            RelayMsg::Data(data) => {
                circ.flow.on_receive()?;
                if self.options.sendmes && circ.flow.needs_sendme() {
                    let digest = circ.crypto.inbound_digest();
                    let sendme = RelayCell::new(0, RelayMsg::Sendme { digest: Some(digest) });
                    out.push(Self::seal(circ_id, circ, sendme)?);
                    circ.flow.on_sendme_sent();
                }

                let Some(flow) = circ.streams.get_mut(&stream_id) else {
                    return Ok(out);
                };
                flow.on_receive()?;
                if self.options.sendmes && flow.needs_sendme() {
                    flow.on_sendme_sent();
                    let sendme = RelayCell::new(stream_id, RelayMsg::Sendme { digest: None });
                    out.push(Self::seal(circ_id, circ, sendme)?);
                }
                if self.options.echo {
                    circ.backlog
                        .push_back(RelayCell::new(stream_id, RelayMsg::Data(data)));
                }
            }
            RelayMsg::End { reason } => {
                circ.streams.remove(&stream_id);
                emit(RelayEvent::StreamEnded {
                    circ_id,
                    stream_id,
                    reason,
                });
            }
            _ => {}
        }

        Ok(out)
    }

    /// Encrypt a relay cell into a RELAY cell for `circ_id`
    fn seal(circ_id: CircId, circ: &mut RelayCircuit, cell: RelayCell) -> Result<Cell> {
        let (body, _) = circ.crypto.marshal(&cell, &mut rand::thread_rng())?;
        ChanMsg::Relay(body).into_cell(circ_id)
    }

    /// Send whatever the windows allow from every circuit's backlog
    fn flush(&mut self) -> Vec<Cell> {
        let mut out = Vec::new();
        for (&circ_id, circ) in self.circuits.iter_mut() {
            while let Some(cell) = circ.backlog.front() {
                let stream_id = cell.stream_id;
                let is_data = matches!(cell.msg, RelayMsg::Data(_));

                if is_data {
                    let Some(stream) = circ.streams.get(&stream_id) else {
                        circ.backlog.pop_front();
                        continue;
                    };
                    if !circ.flow.can_send() || !stream.can_send() {
                        break;
                    }
                }

                let Some(cell) = circ.backlog.pop_front() else {
                    break;
                };
                let ends = matches!(cell.msg, RelayMsg::End { .. });
                let (body, digest) = match circ.crypto.marshal(&cell, &mut rand::thread_rng()) {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("fake relay: cannot send {:?}: {}", cell.msg.command(), e);
                        continue;
                    }
                };

                if is_data {
                    let sent = circ.flow.on_send(Some(digest)).and_then(|_| {
                        circ.streams
                            .get_mut(&stream_id)
                            .ok_or(TorError::StreamNotOpen)?
                            .on_send(None)
                    });
                    if let Err(e) = sent {
                        log::warn!("fake relay: {}", e);
                    }
                }
                if ends {
                    circ.streams.remove(&stream_id);
                }

                if let Ok(cell) = ChanMsg::Relay(body).into_cell(circ_id) {
                    out.push(cell);
                }
            }
        }
        out
    }
}

fn chan_cell(msg: ChanMsg, circ_id: CircId) -> Vec<Cell> {
    match msg.into_cell(circ_id) {
        Ok(cell) => vec![cell],
        Err(e) => {
            log::warn!("fake relay: cannot encode cell: {}", e);
            Vec::new()
        }
    }
}

/// A RELAY cell whose body is random garbage
pub fn garbage_relay_cell(circ_id: CircId) -> Cell {
    let mut body = vec![0u8; Cell::PAYLOAD_SIZE];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut body);
    Cell::new(circ_id, CellCommand::Relay, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_roundtrip_and_eof() {
        let (mut a, mut b) = duplex();
        a.write_all(b"hello").await.unwrap();
        a.write_all(b" world").await.unwrap();

        let mut buf = [0u8; 11];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");

        drop(a);
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
        assert!(b.write_all(b"x").await.is_err());
    }
}
