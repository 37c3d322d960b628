//! Link multiplexer
//!
//! A [`Link`] owns an already-authenticated transport to the first relay.
//! One task reads fixed-size cells and routes them to circuits by circuit
//! id; another serializes every outbound cell through a single queue so
//! interleaved circuits never corrupt each other's bytes on the wire.
//!
//! An I/O error on either side tears the whole link down, and every
//! circuit registered on it with it.

use super::cell::{Cell, CellCommand, ChanMsg, CircId, CLIENT_CIRC_ID_MSB};
use super::circuit::{Circuit, CircuitReactor};
use super::handshake::CreateFastClient;
use crate::config::LinkConfig;
use crate::error::{Result, TorError};
use crate::signal::CloseSignal;
use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::{select_biased, FutureExt, SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Routing entry for one circuit
struct CircuitSlot {
    inbound: mpsc::Sender<Cell>,
    closed: CloseSignal,
}

/// State shared by a link's handles, its tasks and its circuits
pub(crate) struct LinkShared {
    config: LinkConfig,
    outbound: mpsc::Sender<Cell>,
    circuits: RwLock<HashMap<CircId, CircuitSlot>>,
    next_circ_id: AtomicU32,
    closed: CloseSignal,
}

impl LinkShared {
    pub(crate) fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub(crate) fn outbound(&self) -> mpsc::Sender<Cell> {
        self.outbound.clone()
    }

    pub(crate) fn closed(&self) -> &CloseSignal {
        &self.closed
    }

    /// Allocate a fresh client circuit id and route its cells to `inbound`
    fn register(&self, inbound: mpsc::Sender<Cell>, closed: CloseSignal) -> Result<CircId> {
        let mut circuits = self.circuits.write();
        if self.closed.is_fired() {
            return Err(TorError::LinkClosed);
        }

        // The low 31 bits can hold far more circuits than any link carries
        let id = loop {
            let n = self.next_circ_id.fetch_add(1, Ordering::Relaxed) & !CLIENT_CIRC_ID_MSB;
            let id = n | CLIENT_CIRC_ID_MSB;
            if n != 0 && !circuits.contains_key(&id) {
                break id;
            }
        };

        circuits.insert(id, CircuitSlot { inbound, closed });
        Ok(id)
    }

    /// Stop routing cells to `id`
    pub(crate) fn unregister(&self, id: CircId) {
        self.circuits.write().remove(&id);
    }

    /// Close the link and every circuit on it; idempotent
    fn shutdown(&self, cause: &str) {
        if self.closed.fire() {
            log::info!("Link closed: {}", cause);
        }

        let circuits = std::mem::take(&mut *self.circuits.write());
        for (id, slot) in circuits {
            log::debug!("circ {:#x}: closing with link", id);
            slot.closed.fire();
        }
    }

    /// Hand an inbound cell to its circuit
    async fn route(&self, cell: Cell) {
        let (id, command) = (cell.circuit_id, cell.command);
        let inbound = self
            .circuits
            .read()
            .get(&id)
            .map(|s| (s.inbound.clone(), s.closed.wait()));

        match inbound {
            Some((mut tx, mut circuit_closed)) => {
                // A circuit on its way down stops draining its mailbox
                let mut closed = self.closed.wait();
                let sent = select_biased! {
                    _ = closed => false,
                    _ = circuit_closed => false,
                    r = tx.send(cell).fuse() => r.is_ok(),
                };
                if !sent {
                    log::debug!("circ {:#x}: circuit gone, dropping {:?}", id, command);
                }
            }
            None if id == 0 => match command {
                CellCommand::Padding | CellCommand::Vpadding => {}
                other => log::trace!("Ignoring {:?} cell on circuit 0", other),
            },
            None => log::warn!("circ {:#x}: no such circuit, dropping {:?}", id, command),
        }
    }
}

/// Handle to a link
///
/// Cheap to clone; every clone refers to the same link.
#[derive(Clone)]
pub struct Link {
    shared: Arc<LinkShared>,
}

impl Link {
    /// Start multiplexing cells over `transport`
    ///
    /// The transport must already be authenticated and past version
    /// negotiation. Spawns the reader and writer tasks, so this must be
    /// called from within a tokio runtime.
    pub fn launch<T>(transport: T, config: LinkConfig) -> Link
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = transport.split();
        let (outbound, outbound_rx) = mpsc::channel(config.mailbox_capacity);

        let shared = Arc::new(LinkShared {
            config,
            outbound,
            circuits: RwLock::new(HashMap::new()),
            next_circ_id: AtomicU32::new(1),
            closed: CloseSignal::new(),
        });

        tokio::spawn(read_loop(reader, Arc::clone(&shared)));
        tokio::spawn(write_loop(writer, outbound_rx, Arc::clone(&shared)));

        log::debug!("Link launched");
        Link { shared }
    }

    /// Build a one-hop circuit with a CREATE_FAST handshake
    pub async fn create_fast(&self) -> Result<Circuit> {
        let handshake = CreateFastClient::new(&mut rand::thread_rng());
        self.create_fast_with(handshake).await
    }

    /// Build a one-hop circuit using a prepared handshake
    ///
    /// On any failure the circuit is unregistered and never usable.
    pub async fn create_fast_with(&self, handshake: CreateFastClient) -> Result<Circuit> {
        let capacity = self.shared.config.mailbox_capacity;
        let (inbound_tx, mut inbound) = mpsc::channel(capacity);
        let closed = CloseSignal::new();
        let id = self.shared.register(inbound_tx, closed.clone())?;

        log::debug!("circ {:#x}: sending CREATE_FAST", id);
        let keys = match self.handshake(id, handshake, &mut inbound).await {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!("circ {:#x}: handshake failed: {}", id, e);
                self.shared.unregister(id);
                closed.fire();
                return Err(e);
            }
        };

        let (circuit, reactor) =
            CircuitReactor::new(id, &keys, inbound, closed, Arc::clone(&self.shared));
        tokio::spawn(reactor.run());

        log::debug!("circ {:#x}: created", id);
        Ok(circuit)
    }

    async fn handshake(
        &self,
        id: CircId,
        handshake: CreateFastClient,
        inbound: &mut mpsc::Receiver<Cell>,
    ) -> Result<super::crypto::CircuitKeys> {
        let cell = handshake.message().into_cell(id)?;
        self.shared
            .outbound()
            .send(cell)
            .await
            .map_err(|_| TorError::LinkClosed)?;

        let timeout = self.shared.config.handshake_timeout;
        let mut link_closed = self.shared.closed.wait();
        let reply = select_biased! {
            _ = link_closed => return Err(TorError::LinkClosed),
            reply = tokio::time::timeout(timeout, inbound.next()).fuse() => reply,
        };
        let cell = reply
            .map_err(|_| TorError::Timeout("CREATED_FAST"))?
            .ok_or(TorError::LinkClosed)?;

        match ChanMsg::decode(&cell)? {
            ChanMsg::CreatedFast { y, kh } => handshake.complete(&y, &kh),
            ChanMsg::Destroy { reason } => Err(TorError::circuit_destroyed(reason.0)),
            other => Err(TorError::HandshakeFailed(format!(
                "expected CREATED_FAST, got {:?}",
                other.command()
            ))),
        }
    }

    /// Close the link and every circuit on it
    pub fn close(&self) {
        self.shared.shutdown("closed locally");
    }

    /// Whether the link has been torn down
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_fired()
    }

    /// Wait until the link is torn down
    pub async fn wait_closed(&self) {
        self.shared.closed.wait().await
    }

    /// Number of circuits currently routed on this link
    pub fn circuit_count(&self) -> usize {
        self.shared.circuits.read().len()
    }

    /// Configuration this link was launched with
    pub fn config(&self) -> &LinkConfig {
        &self.shared.config
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("circuits", &self.circuit_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_cell<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Cell>> {
    let mut header = [0u8; Cell::HEADER_SIZE];
    let mut body = vec![0u8; Cell::PAYLOAD_SIZE];
    reader.read_exact(&mut header).await?;
    reader.read_exact(&mut body).await?;

    match Cell::from_parts(&header, &body) {
        Ok(cell) => Ok(Some(cell)),
        Err(e) => {
            // The body has been consumed, so the stream is still in sync
            log::warn!("Dropping cell: {}", e);
            Ok(None)
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(mut reader: R, shared: Arc<LinkShared>) {
    let mut closed = shared.closed.wait();
    let cause = loop {
        let cell = select_biased! {
            _ = closed => break "closed".to_string(),
            cell = read_cell(&mut reader).fuse() => cell,
        };

        match cell {
            Ok(Some(cell)) => {
                log::trace!("circ {:#x}: received {:?}", cell.circuit_id, cell.command);
                shared.route(cell).await;
            }
            Ok(None) => {}
            Err(e) => break format!("read failed: {}", e),
        }
    };
    shared.shutdown(&cause);
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Cell>,
    shared: Arc<LinkShared>,
) {
    let mut closed = shared.closed.wait();
    let cause = loop {
        let cell = select_biased! {
            _ = closed => break "closed".to_string(),
            cell = outbound.next() => cell,
        };
        let Some(cell) = cell else {
            break "outbound queue closed".to_string();
        };

        let bytes = match cell.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("circ {:#x}: dropping unencodable cell: {}", cell.circuit_id, e);
                continue;
            }
        };
        log::trace!("circ {:#x}: sending {:?}", cell.circuit_id, cell.command);

        if let Err(e) = write_all(&mut writer, &bytes).await {
            break format!("write failed: {}", e);
        }
    };
    let _ = writer.close().await;
    shared.shutdown(&cause);
}

async fn write_all<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::duplex;

    #[tokio::test]
    async fn test_write_path_frames_cells() {
        let (client, mut relay) = duplex();
        let link = Link::launch(client, LinkConfig::default());

        let mut tx = link.shared.outbound();
        tx.send(Cell::new(0x8000_0007, CellCommand::Padding, vec![]))
            .await
            .unwrap();

        let mut buf = [0u8; Cell::SIZE];
        relay.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..5], &[0x80, 0, 0, 7, 0]);
        assert!(buf[5..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_routes_by_circuit_id() {
        let (client, mut relay) = duplex();
        let link = Link::launch(client, LinkConfig::default());

        let (tx, mut rx) = mpsc::channel(4);
        let id = link.shared.register(tx, CloseSignal::new()).unwrap();
        assert_ne!(id & CLIENT_CIRC_ID_MSB, 0);

        // A cell for nobody, an unknown command, then one for us
        let stray = Cell::new(0x8000_0999, CellCommand::Relay, vec![1; 509]);
        relay.write_all(&stray.to_bytes().unwrap()).await.unwrap();
        let mut bogus = vec![0u8; Cell::SIZE];
        bogus[4] = 250;
        relay.write_all(&bogus).await.unwrap();
        let ours = Cell::new(id, CellCommand::Destroy, vec![3]);
        relay.write_all(&ours.to_bytes().unwrap()).await.unwrap();

        let got = rx.next().await.unwrap();
        assert_eq!(got.circuit_id, id);
        assert_eq!(got.command, CellCommand::Destroy);
        assert_eq!(got.payload[0], 3);
        assert!(!link.is_closed());
    }

    #[tokio::test]
    async fn test_transport_eof_cascades() {
        let (client, relay) = duplex();
        let link = Link::launch(client, LinkConfig::default());

        let circ_closed = CloseSignal::new();
        let (tx, mut rx) = mpsc::channel(4);
        link.shared.register(tx, circ_closed.clone()).unwrap();
        assert_eq!(link.circuit_count(), 1);

        drop(relay);
        link.wait_closed().await;

        assert!(circ_closed.is_fired());
        assert_eq!(link.circuit_count(), 0);
        assert!(rx.next().await.is_none());
        assert!(matches!(
            link.shared.register(mpsc::channel(1).0, CloseSignal::new()),
            Err(TorError::LinkClosed)
        ));
    }
}
