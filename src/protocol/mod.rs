//! Tor link protocol
//!
//! Bottom up:
//! - `kdf`, `cell`, `relay_cell`: key derivation and the wire formats
//! - `crypto`, `handshake`, `flow_control`: per-circuit relay crypto,
//!   CREATE_FAST and SENDME windows
//! - `link`, `circuit`, `stream`: the tasks that multiplex circuits over a
//!   link and streams over a circuit
//! - `consensus`, `relay`: the relay list and weighted path selection

mod cell;
mod circuit;
mod consensus;
mod crypto;
mod flow_control;
mod handshake;
mod kdf;
mod link;
mod relay;
mod relay_cell;
mod stream;

pub use cell::{
    Cell, CellCommand, ChanMsg, CircId, DestroyReason, Netinfo, CLIENT_CIRC_ID_MSB,
};
pub use circuit::Circuit;
pub use consensus::{
    ip_level, BandwidthWeights, Consensus, PortSet, RouterFlags, RouterStatus, WEIGHT_SCALE,
};
pub use crypto::{CircuitKeys, RelayCrypto};
pub use flow_control::{CircuitFlowControl, SendmeTag, StreamFlowControl};
pub use handshake::{CreateFastClient, CreateFastServer};
pub use kdf::{expand, kdf_tor, KeyMaterial, KEY_MATERIAL_LEN, SECRET_LEN};
pub use link::Link;
pub use relay::{pick_weighted, CircuitPath, RelaySelector};
pub use relay_cell::{
    EndReason, RelayCell, RelayCommand, RelayMsg, StreamId, RELAY_HEADER_LEN, RELAY_PAYLOAD_MAX,
};
pub use stream::{DataStream, PendingStream, StreamKind, StreamState};
