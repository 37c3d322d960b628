//! # tor-link
//!
//! Client side of the Tor link, circuit and stream protocols.
//!
//! Hand it an already-authenticated byte transport to a relay and it
//! builds circuits with CREATE_FAST, opens streams over them, and moves
//! application bytes under Tor's onion crypto and SENDME flow control.
//! It also carries the bandwidth-weighted relay selection used to pick a
//! circuit's hops from a consensus snapshot.
//!
//! ## Architecture
//!
//! ```text
//! DataStream ──┐
//! DataStream ──┤  stream reactor per stream
//!              ↓
//!           Circuit         circuit reactor: relay crypto, circuit windows
//!              ↓
//!            Link           reader + writer tasks, circuit id routing
//!              ↓
//!      AsyncRead + AsyncWrite (TLS to the guard)
//! ```
//!
//! Each layer runs as its own task and talks to its neighbours through
//! bounded channels, so a slow reader pushes back all the way to the relay.
//!
//! ## Example
//!
//! ```no_run
//! # async fn run<T>(transport: T) -> tor_link::Result<()>
//! # where T: futures::io::AsyncRead + futures::io::AsyncWrite + Send + Unpin + 'static {
//! use futures::io::{AsyncReadExt, AsyncWriteExt};
//! use tor_link::{Link, LinkConfig};
//!
//! let link = Link::launch(transport, LinkConfig::default());
//! let circuit = link.create_fast().await?;
//! let mut stream = circuit.begin_dir().await?;
//!
//! stream.write_all(b"GET /tor/status-vote/current/consensus HTTP/1.0\r\n\r\n").await?;
//! let mut body = Vec::new();
//! stream.read_to_end(&mut body).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod error;
pub mod protocol;
mod signal;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::LinkConfig;
pub use error::{ErrorCode, Result, TorError};
pub use protocol::{
    Circuit, CircuitPath, Consensus, DataStream, Link, PendingStream, RelaySelector,
    RouterStatus, StreamKind, StreamState,
};
pub use signal::CloseSignal;
