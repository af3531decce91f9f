//! Retrace - a network path measurement library.
//!
//! This crate crafts and captures raw IP packets to discover the sequence
//! of routers between endpoint pairs and to measure loss and latency along
//! a known path by sending self-returning ("boomerang") probe packets.
//!
//! Two engines are provided over a shared [`TransportChannel`]:
//!
//! - **Path discovery** - a traceroute supporting local-to-remote,
//!   remote-to-local and arbitrary-source-to-destination modes.  The remote
//!   modes use IP-in-IP encapsulation to coerce a remote node into emitting
//!   the TTL-probing sequence on our behalf.
//! - **Boomerang probing** - deeply nested IP-in-IP packets that traverse a
//!   path forward and backward, returning to the sender, with per-hop
//!   reachability measured by probing every path prefix.
//!
//! # Privileges
//!
//! Raw sockets and packet capture require elevated privileges
//! (`CAP_NET_RAW` on Linux).
//!
//! # Examples
//!
//! Discover the path to a destination:
//!
//! ```no_run
//! # fn main() -> Result<(), retrace_core::Error> {
//! use retrace_core::Builder;
//! use std::net::Ipv4Addr;
//! use std::time::Duration;
//!
//! let channel = Builder::new().bpf_filter("icmp").build()?;
//! let path = channel.get_path_to(Ipv4Addr::new(1, 1, 1, 1), Duration::from_millis(500))?;
//! println!("{path}");
//! channel.close();
//! # Ok(())
//! # }
//! ```
//!
//! Measure loss and latency to every hop of a known path:
//!
//! ```no_run
//! # fn main() -> Result<(), retrace_core::Error> {
//! use retrace_core::{Builder, Path};
//! use std::net::Ipv4Addr;
//! use std::time::Duration;
//!
//! let path = Path::new(vec![
//!     Ipv4Addr::new(10, 0, 0, 1),
//!     Ipv4Addr::new(10, 0, 0, 2),
//!     Ipv4Addr::new(10, 0, 0, 3),
//! ]);
//! let channel = Builder::new().bpf_filter("ip proto 4").build()?;
//! for result in channel.probe_each_hop_of_path(&path, 10, Duration::from_secs(3)).iter() {
//!     println!("{:?} {:?}", result.payload.dest_ip, result.round_trip_time());
//! }
//! channel.close();
//! # Ok(())
//! # }
//! ```
#![warn(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::use_self,
    clippy::option_if_let_else,
    clippy::missing_const_for_fn,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc
)]
#![deny(unsafe_code)]

mod boomerang;
/// Probe packet construction.
pub mod build;
mod builder;
mod config;
mod constants;
mod discovery;
mod error;
mod hash;
mod listener;
mod net;
mod packet;
mod path;
mod payload;
mod types;

pub use builder::Builder;
pub use config::{defaults, ChannelConfig};
pub use constants::MAX_TTL;
pub use discovery::{PathChannel, PathChannelParams};
pub use error::{Error, IoError, IoOperation, Result};
pub use hash::{boomerang_packet_hasher, PacketHash, PacketHasher};
pub use listener::{Listener, PacketPredicate};
pub use net::channel::{ChannelStats, TransportChannel};
pub use net::socket::{Socket, SocketImpl};
pub use packet::CapturedPacket;
pub use path::Path;
pub use payload::{
    decode_payload, encode_payload, BoomerangPayload, BoomerangResult, BoomerangStatus,
    PACKET_SIGNATURE, SIGNATURE_V4, SIGNATURE_V6, WIRE_KEY_SIZE,
};
pub use types::{Port, TimeToLive};
