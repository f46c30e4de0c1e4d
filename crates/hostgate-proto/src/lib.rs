//! Tunnel Protocol Definitions
//!
//! This crate defines the wire format shared by the gateway and tunnel clients:
//! length-prefixed frames and the packet envelope carried inside each frame.

pub mod codec;
pub mod messages;
pub mod writer;

pub use codec::{encode_frame, CodecError, FrameCodec, FrameReader, PacketCodec};
pub use messages::*;
pub use writer::run_packet_writer;

/// Size of the big-endian length prefix in front of every frame
pub const FRAME_HEADER_SIZE: usize = 4;

/// Default tunnel port the gateway listens on
pub const DEFAULT_TUNNEL_PORT: u16 = 9090;
