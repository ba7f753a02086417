pub mod codec;
pub mod handshake;
pub mod packet;
pub mod reply;

pub use codec::PacketCodec;
pub use handshake::{
    compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket,
};
pub use packet::{capabilities, status, Command, Packet};
pub use reply::{ErrorInfo, Reply, ReplyTracker};
