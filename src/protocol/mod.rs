pub mod codec;
pub mod handshake;
pub mod packet;
pub mod response;

pub use codec::PacketCodec;
pub use handshake::{
    is_eof_packet, is_err_packet, is_local_infile_packet, is_ok_packet, scramble_password,
    ErrPacket, HandshakeResponse, InitialHandshake, OkPacket,
};
pub use packet::{capabilities, status_flags, Command, Packet};
pub use response::{ColumnDef, ReplyState, ReplyTracker};
