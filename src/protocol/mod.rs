//! Wire protocol layer: fixed binary packet layout and incremental framing.

mod frame_buffer;
mod wire;

pub use frame_buffer::FrameBuffer;
pub use wire::{
    decode_fixed_str, encode_fixed_str, Header, Opcode, Packet, DEFAULT_MAX_PAYLOAD_SIZE,
    DISCONNECT_REASON_SIZE, DISCONNECT_SERVICE, HEADER_SIZE, KEEP_ALIVE_SERVICE, MAGIC,
    SERVICE_SIZE, TOKEN_SIZE,
};
