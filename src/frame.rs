//! Wire framing: a pure function over a byte buffer plus cursor, with no
//! I/O and no ownership of the reader thread's buffer.
//!
//! `decode` never blocks and never allocates more than the packet it
//! returns; the caller (the dispatcher) owns the growing buffer and is
//! responsible for draining `consumed` bytes and resynchronising past a
//! bad magic on `Invalid`.

use crate::opcode::{self, CLASS_ASYNC};
use crate::packet::Packet;

const MAGIC_FORWARD: u16 = 0x55AA;
const MAGIC_REVERSE: u16 = 0xAA55;

#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Not enough bytes buffered yet to determine anything.
    NeedMore,
    /// Magic or checksum mismatch; caller should discard the leading two
    /// bytes and keep scanning for the next magic.
    Invalid,
    /// A full, checksum-verified packet, and the number of bytes from the
    /// front of the buffer it consumed.
    Decoded(Packet, usize),
}

fn checksum16(bytes: &[u8]) -> u16 {
    let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
    (sum & 0xFFFF) as u16
}

pub fn encode(pkt: &Packet) -> Vec<u8> {
    let opcode = pkt.opcode();
    let class = opcode::opcode_class(opcode);
    let sub = opcode::opcode_sub(opcode);

    let mut out = Vec::with_capacity(pkt.payload().len() + 7);
    out.extend_from_slice(&MAGIC_FORWARD.to_be_bytes());
    out.push(class);

    let len_byte = match pkt {
        Packet::AsyncAck { acked_opcode } => opcode::opcode_sub(*acked_opcode),
        Packet::Command { payload, .. } => (payload.len() + 3) as u8,
    };
    out.push(len_byte);
    out.push(sub);
    out.extend_from_slice(pkt.payload());

    let checksum = checksum16(&out);
    out.extend_from_slice(&checksum.to_be_bytes());
    out
}

pub fn decode(buf: &[u8]) -> DecodeOutcome {
    if buf.len() < 5 {
        return DecodeOutcome::NeedMore;
    }

    let magic = u16::from_be_bytes([buf[0], buf[1]]);
    if magic != MAGIC_FORWARD && magic != MAGIC_REVERSE {
        return DecodeOutcome::Invalid;
    }

    let class = buf[2];
    let len_byte = buf[3];
    let sub_byte = buf[4];

    if class == CLASS_ASYNC && sub_byte == 0xFF {
        if buf.len() < 7 {
            return DecodeOutcome::NeedMore;
        }
        let frame = &buf[..7];
        let checksum_remote = u16::from_be_bytes([frame[5], frame[6]]);
        if checksum16(&frame[..5]) != checksum_remote {
            return DecodeOutcome::Invalid;
        }
        let acked_opcode = opcode::make_opcode(class, len_byte);
        return DecodeOutcome::Decoded(Packet::AsyncAck { acked_opcode }, 7);
    }

    if len_byte < 3 {
        return DecodeOutcome::Invalid;
    }
    let total = len_byte as usize + 4;
    if buf.len() < total {
        return DecodeOutcome::NeedMore;
    }

    let frame = &buf[..total];
    let checksum_remote = u16::from_be_bytes([frame[total - 2], frame[total - 1]]);
    if checksum16(&frame[..total - 2]) != checksum_remote {
        return DecodeOutcome::Invalid;
    }

    let payload = frame[5..total - 2].to_vec();
    let opcode = opcode::make_opcode(class, sub_byte);
    DecodeOutcome::Decoded(Packet::Command { opcode, payload }, total)
}
