//! Checksums used on the wire.
//!
//! Command packets carry an additive 8-bit checksum over `cmd_id ‖ payload`.
//! Stream packets carry a reflected CRC-8 (polynomial 0x31, processed LSB-first as 0x8C,
//! zero init, no final xor), better known as CRC-8/MAXIM-DOW.

use crc::{Algorithm, Crc};

/// Stream packet CRC-8 parameters.
pub const STREAM_CRC8: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0x00,
    refin: true,
    refout: true,
    xorout: 0x00,
    check: 0xa1,
    residue: 0x00,
};

const CRC8: Crc<u8> = Crc::<u8>::new(&STREAM_CRC8);

/// Additive checksum: the byte sum modulo 256.
#[inline]
pub fn additive_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Checksum of a command packet body (`cmd_id` followed by its payload).
#[inline]
pub fn command_checksum(cmd_id: u8, payload: &[u8]) -> u8 {
    cmd_id.wrapping_add(additive_checksum(payload))
}

/// CRC-8 of a stream packet body (everything between the magic byte and the CRC byte).
#[inline]
pub fn crc8(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}
