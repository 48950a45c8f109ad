//! Wire format of the OpenOCD `jtag_vpi` remote-bitbang protocol.
//!
//! Every request and every reply is one fixed-size little-endian record.

use thiserror::Error;

/// Capacity of each data buffer in bytes.
pub const XFER_MAX_SIZE: usize = 512;

/// Size in bytes of one encoded record.
pub const PACKET_SIZE: usize = 4 + XFER_MAX_SIZE + XFER_MAX_SIZE + 4 + 4;

const BUFFER_OUT_OFFSET: usize = 4;
const BUFFER_IN_OFFSET: usize = BUFFER_OUT_OFFSET + XFER_MAX_SIZE;
const LENGTH_OFFSET: usize = BUFFER_IN_OFFSET + XFER_MAX_SIZE;
const NB_BITS_OFFSET: usize = LENGTH_OFFSET + 4;

/// Request kinds carried in the `cmd` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VpiCommand {
    /// Force the TAP into Test-Logic-Reset.
    Reset = 0,
    /// Clock a sequence of TMS values.
    TmsSeq = 1,
    /// Shift TDI bits with TMS held low and capture TDO.
    ScanChain = 2,
    /// Like [`ScanChain`](Self::ScanChain) but TMS rises on the final bit.
    ScanChainFlipTms = 3,
    /// Client is ending the session.
    StopSimulation = 4,
}

impl VpiCommand {
    /// Converts a wire value into a known command.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Reset),
            1 => Some(Self::TmsSeq),
            2 => Some(Self::ScanChain),
            3 => Some(Self::ScanChainFlipTms),
            4 => Some(Self::StopSimulation),
            _ => None,
        }
    }

    /// Returns true for commands whose bit count comes from the packet.
    #[must_use]
    pub const fn carries_bits(self) -> bool {
        matches!(self, Self::TmsSeq | Self::ScanChain | Self::ScanChainFlipTms)
    }
}

/// Reasons a received record is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum PacketError {
    /// `cmd` is outside the known command set.
    #[error("unknown jtag_vpi command {0}")]
    UnknownCommand(u32),
    /// `length` exceeds the buffer capacity.
    #[error("transfer length {0} exceeds 512 bytes")]
    LengthTooLarge(u32),
    /// `nb_bits` does not fit in `length` bytes.
    #[error("{nb_bits} bits do not fit in {length} bytes")]
    BitCountExceedsLength {
        /// Declared bit count.
        nb_bits: u32,
        /// Declared byte length.
        length: u32,
    },
}

/// One decoded `jtag_vpi` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpiPacket {
    /// Raw command field.
    pub cmd: u32,
    /// Bits sent by the client (TMS or TDI, LSB first).
    pub buffer_out: [u8; XFER_MAX_SIZE],
    /// Bits captured from TDO, LSB first.
    pub buffer_in: [u8; XFER_MAX_SIZE],
    /// Number of meaningful bytes in the buffers.
    pub length: u32,
    /// Number of bits to clock.
    pub nb_bits: u32,
}

impl Default for VpiPacket {
    fn default() -> Self {
        Self {
            cmd: 0,
            buffer_out: [0; XFER_MAX_SIZE],
            buffer_in: [0; XFER_MAX_SIZE],
            length: 0,
            nb_bits: 0,
        }
    }
}

impl VpiPacket {
    /// Builds a request carrying `nb_bits` bits taken from `bits`.
    #[must_use]
    pub fn request(command: VpiCommand, bits: &[u8], nb_bits: u32) -> Self {
        let mut packet = Self {
            cmd: command as u32,
            ..Self::default()
        };
        let len = bits.len().min(XFER_MAX_SIZE);
        packet.buffer_out[..len].copy_from_slice(&bits[..len]);
        packet.length = u32::try_from(len).unwrap_or(0);
        packet.nb_bits = nb_bits;
        packet
    }

    /// Decodes one record; `bytes` must hold at least [`PACKET_SIZE`] bytes.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < PACKET_SIZE {
            return None;
        }
        let mut packet = Self {
            cmd: read_u32(bytes, 0),
            length: read_u32(bytes, LENGTH_OFFSET),
            nb_bits: read_u32(bytes, NB_BITS_OFFSET),
            ..Self::default()
        };
        packet
            .buffer_out
            .copy_from_slice(&bytes[BUFFER_OUT_OFFSET..BUFFER_IN_OFFSET]);
        packet
            .buffer_in
            .copy_from_slice(&bytes[BUFFER_IN_OFFSET..LENGTH_OFFSET]);
        Some(packet)
    }

    /// Encodes the record in wire order.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PACKET_SIZE);
        bytes.extend_from_slice(&self.cmd.to_le_bytes());
        bytes.extend_from_slice(&self.buffer_out);
        bytes.extend_from_slice(&self.buffer_in);
        bytes.extend_from_slice(&self.length.to_le_bytes());
        bytes.extend_from_slice(&self.nb_bits.to_le_bytes());
        bytes
    }

    /// Validates the header and returns the command it carries.
    ///
    /// # Errors
    ///
    /// Returns a [`PacketError`] for unknown commands or inconsistent sizes.
    pub fn command(&self) -> Result<VpiCommand, PacketError> {
        let command = VpiCommand::from_u32(self.cmd).ok_or(PacketError::UnknownCommand(self.cmd))?;
        if !command.carries_bits() {
            return Ok(command);
        }
        if self.length as usize > XFER_MAX_SIZE {
            return Err(PacketError::LengthTooLarge(self.length));
        }
        if u64::from(self.nb_bits) > u64::from(self.length) * 8 {
            return Err(PacketError::BitCountExceedsLength {
                nb_bits: self.nb_bits,
                length: self.length,
            });
        }
        Ok(command)
    }
}

/// Reads bit `index` (LSB-first within each byte).
#[must_use]
pub fn bit(buffer: &[u8], index: usize) -> bool {
    buffer
        .get(index / 8)
        .is_some_and(|byte| (byte >> (index % 8)) & 1 != 0)
}

/// Sets or clears bit `index` (LSB-first within each byte).
pub fn set_bit(buffer: &mut [u8], index: usize, value: bool) {
    if let Some(byte) = buffer.get_mut(index / 8) {
        let mask = 1u8 << (index % 8);
        if value {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}
