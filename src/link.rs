//! Data-link layer: UPDI instruction encoding, ACK discipline, keys, SIB.

use log::info;

use crate::consts::{cs, ctrla, ctrlb, key, opcode, ptr, repeat, size, UPDI_MAX_REPEAT_SIZE, UPDI_PHY_ACK, UPDI_PHY_SYNC};
use crate::error::LinkError;
use crate::phy::{Phy, SerialTransport};

/// Key size selector for the `KEY` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySize {
    Bits64,
    Bits128,
}

impl KeySize {
    fn flag(self) -> u8 {
        match self {
            KeySize::Bits64 => key::SIZE_64,
            KeySize::Bits128 => key::SIZE_128,
        }
    }

    fn byte_len(self) -> usize {
        match self {
            KeySize::Bits64 => 8,
            KeySize::Bits128 => 16,
        }
    }
}

pub struct Link<T: SerialTransport> {
    phy: Phy<T>,
    address_size_flag: u8,
}

impl<T: SerialTransport> Link<T> {
    /// Brings up the data link on top of an already-open physical layer:
    /// disables collision detection (TX/RX are tied together), enables the
    /// inter-byte delay bit, then checks STATUSA is non-zero. On failure,
    /// sends a double break and retries once before giving up.
    pub fn new(phy: Phy<T>) -> Result<Self, LinkError> {
        let mut link = Link {
            phy,
            address_size_flag: size::ADDRESS_16,
        };
        link.init()?;
        if !link.check()? {
            link.phy.send_double_break()?;
            link.init()?;
            if !link.check()? {
                return Err(LinkError::InitFailed);
            }
        }
        Ok(link)
    }

    fn init(&mut self) -> Result<(), LinkError> {
        self.stcs(cs::CTRLB, 1 << ctrlb::CCDETDIS_BIT)?;
        self.stcs(cs::CTRLA, 1 << ctrla::IBDLY_BIT)?;
        Ok(())
    }

    fn check(&mut self) -> Result<bool, LinkError> {
        let ok = self.ldcs(cs::STATUSA) != 0;
        if ok {
            info!("UPDI init OK");
        } else {
            info!("UPDI not OK - reinitialisation required");
        }
        Ok(ok)
    }

    /// Switches address-size encoding for subsequent instructions. Used
    /// once the SIB reports a "P:2" NVM interface (AVR-Dx, 24-bit UPDI).
    pub fn set_24bit_updi(&mut self, enabled: bool) {
        self.address_size_flag = if enabled { size::ADDRESS_24 } else { size::ADDRESS_16 };
    }

    pub fn ldcs(&mut self, address: u8) -> u8 {
        let _ = self
            .phy
            .send(&[UPDI_PHY_SYNC, opcode::LDCS | (address & 0x0F)]);
        let response = self.phy.receive(1);
        if response.len() != 1 {
            return 0x00;
        }
        response[0]
    }

    pub fn stcs(&mut self, address: u8, value: u8) -> Result<(), LinkError> {
        self.phy
            .send(&[UPDI_PHY_SYNC, opcode::STCS | (address & 0x0F), value])?;
        Ok(())
    }

    pub fn ld(&mut self, address: u16) -> Result<u8, LinkError> {
        self.phy.send(&[
            UPDI_PHY_SYNC,
            opcode::LDS | self.address_size_flag | size::DATA_8,
            (address & 0xFF) as u8,
            (address >> 8) as u8,
        ])?;
        let response = self.phy.receive(1);
        response.first().copied().ok_or(LinkError::NoAck)
    }

    pub fn ld16(&mut self, address: u16) -> Result<u16, LinkError> {
        self.phy.send(&[
            UPDI_PHY_SYNC,
            opcode::LDS | self.address_size_flag | size::DATA_16,
            (address & 0xFF) as u8,
            (address >> 8) as u8,
        ])?;
        let response = self.phy.receive(2);
        if response.len() != 2 {
            return Err(LinkError::NoAck);
        }
        Ok(u16::from_le_bytes([response[0], response[1]]))
    }

    fn expect_ack(&mut self) -> Result<(), LinkError> {
        let response = self.phy.receive(1);
        if response.len() != 1 || response[0] != UPDI_PHY_ACK {
            return Err(LinkError::NoAck);
        }
        Ok(())
    }

    pub fn st(&mut self, address: u16, value: u8) -> Result<(), LinkError> {
        self.phy.send(&[
            UPDI_PHY_SYNC,
            opcode::STS | self.address_size_flag | size::DATA_8,
            (address & 0xFF) as u8,
            (address >> 8) as u8,
        ])?;
        self.expect_ack()?;
        self.phy.send(&[value])?;
        self.expect_ack()
    }

    pub fn st16(&mut self, address: u16, value: u16) -> Result<(), LinkError> {
        self.phy.send(&[
            UPDI_PHY_SYNC,
            opcode::STS | self.address_size_flag | size::DATA_16,
            (address & 0xFF) as u8,
            (address >> 8) as u8,
        ])?;
        self.expect_ack()?;
        self.phy
            .send(&[(value & 0xFF) as u8, (value >> 8) as u8])?;
        self.expect_ack()
    }

    pub fn ld_ptr_inc(&mut self, size: usize) -> Result<Vec<u8>, LinkError> {
        self.phy
            .send(&[UPDI_PHY_SYNC, opcode::LD | ptr::INC | crate::consts::size::DATA_8])?;
        Ok(self.phy.receive(size))
    }

    pub fn ld_ptr_inc16(&mut self, words: usize) -> Result<Vec<u8>, LinkError> {
        self.phy
            .send(&[UPDI_PHY_SYNC, opcode::LD | ptr::INC | crate::consts::size::DATA_16])?;
        Ok(self.phy.receive(words * 2))
    }

    pub fn st_ptr(&mut self, address: u16) -> Result<(), LinkError> {
        self.phy.send(&[
            UPDI_PHY_SYNC,
            opcode::ST | ptr::ADDRESS | crate::consts::size::DATA_16,
            (address & 0xFF) as u8,
            (address >> 8) as u8,
        ])?;
        self.expect_ack()
    }

    pub fn st_ptr_inc(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.phy
            .send(&[UPDI_PHY_SYNC, opcode::ST | ptr::INC | crate::consts::size::DATA_8, data[0]])?;
        self.expect_ack()?;
        for &byte in &data[1..] {
            self.phy.send(&[byte])?;
            self.expect_ack()?;
        }
        Ok(())
    }

    pub fn st_ptr_inc16(&mut self, data: &[u8]) -> Result<(), LinkError> {
        self.phy.send(&[
            UPDI_PHY_SYNC,
            opcode::ST | ptr::INC | crate::consts::size::DATA_16,
            data[0],
            data[1],
        ])?;
        self.expect_ack()?;
        let mut n = 2;
        while n < data.len() {
            self.phy.send(&[data[n], data[n + 1]])?;
            self.expect_ack()?;
            n += 2;
        }
        Ok(())
    }

    /// Loads the repeat counter so the following LD/ST executes `repeats`
    /// times. The hardware counter holds `repeats - 1`.
    pub fn repeat(&mut self, repeats: usize) -> Result<(), LinkError> {
        info!("repeat {}", repeats);
        debug_assert!(repeats >= 1 && repeats <= UPDI_MAX_REPEAT_SIZE);
        let n = (repeats - 1) as u16;
        self.phy.send(&[
            UPDI_PHY_SYNC,
            opcode::REPEAT | repeat::WORD,
            (n & 0xFF) as u8,
            (n >> 8) as u8,
        ])?;
        Ok(())
    }

    pub fn read_sib(&mut self) -> Result<Vec<u8>, LinkError> {
        Ok(self.phy.sib()?)
    }

    /// Sends a key; the key bytes go out MSB-last (reversed) as required by
    /// the protocol.
    pub fn key(&mut self, size: KeySize, key_bytes: &[u8]) -> Result<(), LinkError> {
        info!("writing key");
        if key_bytes.len() != size.byte_len() {
            return Err(LinkError::InvalidKeyLength {
                expected: size.byte_len(),
                got: key_bytes.len(),
            });
        }
        self.phy
            .send(&[UPDI_PHY_SYNC, opcode::KEY | key::KEY | size.flag()])?;
        let reversed: Vec<u8> = key_bytes.iter().rev().copied().collect();
        self.phy.send(&reversed)?;
        Ok(())
    }
}
