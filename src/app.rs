//! Application layer: reset sequencing, key-based programming-mode entry,
//! NVM controller command execution, batched memory access.

use log::{error, info};

use crate::consts::{cs, ctrlb, key, key_status, nvm_status, nvmctrl, nvmctrl_v0, nvmctrl_v1, sys_status, RESET_REQ_VALUE, UPDI_MAX_REPEAT_SIZE};
use crate::error::AppError;
use crate::link::{KeySize, Link};
use crate::nvm::device::{DeviceProfile, NvmVariant};
use crate::phy::SerialTransport;

pub struct DeviceInfo {
    pub family: String,
    pub nvm: String,
    pub ocd: String,
    pub osc: String,
    pub pdi_revision: u8,
    pub device_id: Option<String>,
    pub device_rev: Option<String>,
}

/// Application layer, generic over the transport used by the link below it.
pub struct App<T: SerialTransport> {
    link: Link<T>,
    device: Option<DeviceProfile>,
    /// Overrides `device.nvm_variant` once the SIB is read and reports a
    /// "P:2" NVM interface, regardless of what the static profile table
    /// says. Mirrors the original tool's runtime reassignment of
    /// `self.write_nvm` in `device_info()` (see DESIGN.md).
    nvm_variant_override: Option<NvmVariant>,
}

impl<T: SerialTransport> App<T> {
    pub fn new(link: Link<T>, device: Option<DeviceProfile>) -> Self {
        App {
            link,
            device,
            nvm_variant_override: None,
        }
    }

    fn device(&self) -> Result<&DeviceProfile, AppError> {
        self.device.as_ref().ok_or(AppError::NotConfigured)
    }

    pub fn in_prog_mode(&mut self) -> bool {
        self.link.ldcs(cs::ASI_SYS_STATUS) & (1 << sys_status::NVMPROG) != 0
    }

    fn is_locked(&mut self) -> bool {
        self.link.ldcs(cs::ASI_SYS_STATUS) & (1 << sys_status::LOCKSTATUS) != 0
    }

    pub fn device_info(&mut self) -> Result<DeviceInfo, AppError> {
        let sib = self.link.read_sib()?;
        info!("SIB read out as: {:02x?}", sib);

        let field = |range: std::ops::Range<usize>| -> String {
            sib.get(range)
                .map(|s| String::from_utf8_lossy(s).trim().to_string())
                .unwrap_or_default()
        };

        let family = field(0..7);
        let nvm = field(8..11);
        let ocd = field(11..14);
        let osc = field(15..19);
        info!("device family '{}', nvm interface '{}'", family, nvm);

        if nvm == "P:2" {
            info!("using PDI v2, switching to 24-bit addressing and the V1 write path");
            self.link.set_24bit_updi(true);
            self.nvm_variant_override = Some(NvmVariant::V1);
        }

        let pdi_revision = self.link.ldcs(cs::STATUSA) >> 4;

        let mut device_id = None;
        let mut device_rev = None;
        if self.in_prog_mode() {
            if let Some(device) = self.device.clone() {
                let id_bytes = self.read_data(device.sigrow_address, 3)?;
                device_id = Some(format!(
                    "{:X}{:X}{:X}",
                    id_bytes[0], id_bytes[1], id_bytes[2]
                ));
                let rev_byte = self.read_data(device.syscfg_address + 1, 1)?[0];
                device_rev = Some(((b'A' + rev_byte) as char).to_string());
            }
        }

        Ok(DeviceInfo {
            family,
            nvm,
            ocd,
            osc,
            pdi_revision,
            device_id,
            device_rev,
        })
    }

    /// Returns the NVM write command variant to use. Prefers the override
    /// set by [`App::device_info`] when the SIB reports a "P:2" NVM
    /// interface at runtime over the static tag in the configured
    /// `DeviceProfile`, so a part whose profile is stale or generic still
    /// gets the write path its hardware actually needs.
    pub fn nvm_variant(&self) -> NvmVariant {
        self.nvm_variant_override
            .or_else(|| self.device.as_ref().map(|d| d.nvm_variant))
            .unwrap_or(NvmVariant::V0)
    }

    fn wait_unlocked(&mut self, timeout_ms: u64) -> bool {
        let timeout = crate::timeout::Timeout::new(timeout_ms);
        while !timeout.expired() {
            if !self.is_locked() {
                return true;
            }
        }
        info!("timeout waiting for device to unlock");
        false
    }

    /// Sends the chip-erase key, confirms it, re-enters programming mode
    /// (required so CRC can be disabled or flash reprogrammed after the
    /// erase), then toggles reset and waits for the lock to clear.
    pub fn unlock(&mut self) -> Result<(), AppError> {
        self.link.key(KeySize::Bits64, key::CHIP_ERASE)?;
        let status = self.link.ldcs(cs::ASI_KEY_STATUS);
        if status & (1 << key_status::CHIPERASE) == 0 {
            return Err(AppError::KeyRejected);
        }

        self.progmode_key()?;

        self.reset(true)?;
        self.reset(false)?;

        if !self.wait_unlocked(200) {
            return Err(AppError::UnlockTimeout);
        }
        Ok(())
    }

    fn progmode_key(&mut self) -> Result<(), AppError> {
        if self.in_prog_mode() {
            info!("already in NVM programming mode");
            return Ok(());
        }
        self.link.key(KeySize::Bits64, key::NVM)?;
        let status = self.link.ldcs(cs::ASI_KEY_STATUS);
        if status & (1 << key_status::NVMPROG) == 0 {
            return Err(AppError::KeyRejected);
        }
        Ok(())
    }

    /// Enters programming mode, bounded by a 200ms poll for NVMPROG
    /// (the original tool polls unboundedly here; this crate bounds it).
    pub fn enter_progmode(&mut self) -> Result<bool, AppError> {
        if self.in_prog_mode() {
            return Ok(true);
        }

        self.progmode_key()?;
        self.reset(true)?;
        self.reset(false)?;

        if self.is_locked() {
            return Err(AppError::DeviceLocked);
        }

        let timeout = crate::timeout::Timeout::new(200);
        while !timeout.expired() {
            if self.in_prog_mode() {
                info!("now in NVM programming mode");
                return Ok(true);
            }
        }
        Err(AppError::EnterProgmodeTimeout)
    }

    pub fn leave_progmode(&mut self) -> Result<(), AppError> {
        info!("leaving NVM programming mode");
        self.reset(true)?;
        self.reset(false)?;
        self.link
            .stcs(cs::CTRLB, (1 << ctrlb::UPDIDIS_BIT) | (1 << ctrlb::CCDETDIS_BIT))?;
        Ok(())
    }

    fn reset(&mut self, apply: bool) -> Result<(), AppError> {
        if apply {
            self.link.stcs(cs::ASI_RESET_REQ, RESET_REQ_VALUE)?;
            let status = self.link.ldcs(cs::ASI_SYS_STATUS);
            if status & (1 << sys_status::RSTSYS) == 0 {
                return Err(AppError::ResetAssertFailed);
            }
        } else {
            self.link.stcs(cs::ASI_RESET_REQ, 0x00)?;
            let timeout = crate::timeout::Timeout::new(200);
            while !timeout.expired() {
                let status = self.link.ldcs(cs::ASI_SYS_STATUS);
                if status & (1 << sys_status::RSTSYS) == 0 {
                    return Ok(());
                }
            }
            return Err(AppError::ResetReleaseFailed);
        }
        Ok(())
    }

    /// Polls the NVM controller status register until neither FLASH_BUSY
    /// nor EEPROM_BUSY is set, bounded by a 10 second deadline.
    pub fn wait_flash_ready(&mut self) -> Result<bool, AppError> {
        let device = self.device()?.clone();
        let timeout = crate::timeout::Timeout::new(10_000);
        while !timeout.expired() {
            let status = self
                .link
                .ld(device.nvmctrl_address + nvmctrl::STATUS)
                .map_err(AppError::from)?;
            if status & (1 << nvm_status::WRITE_ERROR) != 0 {
                return Ok(false);
            }
            if status & ((1 << nvm_status::EEPROM_BUSY) | (1 << nvm_status::FLASH_BUSY)) == 0 {
                return Ok(true);
            }
        }
        error!("wait flash ready timed out");
        Err(AppError::FlashReadyTimeout)
    }

    pub fn execute_nvm_command(&mut self, command: u8) -> Result<(), AppError> {
        let device = self.device()?.clone();
        self.link
            .st(device.nvmctrl_address + nvmctrl::CTRLA, command)
            .map_err(AppError::from)
    }

    pub fn chip_erase(&mut self) -> Result<(), AppError> {
        info!("chip erase using NVM CTRL");
        if !self.wait_flash_ready()? {
            return Err(AppError::NvmWriteError);
        }
        let command = match self.nvm_variant() {
            NvmVariant::V0 => nvmctrl_v0::CHIP_ERASE,
            NvmVariant::V1 => nvmctrl_v1::CHIP_ERASE,
        };
        self.execute_nvm_command(command)?;
        if !self.wait_flash_ready()? {
            return Err(AppError::NvmWriteError);
        }
        Ok(())
    }

    pub fn write_data_words(&mut self, address: u32, data: &[u8]) -> Result<(), AppError> {
        if data.len() == 2 {
            let value = u16::from_le_bytes([data[0], data[1]]);
            return self.link.st16(address as u16, value).map_err(AppError::from);
        }
        debug_assert!(data.len() <= UPDI_MAX_REPEAT_SIZE * 2);
        self.link.st_ptr(address as u16)?;
        self.link.repeat(data.len() / 2)?;
        self.link.st_ptr_inc16(data).map_err(AppError::from)
    }

    pub fn write_data(&mut self, address: u32, data: &[u8]) -> Result<(), AppError> {
        if data.len() == 1 {
            return self.link.st(address as u16, data[0]).map_err(AppError::from);
        }
        if data.len() == 2 {
            self.link.st(address as u16, data[0])?;
            return self
                .link
                .st(address as u16 + 1, data[1])
                .map_err(AppError::from);
        }
        debug_assert!(data.len() <= UPDI_MAX_REPEAT_SIZE);
        self.link.st_ptr(address as u16)?;
        self.link.repeat(data.len())?;
        self.link.st_ptr_inc(data).map_err(AppError::from)
    }

    /// Writes a page through the page buffer (tinyAVR 0/1-series): clear
    /// the buffer, fill it via word writes, commit with WRITE_PAGE.
    pub fn write_nvm_v0(&mut self, address: u32, data: &[u8]) -> Result<(), AppError> {
        if !self.wait_flash_ready()? {
            return Err(AppError::NvmWriteError);
        }
        info!("clear page buffer");
        self.execute_nvm_command(nvmctrl_v0::PAGE_BUFFER_CLR)?;
        if !self.wait_flash_ready()? {
            return Err(AppError::NvmWriteError);
        }

        self.write_data_words(address, data)?;

        info!("committing page");
        self.execute_nvm_command(nvmctrl_v0::WRITE_PAGE)?;
        if !self.wait_flash_ready()? {
            return Err(AppError::NvmWriteError);
        }
        Ok(())
    }

    /// Writes data directly (AVR-Dx, no page buffer): issue FLASH_WRITE,
    /// stream the words, then clear the command.
    pub fn write_nvm_v1(&mut self, address: u32, data: &[u8]) -> Result<(), AppError> {
        if !self.wait_flash_ready()? {
            return Err(AppError::NvmWriteError);
        }
        info!("NVM write command");
        self.execute_nvm_command(nvmctrl_v1::FLASH_WRITE)?;

        self.write_data_words(address, data)?;

        if !self.wait_flash_ready()? {
            return Err(AppError::NvmWriteError);
        }
        info!("clear NVM command");
        self.execute_nvm_command(nvmctrl_v1::NOCMD)?;
        Ok(())
    }

    pub fn write_nvm(&mut self, address: u32, data: &[u8]) -> Result<(), AppError> {
        match self.nvm_variant() {
            NvmVariant::V0 => self.write_nvm_v0(address, data),
            NvmVariant::V1 => self.write_nvm_v1(address, data),
        }
    }

    pub fn read_data(&mut self, address: u32, size: usize) -> Result<Vec<u8>, AppError> {
        debug_assert!(size <= UPDI_MAX_REPEAT_SIZE);
        self.link.st_ptr(address as u16)?;
        if size > 1 {
            self.link.repeat(size)?;
        }
        self.link.ld_ptr_inc(size).map_err(AppError::from)
    }

    pub fn read_data_words(&mut self, address: u32, words: usize) -> Result<Vec<u8>, AppError> {
        debug_assert!(words <= UPDI_MAX_REPEAT_SIZE);
        self.link.st_ptr(address as u16)?;
        if words > 1 {
            self.link.repeat(words)?;
        }
        self.link.ld_ptr_inc16(words).map_err(AppError::from)
    }

    pub fn ld(&mut self, address: u32) -> Result<u8, AppError> {
        self.link.ld(address as u16).map_err(AppError::from)
    }

    pub fn write_data_bytes(&mut self, address: u32, data: &[u8]) -> Result<(), AppError> {
        self.write_data(address, data)
    }
}
