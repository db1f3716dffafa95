//! Top-level NVM programming operations built on top of the application layer.

pub mod device;
pub mod page;

use log::info;

use crate::app::{App, DeviceInfo};
use crate::consts::nvmctrl;
use crate::error::NvmError;
use crate::link::Link;
use crate::phy::{Phy, SerialTransport};
use device::DeviceProfile;

/// Result of a verified flash write: which offsets, if any, didn't read
/// back as written. The operation is not aborted on mismatch — every
/// mismatch is collected and reported.
#[derive(Debug, Default)]
pub struct FlashWriteReport {
    pub success: bool,
    pub mismatches: Vec<(usize, u8, u8)>,
}

pub struct UpdiNvmProgrammer<T: SerialTransport> {
    app: App<T>,
    device: DeviceProfile,
    in_progmode: bool,
}

impl UpdiNvmProgrammer<Box<dyn serialport::SerialPort>> {
    /// Opens a real serial port and brings up the full PHY/DL/APP stack.
    pub fn open(port: &str, baud: u32, device: DeviceProfile) -> Result<Self, crate::error::ProtocolError> {
        let phy = Phy::open(port, baud)?;
        let link = Link::new(phy)?;
        let app = App::new(link, Some(device.clone()));
        Ok(UpdiNvmProgrammer {
            app,
            device,
            in_progmode: false,
        })
    }
}

impl<T: SerialTransport> UpdiNvmProgrammer<T> {
    /// Wraps an already-constructed application layer (used by tests with
    /// a mock transport).
    pub fn from_app(app: App<T>, device: DeviceProfile) -> Self {
        UpdiNvmProgrammer {
            app,
            device,
            in_progmode: false,
        }
    }

    pub fn get_device_info(&mut self) -> Result<DeviceInfo, NvmError> {
        info!("reading device info");
        Ok(self.app.device_info()?)
    }

    pub fn enter_progmode(&mut self) -> Result<(), NvmError> {
        info!("entering NVM programming mode");
        self.in_progmode = self.app.enter_progmode()?;
        Ok(())
    }

    pub fn leave_progmode(&mut self) -> Result<(), NvmError> {
        info!("leaving NVM programming mode");
        self.app.leave_progmode()?;
        self.in_progmode = false;
        Ok(())
    }

    pub fn unlock_device(&mut self) -> Result<(), NvmError> {
        if self.in_progmode {
            info!("device already unlocked");
            return Ok(());
        }
        self.app.unlock()?;
        self.in_progmode = true;
        Ok(())
    }

    pub fn in_progmode(&self) -> bool {
        self.in_progmode
    }

    fn require_progmode(&self) -> Result<(), NvmError> {
        if !self.in_progmode {
            return Err(NvmError::NotInProgmode);
        }
        Ok(())
    }

    pub fn chip_erase(&mut self) -> Result<(), NvmError> {
        self.require_progmode()?;
        Ok(self.app.chip_erase()?)
    }

    pub fn read_flash(&mut self, address: u32, size: u32) -> Result<Vec<u8>, NvmError> {
        self.require_progmode()?;
        let pagesize = self.device.flash_pagesize;
        if size % pagesize != 0 {
            return Err(NvmError::Unaligned {
                size: size as usize,
                pagesize: pagesize as usize,
            });
        }

        let mut data = Vec::with_capacity(size as usize);
        let mut addr = address;
        let pages = size / pagesize;
        for _ in 0..pages {
            info!("reading page at 0x{:04X}", addr);
            data.extend(self.app.read_data_words(addr, (pagesize / 2) as usize)?);
            addr += pagesize;
        }
        Ok(data)
    }

    pub fn write_flash(&mut self, address: u32, data: &[u8]) -> Result<(), NvmError> {
        self.require_progmode()?;
        if data.len() as u32 > self.device.flash_size {
            return Err(NvmError::ImageTooLarge {
                len: data.len(),
                flash_size: self.device.flash_size as usize,
            });
        }

        let padded = page::pad(data.to_vec(), self.device.flash_pagesize as usize);
        let pages = page::split(&padded, self.device.flash_pagesize as usize);

        let mut addr = address;
        for page in pages {
            info!("writing page at 0x{:04X}", addr);
            self.app.write_nvm(addr, page)?;
            addr += page.len() as u32;
        }
        Ok(())
    }

    /// Writes flash and reads it back, reporting every mismatched offset
    /// without aborting on the first one.
    pub fn write_flash_verified(
        &mut self,
        address: u32,
        data: &[u8],
    ) -> Result<FlashWriteReport, NvmError> {
        self.write_flash(address, data)?;

        let padded_len = {
            let pagesize = self.device.flash_pagesize as usize;
            let rem = data.len() % pagesize;
            if rem == 0 {
                data.len()
            } else {
                data.len() + (pagesize - rem)
            }
        };
        let readback = self.read_flash(address, padded_len as u32)?;

        let mut report = FlashWriteReport {
            success: true,
            mismatches: Vec::new(),
        };
        let padded = page::pad(data.to_vec(), self.device.flash_pagesize as usize);
        for (offset, (expected, actual)) in padded.iter().zip(readback.iter()).enumerate() {
            if expected != actual {
                report.success = false;
                report.mismatches.push((offset, *expected, *actual));
            }
        }
        Ok(report)
    }

    pub fn read_fuse(&mut self, fuse_num: u32) -> Result<u8, NvmError> {
        self.require_progmode()?;
        let address = self.device.fuses_address + fuse_num;
        Ok(self.app.ld(address)?)
    }

    pub fn write_fuse(&mut self, fuse_num: u32, value: u8) -> Result<(), NvmError> {
        self.require_progmode()?;
        if !self.app.wait_flash_ready()? {
            return Err(NvmError::App(crate::error::AppError::NvmWriteError));
        }

        let fuse_address = self.device.fuses_address + fuse_num;
        let base = self.device.nvmctrl_address;

        self.app
            .write_data_bytes(base + nvmctrl::ADDRL, &[(fuse_address & 0xFF) as u8])?;
        self.app
            .write_data_bytes(base + nvmctrl::ADDRH, &[(fuse_address >> 8) as u8])?;
        self.app
            .write_data_bytes(base + nvmctrl::DATAL, &[value])?;

        let command = match self.app.nvm_variant() {
            device::NvmVariant::V0 => crate::consts::nvmctrl_v0::WRITE_FUSE,
            device::NvmVariant::V1 => crate::consts::nvmctrl_v1::WRITE_FUSE,
        };
        self.app.execute_nvm_command(command)?;
        Ok(())
    }
}

/// Loads an Intel HEX image, returning the byte image and its start
/// address. Offsets the start address to the device's flash-start base if
/// the hex file's addresses are relative (0-based).
pub fn load_ihex(contents: &str, device: &DeviceProfile) -> Result<(Vec<u8>, u32), NvmError> {
    use ihex::Record;

    let mut image: Vec<u8> = Vec::new();
    let mut base_offset: u32 = 0;
    let mut min_address: Option<u32> = None;

    for record in ihex::Reader::new(contents) {
        let record = record.map_err(|_| NvmError::ImageTooLarge {
            len: contents.len(),
            flash_size: device.flash_size as usize,
        })?;
        match record {
            Record::Data { offset, value } => {
                let addr = base_offset + offset as u32;
                min_address = Some(min_address.map_or(addr, |m| m.min(addr)));
                let end = (addr + value.len() as u32) as usize;
                if image.len() < end {
                    image.resize(end, 0xFF);
                }
                for (i, byte) in value.into_iter().enumerate() {
                    image[addr as usize + i] = byte;
                }
            }
            Record::ExtendedLinearAddress(upper) => {
                base_offset = (upper as u32) << 16;
            }
            Record::ExtendedSegmentAddress(segment) => {
                base_offset = (segment as u32) << 4;
            }
            Record::EndOfFile => break,
            _ => {}
        }
    }

    if image.len() as u32 > device.flash_size {
        return Err(NvmError::ImageTooLarge {
            len: image.len(),
            flash_size: device.flash_size as usize,
        });
    }

    let mut start_address = min_address.unwrap_or(0);
    if start_address < device.flash_start {
        start_address += device.flash_start;
    }

    Ok((image, start_address))
}
