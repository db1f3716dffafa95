//! Device profiles: the per-part memory map UPDI operations are relative to.

/// Which NVM controller generation the target has.
///
/// V0 parts (tinyAVR 0/1-series) stage writes through a page buffer; V1
/// parts (AVR-Dx) have no page buffer and write flash words directly. The
/// reference tool this crate is descended from picks the write path by
/// reassigning a method pointer at runtime once the SIB is read; this is
/// the tagged-variant replacement dispatched in `App::write_nvm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmVariant {
    V0,
    V1,
}

#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub name: &'static str,
    pub flash_start: u32,
    pub flash_size: u32,
    pub flash_pagesize: u32,
    pub syscfg_address: u32,
    pub nvmctrl_address: u32,
    pub sigrow_address: u32,
    pub fuses_address: u32,
    pub userrow_address: u32,
    pub lock_address: Option<u32>,
    pub nvm_variant: NvmVariant,
}

macro_rules! tiny_profile {
    ($name:expr, $flash_size:expr) => {
        DeviceProfile {
            name: $name,
            flash_start: 0x8000,
            flash_size: $flash_size,
            flash_pagesize: 64,
            syscfg_address: 0x0F00,
            nvmctrl_address: 0x1000,
            sigrow_address: 0x1100,
            fuses_address: 0x1280,
            userrow_address: 0x1300,
            lock_address: None,
            nvm_variant: NvmVariant::V0,
        }
    };
}

const ATTINY817: DeviceProfile = tiny_profile!("attiny817", 8 * 1024);
const ATTINY816: DeviceProfile = tiny_profile!("attiny816", 8 * 1024);
const ATTINY814: DeviceProfile = tiny_profile!("attiny814", 8 * 1024);
const ATTINY417: DeviceProfile = tiny_profile!("attiny417", 4 * 1024);

/// AVR-Dx representative profile: 24-bit addressing, no page buffer, and a
/// LOCKBIT byte at its own address rather than in the fuses block.
const AVR128DA28: DeviceProfile = DeviceProfile {
    name: "avr128da28",
    flash_start: 0x800000,
    flash_size: 128 * 1024,
    flash_pagesize: 256,
    syscfg_address: 0x0F00,
    nvmctrl_address: 0x1000,
    sigrow_address: 0x1080,
    fuses_address: 0x1050,
    userrow_address: 0x1100,
    lock_address: Some(0x1040),
    nvm_variant: NvmVariant::V1,
};

const PROFILES: &[DeviceProfile] = &[
    ATTINY817,
    ATTINY816,
    ATTINY814,
    ATTINY417,
    AVR128DA28,
];

/// Looks up a device profile by part name (case-sensitive, matching the
/// datasheet part number).
pub fn lookup(name: &str) -> Option<DeviceProfile> {
    PROFILES.iter().find(|p| p.name == name).cloned()
}

pub fn supported_devices() -> Vec<&'static str> {
    PROFILES.iter().map(|p| p.name).collect()
}
