//! End-to-end tests driving the full PHY/DL/APP/NVM stack against a
//! scripted in-memory transport instead of real hardware.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Duration;

use serialport::{Parity, StopBits};

use updi_nvm::app::App;
use updi_nvm::consts::{
    cs, ctrla, ctrlb, key, key_status, nvmctrl, nvmctrl_v0, opcode, ptr, repeat, size,
    sys_status, UPDI_PHY_ACK, UPDI_PHY_SYNC,
};
use updi_nvm::link::Link;
use updi_nvm::nvm::device::{DeviceProfile, NvmVariant};
use updi_nvm::nvm::UpdiNvmProgrammer;
use updi_nvm::phy::{Phy, SerialTransport};

/// A scripted half-duplex transport: every write is recorded, and reads are
/// served from a queue the test pre-loads with the echo bytes (a true copy
/// of whatever is about to be written, since the link is physically looped
/// back) followed by whatever the target would drive onto the line next
/// (an ACK, a register value, a page of data). Shared via `Rc<RefCell<_>>`
/// so the test can keep inspecting `written()` after handing one clone down
/// into the `Phy`/`Link`/`App` stack, which take ownership of the other.
#[derive(Clone)]
struct MockTransport {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Default)]
struct Inner {
    to_read: std::collections::VecDeque<u8>,
    written: Vec<u8>,
}

impl MockTransport {
    fn new() -> Self {
        MockTransport {
            inner: Rc::new(RefCell::new(Inner::default())),
        }
    }

    fn queue(&self, bytes: &[u8]) {
        self.inner.borrow_mut().to_read.extend(bytes.iter().copied());
    }

    fn written(&self) -> Vec<u8> {
        self.inner.borrow().written.clone()
    }
}

impl Read for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        if inner.to_read.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock exhausted"));
        }
        let n = buf.len().min(inner.to_read.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inner.to_read.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        inner.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialTransport for MockTransport {
    fn set_baud_rate(&mut self, _baud: u32) -> io::Result<()> {
        Ok(())
    }

    fn set_parity(&mut self, _parity: Parity) -> io::Result<()> {
        Ok(())
    }

    fn set_stop_bits(&mut self, _stop_bits: StopBits) -> io::Result<()> {
        Ok(())
    }

    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }
}

fn ldcs_bytes(addr: u8) -> Vec<u8> {
    vec![UPDI_PHY_SYNC, opcode::LDCS | (addr & 0x0F)]
}

fn stcs_bytes(addr: u8, value: u8) -> Vec<u8> {
    vec![UPDI_PHY_SYNC, opcode::STCS | (addr & 0x0F), value]
}

/// Queues the echo for an `ldcs` call plus the CS byte the target returns.
fn queue_ldcs(mock: &MockTransport, addr: u8, response: u8) {
    mock.queue(&ldcs_bytes(addr));
    mock.queue(&[response]);
}

/// Queues the echo for an `stcs` call (no ACK is read for STCS).
fn queue_stcs(mock: &MockTransport, addr: u8, value: u8) {
    mock.queue(&stcs_bytes(addr, value));
}

fn queue_ack(mock: &MockTransport) {
    mock.queue(&[UPDI_PHY_ACK]);
}

/// Queues a full `ld()` (LDS, 16-bit address, 8-bit data) round trip.
fn queue_ld(mock: &MockTransport, address: u32, response: u8) {
    mock.queue(&[
        UPDI_PHY_SYNC,
        opcode::LDS | size::ADDRESS_16 | size::DATA_8,
        (address & 0xFF) as u8,
        (address >> 8) as u8,
    ]);
    mock.queue(&[response]);
}

/// Queues a full `st()` (STS, 16-bit address, 8-bit data) round trip: two
/// ACKs, one after the address phase and one after the data byte.
fn queue_st(mock: &MockTransport, address: u32, value: u8) {
    mock.queue(&[
        UPDI_PHY_SYNC,
        opcode::STS | size::ADDRESS_16 | size::DATA_8,
        (address & 0xFF) as u8,
        (address >> 8) as u8,
    ]);
    queue_ack(mock);
    mock.queue(&[value]);
    queue_ack(mock);
}

fn device_profile() -> DeviceProfile {
    DeviceProfile {
        name: "test-part",
        flash_start: 0x8000,
        flash_size: 8 * 1024,
        flash_pagesize: 64,
        syscfg_address: 0x0F00,
        nvmctrl_address: 0x1000,
        sigrow_address: 0x1100,
        fuses_address: 0x1280,
        userrow_address: 0x1300,
        lock_address: None,
        nvm_variant: NvmVariant::V0,
    }
}

/// Queues the whole fresh-link init script: two STCS writes, then an LDCS
/// read that comes back non-zero so no double break is needed.
fn queue_fresh_init(mock: &MockTransport) {
    queue_stcs(mock, cs::CTRLB, 1 << ctrlb::CCDETDIS_BIT);
    queue_stcs(mock, cs::CTRLA, 1 << ctrla::IBDLY_BIT);
    queue_ldcs(mock, cs::STATUSA, 0x10);
}

/// Builds a ready `Link` against a pre-scripted fresh-init transport, handy
/// for tests that only care about what happens after bring-up.
fn fresh_link(mock: &MockTransport) -> Link<MockTransport> {
    queue_fresh_init(mock);
    let phy = Phy::from_transport(mock.clone(), 115_200);
    Link::new(phy).expect("scripted init should succeed")
}

/// Queues a full `enter_progmode()` success path, starting from "not yet in
/// programming mode" through the key, reset pulse, lock check and the poll
/// that observes NVMPROG set.
fn queue_enter_progmode(mock: &MockTransport) {
    // enter_progmode's own check, then progmode_key's internal check.
    queue_ldcs(mock, cs::ASI_SYS_STATUS, 0x00);
    queue_ldcs(mock, cs::ASI_SYS_STATUS, 0x00);

    // key() sends the opcode and the reversed key bytes; no ACK is read.
    mock.queue(&[UPDI_PHY_SYNC, opcode::KEY | key::KEY | key::SIZE_64]);
    mock.queue(key::NVM);
    queue_ldcs(mock, cs::ASI_KEY_STATUS, 1 << key_status::NVMPROG);

    // reset(true): assert, confirm RSTSYS.
    queue_stcs(mock, cs::ASI_RESET_REQ, 0x59);
    queue_ldcs(mock, cs::ASI_SYS_STATUS, 1 << sys_status::RSTSYS);

    // reset(false): release, RSTSYS clears on the first poll.
    queue_stcs(mock, cs::ASI_RESET_REQ, 0x00);
    queue_ldcs(mock, cs::ASI_SYS_STATUS, 0x00);

    // is_locked() back in enter_progmode: not locked.
    queue_ldcs(mock, cs::ASI_SYS_STATUS, 1 << sys_status::NVMPROG);

    // Poll loop observes NVMPROG set on the first read.
    queue_ldcs(mock, cs::ASI_SYS_STATUS, 1 << sys_status::NVMPROG);
}

/// Queues a full `write_nvm_v0()` page write: clear the page buffer, stream
/// the page through the pointer register, commit.
fn queue_write_page_v0(mock: &MockTransport, device: &DeviceProfile, page: &[u8]) {
    queue_ld(mock, device.nvmctrl_address + nvmctrl::STATUS, 0x00);
    queue_st(mock, device.nvmctrl_address + nvmctrl::CTRLA, nvmctrl_v0::PAGE_BUFFER_CLR);
    queue_ld(mock, device.nvmctrl_address + nvmctrl::STATUS, 0x00);

    mock.queue(&[
        UPDI_PHY_SYNC,
        opcode::ST | ptr::ADDRESS | size::DATA_16,
        (device.flash_start & 0xFF) as u8,
        (device.flash_start >> 8) as u8,
    ]);
    queue_ack(mock);
    let words = (page.len() / 2) as u16 - 1;
    mock.queue(&[
        UPDI_PHY_SYNC,
        opcode::REPEAT | repeat::WORD,
        (words & 0xFF) as u8,
        (words >> 8) as u8,
    ]);
    mock.queue(&[UPDI_PHY_SYNC, opcode::ST | ptr::INC | size::DATA_16, page[0], page[1]]);
    queue_ack(mock);
    for chunk in page[2..].chunks(2) {
        mock.queue(chunk);
        queue_ack(mock);
    }

    queue_st(mock, device.nvmctrl_address + nvmctrl::CTRLA, nvmctrl_v0::WRITE_PAGE);
    queue_ld(mock, device.nvmctrl_address + nvmctrl::STATUS, 0x00);
}

/// Queues a full `read_data_words()` page read, returning `page` as the
/// payload.
fn queue_read_page_words(mock: &MockTransport, device: &DeviceProfile, page: &[u8]) {
    mock.queue(&[
        UPDI_PHY_SYNC,
        opcode::ST | ptr::ADDRESS | size::DATA_16,
        (device.flash_start & 0xFF) as u8,
        (device.flash_start >> 8) as u8,
    ]);
    queue_ack(mock);
    let words = (page.len() / 2) as u16 - 1;
    mock.queue(&[
        UPDI_PHY_SYNC,
        opcode::REPEAT | repeat::WORD,
        (words & 0xFF) as u8,
        (words >> 8) as u8,
    ]);
    mock.queue(&[UPDI_PHY_SYNC, opcode::LD | ptr::INC | size::DATA_16]);
    mock.queue(page);
}

#[test]
fn link_init_succeeds_on_a_fresh_wire() {
    let mock = MockTransport::new();
    queue_fresh_init(&mock);

    let phy = Phy::from_transport(mock.clone(), 115_200);
    let link = Link::new(phy);
    assert!(link.is_ok());

    let written = mock.written();
    assert_eq!(&written[0..3], &stcs_bytes(cs::CTRLB, 1 << ctrlb::CCDETDIS_BIT)[..]);
    assert_eq!(&written[3..6], &stcs_bytes(cs::CTRLA, 1 << ctrla::IBDLY_BIT)[..]);
    assert_eq!(&written[6..8], &ldcs_bytes(cs::STATUSA)[..]);
}

#[test]
fn link_init_recovers_via_double_break_when_statusa_reads_zero() {
    let mock = MockTransport::new();

    // First attempt: STATUSA reads back 0x00, a failed check.
    queue_stcs(&mock, cs::CTRLB, 1 << ctrlb::CCDETDIS_BIT);
    queue_stcs(&mock, cs::CTRLA, 1 << ctrla::IBDLY_BIT);
    queue_ldcs(&mock, cs::STATUSA, 0x00);

    // send_double_break() writes two BREAK bytes and reads their echo back.
    mock.queue(&[0x00, 0x00]);

    // Second attempt succeeds.
    queue_fresh_init(&mock);

    let phy = Phy::from_transport(mock.clone(), 115_200);
    let link = Link::new(phy);
    assert!(link.is_ok());
}

#[test]
fn link_init_fails_after_a_second_stuck_statusa() {
    let mock = MockTransport::new();

    queue_stcs(&mock, cs::CTRLB, 1 << ctrlb::CCDETDIS_BIT);
    queue_stcs(&mock, cs::CTRLA, 1 << ctrla::IBDLY_BIT);
    queue_ldcs(&mock, cs::STATUSA, 0x00);
    mock.queue(&[0x00, 0x00]);
    queue_stcs(&mock, cs::CTRLB, 1 << ctrlb::CCDETDIS_BIT);
    queue_stcs(&mock, cs::CTRLA, 1 << ctrla::IBDLY_BIT);
    queue_ldcs(&mock, cs::STATUSA, 0x00);

    let phy = Phy::from_transport(mock, 115_200);
    let err = Link::new(phy).unwrap_err();
    assert!(matches!(err, updi_nvm::error::LinkError::InitFailed));
}

#[test]
fn key_bytes_go_out_most_significant_byte_last() {
    let mock = MockTransport::new();
    let mut link = fresh_link(&mock);

    mock.queue(&[UPDI_PHY_SYNC, opcode::KEY | key::KEY | key::SIZE_64]);
    mock.queue(key::NVM);
    link.key(updi_nvm::link::KeySize::Bits64, key::NVM).unwrap();

    let written = mock.written();
    let key_start = written.len() - 8;
    let mut expected: Vec<u8> = key::NVM.to_vec();
    expected.reverse();
    assert_eq!(&written[key_start..], &expected[..]);
}

#[test]
fn enter_progmode_sends_the_key_exactly_once_when_called_twice() {
    let mock = MockTransport::new();
    let link = fresh_link(&mock);
    let mut app = App::new(link, Some(device_profile()));

    queue_enter_progmode(&mock);
    assert!(app.enter_progmode().unwrap());

    let after_first_call = mock.written().len();

    // Second call: idempotent, observes NVMPROG set and returns immediately
    // without sending the key again.
    queue_ldcs(&mock, cs::ASI_SYS_STATUS, 1 << sys_status::NVMPROG);
    assert!(app.enter_progmode().unwrap());

    let written = mock.written();
    assert_eq!(written.len() - after_first_call, ldcs_bytes(cs::ASI_SYS_STATUS).len());
}

#[test]
fn enter_progmode_reports_a_locked_device() {
    let mock = MockTransport::new();
    let link = fresh_link(&mock);
    let mut app = App::new(link, Some(device_profile()));

    queue_ldcs(&mock, cs::ASI_SYS_STATUS, 0x00);
    queue_ldcs(&mock, cs::ASI_SYS_STATUS, 0x00);
    mock.queue(&[UPDI_PHY_SYNC, opcode::KEY | key::KEY | key::SIZE_64]);
    mock.queue(key::NVM);
    queue_ldcs(&mock, cs::ASI_KEY_STATUS, 1 << key_status::NVMPROG);
    queue_stcs(&mock, cs::ASI_RESET_REQ, 0x59);
    queue_ldcs(&mock, cs::ASI_SYS_STATUS, 1 << sys_status::RSTSYS);
    queue_stcs(&mock, cs::ASI_RESET_REQ, 0x00);
    queue_ldcs(&mock, cs::ASI_SYS_STATUS, 0x00);
    // is_locked(): LOCKSTATUS bit set.
    queue_ldcs(&mock, cs::ASI_SYS_STATUS, 1 << sys_status::LOCKSTATUS);

    let err = app.enter_progmode().unwrap_err();
    assert!(matches!(err, updi_nvm::error::AppError::DeviceLocked));
}

#[test]
fn unlock_clears_lockstatus_and_enters_progmode() {
    let mock = MockTransport::new();
    let link = fresh_link(&mock);
    let mut app = App::new(link, Some(device_profile()));

    // unlock(): send the chip-erase key, confirm CHIPERASE.
    mock.queue(&[UPDI_PHY_SYNC, opcode::KEY | key::KEY | key::SIZE_64]);
    mock.queue(key::CHIP_ERASE);
    queue_ldcs(&mock, cs::ASI_KEY_STATUS, 1 << key_status::CHIPERASE);

    // progmode_key(): not yet in progmode, so the NVMProg key also goes out.
    queue_ldcs(&mock, cs::ASI_SYS_STATUS, 0x00);
    mock.queue(&[UPDI_PHY_SYNC, opcode::KEY | key::KEY | key::SIZE_64]);
    mock.queue(key::NVM);
    queue_ldcs(&mock, cs::ASI_KEY_STATUS, 1 << key_status::NVMPROG);

    // reset pulse.
    queue_stcs(&mock, cs::ASI_RESET_REQ, 0x59);
    queue_ldcs(&mock, cs::ASI_SYS_STATUS, 1 << sys_status::RSTSYS);
    queue_stcs(&mock, cs::ASI_RESET_REQ, 0x00);
    queue_ldcs(&mock, cs::ASI_SYS_STATUS, 0x00);

    // wait_unlocked(): LOCKSTATUS clear on first poll.
    queue_ldcs(&mock, cs::ASI_SYS_STATUS, 0x00);

    app.unlock().unwrap();
}

#[test]
fn batched_page_write_uses_repeat_and_ack_discipline() {
    let mock = MockTransport::new();
    let link = fresh_link(&mock);
    let mut app = App::new(link, Some(device_profile()));
    let device = device_profile();
    let page = vec![0xAAu8; device.flash_pagesize as usize];

    queue_write_page_v0(&mock, &device, &page);

    app.write_nvm_v0(device.flash_start, &page).unwrap();
}

#[test]
fn programmer_reports_flash_write_verify_mismatches() {
    let mock = MockTransport::new();
    let link = fresh_link(&mock);
    let device = device_profile();
    let app = App::new(link, Some(device.clone()));
    let mut programmer = UpdiNvmProgrammer::from_app(app, device.clone());

    queue_enter_progmode(&mock);
    programmer.enter_progmode().unwrap();
    assert!(programmer.in_progmode());

    let data = vec![0xAAu8; device.flash_pagesize as usize];
    queue_write_page_v0(&mock, &device, &data);

    let mut readback = data.clone();
    let last = readback.len() - 1;
    readback[last] = 0x55;
    queue_read_page_words(&mock, &device, &readback);

    let report = programmer
        .write_flash_verified(device.flash_start, &data)
        .unwrap();

    assert!(!report.success);
    assert_eq!(report.mismatches.len(), 1);
    assert_eq!(report.mismatches[0], (last, 0xAA, 0x55));
}

#[test]
fn read_flash_rejects_unaligned_sizes() {
    let mock = MockTransport::new();
    let link = fresh_link(&mock);
    let device = device_profile();
    let app = App::new(link, Some(device.clone()));
    let mut programmer = UpdiNvmProgrammer::from_app(app, device.clone());

    queue_enter_progmode(&mock);
    programmer.enter_progmode().unwrap();

    let err = programmer
        .read_flash(device.flash_start, device.flash_pagesize - 1)
        .unwrap_err();
    assert!(matches!(err, updi_nvm::error::NvmError::Unaligned { .. }));
}

#[test]
fn operations_require_programming_mode_first() {
    let mock = MockTransport::new();
    let link = fresh_link(&mock);
    let device = device_profile();
    let app = App::new(link, Some(device.clone()));
    let mut programmer = UpdiNvmProgrammer::from_app(app, device.clone());

    let err = programmer.chip_erase().unwrap_err();
    assert!(matches!(err, updi_nvm::error::NvmError::NotInProgmode));
}
