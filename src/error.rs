//! Typed error hierarchy for the PHY/DL/APP/NVM layers.
//!
//! Each layer raises its own error type; [`ProtocolError`] unifies them at
//! the crate boundary so callers (the CLI, integration tests) can match on
//! one type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PhyError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("echo mismatch: expected {expected} bytes, got {got}")]
    EchoLost { expected: usize, got: usize },
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("UPDI initialisation failed even after a double break")]
    InitFailed,
    #[error("no ACK received for UPDI store instruction")]
    NoAck,
    #[error("invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error(transparent)]
    Phy(#[from] PhyError),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("operation requires a device profile, none was configured")]
    NotConfigured,
    #[error("key was not accepted by the target")]
    KeyRejected,
    #[error("target did not confirm reset assertion")]
    ResetAssertFailed,
    #[error("target did not clear RSTSYS within the reset-release deadline")]
    ResetReleaseFailed,
    #[error("timed out entering NVM programming mode")]
    EnterProgmodeTimeout,
    #[error("device is locked; call unlock_device() first")]
    DeviceLocked,
    #[error("timed out waiting for device to unlock")]
    UnlockTimeout,
    #[error("NVM controller reported a write error while waiting for ready")]
    NvmWriteError,
    #[error("timed out waiting for flash ready")]
    FlashReadyTimeout,
    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Debug, Error)]
pub enum NvmError {
    #[error("not in programming mode; call enter_progmode() or unlock_device() first")]
    NotInProgmode,
    #[error("size {size} is not a multiple of the flash page size {pagesize}")]
    Unaligned { size: usize, pagesize: usize },
    #[error("image of {len} bytes does not fit in {flash_size} bytes of flash")]
    ImageTooLarge { len: usize, flash_size: usize },
    #[error("batch of {len} exceeds the UPDI repeat-counter limit of {max}")]
    RepeatBatchTooLarge { len: usize, max: usize },
    #[error(transparent)]
    App(#[from] AppError),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Phy(#[from] PhyError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    App(#[from] AppError),
    #[error(transparent)]
    Nvm(#[from] NvmError),
    #[error("unknown device profile: {0}")]
    UnknownDevice(String),
    #[error("failed to load Intel HEX image: {0}")]
    Ihex(String),
}
