//! Host-side UPDI programmer and NVM flashing library.
//!
//! Four layers, each owning only the one below it:
//! [`phy`] (serial framing and echo-cancellation), [`link`] (UPDI instruction
//! encoding), [`app`] (target control/status registers and the NVM
//! controller), and [`nvm`] (page-wise flash programming on top of it all).
//!
//! A session is built bottom-up: open a [`phy::Phy`], bring up a
//! [`link::Link`] on top of it, wrap that in an [`app::App`], then hand the
//! result to [`nvm::UpdiNvmProgrammer`]. [`nvm::UpdiNvmProgrammer::open`]
//! does all three steps against a real serial port in one call.

pub mod app;
pub mod consts;
pub mod error;
pub mod link;
pub mod nvm;
pub mod phy;
pub mod timeout;

pub use error::ProtocolError;
pub use nvm::device::DeviceProfile;
pub use nvm::UpdiNvmProgrammer;
