#![no_std]

#[cfg(any(test, feature = "ram-disk"))]
extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod block;
pub mod fat;
pub mod transport;
pub mod wav;
pub mod window;

pub use block::{BlockDevice, StorageErrorKind, BLOCK_SIZE};
#[cfg(any(test, feature = "ram-disk"))]
pub use block::{FormatSpec, RamDisk};
pub use fat::{
    ChainWriter, DirSlot, Fat16Volume, FileKind, SdFatError, VolumeGeometry, WriteProgress,
};
pub use transport::{SdCardInfo, SdCardVersion, SdError, SdTransport};
pub use wav::{WavFormat, WavWriter};
pub use window::{Bookmark, RingWindow};
