//! The flash capability the store is built on: any `NorFlash` that can also compute a CRC32.

use embedded_storage::nor_flash::NorFlash;

/// Minimal alignment of every record boundary, regardless of the flash word size.
pub(crate) const MIN_RECORD_ALIGNMENT: usize = 4;

/// Size of the stack buffer used to stream record payloads through. Read and write sizes of
/// the flash have to divide it.
pub(crate) const SCRATCH_SIZE: usize = 64;

/// See README.md for an example implementation.
pub trait Platform: Crc + NorFlash {}

impl<T: Crc + NorFlash> Platform for T {}

pub type FnCrc32 = fn(init: u32, data: &[u8]) -> u32;

/// `crc32` has to be chainable: `crc32(crc32(init, a), b) == crc32(init, a ++ b)`
pub trait Crc {
    fn crc32(init: u32, data: &[u8]) -> u32;
}

impl<T: Crc> Crc for &mut T {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        T::crc32(init, data)
    }
}

pub trait AlignedOps: Platform {
    fn align_read(size: usize) -> usize {
        align_ceil(size, Self::READ_SIZE)
    }

    /// Records start and end on this boundary, so every record can be read and programmed
    /// without touching its neighbours.
    fn record_alignment() -> usize {
        MIN_RECORD_ALIGNMENT
            .max(Self::READ_SIZE)
            .max(Self::WRITE_SIZE)
    }

    fn align_record(size: usize) -> usize {
        align_ceil(size, Self::record_alignment())
    }

    fn geometry_supported() -> bool {
        Self::READ_SIZE.is_power_of_two()
            && Self::WRITE_SIZE.is_power_of_two()
            && Self::record_alignment() <= SCRATCH_SIZE
    }
}

#[inline(always)]
pub(crate) const fn align_ceil(size: usize, alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        size.saturating_add(alignment - 1) & !(alignment - 1)
    } else {
        size.saturating_add(alignment - 1) / alignment * alignment
    }
}

impl<T: Platform> AlignedOps for T {}

#[cfg(any(
    feature = "esp32",
    feature = "esp32s2",
    feature = "esp32s3",
    feature = "esp32c2",
    feature = "esp32c3",
    feature = "esp32c6",
    feature = "esp32h2",
))]
mod chip {
    use crate::platform::Crc;
    use esp_storage::FlashStorage;

    /// Both store areas live in the partition handed to `Sotp::new`, addresses are absolute
    /// flash offsets.
    impl Crc for FlashStorage<'_> {
        fn crc32(init: u32, data: &[u8]) -> u32 {
            esp_hal::rom::crc::crc32_le(init, data)
        }
    }
}
