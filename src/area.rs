//! The two flash areas used in ping-pong fashion. Exactly one of them holds the current
//! generation of the log, the other one is the destination of the next garbage collection.

use crate::error::Error;
use crate::platform::{AlignedOps, Platform, SCRATCH_SIZE};
use crate::record::{self, Record};
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

#[derive(strum::Display, Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Area {
    First = 0,
    Second = 1,
}

impl Area {
    /// The area which is not `self`.
    pub fn other(self) -> Area {
        match self {
            Area::First => Area::Second,
            Area::Second => Area::First,
        }
    }
}

/// Location of an area in flash. `address` is the absolute flash offset as passed to the
/// `NorFlash` implementation.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AreaInfo {
    pub address: usize,
    pub size: usize,
}

/// Splits a partition into two equally sized areas and confines all flash access to them.
pub(crate) struct AreaLayout {
    base_address: usize,
    area_size: usize,
}

impl AreaLayout {
    pub(crate) fn new<T: Platform>(
        partition_offset: usize,
        partition_size: usize,
    ) -> Result<Self, Error> {
        if !partition_offset.is_multiple_of(T::ERASE_SIZE) {
            return Err(Error::InvalidPartitionOffset);
        }

        if partition_size == 0 || !partition_size.is_multiple_of(2 * T::ERASE_SIZE) {
            return Err(Error::InvalidPartitionSize);
        }

        let area_size = partition_size / 2;
        if partition_offset.saturating_add(partition_size) > u32::MAX as usize {
            return Err(Error::InvalidPartitionSize);
        }

        if !T::geometry_supported() || !area_size.is_multiple_of(T::record_alignment()) {
            return Err(Error::UnsupportedFlashGeometry);
        }

        // an area has to hold at least the master record and one empty record
        if area_size < record::master_record_size::<T>() + record::record_size::<T>(0) {
            return Err(Error::InvalidPartitionSize);
        }

        Ok(Self {
            base_address: partition_offset,
            area_size,
        })
    }

    pub(crate) fn area_size(&self) -> usize {
        self.area_size
    }

    pub(crate) fn info(&self, area: Area) -> AreaInfo {
        AreaInfo {
            address: self.base_address + area as usize * self.area_size,
            size: self.area_size,
        }
    }

    fn address(&self, area: Area, offset: usize, len: usize) -> Result<u32, Error> {
        if offset + len > self.area_size {
            return Err(Error::FlashAreaTooSmall);
        }
        Ok((self.info(area).address + offset) as u32)
    }

    pub(crate) fn read<T: Platform>(
        &self,
        hal: &mut T,
        area: Area,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("flash_read_area: {}@{:#06x}[{}]", area, offset, buf.len());

        let address = self.address(area, offset, buf.len())?;
        hal.read(address, buf).map_err(|_| Error::ReadError)
    }

    pub(crate) fn write<T: Platform>(
        &self,
        hal: &mut T,
        area: Area,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("flash_write_area: {}@{:#06x}[{}]", area, offset, bytes.len());

        debug_assert!(bytes.len().is_multiple_of(T::WRITE_SIZE));

        let address = self.address(area, offset, bytes.len())?;
        hal.write(address, bytes).map_err(|_| Error::WriteError)
    }

    pub(crate) fn erase<T: Platform>(&self, hal: &mut T, area: Area) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("flash_erase_area: {}", area);

        #[cfg(feature = "debug-logs")]
        println!("area: erase {area}");

        let AreaInfo { address, size } = self.info(area);
        hal.erase(address as u32, (address + size) as u32)
            .map_err(|_| Error::WriteError)
    }

    /// Returns the version of the area's master record or `None` if the area doesn't start with
    /// a valid one. Only physical read errors are reported as errors.
    pub(crate) fn read_master<T: Platform>(
        &self,
        hal: &mut T,
        area: Area,
    ) -> Result<Option<u16>, Error> {
        match record::read_record(self, hal, area, 0, None) {
            Ok(Some(entry)) => match entry.record {
                Record::Master { version } => Ok(Some(version)),
                _ => Ok(None),
            },
            Ok(None) => Ok(None),
            Err(Error::DataCorrupt) => {
                #[cfg(feature = "defmt")]
                warn!("corrupt master record in area {}", area);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Picks the area holding the newest valid generation.
    pub(crate) fn select_active<T: Platform>(
        &self,
        hal: &mut T,
    ) -> Result<Option<(Area, u16)>, Error> {
        let first = self.read_master(hal, Area::First)?;
        let second = self.read_master(hal, Area::Second)?;

        #[cfg(feature = "debug-logs")]
        println!("area: master records: {first:?} / {second:?}");

        Ok(match (first, second) {
            (Some(first), Some(second)) => {
                if is_newer(second, first) {
                    Some((Area::Second, second))
                } else {
                    Some((Area::First, first))
                }
            }
            (Some(first), None) => Some((Area::First, first)),
            (None, Some(second)) => Some((Area::Second, second)),
            (None, None) => None,
        })
    }

    /// Checks that nothing was programmed from `offset` to the end of the area.
    pub(crate) fn is_blank_from<T: Platform>(
        &self,
        hal: &mut T,
        area: Area,
        offset: usize,
    ) -> Result<bool, Error> {
        let mut buf = [0u8; SCRATCH_SIZE];
        let mut offset = offset;
        while offset < self.area_size {
            let chunk = (self.area_size - offset).min(SCRATCH_SIZE);
            self.read(hal, area, offset, &mut buf[..chunk])?;
            if buf[..chunk].iter().any(|&b| b != 0xFF) {
                #[cfg(feature = "debug-logs")]
                println!("area: {area} is dirty after {offset:#06x}");
                return Ok(false);
            }
            offset += chunk;
        }
        Ok(true)
    }
}

/// Circular comparison of generation counters: `a` is newer than `b` if it is ahead of `b` by
/// less than half of the counter range. After 65535 comes 0, which is newer than 65535.
pub(crate) fn is_newer(a: u16, b: u16) -> bool {
    (a.wrapping_sub(b) as i16) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_versions_wrap_around() {
        assert!(is_newer(1, 0));
        assert!(!is_newer(0, 1));
        assert!(!is_newer(7, 7));
        assert!(is_newer(0, u16::MAX));
        assert!(is_newer(3, u16::MAX - 2));
        assert!(!is_newer(u16::MAX, 0));
    }

    #[test]
    fn other_area() {
        assert_eq!(Area::First.other(), Area::Second);
        assert_eq!(Area::Second.other(), Area::First);
    }
}
