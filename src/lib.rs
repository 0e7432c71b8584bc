#![doc = include_str ! ("../README.md")]
#![cfg_attr(not(target_arch = "x86_64"), no_std)]

mod area;
pub mod error;
mod internal;
pub mod platform;
mod record;
mod shared;

pub use area::{Area, AreaInfo};
pub use error::{Error, ResultCode};
pub use record::{MASTER_RECORD_TYPE, NO_TYPE};
pub use shared::SharedSotp;

extern crate alloc;

use crate::area::AreaLayout;
use crate::internal::ActiveState;
use crate::platform::Platform;
use crate::record::DELETE_FLAG;
#[cfg(feature = "defmt")]
use defmt::trace;

/// Number of types available after construction, see [`Sotp::set_num_types`].
pub const DEFAULT_NUM_TYPES: u8 = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct SotpStatistics {
    pub active_area: Area,
    pub version: u16,
    pub area_size: usize,
    /// Bytes occupied by the log of the active area, including the master record
    pub used_bytes: usize,
    pub free_bytes: usize,
    /// Number of types that currently hold a value
    pub live_types: u16,
}

/// The Sotp struct owns the flash and keeps the type index of the active area in memory.
/// The index grows with the number of types, not with the amount of stored data.
pub struct Sotp<T: Platform> {
    pub(crate) hal: T,
    pub(crate) layout: AreaLayout,
    pub(crate) num_types: u8,

    // set after a successful init, dropped on deinit and after flash errors
    pub(crate) state: Option<ActiveState>,
}

impl<T: Platform> Sotp<T> {
    /// Splits the partition into two equally sized areas. Flash is not touched until the first
    /// operation, call [`Sotp::init`] to validate existing data or [`Sotp::reset`] to format.
    pub fn new(partition_offset: usize, partition_size: usize, hal: T) -> Result<Sotp<T>, Error> {
        let layout = AreaLayout::new::<T>(partition_offset, partition_size)?;

        Ok(Self {
            hal,
            layout,
            num_types: DEFAULT_NUM_TYPES,
            state: None,
        })
    }

    /// Selects the active area, builds the index and recovers from interrupted writes.
    ///
    /// Fails with [`Error::DataCorrupt`] if none of the areas holds a valid master record, in
    /// which case the store has to be formatted with [`Sotp::reset`].
    pub fn init(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("init");

        self.load_active_area().inspect_err(|_| self.state = None)
    }

    /// Drops the index. Nothing is written, the next operation initializes again.
    pub fn deinit(&mut self) {
        #[cfg(feature = "defmt")]
        trace!("deinit");

        self.state = None;
    }

    /// Returns true if the index is loaded.
    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    /// Erases both areas and starts over with an empty store.
    pub fn reset(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("reset");

        self.format().inspect_err(|_| self.state = None)
    }

    pub fn num_types(&self) -> u8 {
        self.num_types
    }

    /// Changes the number of usable types to `0..num_types`. The index is rebuilt on the next
    /// operation; values of types outside the new range become invisible and are dropped by
    /// the next garbage collection.
    pub fn set_num_types(&mut self, num_types: u8) -> Result<(), Error> {
        if num_types > MASTER_RECORD_TYPE {
            return Err(Error::BadValue);
        }

        self.num_types = num_types;
        self.state = None;
        Ok(())
    }

    /// Largest value [`Sotp::set`] accepts.
    pub fn max_item_size(&self) -> usize {
        internal::max_item_size::<T>(&self.layout)
    }

    pub fn area_info(&self, area: Area) -> AreaInfo {
        self.layout.info(area)
    }

    /// Copies the value of `type_` to the start of `buf` and returns its length.
    ///
    /// Fails with [`Error::BuffTooSmall`] without copying anything if `buf` can't hold the
    /// whole value. An empty value is distinct from a missing one, the latter is reported as
    /// [`Error::NotFound`].
    pub fn get(&mut self, type_: u8, buf: &mut [u8]) -> Result<usize, Error> {
        self.check_type(type_)?;
        self.ensure_initialized()?;

        let result = self.do_get(type_, Some(buf));
        self.guard(result)
    }

    /// Returns the length of the value of `type_` without copying it.
    pub fn get_item_size(&mut self, type_: u8) -> Result<usize, Error> {
        self.check_type(type_)?;
        self.ensure_initialized()?;

        let result = self.do_get(type_, None);
        self.guard(result)
    }

    /// Stores `value` for `type_`, replacing the previous value. Compacts the log if the active
    /// area is full.
    pub fn set(&mut self, type_: u8, value: &[u8]) -> Result<(), Error> {
        self.check_type(type_)?;
        if value.len() > self.max_item_size() {
            return Err(Error::BadValue);
        }
        self.ensure_initialized()?;

        let result = self.do_set(type_, 0, value);
        self.guard(result)
    }

    /// Removes the value of `type_`. Removing a missing type is not an error.
    pub fn remove(&mut self, type_: u8) -> Result<(), Error> {
        self.check_type(type_)?;
        self.ensure_initialized()?;

        let present = self
            .state
            .as_ref()
            .is_some_and(|state| state.index[type_ as usize].is_some());
        if !present {
            return Ok(());
        }

        let result = self.do_set(type_, DELETE_FLAG, &[]);
        self.guard(result)
    }

    /// Reads the value of `type_` directly from flash, without using or requiring the index.
    /// Works before [`Sotp::init`] and on stores `init` refuses; returns [`Error::NotFound`] if
    /// no area holds a valid master record.
    pub fn probe(&mut self, type_: u8, buf: &mut [u8]) -> Result<usize, Error> {
        if type_ >= MASTER_RECORD_TYPE {
            return Err(Error::BadValue);
        }

        self.probe_scan(type_, buf)
    }

    /// Compacts the log into the standby area, regardless of the free space left.
    pub fn force_garbage_collection(&mut self) -> Result<(), Error> {
        self.ensure_initialized()?;

        let result = self.garbage_collection(None);
        self.guard(result)
    }

    /// Returns usage statistics of the active area
    pub fn statistics(&mut self) -> Result<SotpStatistics, Error> {
        self.ensure_initialized()?;

        let state = self.state.as_ref().ok_or(Error::NotFound)?;
        let area_size = self.layout.area_size();

        Ok(SotpStatistics {
            active_area: state.area,
            version: state.version,
            area_size,
            used_bytes: state.free_space_offset,
            free_bytes: area_size - state.free_space_offset,
            live_types: state
                .index
                .iter()
                .filter(|offset| offset.is_some())
                .count() as u16,
        })
    }

    /// Returns the flash, e.g. to inspect or power cycle it.
    pub fn into_inner(self) -> T {
        self.hal
    }

    fn check_type(&self, type_: u8) -> Result<(), Error> {
        if type_ >= self.num_types {
            return Err(Error::BadValue);
        }
        Ok(())
    }

    fn ensure_initialized(&mut self) -> Result<(), Error> {
        if self.state.is_none() {
            self.init()?;
        }
        Ok(())
    }

    /// The in-RAM state can't be trusted after the flash failed, the next operation rescans.
    fn guard<R>(&mut self, result: Result<R, Error>) -> Result<R, Error> {
        if let Err(e) = &result
            && e.is_flash_error()
        {
            self.state = None;
        }
        result
    }
}
