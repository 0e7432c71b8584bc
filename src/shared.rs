use crate::area::{Area, AreaInfo};
use crate::error::Error;
use crate::platform::Platform;
use crate::{Sotp, SotpStatistics};
use core::cell::RefCell;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;

/// A [`Sotp`] that can be shared between threads or tasks.
///
/// Every operation, reads included, runs under the lock. A reader therefore sees the store
/// either before or after a garbage collection, never while the active area is swapped.
/// Choose `M` according to the execution context, e.g. `CriticalSectionRawMutex` if the store
/// is used from several executors or threads.
pub struct SharedSotp<M: RawMutex, T: Platform> {
    inner: Mutex<M, RefCell<Sotp<T>>>,
}

impl<M: RawMutex, T: Platform> SharedSotp<M, T> {
    pub const fn new(sotp: Sotp<T>) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(sotp)),
        }
    }

    /// Runs `f` with exclusive access to the store.
    pub fn with<R>(&self, f: impl FnOnce(&mut Sotp<T>) -> R) -> R {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }

    pub fn init(&self) -> Result<(), Error> {
        self.with(|sotp| sotp.init())
    }

    pub fn deinit(&self) {
        self.with(|sotp| sotp.deinit())
    }

    pub fn reset(&self) -> Result<(), Error> {
        self.with(|sotp| sotp.reset())
    }

    pub fn num_types(&self) -> u8 {
        self.with(|sotp| sotp.num_types())
    }

    pub fn set_num_types(&self, num_types: u8) -> Result<(), Error> {
        self.with(|sotp| sotp.set_num_types(num_types))
    }

    pub fn max_item_size(&self) -> usize {
        self.with(|sotp| sotp.max_item_size())
    }

    pub fn area_info(&self, area: Area) -> AreaInfo {
        self.with(|sotp| sotp.area_info(area))
    }

    pub fn get(&self, type_: u8, buf: &mut [u8]) -> Result<usize, Error> {
        self.with(|sotp| sotp.get(type_, buf))
    }

    pub fn get_item_size(&self, type_: u8) -> Result<usize, Error> {
        self.with(|sotp| sotp.get_item_size(type_))
    }

    pub fn set(&self, type_: u8, value: &[u8]) -> Result<(), Error> {
        self.with(|sotp| sotp.set(type_, value))
    }

    pub fn remove(&self, type_: u8) -> Result<(), Error> {
        self.with(|sotp| sotp.remove(type_))
    }

    pub fn probe(&self, type_: u8, buf: &mut [u8]) -> Result<usize, Error> {
        self.with(|sotp| sotp.probe(type_, buf))
    }

    pub fn force_garbage_collection(&self) -> Result<(), Error> {
        self.with(|sotp| sotp.force_garbage_collection())
    }

    pub fn statistics(&self) -> Result<SotpStatistics, Error> {
        self.with(|sotp| sotp.statistics())
    }

    pub fn into_inner(self) -> Sotp<T> {
        self.inner.into_inner().into_inner()
    }
}
