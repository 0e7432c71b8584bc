use crate::area::{Area, AreaLayout};
use crate::error::Error;
use crate::platform::Platform;
use crate::record::{
    self, DELETE_FLAG, LogEntry, Record, RecordIter, copy_record, master_record_size, read_record,
    record_size, write_master_record, write_record,
};
use crate::Sotp;
use alloc::vec;
use alloc::vec::Vec;
#[cfg(feature = "defmt")]
use defmt::{trace, warn};

/// In-RAM view of the active area. Only exists while the store is initialized.
pub(crate) struct ActiveState {
    pub(crate) area: Area,
    pub(crate) version: u16,
    pub(crate) free_space_offset: usize,
    /// Current record of each type, `None` if the type is absent.
    pub(crate) index: Vec<Option<Slot>>,
}

/// Position and payload length of a live record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Slot {
    pub(crate) offset: u32,
    pub(crate) length: u16,
}

impl Slot {
    fn new(offset: usize, length: usize) -> Self {
        Self {
            offset: offset as u32,
            length: length as u16,
        }
    }
}

impl ActiveState {
    fn offset_of(&self, type_: u8) -> Option<usize> {
        self.index
            .get(type_ as usize)
            .copied()
            .flatten()
            .map(|slot| slot.offset as usize)
    }

    /// Live records ordered by their position in the log.
    fn live_records(&self) -> Vec<(Slot, u8)> {
        let mut live: Vec<(Slot, u8)> = self
            .index
            .iter()
            .enumerate()
            .filter_map(|(type_, slot)| slot.map(|slot| (slot, type_ as u8)))
            .collect();
        live.sort_unstable_by_key(|(slot, _)| slot.offset);
        live
    }
}

/// A write that didn't fit into the active area and is completed as part of the compaction.
#[derive(Clone, Copy)]
pub(crate) struct PendingRecord<'a> {
    pub(crate) type_: u8,
    pub(crate) flags: u8,
    pub(crate) data: &'a [u8],
}

impl<T> Sotp<T>
where
    T: Platform,
{
    /// Selects the active area, rebuilds the type index by scanning the whole log and
    /// recovers from interrupted writes.
    pub(crate) fn load_active_area(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("load_active_area");

        #[cfg(feature = "debug-logs")]
        println!("internal: load_active_area");

        self.state = None;

        let (area, version) = self
            .layout
            .select_active(&mut self.hal)?
            .ok_or(Error::DataCorrupt)?;

        let mut index = vec![None; self.num_types as usize];
        let mut clean = true;

        let mut scan = RecordIter::new(&self.layout, &mut self.hal, area);
        for entry in scan.by_ref() {
            match entry {
                Ok(LogEntry { offset, record, .. }) => match record {
                    Record::Live { type_, length } => {
                        if let Some(slot) = index.get_mut(type_ as usize) {
                            *slot = Some(Slot::new(offset, length as usize));
                        }
                    }
                    Record::Deleted { type_ } => {
                        if let Some(slot) = index.get_mut(type_ as usize) {
                            *slot = None;
                        }
                    }
                    Record::Master { .. } => {}
                },
                Err(Error::DataCorrupt) => {
                    clean = false;
                }
                Err(e) => return Err(e),
            }
        }
        let free_space_offset = scan.end_offset();

        if clean {
            clean = self
                .layout
                .is_blank_from(&mut self.hal, area, free_space_offset)?;
        }

        #[cfg(feature = "debug-logs")]
        println!(
            "internal: active area {area} v{version}, free space @{free_space_offset:#06x}, clean: {clean}"
        );

        self.state = Some(ActiveState {
            area,
            version,
            free_space_offset,
            index,
        });

        if !clean {
            // appending behind a torn record would program already programmed cells
            #[cfg(feature = "defmt")]
            warn!(
                "interrupted write detected in area {} @{:#06x}, compacting",
                area, free_space_offset
            );
            self.garbage_collection(None)?;
        }

        Ok(())
    }

    pub(crate) fn do_get(&mut self, type_: u8, buf: Option<&mut [u8]>) -> Result<usize, Error> {
        #[cfg(feature = "defmt")]
        trace!("do_get: {}", type_);

        let state = self.state.as_ref().ok_or(Error::NotFound)?;
        let offset = state.offset_of(type_).ok_or(Error::NotFound)?;

        load_value(&self.layout, &mut self.hal, state.area, offset, type_, buf)
    }

    /// Index independent lookup: determines the active area from the master records and scans
    /// its log for the last record of `type_`.
    pub(crate) fn probe_scan(&mut self, type_: u8, buf: &mut [u8]) -> Result<usize, Error> {
        #[cfg(feature = "defmt")]
        trace!("probe_scan: {}", type_);

        #[cfg(feature = "debug-logs")]
        println!("internal: probe_scan {type_}");

        let Some((area, _)) = self.layout.select_active(&mut self.hal)? else {
            return Err(Error::NotFound);
        };

        let mut current = None;
        for entry in RecordIter::new(&self.layout, &mut self.hal, area) {
            match entry {
                Ok(LogEntry { offset, record, .. }) => match record {
                    Record::Live { type_: t, .. } if t == type_ => current = Some(offset),
                    Record::Deleted { type_: t } if t == type_ => current = None,
                    _ => {}
                },
                // the log ends with an interrupted write, everything before it is valid
                Err(Error::DataCorrupt) => break,
                Err(e) => return Err(e),
            }
        }

        let offset = current.ok_or(Error::NotFound)?;
        load_value(&self.layout, &mut self.hal, area, offset, type_, Some(buf))
    }

    /// Appends a record for `type_`, compacting the log first if it doesn't fit.
    pub(crate) fn do_set(&mut self, type_: u8, flags: u8, data: &[u8]) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("do_set: {} [{}] flags {:#04x}", type_, data.len(), flags);

        #[cfg(feature = "debug-logs")]
        println!("internal: do_set {type_} [{}] flags {flags:#04x}", data.len());

        let state = self.state.as_mut().ok_or(Error::NotFound)?;

        let size = record_size::<T>(data.len());
        if state.free_space_offset + size > self.layout.area_size() {
            #[cfg(feature = "defmt")]
            trace!("do_set: area full, collecting garbage");

            return self.garbage_collection(Some(PendingRecord { type_, flags, data }));
        }

        let offset = state.free_space_offset;
        let next_offset = write_record(
            &self.layout,
            &mut self.hal,
            state.area,
            offset,
            type_,
            flags,
            data,
        )?;

        state.free_space_offset = next_offset;
        state.index[type_ as usize] = if flags & DELETE_FLAG != 0 {
            None
        } else {
            Some(Slot::new(offset, data.len()))
        };

        Ok(())
    }

    /// Copies the current record of every type into the standby area, appends `pending` and
    /// finally writes the master record of the new generation. Until that last write the
    /// active area stays the only valid one, so an interruption at any point loses nothing.
    pub(crate) fn garbage_collection(
        &mut self,
        pending: Option<PendingRecord<'_>>,
    ) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("garbage_collection");

        #[cfg(feature = "debug-logs")]
        println!("internal: garbage_collection");

        let state = self.state.as_ref().ok_or(Error::NotFound)?;
        let source = state.area;
        let target = source.other();

        let mut live = state.live_records();
        if let Some(pending) = pending {
            live.retain(|&(_, type_)| type_ != pending.type_);
        }

        // the compacted log has to fit before the standby area is erased
        let mut required = master_record_size::<T>()
            + live
                .iter()
                .map(|(slot, _)| record_size::<T>(slot.length as usize))
                .sum::<usize>();
        if let Some(pending) = pending
            && pending.flags & DELETE_FLAG == 0
        {
            required += record_size::<T>(pending.data.len());
        }
        if required > self.layout.area_size() {
            #[cfg(feature = "defmt")]
            warn!(
                "compacted log needs {} bytes, area holds {}",
                required,
                self.layout.area_size()
            );

            return Err(Error::FlashAreaTooSmall);
        }

        let mut index = vec![None; state.index.len()];

        self.layout.erase(&mut self.hal, target)?;

        let mut offset = master_record_size::<T>();
        for (slot, type_) in live {
            let next_offset = copy_record(
                &self.layout,
                &mut self.hal,
                source,
                slot.offset as usize,
                target,
                offset,
            )?;
            index[type_ as usize] = Some(Slot::new(offset, slot.length as usize));
            offset = next_offset;
        }

        if let Some(pending) = pending
            && pending.flags & DELETE_FLAG == 0
        {
            let next_offset = write_record(
                &self.layout,
                &mut self.hal,
                target,
                offset,
                pending.type_,
                pending.flags,
                pending.data,
            )?;
            index[pending.type_ as usize] = Some(Slot::new(offset, pending.data.len()));
            offset = next_offset;
        }

        let version = state.version.wrapping_add(1);
        write_master_record(&self.layout, &mut self.hal, target, version)?;

        #[cfg(feature = "debug-logs")]
        println!("internal: garbage_collection: now {target} v{version}, free @{offset:#06x}");

        self.state = Some(ActiveState {
            area: target,
            version,
            free_space_offset: offset,
            index,
        });

        Ok(())
    }

    /// Erases both areas and starts generation 0 in the first one.
    pub(crate) fn format(&mut self) -> Result<(), Error> {
        #[cfg(feature = "defmt")]
        trace!("format");

        self.state = None;

        self.layout.erase(&mut self.hal, Area::First)?;
        self.layout.erase(&mut self.hal, Area::Second)?;
        let free_space_offset = write_master_record(&self.layout, &mut self.hal, Area::First, 0)?;

        self.state = Some(ActiveState {
            area: Area::First,
            version: 0,
            free_space_offset,
            index: vec![None; self.num_types as usize],
        });

        Ok(())
    }
}

/// Reads the live record of `type_` at `offset`. `buf == None` only validates the record.
fn load_value<T: Platform>(
    layout: &AreaLayout,
    hal: &mut T,
    area: Area,
    offset: usize,
    type_: u8,
    buf: Option<&mut [u8]>,
) -> Result<usize, Error> {
    let entry = read_record(layout, hal, area, offset, buf)?.ok_or(Error::DataCorrupt)?;

    match entry.record {
        Record::Live { type_: t, length } if t == type_ => Ok(length as usize),
        Record::Deleted { type_: t } if t == type_ => Err(Error::NotFound),
        _ => Err(Error::DataCorrupt),
    }
}

pub(crate) fn max_item_size<T: Platform>(layout: &AreaLayout) -> usize {
    let capacity = layout.area_size() - master_record_size::<T>() - record::HEADER_SIZE;
    capacity.min(u16::MAX as usize)
}
