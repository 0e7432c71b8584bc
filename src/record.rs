//! Binary format of the log.
//!
//! Every record starts on a boundary of [`AlignedOps::record_alignment`] and looks like this
//! (little endian):
//!
//! ```text
//! +------+-------+--------+-------+---------------------+-----------------+
//! | type | flags | length |  crc  | payload (length)    | 0xFF padding    |
//! |  u8  |  u8   |  u16   |  u32  |                     |                 |
//! +------+-------+--------+-------+---------------------+-----------------+
//! ```
//!
//! `crc` covers the first four header bytes followed by the payload. The first record of an
//! area is the master record: type [`MASTER_RECORD_TYPE`] with the area version and two
//! reserved bytes as payload. A header consisting only of 0xFF bytes marks the end of the log.

use crate::area::{Area, AreaLayout};
use crate::error::Error;
use crate::platform::{AlignedOps, FnCrc32, Platform, SCRATCH_SIZE};
#[cfg(feature = "defmt")]
use defmt::trace;

pub(crate) const HEADER_SIZE: usize = 8;

/// Type of the record which opens every area.
pub const MASTER_RECORD_TYPE: u8 = 0xFE;

/// Never written, an erased header reads as this type.
pub const NO_TYPE: u8 = 0xFF;

/// Record marks the type as removed.
pub(crate) const DELETE_FLAG: u8 = 0x01;

const MASTER_PAYLOAD_SIZE: usize = 4;

pub(crate) fn record_size<T: Platform>(data_len: usize) -> usize {
    T::align_record(HEADER_SIZE + data_len)
}

pub(crate) fn master_record_size<T: Platform>() -> usize {
    record_size::<T>(MASTER_PAYLOAD_SIZE)
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct RecordHeader {
    pub(crate) type_: u8,
    pub(crate) flags: u8,
    pub(crate) length: u16,
    pub(crate) crc: u32,
}

impl RecordHeader {
    fn new(crc32: FnCrc32, type_: u8, flags: u8, data: &[u8]) -> Self {
        let mut header = Self {
            type_,
            flags,
            length: data.len() as u16,
            crc: 0,
        };
        header.crc = crc32(header.seed_crc(crc32), data);
        header
    }

    fn parse(raw: &[u8]) -> Self {
        Self {
            type_: raw[0],
            flags: raw[1],
            length: u16::from_le_bytes([raw[2], raw[3]]),
            crc: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let [l0, l1] = self.length.to_le_bytes();
        let [c0, c1, c2, c3] = self.crc.to_le_bytes();
        [self.type_, self.flags, l0, l1, c0, c1, c2, c3]
    }

    /// CRC over the part of the header not containing the CRC itself
    fn seed_crc(&self, crc32: FnCrc32) -> u32 {
        let [l0, l1] = self.length.to_le_bytes();
        crc32(u32::MAX, &[self.type_, self.flags, l0, l1])
    }

    fn is_deleted(&self) -> bool {
        self.flags & DELETE_FLAG != 0
    }
}

/// A decoded record.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) enum Record {
    Master { version: u16 },
    Live { type_: u8, length: u16 },
    Deleted { type_: u8 },
}

/// A record together with its position in the area.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(crate) struct LogEntry {
    pub(crate) offset: usize,
    pub(crate) record: Record,
    pub(crate) next_offset: usize,
}

/// Collects CRC, the leading payload bytes and optionally a copy of the payload while the
/// record is streamed through the scratch buffer.
struct PayloadSink<'a> {
    crc32: FnCrc32,
    crc: u32,
    position: usize,
    lead: [u8; MASTER_PAYLOAD_SIZE],
    out: Option<&'a mut [u8]>,
}

impl PayloadSink<'_> {
    fn feed(&mut self, data: &[u8]) {
        self.crc = (self.crc32)(self.crc, data);

        if self.position < MASTER_PAYLOAD_SIZE {
            let n = (MASTER_PAYLOAD_SIZE - self.position).min(data.len());
            self.lead[self.position..self.position + n].copy_from_slice(&data[..n]);
        }

        if let Some(out) = self.out.as_deref_mut() {
            out[self.position..self.position + data.len()].copy_from_slice(data);
        }

        self.position += data.len();
    }
}

/// Reads the record header at `offset`. `Ok(None)` means erased flash, i.e. the end of the log.
pub(crate) fn read_header<T: Platform>(
    layout: &AreaLayout,
    hal: &mut T,
    area: Area,
    offset: usize,
) -> Result<Option<RecordHeader>, Error> {
    let mut scratch = [0u8; SCRATCH_SIZE];
    read_header_window(layout, hal, area, offset, &mut scratch).map(|it| it.map(|(h, _)| h))
}

/// Reads as much of the record as fits into `scratch` and parses the header from it.
/// Returns the header and the number of valid bytes in `scratch`.
fn read_header_window<T: Platform>(
    layout: &AreaLayout,
    hal: &mut T,
    area: Area,
    offset: usize,
    scratch: &mut [u8; SCRATCH_SIZE],
) -> Result<Option<(RecordHeader, usize)>, Error> {
    let window = layout.area_size().saturating_sub(offset).min(SCRATCH_SIZE);
    if window < HEADER_SIZE {
        return Ok(None);
    }

    layout.read(hal, area, offset, &mut scratch[..window])?;

    if scratch[..HEADER_SIZE].iter().all(|&b| b == 0xFF) {
        return Ok(None);
    }

    let header = RecordHeader::parse(&scratch[..HEADER_SIZE]);
    if header.type_ == NO_TYPE {
        return Err(Error::DataCorrupt);
    }

    if header.type_ == MASTER_RECORD_TYPE && header.length as usize != MASTER_PAYLOAD_SIZE {
        return Err(Error::DataCorrupt);
    }

    if offset + record_size::<T>(header.length as usize) > layout.area_size() {
        return Err(Error::DataCorrupt);
    }

    Ok(Some((header, window)))
}

/// Decodes and validates the record at `offset`.
///
/// With `out == None` only the integrity of the record is checked. Otherwise the payload is
/// copied to the start of `out`, which fails with [`Error::BuffTooSmall`] before any data is
/// copied if `out` is shorter than the payload.
///
/// `Ok(None)` marks erased flash. A non-blank record which fails its integrity check results in
/// [`Error::DataCorrupt`].
pub(crate) fn read_record<T: Platform>(
    layout: &AreaLayout,
    hal: &mut T,
    area: Area,
    offset: usize,
    out: Option<&mut [u8]>,
) -> Result<Option<LogEntry>, Error> {
    let mut scratch = [0u8; SCRATCH_SIZE];
    let Some((header, window)) = read_header_window(layout, hal, area, offset, &mut scratch)?
    else {
        return Ok(None);
    };

    let length = header.length as usize;
    if let Some(out) = &out
        && out.len() < length
    {
        return Err(Error::BuffTooSmall {
            required: header.length,
        });
    }

    let mut sink = PayloadSink {
        crc32: T::crc32,
        crc: header.seed_crc(T::crc32),
        position: 0,
        lead: [0xFF; MASTER_PAYLOAD_SIZE],
        out,
    };

    let total = HEADER_SIZE + length;
    let mut consumed = window.min(total);
    sink.feed(&scratch[HEADER_SIZE..consumed]);

    while consumed < total {
        let chunk = (total - consumed).min(SCRATCH_SIZE);
        layout.read(hal, area, offset + consumed, &mut scratch[..T::align_read(chunk)])?;
        sink.feed(&scratch[..chunk]);
        consumed += chunk;
    }

    if sink.crc != header.crc {
        #[cfg(feature = "defmt")]
        trace!("crc mismatch: {}@{:#06x}", area, offset);

        #[cfg(feature = "debug-logs")]
        println!("record: crc mismatch at {area}@{offset:#06x}");

        return Err(Error::DataCorrupt);
    }

    let record = if header.type_ == MASTER_RECORD_TYPE {
        Record::Master {
            version: u16::from_le_bytes([sink.lead[0], sink.lead[1]]),
        }
    } else if header.is_deleted() {
        Record::Deleted {
            type_: header.type_,
        }
    } else {
        Record::Live {
            type_: header.type_,
            length: header.length,
        }
    };

    Ok(Some(LogEntry {
        offset,
        record,
        next_offset: offset + record_size::<T>(length),
    }))
}

/// Programs a record at `offset` and returns the offset following it.
pub(crate) fn write_record<T: Platform>(
    layout: &AreaLayout,
    hal: &mut T,
    area: Area,
    offset: usize,
    type_: u8,
    flags: u8,
    data: &[u8],
) -> Result<usize, Error> {
    if type_ >= MASTER_RECORD_TYPE || data.len() > u16::MAX as usize {
        return Err(Error::BadValue);
    }
    program(layout, hal, area, offset, type_, flags, data)
}

/// Programs the master record of a new generation at the start of `area`.
pub(crate) fn write_master_record<T: Platform>(
    layout: &AreaLayout,
    hal: &mut T,
    area: Area,
    version: u16,
) -> Result<usize, Error> {
    #[cfg(feature = "defmt")]
    trace!("write_master_record: {} v{}", area, version);

    let [v0, v1] = version.to_le_bytes();
    program(layout, hal, area, 0, MASTER_RECORD_TYPE, 0, &[v0, v1, 0xFF, 0xFF])
}

fn program<T: Platform>(
    layout: &AreaLayout,
    hal: &mut T,
    area: Area,
    offset: usize,
    type_: u8,
    flags: u8,
    data: &[u8],
) -> Result<usize, Error> {
    let size = record_size::<T>(data.len());
    if offset + size > layout.area_size() {
        return Err(Error::FlashAreaTooSmall);
    }

    let header = RecordHeader::new(T::crc32, type_, flags, data).to_bytes();

    let mut scratch = [0u8; SCRATCH_SIZE];
    let mut position = 0;
    while position < size {
        let chunk = (size - position).min(SCRATCH_SIZE);
        let buf = &mut scratch[..chunk];
        buf.fill(0xFF);
        copy_overlap(buf, position, &header, 0);
        copy_overlap(buf, position, data, HEADER_SIZE);
        layout.write(hal, area, offset + position, buf)?;
        position += chunk;
    }

    Ok(offset + size)
}

/// Copies the part of `src` (located at `src_position` within the record) that overlaps with
/// `buf` (located at `buf_position`).
fn copy_overlap(buf: &mut [u8], buf_position: usize, src: &[u8], src_position: usize) {
    let start = buf_position.max(src_position);
    let end = (buf_position + buf.len()).min(src_position + src.len());
    if start < end {
        buf[start - buf_position..end - buf_position]
            .copy_from_slice(&src[start - src_position..end - src_position]);
    }
}

/// Relocates a record verbatim. The record at `from_offset` is expected to be valid, it is not
/// checked again. Returns the offset following the copy.
pub(crate) fn copy_record<T: Platform>(
    layout: &AreaLayout,
    hal: &mut T,
    from_area: Area,
    from_offset: usize,
    to_area: Area,
    to_offset: usize,
) -> Result<usize, Error> {
    let header = read_header(layout, hal, from_area, from_offset)?.ok_or(Error::DataCorrupt)?;

    let size = record_size::<T>(header.length as usize);
    if to_offset + size > layout.area_size() {
        return Err(Error::FlashAreaTooSmall);
    }

    let mut scratch = [0u8; SCRATCH_SIZE];
    let mut position = 0;
    while position < size {
        let chunk = (size - position).min(SCRATCH_SIZE);
        layout.read(hal, from_area, from_offset + position, &mut scratch[..chunk])?;
        layout.write(hal, to_area, to_offset + position, &scratch[..chunk])?;
        position += chunk;
    }

    Ok(to_offset + size)
}

/// Walks the data records of an area, starting after the master record.
///
/// Yields `Ok` entries until erased flash is reached (the iterator ends) or a record fails its
/// integrity check (yields `Err(Error::DataCorrupt)` once, then ends). Physical read errors are
/// yielded the same way. [`RecordIter::end_offset`] is the offset at which iteration stopped.
pub(crate) struct RecordIter<'a, T: Platform> {
    layout: &'a AreaLayout,
    hal: &'a mut T,
    area: Area,
    offset: usize,
    finished: bool,
}

impl<'a, T: Platform> RecordIter<'a, T> {
    pub(crate) fn new(layout: &'a AreaLayout, hal: &'a mut T, area: Area) -> Self {
        Self {
            layout,
            hal,
            area,
            offset: master_record_size::<T>(),
            finished: false,
        }
    }

    pub(crate) fn end_offset(&self) -> usize {
        self.offset
    }
}

impl<T: Platform> Iterator for RecordIter<'_, T> {
    type Item = Result<LogEntry, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match read_record(self.layout, self.hal, self.area, self.offset, None) {
            Ok(Some(LogEntry {
                record: Record::Master { .. },
                ..
            })) => {
                // only the first record of an area may be a master record
                self.finished = true;
                Some(Err(Error::DataCorrupt))
            }
            Ok(Some(entry)) => {
                self.offset = entry.next_offset;
                Some(Ok(entry))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_crc(init: u32, data: &[u8]) -> u32 {
        data.iter()
            .fold(init, |acc, &b| acc.rotate_left(5) ^ u32::from(b))
    }

    #[test]
    fn header_layout() {
        let header = RecordHeader::new(sum_crc, 5, 0, &[1, 2, 3]);
        let raw = header.to_bytes();
        assert_eq!(raw[0], 5);
        assert_eq!(raw[1], 0);
        assert_eq!(&raw[2..4], &3u16.to_le_bytes());
        assert_eq!(RecordHeader::parse(&raw), header);
    }

    #[test]
    fn crc_covers_header_and_payload() {
        let a = RecordHeader::new(sum_crc, 5, 0, &[1, 2, 3]);
        let b = RecordHeader::new(sum_crc, 6, 0, &[1, 2, 3]);
        let c = RecordHeader::new(sum_crc, 5, DELETE_FLAG, &[1, 2, 3]);
        let d = RecordHeader::new(sum_crc, 5, 0, &[1, 2, 4]);
        assert_ne!(a.crc, b.crc);
        assert_ne!(a.crc, c.crc);
        assert_ne!(a.crc, d.crc);
        assert!(c.is_deleted());
        assert!(!a.is_deleted());
    }

    #[test]
    fn overlapping_copy() {
        let mut buf = [0xFFu8; 4];
        // record bytes 6..10 are in `buf`, header occupies 0..8
        copy_overlap(&mut buf, 6, &[0, 1, 2, 3, 4, 5, 6, 7], 0);
        assert_eq!(buf, [6, 7, 0xFF, 0xFF]);
        copy_overlap(&mut buf, 6, &[0xA0, 0xA1, 0xA2], 8);
        assert_eq!(buf, [6, 7, 0xA0, 0xA1]);
        copy_overlap(&mut buf, 6, &[9], 12);
        assert_eq!(buf, [6, 7, 0xA0, 0xA1]);
    }
}
