#![allow(dead_code)]

// filename according to https://doc.rust-lang.org/book/ch11-03-test-organization.html
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
};
use sotp::platform::Crc;

pub const FLASH_SECTOR_SIZE: usize = 4096;
// Taken from https://github.com/esp-rs/esp-hal/blob/main/esp-storage/src/stub.rs
pub const WORD_SIZE: usize = 4;

pub const HEADER_SIZE: usize = 8;
pub const MASTER_RECORD_SIZE: usize = 12;

/// RAM backed NOR flash. Programming can only flip bits from 1 to 0, erase sets them back.
/// `W` is the read and write granularity.
pub struct Flash<const W: usize = WORD_SIZE> {
    pub buf: Vec<u8>,
    pub fail_after_operation: usize,
    pub operations: Vec<Operation>,
    pub verbose: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub enum Operation {
    Read { offset: u32, len: usize },
    Write { offset: u32, len: usize },
    Erase { offset: u32, len: usize },
}

impl Flash {
    pub fn new(pages: usize) -> Self {
        Self::with_word_size(pages)
    }

    /// Programs a valid master record of `version` at `address`, as written by a garbage
    /// collection of generation `version`.
    pub fn program_master(&mut self, address: usize, version: u16) {
        let [v0, v1] = version.to_le_bytes();
        let payload = [v0, v1, 0xff, 0xff];
        let head = [sotp::MASTER_RECORD_TYPE, 0, payload.len() as u8, 0];
        let crc = <Self as Crc>::crc32(<Self as Crc>::crc32(u32::MAX, &head), &payload);

        let record = &mut self.buf[address..address + MASTER_RECORD_SIZE];
        record[..4].copy_from_slice(&head);
        record[4..8].copy_from_slice(&crc.to_le_bytes());
        record[8..].copy_from_slice(&payload);
    }

    pub fn new_with_fault(pages: usize, fail_after_operation: usize) -> Self {
        Self {
            fail_after_operation,
            ..Self::with_word_size(pages)
        }
    }
}

impl<const W: usize> Flash<W> {
    pub fn with_word_size(pages: usize) -> Self {
        Self {
            buf: vec![0xffu8; FLASH_SECTOR_SIZE * pages],
            fail_after_operation: usize::MAX,
            operations: Vec::new(),
            verbose: true,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn disable_faults(&mut self) {
        self.fail_after_operation = usize::MAX;
    }

    /// Lets `n` more operations succeed before every further operation fails.
    pub fn fail_after(&mut self, n: usize) {
        self.fail_after_operation = self.operations.len() + n;
    }

    pub fn erases(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Erase { .. }))
            .count()
    }

    pub fn writes(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| matches!(op, Operation::Write { .. }))
            .count()
    }

    pub fn dump_operations(&self) {
        println!("Operations:");
        for op in &self.operations {
            println!("  {:?}", op);
        }
    }

    fn fault(&self) -> bool {
        if self.operations.len() >= self.fail_after_operation {
            if self.verbose {
                println!("    flash: FAULT");
            }
            return true;
        }
        false
    }
}

#[derive(Debug)]
pub struct FlashError;

impl NorFlashError for FlashError {
    fn kind(&self) -> NorFlashErrorKind {
        NorFlashErrorKind::Other
    }
}

impl<const W: usize> ErrorType for Flash<W> {
    type Error = FlashError;
}

impl<const W: usize> ReadNorFlash for Flash<W> {
    const READ_SIZE: usize = W;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::READ_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::READ_SIZE));

        if self.verbose {
            println!(
                "    flash: read:  0x{offset:04X}[0x{:04X}] #{:>2}",
                bytes.len(),
                self.operations.len()
            );
        }
        if self.fault() {
            return Err(FlashError);
        }
        self.operations.push(Operation::Read {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        bytes.copy_from_slice(&self.buf[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl<const W: usize> NorFlash for Flash<W> {
    const WRITE_SIZE: usize = W;

    const ERASE_SIZE: usize = FLASH_SECTOR_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        assert!(from.is_multiple_of(Self::ERASE_SIZE as _));
        assert!(to.is_multiple_of(Self::ERASE_SIZE as _));

        if self.verbose {
            println!(
                "    flash: erase: {from:04X} - {to:04X} #{:>2}",
                self.operations.len()
            );
        }
        if self.fault() {
            return Err(FlashError);
        }

        self.operations.push(Operation::Erase {
            offset: from,
            len: (to - from) as usize,
        });

        self.buf[from as usize..to as usize].fill(0xff);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        assert!(offset.is_multiple_of(Self::WRITE_SIZE as _));
        assert!(bytes.len().is_multiple_of(Self::WRITE_SIZE));
        assert!(!bytes.is_empty());

        if self.verbose {
            println!(
                "    flash: write: 0x{offset:04X}[0x{:04X}] #{:>2}",
                bytes.len(),
                self.operations.len()
            );
        }
        if self.fault() {
            return Err(FlashError);
        }

        self.operations.push(Operation::Write {
            offset,
            len: bytes.len(),
        });

        let offset = offset as usize;
        for (i, &val) in bytes.iter().enumerate() {
            // like the real flash we can only flip bits from 1 to 0
            self.buf[offset + i] &= val;
        }
        Ok(())
    }
}

impl<const W: usize> Crc for Flash<W> {
    fn crc32(init: u32, data: &[u8]) -> u32 {
        unsafe { libz_sys::crc32(init as u64, data.as_ptr(), data.len() as u32) as u32 }
    }
}

/// Deterministic test data, different for every `seed`.
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// xorshift32, good enough to shuffle types and lengths reproducibly
pub struct Rng(pub u32);

impl Rng {
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    pub fn below(&mut self, n: u32) -> u32 {
        self.next_u32() % n
    }
}
