//! GUID Partition Table parsing (§4.4, §6 "GPT").

use crate::config::SECTOR_SIZE;
use crate::error::{KError, KResult};
use containers::KVec;

pub const GPT_MAGIC: u64 = 0x5452_4150_2049_4645;

/// Header at LBA 1. Only the fields the port needs to locate and size
/// the entry array are kept; checksums are not verified (no CRC32
/// implementation is in scope here, matching the original's own
/// unchecked read).
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct GptHeader {
    pub signature: u64,
    pub revision: u32,
    pub header_size: u32,
    pub header_checksum: u32,
    _reserved0: u32,
    pub header_lba: u64,
    pub alt_header_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub entry_arr_lba: u64,
    pub num_part_entries: u32,
    pub entry_size: u32,
    pub part_arr_checksum: u32,
}

/// One 128-byte partition entry.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct GptEntry {
    pub type_guid_lo: u64,
    pub type_guid_hi: u64,
    pub uniq_guid: [u8; 16],
    pub start_lba: u64,
    pub end_lba: u64,
    pub attrs: u64,
    pub name: [u16; 36],
}

impl GptEntry {
    pub fn is_unused(&self) -> bool {
        self.type_guid_lo == 0 && self.type_guid_hi == 0
    }
}

pub struct Gpt {
    header: GptHeader,
    entries: KVec<GptEntry>,
}

impl Gpt {
    /// Parses just the header, so the caller can size the entry-array
    /// read before handing both sectors to [`Gpt::parse`].
    pub fn peek_header(header_sector: &[u8]) -> KResult<GptHeader> {
        if header_sector.len() < size_of::<GptHeader>() {
            return Err(KError::InvalidFormat);
        }
        let header = unsafe { (header_sector.as_ptr() as *const GptHeader).read_unaligned() };
        if header.signature != GPT_MAGIC {
            return Err(KError::InvalidFormat);
        }
        Ok(header)
    }

    /// Parses a GPT out of the already-read LBA-1 header sector and the
    /// already-read entry-array sectors.
    pub fn parse(header_sector: &[u8], entry_sectors: &[u8]) -> KResult<Self> {
        let header = Self::peek_header(header_sector)?;

        let entry_size = header.entry_size as usize;
        if entry_size < size_of::<GptEntry>() {
            return Err(KError::InvalidFormat);
        }

        let mut entries = KVec::new();
        for i in 0..header.num_part_entries as usize {
            let off = i * entry_size;
            if off + size_of::<GptEntry>() > entry_sectors.len() {
                break;
            }
            let entry = unsafe {
                (entry_sectors.as_ptr().add(off) as *const GptEntry).read_unaligned()
            };
            entries.push(entry);
        }

        Ok(Self { header, entries })
    }

    /// Sector count of the entry array, rounded up to whole sectors.
    pub fn entry_array_sectors(header: &GptHeader) -> usize {
        let bytes = header.num_part_entries as usize * header.entry_size as usize;
        bytes.div_ceil(SECTOR_SIZE)
    }

    pub fn entry_array_lba(&self) -> u64 {
        self.header.entry_arr_lba
    }

    pub fn num_entries(&self) -> u32 {
        self.header.num_part_entries
    }

    pub fn find_by_guid(&self, type_guid_lo: u64, type_guid_hi: u64) -> Option<&GptEntry> {
        self.entries
            .iter()
            .find(|e| e.type_guid_lo == type_guid_lo && e.type_guid_hi == type_guid_hi)
    }

    pub fn nth(&self, n: usize) -> Option<&GptEntry> {
        self.entries.get(n).filter(|e| !e.is_unused())
    }
}

pub fn partition_range(entry: &GptEntry) -> (u64, u64) {
    (entry.start_lba, entry.end_lba.saturating_sub(entry.start_lba) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(num_part_entries: u32, entry_size: u32, entry_arr_lba: u64) -> [u8; SECTOR_SIZE] {
        let header = GptHeader {
            signature: GPT_MAGIC,
            revision: 0x0001_0000,
            header_size: size_of::<GptHeader>() as u32,
            header_checksum: 0,
            _reserved0: 0,
            header_lba: 1,
            alt_header_lba: 0,
            first_usable_lba: 34,
            last_usable_lba: 100,
            disk_guid: [0; 16],
            entry_arr_lba,
            num_part_entries,
            entry_size,
            part_arr_checksum: 0,
        };
        let mut buf = [0u8; SECTOR_SIZE];
        unsafe { core::ptr::write(buf.as_mut_ptr() as *mut GptHeader, header) };
        buf
    }

    fn entry(type_guid: (u64, u64), start_lba: u64, end_lba: u64) -> GptEntry {
        GptEntry {
            type_guid_lo: type_guid.0,
            type_guid_hi: type_guid.1,
            uniq_guid: [0; 16],
            start_lba,
            end_lba,
            attrs: 0,
            name: [0; 36],
        }
    }

    #[test]
    fn peek_header_rejects_bad_magic() {
        let mut buf = header_bytes(1, 128, 2);
        buf[0] = 0;
        assert!(Gpt::peek_header(&buf).is_err());
    }

    #[test]
    fn peek_header_accepts_valid_magic() {
        let buf = header_bytes(2, 128, 2);
        let header = Gpt::peek_header(&buf).unwrap();
        assert_eq!(header.entry_arr_lba, 2);
        assert_eq!(header.num_part_entries, 2);
    }

    #[test]
    fn parse_finds_entry_by_guid_and_by_index() {
        let header_buf = header_bytes(2, 128, 2);
        let mut entries_buf = [0u8; 256];
        let e0 = entry((0x1111, 0x2222), 34, 1000);
        let e1 = entry((0x3333, 0x4444), 1001, 2000);
        unsafe {
            core::ptr::write(entries_buf.as_mut_ptr() as *mut GptEntry, e0);
            core::ptr::write(entries_buf.as_mut_ptr().add(128) as *mut GptEntry, e1);
        }

        let gpt = Gpt::parse(&header_buf, &entries_buf).unwrap();
        assert_eq!(gpt.num_entries(), 2);
        assert_eq!(gpt.find_by_guid(0x3333, 0x4444).unwrap().start_lba, 1001);
        assert!(gpt.find_by_guid(0x9999, 0x9999).is_none());

        let (start, len) = partition_range(gpt.nth(0).unwrap());
        assert_eq!((start, len), (34, 967));
    }

    #[test]
    fn nth_skips_unused_entries() {
        let header_buf = header_bytes(1, 128, 2);
        let mut entries_buf = [0u8; 128];
        let unused = entry((0, 0), 0, 0);
        unsafe { core::ptr::write(entries_buf.as_mut_ptr() as *mut GptEntry, unused) };

        let gpt = Gpt::parse(&header_buf, &entries_buf).unwrap();
        assert!(gpt.nth(0).is_none());
    }

    #[test]
    fn entry_array_sectors_rounds_up() {
        let header = GptHeader {
            signature: GPT_MAGIC,
            revision: 0,
            header_size: 0,
            header_checksum: 0,
            _reserved0: 0,
            header_lba: 1,
            alt_header_lba: 0,
            first_usable_lba: 0,
            last_usable_lba: 0,
            disk_guid: [0; 16],
            entry_arr_lba: 2,
            num_part_entries: 128,
            entry_size: 128,
            part_arr_checksum: 0,
        };
        assert_eq!(Gpt::entry_array_sectors(&header), 32);
    }
}
