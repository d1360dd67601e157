//! BIOS directory tables
//!
//! Same shape as the PSP directories with different cookies (`$BHD` and
//! `$BL2`) and 24 byte entries that carry a source and a destination
//! address. Entries of kind 0x70 point at a level 2 directory.

use std::fmt::{self, Display};

use bitfield_struct::bitfield;
use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{fourcc, parse_directory, AmdError, DirectoryHeader};
use crate::Range;

/// Level 1 cookie, "$BHD".
pub const BIOS_COOKIE: u32 = 0x4448_4224;
/// Level 2 cookie, "$BL2".
pub const BIOS_LEVEL2_COOKIE: u32 = 0x324c_4224;

/// Entry kind pointing at a level 2 directory.
pub const LEVEL2_ENTRY: u8 = 0x70;

pub const ENTRY_SIZE: usize = 24;

#[bitfield(u8)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct BiosEntryFlags {
    pub reset_image: bool,
    pub copy_image: bool,
    pub read_only: bool,
    pub compressed: bool,
    #[bits(4)]
    pub instance: u8,
}

#[bitfield(u8)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct BiosEntrySub {
    #[bits(3)]
    pub subprogram: u8,
    #[bits(2)]
    pub rom_id: u8,
    #[bits(3)]
    _0: u8,
}

#[derive(Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct BiosDirectoryEntry {
    pub kind: u8,
    pub region_kind: u8,
    pub flags: BiosEntryFlags,
    pub sub: BiosEntrySub,
    pub size: u32,
    pub source_address: u64,
    /// Where the entry is copied to in DRAM; all-ones when unused.
    pub destination_address: u64,
}

impl Display for BiosDirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let k = self.kind;
        let i = self.flags.instance();
        let s = self.sub.subprogram();
        let size = self.size;
        let src = self.source_address;
        let info = kind_info(k);
        write!(f, "0x{k:<3x} | 0x{i:<7x} | 0x{s:<9x} | {size:<10} | 0x{src:<12x} {info}")
    }
}

// See coreboot util/amdfwtool `bhd_directory_entries`.
pub fn kind_info(kind: u8) -> &'static str {
    match kind {
        0x60 => "APCB data",
        0x61 => "APOB data",
        0x62 => "BIOS binary",
        0x63 => "APOB NV copy",
        0x64 => "PMU firmware instructions",
        0x65 => "PMU firmware data",
        0x66 => "microcode patch",
        0x68 => "APCB data backup",
        0x6a => "MP2 firmware config",
        LEVEL2_ENTRY => "level 2 directory",
        _ => "unknown",
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BiosDirectoryTable {
    pub header: DirectoryHeader,
    pub range: Range,
    pub entries: Vec<BiosDirectoryEntry>,
}

impl BiosDirectoryTable {
    /// Parse a directory at `offset` within `data`, accepting either the
    /// level 1 or level 2 cookie.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, AmdError> {
        let (header, entries, range) = parse_directory::<BiosDirectoryEntry>(
            data,
            offset,
            [BIOS_COOKIE, BIOS_LEVEL2_COOKIE],
        )?;
        Ok(Self {
            header,
            range,
            entries,
        })
    }

    /// Scan for the level 1 cookie from `from` onward and return the first
    /// occurrence that parses as a directory.
    pub fn scan(data: &[u8], from: usize) -> Option<Self> {
        let cookie = BIOS_COOKIE.to_le_bytes();
        let mut pos = from;
        while pos < data.len() {
            let idx = pos + data[pos..].windows(4).position(|w| w == cookie)?;
            match Self::parse(data, idx) {
                Ok(table) => return Some(table),
                Err(_) => pos = idx + 4,
            }
        }
        None
    }
}

impl Display for BiosDirectoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cookie = fourcc(self.header.cookie);
        let o = self.range.offset;
        writeln!(f, "BIOS directory {cookie} @ {o:08x}")?;
        writeln!(f, "Checksum: {:08x}", self.header.checksum)?;
        writeln!(f, "Total Entries: {}", self.header.total_entries)?;
        writeln!(
            f,
            "{:<5} | {:<9} | {:<11} | {:<10} | {:<14}",
            "Type", "Instance", "Subprogram", "Size", "Source"
        )?;
        for entry in &self.entries {
            writeln!(f, "{entry}")?;
        }
        write!(f, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn struct_size() {
        assert_eq!(size_of::<BiosDirectoryEntry>(), ENTRY_SIZE);
    }

    #[test]
    fn parse_entries() {
        let mut data = vec![0u8; 0x100];
        data[0..4].copy_from_slice(&BIOS_COOKIE.to_le_bytes());
        data[8..12].copy_from_slice(&1u32.to_le_bytes());
        data[16] = 0x62;
        data[17] = 0x01; // region kind
        data[18] = 0b0010_0101; // reset_image, read_only, instance 2
        data[19] = 0b0000_1010; // subprogram 2, rom_id 1
        data[20..24].copy_from_slice(&0x2000u32.to_le_bytes());
        data[24..32].copy_from_slice(&0x10_0000u64.to_le_bytes());
        data[32..40].copy_from_slice(&u64::MAX.to_le_bytes());

        let dir = BiosDirectoryTable::parse(&data, 0).unwrap();
        assert_eq!(dir.range, Range { offset: 0, length: 40 });
        let e = &dir.entries[0];
        assert_eq!(e.kind, 0x62);
        assert!(e.flags.reset_image());
        assert!(!e.flags.copy_image());
        assert!(e.flags.read_only());
        assert_eq!(e.flags.instance(), 2);
        assert_eq!(e.sub.subprogram(), 2);
        assert_eq!(e.sub.rom_id(), 1);
        assert_eq!(e.size, 0x2000);
        assert_eq!(e.source_address, 0x10_0000);
        assert_eq!(e.destination_address, u64::MAX);
    }

    #[test]
    fn truncated_directory() {
        let mut data = vec![0u8; 0x40];
        data[0..4].copy_from_slice(&BIOS_COOKIE.to_le_bytes());
        data[8..12].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            BiosDirectoryTable::parse(&data, 0),
            Err(AmdError::TruncatedStructure(_))
        ));
    }

    #[test]
    fn cookie_constants() {
        assert_eq!(&BIOS_COOKIE.to_le_bytes(), b"$BHD");
        assert_eq!(&BIOS_LEVEL2_COOKIE.to_le_bytes(), b"$BL2");
    }
}
