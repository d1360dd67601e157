//! PSP directory tables
//!
//! A directory is a 16 byte header followed by 16 byte entries. Level 1
//! tables carry the `$PSP` cookie, level 2 tables `$PL2`. Entries of kinds
//! 0x40/0x48/0x4a point at a level 2 directory; the recovery kinds do so
//! through a small indirection record.

use std::fmt::{self, Display};

use bitfield_struct::bitfield;
use serde::{Deserialize, Serialize};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{fourcc, parse_directory, AmdError, DirectoryHeader};
use crate::Range;

/// Level 1 cookie, "$PSP".
pub const PSP_COOKIE: u32 = 0x5053_5024;
/// Level 2 cookie, "$PL2".
pub const PSP_LEVEL2_COOKIE: u32 = 0x324c_5024;

/// Entry kinds pointing at a level 2 directory.
pub const LEVEL2_ENTRY: u8 = 0x40;
pub const LEVEL2_RECOVERY_A_ENTRY: u8 = 0x48;
pub const LEVEL2_RECOVERY_B_ENTRY: u8 = 0x4a;

pub const ENTRY_SIZE: usize = 16;

#[bitfield(u16)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct PspEntryFlags {
    #[bits(14)]
    _0: u16,
    #[bits(2)]
    pub rom_id: u8,
}

#[derive(Immutable, IntoBytes, FromBytes, KnownLayout, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct PspDirectoryEntry {
    pub kind: u8,
    pub subprogram: u8,
    pub flags: PspEntryFlags,
    pub size: u32,
    /// A location for blob entries; an immediate value for entries such as
    /// the soft fuse chain.
    pub location_or_value: u64,
}

impl PspDirectoryEntry {
    pub fn rom_id(&self) -> u8 {
        self.flags.rom_id()
    }

    pub fn points_to_level2(&self) -> bool {
        matches!(
            self.kind,
            LEVEL2_ENTRY | LEVEL2_RECOVERY_A_ENTRY | LEVEL2_RECOVERY_B_ENTRY
        )
    }

    pub fn is_recovery(&self) -> bool {
        matches!(self.kind, LEVEL2_RECOVERY_A_ENTRY | LEVEL2_RECOVERY_B_ENTRY)
    }
}

impl Display for PspDirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let k = self.kind;
        let s = self.subprogram;
        let r = self.rom_id();
        let size = self.size;
        let l = self.location_or_value;
        let info = kind_info(k);
        write!(f, "0x{k:<3x} | 0x{s:<8x} | 0x{r:<3x} | {size:<10} | 0x{l:<12x} {info}")
    }
}

// See coreboot util/amdfwtool and the PSP design guide. Only the location,
// size and kind are decoded; payloads are out of scope.
pub fn kind_info(kind: u8) -> &'static str {
    match kind {
        0x00 => "AMD public key",
        0x01 => "PSP bootloader",
        0x02 => "PSP secure OS",
        0x03 => "PSP recovery bootloader",
        0x04 => "PSP NV data",
        0x05 => "BIOS public key",
        0x06 => "BIOS RTM firmware",
        0x07 => "BIOS RTM signature",
        0x08 => "SMU offchip firmware",
        0x09 => "AMD secure debug key",
        0x0a => "OEM public key",
        0x0b => "soft fuse chain",
        0x0c => "PSP boot-loaded trustlet",
        0x0d => "trustlet public key",
        0x12 => "SMU offchip firmware 2",
        0x21 => "wrapped iKEK",
        0x22 => "PSP token unlock data",
        0x24 => "security policy",
        0x25 => "MP2 firmware",
        0x28 => "PSP system driver",
        0x2a => "MP5 firmware",
        0x30 => "AGESA bootloader",
        LEVEL2_ENTRY => "level 2 directory",
        LEVEL2_RECOVERY_A_ENTRY => "level 2 directory (recovery A)",
        LEVEL2_RECOVERY_B_ENTRY => "level 2 directory (recovery B)",
        _ => "unknown",
    }
}

/// The record behind a recovery level 2 entry. Most fields are not publicly
/// documented; the trailing location is the actual directory offset.
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct RecoveryPointer {
    pub _0: u16,
    pub _2: u32,
    pub _6: u32,
    pub _10: u16,
    pub location: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PspDirectoryTable {
    pub header: DirectoryHeader,
    pub range: Range,
    pub entries: Vec<PspDirectoryEntry>,
}

impl PspDirectoryTable {
    /// Parse a directory at `offset` within `data`, accepting either the
    /// level 1 or level 2 cookie.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, AmdError> {
        let (header, entries, range) =
            parse_directory::<PspDirectoryEntry>(data, offset, [PSP_COOKIE, PSP_LEVEL2_COOKIE])?;
        Ok(Self {
            header,
            range,
            entries,
        })
    }

    /// Scan for the level 1 cookie from `from` onward and return the first
    /// occurrence that parses as a directory.
    pub fn scan(data: &[u8], from: usize) -> Option<Self> {
        let cookie = PSP_COOKIE.to_le_bytes();
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

impl Display for PspDirectoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cookie = fourcc(self.header.cookie);
        let o = self.range.offset;
        writeln!(f, "PSP directory {cookie} @ {o:08x}")?;
        writeln!(f, "Checksum: {:08x}", self.header.checksum)?;
        writeln!(f, "Total Entries: {}", self.header.total_entries)?;
        writeln!(f, "Additional Info: 0x{:x}", self.header.additional_info)?;
        writeln!(
            f,
            "{:<5} | {:<10} | {:<5} | {:<10} | {:<14}",
            "Type", "Subprogram", "ROMId", "Size", "Location/Value"
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

    fn table(cookie: u32, entries: u32) -> Vec<u8> {
        let mut data = vec![0u8; 0x200];
        data[0..4].copy_from_slice(&cookie.to_le_bytes());
        data[8..12].copy_from_slice(&entries.to_le_bytes());
        data
    }

    #[test]
    fn struct_sizes() {
        assert_eq!(size_of::<DirectoryHeader>(), 16);
        assert_eq!(size_of::<PspDirectoryEntry>(), ENTRY_SIZE);
        assert_eq!(size_of::<RecoveryPointer>(), 16);
    }

    #[test]
    fn parse_entries() {
        let mut data = table(PSP_COOKIE, 2);
        data[16] = 0x01;
        data[17] = 0x02; // subprogram
        data[18..20].copy_from_slice(&(0x3u16 << 14).to_le_bytes()); // rom_id
        data[20..24].copy_from_slice(&0x1000u32.to_le_bytes());
        data[24..32].copy_from_slice(&0x4_0000u64.to_le_bytes());
        data[32] = 0x0b;

        let dir = PspDirectoryTable::parse(&data, 0).unwrap();
        assert_eq!(dir.header.total_entries, 2);
        assert_eq!(dir.range, Range { offset: 0, length: 48 });
        let e = &dir.entries[0];
        assert_eq!(e.kind, 0x01);
        assert_eq!(e.subprogram, 0x02);
        assert_eq!(e.rom_id(), 0x3);
        assert_eq!(e.size, 0x1000);
        assert_eq!(e.location_or_value, 0x4_0000);
        assert!(!e.points_to_level2());
    }

    #[test]
    fn level2_cookie_accepted() {
        let data = table(PSP_LEVEL2_COOKIE, 0);
        let dir = PspDirectoryTable::parse(&data, 0).unwrap();
        assert_eq!(dir.header.cookie, PSP_LEVEL2_COOKIE);
    }

    #[test]
    fn bad_cookie() {
        let data = table(0x2444_5024, 0);
        assert!(matches!(
            PspDirectoryTable::parse(&data, 0),
            Err(AmdError::BadCookie(_))
        ));
    }

    #[test]
    fn truncated_directory() {
        // Declares more entries than the buffer can hold.
        let data = table(PSP_COOKIE, 0x100);
        assert!(matches!(
            PspDirectoryTable::parse(&data, 0),
            Err(AmdError::TruncatedStructure(_))
        ));
    }

    #[test]
    fn scan_skips_false_positives() {
        let mut data = vec![0u8; 0x1000];
        // A bare cookie with an oversized entry count does not parse; the
        // real directory further in does.
        data[0x100..0x104].copy_from_slice(&PSP_COOKIE.to_le_bytes());
        data[0x108..0x10c].copy_from_slice(&0xffffu32.to_le_bytes());
        data[0x800..0x804].copy_from_slice(&PSP_COOKIE.to_le_bytes());
        data[0x808..0x80c].copy_from_slice(&1u32.to_le_bytes());

        let dir = PspDirectoryTable::scan(&data, 0).unwrap();
        assert_eq!(dir.range.offset, 0x800);
    }

    #[test]
    fn scan_empty() {
        let data = vec![0u8; 0x1000];
        assert!(PspDirectoryTable::scan(&data, 0).is_none());
    }
}
