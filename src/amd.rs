//! AMD PSP firmware structures
//!
//! An AMD image carries an Embedded Firmware Structure at one of a few well
//! known locations, pointing at PSP and BIOS directory tables. Level 1
//! directories may point at level 2 directories, directly or through a
//! small recovery indirection record. Some images have stale pointers and
//! directories only reachable by scanning for their cookie, so discovery is
//! best effort: whatever parses is collected, whatever does not is logged
//! and skipped.

pub mod bios;
pub mod efs;
pub mod psp;

use std::mem::size_of;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, KnownLayout, Ref};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use crate::{FlashImage, Range};
use bios::BiosDirectoryTable;
use efs::EmbeddedFirmwareStructure;
use psp::{PspDirectoryTable, RecoveryPointer};

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum AmdError {
    EfsNotFound,
    BadCookie(String),
    TruncatedStructure(String),
    OutOfBoundsPointer(u64),
}

/// Directory table header, common to PSP and BIOS directories.
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct DirectoryHeader {
    pub cookie: u32,
    pub checksum: u32,
    pub total_entries: u32,
    pub additional_info: u32,
}

pub const DIRECTORY_HEADER_SIZE: usize = 16;

/// Render a cookie for diagnostics, e.g. `$PSP`.
pub(crate) fn fourcc(cookie: u32) -> String {
    let b = cookie.to_le_bytes();
    match std::str::from_utf8(&b) {
        Ok(s) => s.to_string(),
        Err(_) => format!("{b:02x?}"),
    }
}

/// Read a directory header and its entry array at `offset` in the image.
///
/// PSP and BIOS directories share this shape and differ in cookie values
/// and entry layout.
pub(crate) fn parse_directory<E>(
    data: &[u8],
    offset: usize,
    cookies: [u32; 2],
) -> Result<(DirectoryHeader, Vec<E>, Range), AmdError>
where
    E: FromBytes + Immutable + KnownLayout + Copy,
{
    let Some(slice) = data.get(offset..) else {
        return Err(AmdError::OutOfBoundsPointer(offset as u64));
    };
    let Ok((header, rest)) = DirectoryHeader::read_from_prefix(slice) else {
        return Err(AmdError::TruncatedStructure(format!(
            "no room for a directory header @ {offset:08x}"
        )));
    };
    if !cookies.contains(&header.cookie) {
        return Err(AmdError::BadCookie(format!(
            "incorrect cookie {} @ {offset:08x}",
            fourcc(header.cookie)
        )));
    }
    let count = header.total_entries as usize;
    let required = count * size_of::<E>();
    if rest.len() < required {
        return Err(AmdError::TruncatedStructure(format!(
            "directory @ {offset:08x} declares {count} entries, only {} bytes left",
            rest.len()
        )));
    }
    let Ok((entries, _)) = Ref::<_, [E]>::from_prefix_with_elems(rest, count) else {
        return Err(AmdError::TruncatedStructure(format!(
            "cannot read {count} directory entries @ {offset:08x}"
        )));
    };
    let range = Range {
        offset: offset as u64,
        length: (DIRECTORY_HEADER_SIZE + required) as u64,
    };
    Ok((header, entries.to_vec(), range))
}

/// A PSP directory with its optional level 2 directory.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PspDir {
    pub level1: PspDirectoryTable,
    pub level2: Option<PspDirectoryTable>,
}

/// A BIOS directory with its optional level 2 directory.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BiosDir {
    pub level1: BiosDirectoryTable,
    pub level2: Option<BiosDirectoryTable>,
}

/// The PSP related structures of an image: the EFS and every directory
/// reachable from it, in discovery order.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PspFirmware {
    pub efs: EmbeddedFirmwareStructure,
    pub efs_range: Range,
    pub psp_directories: Vec<PspDir>,
    pub bios_directories: Vec<BiosDir>,
}

impl PspFirmware {
    /// Walk the image: EFS, modern PSP directory, legacy PSP directory, the
    /// four BIOS directory pointers in declared order, then a cookie scan
    /// for BIOS directories nothing points at. Only a missing EFS is fatal.
    pub fn parse(fw: &impl FlashImage) -> Result<Self, AmdError> {
        let image = fw.image_bytes();
        let (efs, efs_range) = efs::find_embedded_firmware_structure(fw)?;

        let mut psp_directories = Vec::new();

        // The modern directory's fallback scan may start anywhere; the
        // legacy one must start past the modern directory so the scan does
        // not rediscover it.
        let mut legacy_scan_from = 0;
        if let Some(level1) = locate_psp_directory(fw, efs.psp_dir, "modern", 0) {
            legacy_scan_from = level1.range.end() as usize;
            let level2 = promote_psp_level2(fw, &level1);
            psp_directories.push(PspDir { level1, level2 });
        }
        if let Some(level1) =
            locate_psp_directory(fw, efs.psp_legacy_dir, "legacy", legacy_scan_from)
        {
            let level2 = promote_psp_level2(fw, &level1);
            psp_directories.push(PspDir { level1, level2 });
        }

        let mut bios_directories = Vec::new();
        for pointer in efs.bios_dir_pointers() {
            if pointer == 0 || pointer == 0xffff_ffff {
                continue;
            }
            let offset = fw.pointer_to_offset(pointer as u64) as usize;
            if offset >= image.len() {
                warn!("BIOS directory pointer {pointer:08x} outside the image");
                continue;
            }
            info!("Parse BIOS directory @ {offset:08x}");
            match BiosDirectoryTable::parse(image, offset) {
                Ok(level1) => {
                    let level2 = promote_bios_level2(fw, &level1);
                    bios_directories.push(BiosDir { level1, level2 });
                }
                Err(e) => warn!("BIOS directory @ {offset:08x}: {e:?}"),
            }
        }

        // Some images have BIOS directories no pointer references; pick
        // them up by their cookie, skipping the ones already found.
        let known: Vec<u64> = bios_directories
            .iter()
            .flat_map(|d| {
                let mut offsets = vec![d.level1.range.offset];
                if let Some(level2) = &d.level2 {
                    offsets.push(level2.range.offset);
                }
                offsets
            })
            .collect();
        let mut pos = 0;
        while let Some(found) = BiosDirectoryTable::scan(image, pos) {
            pos = found.range.offset as usize + 4;
            if known.contains(&found.range.offset) {
                continue;
            }
            info!("BIOS directory found by scan @ {:08x}", found.range.offset);
            bios_directories.push(BiosDir {
                level1: found,
                level2: None,
            });
        }

        Ok(Self {
            efs,
            efs_range,
            psp_directories,
            bios_directories,
        })
    }
}

/// Follow a level 1 PSP directory pointer from the EFS. The pointer is
/// authoritative; if it is stale or its target does not parse, fall back to
/// a cookie scan starting at `scan_from`.
fn locate_psp_directory(
    fw: &impl FlashImage,
    pointer: u32,
    which: &str,
    scan_from: usize,
) -> Option<PspDirectoryTable> {
    if pointer == 0 {
        return None;
    }
    let image = fw.image_bytes();
    let offset = fw.pointer_to_offset(pointer as u64) as usize;
    if offset < image.len() {
        info!("Parse {which} PSP directory @ {offset:08x}");
        match PspDirectoryTable::parse(image, offset) {
            Ok(table) => return Some(table),
            Err(e) => warn!("{which} PSP directory @ {offset:08x}: {e:?}"),
        }
    } else {
        warn!("{which} PSP directory pointer {pointer:08x} outside the image");
    }
    info!("Scanning for the {which} PSP directory from {scan_from:08x}");
    PspDirectoryTable::scan(image, scan_from)
}

/// Promote the first level 2 pointer entry of a level 1 PSP directory.
/// Recovery entries point at an indirection record rather than at the
/// directory itself.
fn promote_psp_level2(
    fw: &impl FlashImage,
    level1: &PspDirectoryTable,
) -> Option<PspDirectoryTable> {
    let image = fw.image_bytes();
    let entry = level1.entries.iter().find(|e| e.points_to_level2())?;
    let mut offset = fw.pointer_to_offset(entry.location_or_value) as usize;
    if offset == 0 || offset >= image.len() {
        warn!(
            "level 2 PSP directory pointer {:x} outside the image",
            entry.location_or_value
        );
        return None;
    }
    if entry.is_recovery() {
        let Ok((recovery, _)) = RecoveryPointer::read_from_prefix(&image[offset..]) else {
            warn!("no room for a recovery pointer @ {offset:08x}");
            return None;
        };
        let location = recovery.location;
        offset = fw.pointer_to_offset(location as u64) as usize;
        info!("Recovery level 2 PSP directory @ {offset:08x}");
        if offset >= image.len() {
            warn!("recovery directory location {location:08x} outside the image");
            return None;
        }
    }
    match PspDirectoryTable::parse(image, offset) {
        Ok(table) => Some(table),
        Err(e) => {
            warn!("level 2 PSP directory @ {offset:08x}: {e:?}");
            None
        }
    }
}

/// Promote the first level 2 pointer entry of a level 1 BIOS directory.
fn promote_bios_level2(
    fw: &impl FlashImage,
    level1: &BiosDirectoryTable,
) -> Option<BiosDirectoryTable> {
    let image = fw.image_bytes();
    let entry = level1
        .entries
        .iter()
        .find(|e| e.kind == bios::LEVEL2_ENTRY)?;
    let offset = fw.pointer_to_offset(entry.source_address) as usize;
    if offset == 0 || offset >= image.len() {
        warn!(
            "level 2 BIOS directory pointer {:x} outside the image",
            entry.source_address
        );
        return None;
    }
    info!("Level 2 BIOS directory @ {offset:08x}");
    match BiosDirectoryTable::parse(image, offset) {
        Ok(table) => Some(table),
        Err(e) => {
            warn!("level 2 BIOS directory @ {offset:08x}: {e:?}");
            None
        }
    }
}
