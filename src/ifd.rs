//! Intel Flash Descriptor (IFD)
//!
//! The descriptor occupies the first 4 KiB of the image and carves the
//! flash into regions (BIOS, ME, GbE, ...). References: coreboot
//! `util/ifdtool/` and the PCH datasheets, e.g. the 600 series chipset
//! family volume 1.
//!
//! The descriptor map stores section locations in compressed form: an
//! 8 bit base-address field holds bits 4..12 of the byte offset, and the
//! count fields are stored off by one. Region bases and limits are 4 KiB
//! sector numbers.

use std::fmt::{self, Display};

use bitfield_struct::bitfield;
use serde::{Deserialize, Serialize};
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

// On-wire signature value, already little-endian.
const MAGIC: u32 = 0x0ff0_a55a;

// The signature sits 0x10 into the image; the descriptor map follows.
const MAP_OFFSET: usize = 0x10;

const SECTOR_SIZE: u64 = 0x1000;

// FLREG slots per coreboot util/ifdtool; slot 0 is the descriptor itself.
const MAX_REGIONS: usize = 16;

/// FLMAP0: where the component and region sections live.
#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct DescriptorMap0 {
    component_base: u8,
    #[bits(2)]
    component_count: u8,
    #[bits(6)]
    _0: u8,
    region_base: u8,
    #[bits(3)]
    region_count: u8,
    #[bits(5)]
    _1: u8,
}

impl DescriptorMap0 {
    /// Byte offset of the flash region table (FRBA).
    fn region_table(self) -> usize {
        usize::from(self.region_base()) << 4
    }

    /// Declared number of regions (NR holds one less).
    fn regions(self) -> usize {
        usize::from(self.region_count()) + 1
    }

    fn component_table(self) -> usize {
        usize::from(self.component_base()) << 4
    }

    fn components(self) -> usize {
        usize::from(self.component_count()) + 1
    }
}

impl Display for DescriptorMap0 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let regions = self.regions();
        let frba = self.region_table();
        let components = self.components();
        let fcba = self.component_table();
        write!(
            f,
            "FLMAP0: {regions} regions (table @ {frba:#x}), {components} components (table @ {fcba:#x})"
        )
    }
}

/// FLMAP1: master and strap sections.
#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct DescriptorMap1 {
    master_base: u8,
    #[bits(3)]
    master_count: u8,
    #[bits(5)]
    _0: u8,
    strap_base: u8,
    strap_count: u8,
}

impl DescriptorMap1 {
    fn master_table(self) -> usize {
        usize::from(self.master_base()) << 4
    }

    fn masters(self) -> usize {
        usize::from(self.master_count()) + 1
    }

    // FISBA on early chipsets; later ones repurposed it as FPSBA.
    fn strap_table(self) -> usize {
        usize::from(self.strap_base()) << 4
    }

    fn straps(self) -> usize {
        usize::from(self.strap_count())
    }
}

impl Display for DescriptorMap1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let masters = self.masters();
        let fmba = self.master_table();
        let straps = self.straps();
        let fisba = self.strap_table();
        write!(
            f,
            "FLMAP1: {masters} masters (table @ {fmba:#x}), {straps} strap dwords @ {fisba:#x}"
        )
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct Header {
    magic: u32,
    pub flmap0: DescriptorMap0,
    pub flmap1: DescriptorMap1,
    pub flmap2: u32, // 100x series straps
    pub flmap3: u32, // 500 series and later
}

/// One FLREG slot. Base and limit are 4 KiB sector numbers; a limit below
/// the base marks the slot unused.
#[bitfield(u32)]
#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize)]
pub struct FlashRegion {
    #[bits(13)]
    base: u32,
    #[bits(3)]
    _0: u8,
    #[bits(13)]
    limit: u32,
    #[bits(3)]
    _1: u8,
}

impl FlashRegion {
    fn unused(self) -> bool {
        self.limit() < self.base()
    }

    fn start(self) -> u64 {
        u64::from(self.base()) * SECTOR_SIZE
    }

    /// Size in bytes; the limit sector is inclusive.
    fn size(self) -> u64 {
        (u64::from(self.limit()) - u64::from(self.base()) + 1) * SECTOR_SIZE
    }
}

impl Display for FlashRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unused() {
            return write!(f, "unused");
        }
        let start = self.start();
        let end = start + self.size();
        write!(f, "{start:#010x}..{end:#010x}")
    }
}

/// The named regions we resolve, by their FLREG slot.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Bios = 1,
    Me = 2,
    Gbe = 3,
    Microcode = 7,
    Ec = 8,
    Ptt = 15,
}

impl RegionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bios => "BIOS",
            Self::Me => "ME",
            Self::Gbe => "GBE",
            Self::Microcode => "ucode",
            Self::Ec => "EC",
            Self::Ptt => "PTT",
        }
    }
}

/// Display order of the region map.
pub const NAMED_REGIONS: [RegionKind; 6] = [
    RegionKind::Bios,
    RegionKind::Me,
    RegionKind::Gbe,
    RegionKind::Ptt,
    RegionKind::Ec,
    RegionKind::Microcode,
];

/// A resolved region. All-zero means the region is not present, which is
/// not an error.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub size: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum IfdError {
    BadDescriptor(String),
    UnknownRegion(String),
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Ifd {
    pub header: Header,
    pub regions: Vec<FlashRegion>,
}

impl Ifd {
    pub fn parse(data: &[u8]) -> Result<Self, IfdError> {
        let Some(map) = data.get(MAP_OFFSET..) else {
            return Err(IfdError::BadDescriptor(
                "image too small for a flash descriptor".to_string(),
            ));
        };
        let Ok((header, _)) = Header::read_from_prefix(map) else {
            return Err(IfdError::BadDescriptor(
                "image too small for a flash descriptor".to_string(),
            ));
        };

        if header.magic != MAGIC {
            return Err(IfdError::BadDescriptor(format!(
                "no IFD signature at offset {MAP_OFFSET:#x}: found {:08x}",
                header.magic
            )));
        }

        let frba = header.flmap0.region_table();
        // NR saturated means "8 or more"; IFD v2 images leave it that way
        // and carry the full 16-slot region table.
        let count = match header.flmap0.regions() {
            8 => MAX_REGIONS,
            n => n,
        };
        let Some(slots) = data.get(frba..frba + count * 4) else {
            return Err(IfdError::BadDescriptor(format!(
                "region table at {frba:08x} exceeds the image"
            )));
        };
        let regions = slots
            .chunks_exact(4)
            .map(|w| FlashRegion::from_bits(u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
            .collect();

        Ok(Self { header, regions })
    }

    /// Resolve a named region to its offset and size in bytes.
    pub fn region(&self, kind: RegionKind) -> Result<Region, IfdError> {
        let slot = kind as usize;
        let Some(r) = self.regions.get(slot) else {
            return Err(IfdError::UnknownRegion(format!(
                "{} (slot {slot}) beyond the {} declared regions",
                kind.name(),
                self.regions.len()
            )));
        };
        if r.unused() {
            return Ok(Region::default());
        }
        Ok(Region {
            offset: r.start(),
            size: r.size(),
        })
    }

    /// The six named regions in display order. Absent and undeclared
    /// regions both resolve to zeros here.
    pub fn region_map(&self) -> Vec<(RegionKind, Region)> {
        NAMED_REGIONS
            .iter()
            .map(|kind| (*kind, self.region(*kind).unwrap_or_default()))
            .collect()
    }
}

impl Display for Ifd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.header.flmap0)?;
        writeln!(f, "{}", self.header.flmap1)?;
        for (i, r) in self.regions.iter().enumerate() {
            writeln!(f, "FLREG{i}: {r}")?;
        }
        Ok(())
    }
}
