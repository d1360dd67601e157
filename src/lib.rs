#![doc = include_str!("../README.md")]

use log::warn;
use serde::{Deserialize, Serialize};

pub mod amd;
pub mod ifd;
pub mod ucode;

use amd::{AmdError, PspFirmware};
use ifd::{Ifd, IfdError};

/// Physical address the top of the flash image is mapped at.
///
/// On a live system the SPI flash decode window ends at 4 GiB, so a 16 MiB
/// image starts at `0xff000000`. Dumps from nonstandard decode windows can
/// supply their own base via [`RomImage::with_mapping`].
pub const DEFAULT_MAPPING: u64 = 0xff00_0000;

/// A byte range within the image.
///
/// Every parsed structure records the range it occupied, so downstream
/// tooling can carve the bytes back out.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Range {
    pub offset: u64,
    pub length: u64,
}

impl Range {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Read access to a flash image plus its physical-address mapping.
///
/// Decoders are polymorphic over this so that memory-mapped dumps, network
/// fetched blobs and test fixtures all work alike.
pub trait FlashImage {
    fn image_bytes(&self) -> &[u8];
    fn phys_to_offset(&self, phys: u64) -> u64;
    fn offset_to_phys(&self, offset: u64) -> u64;

    /// Translate a pointer read from a parsed structure to an image offset.
    ///
    /// Pointers above the mapping base were authored for the live memory
    /// map and need the base subtracted; anything else already is an image
    /// offset. Callers apply this exactly once per raw pointer, then bounds
    /// check the result.
    fn pointer_to_offset(&self, ptr: u64) -> u64 {
        let mapping = self.offset_to_phys(0);
        if ptr > mapping {
            self.phys_to_offset(ptr)
        } else {
            ptr
        }
    }
}

/// The default accessor: a borrowed image with the standard top-of-memory
/// mapping.
#[derive(Clone, Copy, Debug)]
pub struct RomImage<'a> {
    data: &'a [u8],
    mapping: u64,
}

impl<'a> RomImage<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            mapping: DEFAULT_MAPPING,
        }
    }

    pub fn with_mapping(data: &'a [u8], mapping: u64) -> Self {
        Self { data, mapping }
    }
}

impl FlashImage for RomImage<'_> {
    fn image_bytes(&self) -> &[u8] {
        self.data
    }

    // NOTE: Wrapping arithmetic; a pointer below the mapping base yields an
    // offset that fails the bounds check instead of aborting the walk.
    fn phys_to_offset(&self, phys: u64) -> u64 {
        phys.wrapping_sub(self.mapping)
    }

    fn offset_to_phys(&self, offset: u64) -> u64 {
        offset.wrapping_add(self.mapping)
    }
}

/// Everything we can tell about a firmware image.
///
/// Per-vendor failures are recorded, not propagated; an Intel image simply
/// has no EFS, and an AMD image no flash descriptor.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Firmware {
    pub ifd: Result<Ifd, IfdError>,
    pub amd: Result<PspFirmware, AmdError>,
}

impl Firmware {
    pub fn parse(fw: &impl FlashImage) -> Self {
        let ifd = Ifd::parse(fw.image_bytes());
        if let Err(e) = &ifd {
            warn!("No flash descriptor: {e:?}");
        }
        let amd = PspFirmware::parse(fw);
        if let Err(e) = &amd {
            warn!("No PSP firmware: {e:?}");
        }
        Self { ifd, amd }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_round_trip() {
        let image = RomImage::new(&[]);
        for x in [0, 0x1000, 0xe7_0000, 0xff_ffff] {
            assert_eq!(image.phys_to_offset(image.offset_to_phys(x)), x);
        }
    }

    #[test]
    fn pointer_heuristic() {
        let image = RomImage::new(&[]);
        // Physical addresses get the mapping subtracted, offsets pass through.
        assert_eq!(image.pointer_to_offset(0xff0e_7000), 0xe_7000);
        assert_eq!(image.pointer_to_offset(0xe_7000), 0xe_7000);
        assert_eq!(image.pointer_to_offset(0), 0);
    }

    #[test]
    fn custom_mapping() {
        let image = RomImage::with_mapping(&[], 0xffc0_0000);
        assert_eq!(image.pointer_to_offset(0xffc2_0000), 0x2_0000);
    }
}
