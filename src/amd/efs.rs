//! AMD Embedded Firmware Structure (EFS)
//!
//! A fixed-layout table listing pointers to the PSP and BIOS directories;
//! see <https://doc.coreboot.org/soc/amd/psp_integration.html> and the AMD
//! PSP BIOS Architecture Design Guide for Family 17h and Family 19h
//! processors (#55758).
//!
//! The first generation layout is canonical; the second generation appends
//! a generation word, Promontory pointers and SPI mode bytes, all part of
//! the same fixed-size read. Boot ROMs tolerate short records the same way.

use std::mem::size_of;

use log::info;
use serde::{Deserialize, Serialize};
use zerocopy::FromBytes;
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

use super::AmdError;
use crate::{FlashImage, Range};

pub const EFS_SIGNATURE: u32 = 0x55aa_55aa;

/// Physical addresses AMD boot ROMs probe for the EFS, in probe order.
/// The first is the recommended one; the last is what most images use.
pub const EFS_ADDRESSES: [u64; 6] = [
    0xfffa_0000,
    0xfff2_0000,
    0xffe2_0000,
    0xffc2_0000,
    0xff82_0000,
    0xff02_0000,
];

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct EmbeddedFirmwareStructure {
    pub signature: u32,
    // FW pointers predating the PSP; usually unused.
    pub imc_fw: u32,
    pub gbe_fw: u32,
    pub xhci_fw: u32,
    pub psp_legacy_dir: u32,
    pub psp_dir: u32,
    // BIOS directory pointers for Family 17h models 00h-0Fh, 10h-1Fh,
    // 30h-3Fh and 60h-6Fh.
    pub bios_dir_00h: u32,
    pub bios_dir_10h: u32,
    pub bios_dir_30h: u32,
    /// Bit 0 clear marks a second generation EFS on client SKUs.
    pub generation: u32,
    pub bios_dir_60h: u32,
    pub _2c: u32,
    pub promontory_fw: u32,
    pub lp_promontory_fw: u32,
    pub _38: u32,
    pub _3c: u32,
    // SPI mode byte groups; which one applies depends on the processor
    // family: read mode, fast speed, then a family specific third byte.
    pub spi_mode_f15_60h: [u8; 3],
    pub spi_mode_f17_00h: [u8; 4],
    pub spi_mode_f17_30h: [u8; 3],
    pub _4a: [u8; 2],
    pub _4c: u32,
}

pub const EFS_SIZE: usize = size_of::<EmbeddedFirmwareStructure>();

impl EmbeddedFirmwareStructure {
    pub fn second_gen(&self) -> bool {
        self.generation & 1 == 0
    }

    /// The four BIOS directory pointers in their declared order.
    pub fn bios_dir_pointers(&self) -> [u32; 4] {
        [
            self.bios_dir_00h,
            self.bios_dir_10h,
            self.bios_dir_30h,
            self.bios_dir_60h,
        ]
    }
}

/// Probe the well-known addresses in ROM order and parse the first EFS
/// found. Probing more broadly would risk matching stray signatures a live
/// CPU would never honor.
pub fn find_embedded_firmware_structure(
    fw: &impl FlashImage,
) -> Result<(EmbeddedFirmwareStructure, Range), AmdError> {
    let image = fw.image_bytes();
    for addr in EFS_ADDRESSES {
        let offset = fw.phys_to_offset(addr) as usize;
        let Some(word) = image.get(offset..offset + 4) else {
            continue;
        };
        if u32::from_le_bytes([word[0], word[1], word[2], word[3]]) != EFS_SIGNATURE {
            continue;
        }
        let Ok((efs, _)) = EmbeddedFirmwareStructure::read_from_prefix(&image[offset..]) else {
            return Err(AmdError::TruncatedStructure(format!(
                "EFS @ {offset:08x} exceeds the image"
            )));
        };
        info!("EFS @ {offset:08x}, second generation: {}", efs.second_gen());
        return Ok((
            efs,
            Range {
                offset: offset as u64,
                length: EFS_SIZE as u64,
            },
        ));
    }
    Err(AmdError::EfsNotFound)
}
