//! Intel CPU microcode updates
//!
//! Layout per the Intel SDM vol. 3A, "Microcode Update Facilities": a 48
//! byte header, the update data, and an optional extended signature table
//! for updates that apply to multiple processors. Both the main and the
//! extended block must sum to zero as little-endian 32 bit words.

use std::fmt::{self, Display};
use std::io::Read;

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes};

pub const HEADER_SIZE: usize = 48;
const EXT_TABLE_SIZE: usize = 20;
const EXT_SIGNATURE_SIZE: usize = 12;

// An all-zero data size means 2000 bytes of data and 2048 bytes in total.
const DEFAULT_DATA_SIZE: u32 = 2000;
const DEFAULT_TOTAL_SIZE: u32 = 2048;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum UcodeError {
    Io(String),
    BadMicrocodeVersion(String),
    MisalignedSize(String),
    BadSize(String),
    BadChecksum(u32),
    BadExtChecksum(u32),
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct Header {
    /// Must be 1.
    pub version: u32,
    pub revision: u32,
    /// Packed BCD, MMDDYYYY.
    pub date: u32,
    pub processor_signature: u32,
    pub checksum: u32,
    pub loader_revision: u32,
    pub processor_flags: u32,
    pub data_size: u32,
    pub total_size: u32,
    pub _r: [u32; 3],
}

impl Header {
    pub fn data_size(&self) -> u32 {
        if self.data_size == 0 {
            DEFAULT_DATA_SIZE
        } else {
            self.data_size
        }
    }

    pub fn total_size(&self) -> u32 {
        if self.total_size == 0 {
            DEFAULT_TOTAL_SIZE
        } else {
            self.total_size
        }
    }
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct ExtSigTable {
    pub count: u32,
    pub checksum: u32,
    pub _r: [u32; 3],
}

#[derive(Immutable, IntoBytes, FromBytes, Serialize, Deserialize, Clone, Copy, Debug)]
#[repr(C)]
pub struct ExtendedSignature {
    pub signature: u32,
    pub processor_flags: u32,
    pub checksum: u32,
}

impl Display for ExtendedSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.signature;
        let p = self.processor_flags;
        write!(f, "sig=0x{s:x}, pf=0x{p:x}")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Microcode {
    pub header: Header,
    pub data: Vec<u8>,
    pub ext_table: Option<ExtSigTable>,
    pub ext_signatures: Vec<ExtendedSignature>,
}

fn read_bytes<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> Result<(), UcodeError> {
    r.read_exact(buf)
        .map_err(|e| UcodeError::Io(format!("cannot read {what}: {e}")))
}

/// Sum a byte stream as little-endian 32 bit words, wrapping.
fn checksum32(parts: &[&[u8]]) -> u32 {
    let mut sum = 0u32;
    for part in parts {
        for v in part.chunks_exact(4) {
            sum = sum.wrapping_add(u32::from_le_bytes([v[0], v[1], v[2], v[3]]));
        }
    }
    sum
}

impl Microcode {
    pub fn parse<R: Read>(r: &mut R) -> Result<Self, UcodeError> {
        let mut buf = [0u8; HEADER_SIZE];
        read_bytes(r, &mut buf, "header")?;
        let Ok(header) = Header::read_from_bytes(&buf) else {
            return Err(UcodeError::Io("header size mismatch".to_string()));
        };

        if header.version != 1 || header.loader_revision != 1 {
            return Err(UcodeError::BadMicrocodeVersion(format!(
                "version {}, loader revision {}",
                header.version, header.loader_revision
            )));
        }
        let data_size = header.data_size();
        let total_size = header.total_size();
        if data_size % 4 != 0 {
            return Err(UcodeError::MisalignedSize(format!(
                "data size {data_size:#x} not 32 bit aligned"
            )));
        }
        if total_size % 4 != 0 {
            return Err(UcodeError::MisalignedSize(format!(
                "total size {total_size:#x} not 32 bit aligned"
            )));
        }
        if total_size < data_size + HEADER_SIZE as u32 {
            return Err(UcodeError::BadSize(format!(
                "total size {total_size:#x} below data size {data_size:#x} plus header"
            )));
        }

        let mut data = vec![0u8; data_size as usize];
        read_bytes(r, &mut data, "data")?;

        let sum = checksum32(&[header.as_bytes(), &data]);
        if sum != 0 {
            return Err(UcodeError::BadChecksum(sum));
        }

        if total_size == data_size + HEADER_SIZE as u32 {
            return Ok(Self {
                header,
                data,
                ext_table: None,
                ext_signatures: Vec::new(),
            });
        }

        // The remainder is the extended signature table with its own sum.
        let mut buf = [0u8; EXT_TABLE_SIZE];
        read_bytes(r, &mut buf, "extended signature table")?;
        let Ok(ext_table) = ExtSigTable::read_from_bytes(&buf) else {
            return Err(UcodeError::Io("extended table size mismatch".to_string()));
        };
        let mut sum = checksum32(&[ext_table.as_bytes()]);
        let mut ext_signatures = Vec::new();
        for _ in 0..ext_table.count {
            let mut buf = [0u8; EXT_SIGNATURE_SIZE];
            read_bytes(r, &mut buf, "extended signature")?;
            sum = sum.wrapping_add(checksum32(&[&buf]));
            let Ok(signature) = ExtendedSignature::read_from_bytes(&buf) else {
                return Err(UcodeError::Io("extended signature size mismatch".to_string()));
            };
            ext_signatures.push(signature);
        }
        if sum != 0 {
            return Err(UcodeError::BadExtChecksum(sum));
        }

        Ok(Self {
            header,
            data,
            ext_table: Some(ext_table),
            ext_signatures,
        })
    }
}

impl Display for Microcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        let date = h.date;
        // The date is BCD, so hex formatting renders the decimal digits.
        write!(
            f,
            "sig=0x{:x}, pf=0x{:x}, rev=0x{:x}, total size=0x{:x}, date = {:04x}-{:02x}-{:02x}",
            h.processor_signature,
            h.processor_flags,
            h.revision,
            h.total_size(),
            date & 0xffff,
            date >> 24,
            (date >> 16) & 0xff
        )?;
        for (i, s) in self.ext_signatures.iter().enumerate() {
            write!(f, "\nExtended signature[{i}]: {s}")?;
        }
        write!(f, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    // Assemble an update with a valid main checksum and, optionally, a
    // valid extended block.
    fn build(data_len: usize, ext_count: usize) -> Vec<u8> {
        let ext_size = if ext_count > 0 {
            EXT_TABLE_SIZE + ext_count * EXT_SIGNATURE_SIZE
        } else {
            0
        };
        let mut header = Header {
            version: 1,
            revision: 0x2f,
            date: 0x0315_2023, // March 15, 2023
            processor_signature: 0x906ea,
            checksum: 0,
            loader_revision: 1,
            processor_flags: 0x2,
            data_size: data_len as u32,
            total_size: (HEADER_SIZE + data_len + ext_size) as u32,
            _r: [0; 3],
        };
        let data: Vec<u8> = (0..data_len).map(|i| i as u8).collect();
        let sum = checksum32(&[header.as_bytes(), &data]);
        header.checksum = 0u32.wrapping_sub(sum);

        let mut blob = header.as_bytes().to_vec();
        blob.extend_from_slice(&data);

        if ext_count > 0 {
            let mut table = ExtSigTable {
                count: ext_count as u32,
                checksum: 0,
                _r: [0; 3],
            };
            let signatures: Vec<ExtendedSignature> = (0..ext_count)
                .map(|i| ExtendedSignature {
                    signature: 0x906ec + i as u32,
                    processor_flags: 0x80,
                    checksum: 0,
                })
                .collect();
            let mut sum = checksum32(&[table.as_bytes()]);
            for s in &signatures {
                sum = sum.wrapping_add(checksum32(&[s.as_bytes()]));
            }
            table.checksum = 0u32.wrapping_sub(sum);
            blob.extend_from_slice(table.as_bytes());
            for s in &signatures {
                blob.extend_from_slice(s.as_bytes());
            }
        }
        blob
    }

    #[test]
    fn struct_sizes() {
        assert_eq!(size_of::<Header>(), HEADER_SIZE);
        assert_eq!(size_of::<ExtSigTable>(), EXT_TABLE_SIZE);
        assert_eq!(size_of::<ExtendedSignature>(), EXT_SIGNATURE_SIZE);
    }

    #[test]
    fn plain_update() {
        let blob = build(0x1000, 0);
        let m = Microcode::parse(&mut blob.as_slice()).unwrap();
        assert_eq!(m.header.revision, 0x2f);
        assert_eq!(m.data.len(), 0x1000);
        assert!(m.ext_table.is_none());
        assert!(m.ext_signatures.is_empty());
    }

    #[test]
    fn extended_table() {
        let blob = build(0x1000, 1);
        assert_eq!(
            blob.len(),
            HEADER_SIZE + 0x1000 + EXT_TABLE_SIZE + EXT_SIGNATURE_SIZE
        );
        let m = Microcode::parse(&mut blob.as_slice()).unwrap();
        assert_eq!(m.ext_table.unwrap().count, 1);
        assert_eq!(m.ext_signatures.len(), 1);
        assert_eq!(m.ext_signatures[0].signature, 0x906ec);
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut blob = build(0x100, 0);
        blob[HEADER_SIZE + 5] ^= 0x10;
        assert!(matches!(
            Microcode::parse(&mut blob.as_slice()),
            Err(UcodeError::BadChecksum(_))
        ));
    }

    #[test]
    fn flipped_byte_fails_ext_checksum() {
        let mut blob = build(0x100, 2);
        let last = blob.len() - 1;
        blob[last] ^= 1;
        assert!(matches!(
            Microcode::parse(&mut blob.as_slice()),
            Err(UcodeError::BadExtChecksum(_))
        ));
    }

    #[test]
    fn bad_version() {
        let mut blob = build(0x100, 0);
        blob[0] = 2;
        assert!(matches!(
            Microcode::parse(&mut blob.as_slice()),
            Err(UcodeError::BadMicrocodeVersion(_))
        ));
    }

    #[test]
    fn bad_loader_revision() {
        let mut blob = build(0x100, 0);
        blob[20] = 0;
        assert!(matches!(
            Microcode::parse(&mut blob.as_slice()),
            Err(UcodeError::BadMicrocodeVersion(_))
        ));
    }

    #[test]
    fn misaligned_data_size() {
        let mut blob = build(0x100, 0);
        // data size 0x101, total size still aligned
        blob[28] = 0x01;
        blob[29] = 0x01;
        assert!(matches!(
            Microcode::parse(&mut blob.as_slice()),
            Err(UcodeError::MisalignedSize(_))
        ));
    }

    #[test]
    fn total_below_data_plus_header() {
        let mut blob = build(0x100, 0);
        blob[32..36].copy_from_slice(&0x100u32.to_le_bytes());
        assert!(matches!(
            Microcode::parse(&mut blob.as_slice()),
            Err(UcodeError::BadSize(_))
        ));
    }

    #[test]
    fn zero_sizes_mean_defaults() {
        let header = Header::read_from_bytes(&[0u8; HEADER_SIZE]).unwrap();
        assert_eq!(header.data_size(), 2000);
        assert_eq!(header.total_size(), 2048);
    }

    #[test]
    fn truncated_stream() {
        let blob = build(0x100, 0);
        assert!(matches!(
            Microcode::parse(&mut blob[..0x40].as_ref()),
            Err(UcodeError::Io(_))
        ));
    }

    #[test]
    fn summary_line() {
        let blob = build(0x100, 1);
        let m = Microcode::parse(&mut blob.as_slice()).unwrap();
        let s = format!("{m}");
        assert!(s.starts_with("sig=0x906ea, pf=0x2, rev=0x2f,"));
        assert!(s.contains("date = 2023-03-15"));
        assert!(s.contains("Extended signature[0]: sig=0x906ec, pf=0x80"));
    }
}
