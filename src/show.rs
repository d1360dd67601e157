use std::fs::{self, File};

use rom_fw::amd::PspFirmware;
use rom_fw::ifd::Ifd;
use rom_fw::ucode::Microcode;
use rom_fw::RomImage;

fn read(file_name: &str) -> Result<Vec<u8>, String> {
    fs::read(file_name).map_err(|e| format!("cannot read {file_name}: {e}"))
}

/// Print the six named regions, one line each, absent ones as zeros.
pub fn ifd(file_name: &str, verbose: bool) -> Result<(), String> {
    let data = read(file_name)?;
    let ifd = Ifd::parse(&data).map_err(|e| format!("{file_name}: {e:?}"))?;
    if verbose {
        println!("{ifd}");
    }
    for (kind, region) in ifd.region_map() {
        let name = kind.name();
        let o = region.offset;
        let s = region.size;
        println!("{name:<5} offset {o:x} size {s:x}");
    }
    Ok(())
}

/// Print the PSP firmware record tree as JSON.
pub fn amd(file_name: &str) -> Result<(), String> {
    let data = read(file_name)?;
    let image = RomImage::new(&data);
    let fw = PspFirmware::parse(&image).map_err(|e| format!("{file_name}: {e:?}"))?;
    let j = serde_json::to_string_pretty(&fw).map_err(|e| format!("{e}"))?;
    println!("{j}");
    Ok(())
}

/// Print the microcode header plus the one-line summary and any extended
/// signatures.
pub fn ucode(file_name: &str) -> Result<(), String> {
    let mut file =
        File::open(file_name).map_err(|e| format!("cannot open {file_name}: {e}"))?;
    let m = Microcode::parse(&mut file).map_err(|e| format!("{file_name}: {e:?}"))?;
    println!("ucode header: {:x?}", m.header);
    println!("ucode: {m}");
    Ok(())
}
