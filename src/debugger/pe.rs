//! Export lookup on a PE image mapped in the target.
//!
//! Only the headers and export directory are touched, and every read goes
//! through the adapter, so a corrupt image yields `Ok(None)` or a read error
//! rather than a bogus address.

use crate::debugger::{read_u32, DebugAdapter, Pid};
use crate::error::{Error, Result};

const MZ: u16 = 0x5A4D;
const PE_SIGNATURE: u32 = 0x0000_4550;
const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;

/// Upper bound on exported names walked per module.
const MAX_NAMES: u32 = 0x1_0000;
/// Upper bound on an export name length.
const MAX_NAME_LEN: usize = 512;
const PAGE: u64 = 0x1000;

fn read_u16<A: DebugAdapter + ?Sized>(adapter: &mut A, pid: Pid, address: u64) -> Result<u16> {
    match adapter.read_memory(pid, address, 2)?.as_slice() {
        [lo, hi] => Ok(u16::from_le_bytes([*lo, *hi])),
        _ => Err(Error::Read { address, length: 2 }),
    }
}

/// NUL-terminated string, read without crossing into an unmapped page.
fn read_c_string<A: DebugAdapter + ?Sized>(
    adapter: &mut A,
    pid: Pid,
    address: u64,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut cur = address;
    while out.len() < MAX_NAME_LEN {
        let to_page_end = PAGE - (cur % PAGE);
        let chunk = to_page_end.min(64) as usize;
        let bytes = adapter.read_memory(pid, cur, chunk)?;
        if let Some(end) = bytes.iter().position(|&b| b == 0) {
            out.extend_from_slice(&bytes[..end]);
            return Ok(out);
        }
        out.extend_from_slice(&bytes);
        cur += chunk as u64;
    }
    Ok(out)
}

/// Export directory location of the image at `base`.
fn export_directory<A: DebugAdapter + ?Sized>(
    adapter: &mut A,
    pid: Pid,
    base: u64,
) -> Result<Option<(u32, u32)>> {
    if read_u16(adapter, pid, base)? != MZ {
        return Ok(None);
    }
    let nt = base + u64::from(read_u32(adapter, pid, base + 0x3C)?);
    if read_u32(adapter, pid, nt)? != PE_SIGNATURE {
        return Ok(None);
    }
    let optional = nt + 24;
    let dirs = match read_u16(adapter, pid, optional)? {
        PE32_MAGIC => optional + 96,
        PE32_PLUS_MAGIC => optional + 112,
        _ => return Ok(None),
    };
    let rva = read_u32(adapter, pid, dirs)?;
    let size = read_u32(adapter, pid, dirs + 4)?;
    if rva == 0 || size == 0 {
        return Ok(None);
    }
    Ok(Some((rva, size)))
}

/// Address of the export `name` in the image at `base`.
///
/// Forwarded exports resolve to `None`, since their code lives in another
/// module.
pub fn find_export<A: DebugAdapter + ?Sized>(
    adapter: &mut A,
    pid: Pid,
    base: u64,
    name: &str,
) -> Result<Option<u64>> {
    let (dir_rva, dir_size) = match export_directory(adapter, pid, base)? {
        Some(d) => d,
        None => return Ok(None),
    };
    let dir = base + u64::from(dir_rva);
    let num_functions = read_u32(adapter, pid, dir + 0x14)?;
    let num_names = read_u32(adapter, pid, dir + 0x18)?.min(MAX_NAMES);
    let functions = base + u64::from(read_u32(adapter, pid, dir + 0x1C)?);
    let names = base + u64::from(read_u32(adapter, pid, dir + 0x20)?);
    let ordinals = base + u64::from(read_u32(adapter, pid, dir + 0x24)?);
    if num_names == 0 {
        return Ok(None);
    }

    let name_rvas = adapter.read_memory(pid, names, num_names as usize * 4)?;
    let ordinal_table = adapter.read_memory(pid, ordinals, num_names as usize * 2)?;
    if name_rvas.len() != num_names as usize * 4 || ordinal_table.len() != num_names as usize * 2 {
        return Err(Error::Read { address: names, length: num_names as usize * 4 });
    }

    for (i, rva) in name_rvas.chunks_exact(4).enumerate() {
        let rva = u32::from_le_bytes([rva[0], rva[1], rva[2], rva[3]]);
        if read_c_string(adapter, pid, base + u64::from(rva))? != name.as_bytes() {
            continue;
        }
        let ordinal = u16::from_le_bytes([ordinal_table[i * 2], ordinal_table[i * 2 + 1]]);
        if u32::from(ordinal) >= num_functions {
            return Ok(None);
        }
        let func_rva = read_u32(adapter, pid, functions + u64::from(ordinal) * 4)?;
        if func_rva >= dir_rva && func_rva < dir_rva.saturating_add(dir_size) {
            return Ok(None);
        }
        return Ok(Some(base + u64::from(func_rva)));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::SimulatedTarget;
    use std::path::Path;

    const BASE: u64 = 0x7650_0000;

    /// Minimal PE32 image exporting `names` at RVAs 0x1000, 0x1010, ...
    /// plus one forwarded export called `Forwarded`.
    fn image(names: &[&str]) -> Vec<u8> {
        let mut img = vec![0u8; 0x3000];
        img[0..2].copy_from_slice(&MZ.to_le_bytes());
        img[0x3C..0x40].copy_from_slice(&0x80u32.to_le_bytes());
        img[0x80..0x84].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
        let optional = 0x80 + 24;
        img[optional..optional + 2].copy_from_slice(&PE32_MAGIC.to_le_bytes());
        let dirs = optional + 96;
        let dir_rva = 0x2000u32;
        img[dirs..dirs + 4].copy_from_slice(&dir_rva.to_le_bytes());
        img[dirs + 4..dirs + 8].copy_from_slice(&0x800u32.to_le_bytes());

        let mut all: Vec<&str> = names.to_vec();
        all.push("Forwarded");
        all.sort();
        let n = all.len() as u32;
        let d = dir_rva as usize;
        let functions = d + 0x40;
        let name_ptrs = functions + 4 * all.len();
        let ords = name_ptrs + 4 * all.len();
        let mut strings = ords + 2 * all.len();
        img[d + 0x14..d + 0x18].copy_from_slice(&n.to_le_bytes());
        img[d + 0x18..d + 0x1C].copy_from_slice(&n.to_le_bytes());
        img[d + 0x1C..d + 0x20].copy_from_slice(&(functions as u32).to_le_bytes());
        img[d + 0x20..d + 0x24].copy_from_slice(&(name_ptrs as u32).to_le_bytes());
        img[d + 0x24..d + 0x28].copy_from_slice(&(ords as u32).to_le_bytes());
        for (i, name) in all.iter().enumerate() {
            let rva = if *name == "Forwarded" {
                // Points inside the export directory.
                (d + 0x700) as u32
            } else {
                0x1000 + 0x10 * i as u32
            };
            img[functions + 4 * i..functions + 4 * i + 4].copy_from_slice(&rva.to_le_bytes());
            img[name_ptrs + 4 * i..name_ptrs + 4 * i + 4]
                .copy_from_slice(&(strings as u32).to_le_bytes());
            img[ords + 2 * i..ords + 2 * i + 2].copy_from_slice(&(i as u16).to_le_bytes());
            img[strings..strings + name.len()].copy_from_slice(name.as_bytes());
            strings += name.len() + 1;
        }
        img
    }

    fn target(img: Vec<u8>) -> (SimulatedTarget, Pid) {
        let mut sim = SimulatedTarget::new().with_memory(BASE, img);
        let pid = crate::debugger::DebugAdapter::launch(&mut sim, Path::new("winword.exe"), &[])
            .unwrap();
        (sim, pid)
    }

    #[test]
    fn resolves_named_export() {
        let (mut sim, pid) = target(image(&["OleLoad", "OleGetAutoConvert"]));
        // Sorted: Forwarded, OleGetAutoConvert, OleLoad
        assert_eq!(find_export(&mut sim, pid, BASE, "OleLoad").unwrap(), Some(BASE + 0x1020));
        assert_eq!(
            find_export(&mut sim, pid, BASE, "OleGetAutoConvert").unwrap(),
            Some(BASE + 0x1010)
        );
    }

    #[test]
    fn missing_export_is_none() {
        let (mut sim, pid) = target(image(&["OleLoad"]));
        assert_eq!(find_export(&mut sim, pid, BASE, "OleConvertOLESTREAMToIStorage").unwrap(), None);
    }

    #[test]
    fn forwarded_export_is_none() {
        let (mut sim, pid) = target(image(&["OleLoad"]));
        assert_eq!(find_export(&mut sim, pid, BASE, "Forwarded").unwrap(), None);
    }

    #[test]
    fn not_an_image() {
        let (mut sim, pid) = target(vec![0u8; 0x1000]);
        assert_eq!(find_export(&mut sim, pid, BASE, "OleLoad").unwrap(), None);
    }
}
