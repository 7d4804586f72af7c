//! Firmware image acceptance: ELF32 little-endian or flat binary.
//!
//! ELF images are split into their `PT_LOAD` segments; anything
//! without the ELF magic is programmed as-is at the flash base
//! address. An image that carries the magic but is not 32-bit
//! little-endian is rejected outright rather than guessed at.

use log::debug;

use crate::config::FLASH_BASE_ADDRESS;
use crate::error::{DriverError, DriverResult};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const PT_LOAD: u32 = 1;

/// ELF32 header field offsets (System V ABI).
const E_PHOFF: usize = 28;
const E_PHENTSIZE: usize = 42;
const E_PHNUM: usize = 44;
const EHDR_LEN: usize = 52;

/// ELF32 program header field offsets.
const P_TYPE: usize = 0;
const P_OFFSET: usize = 4;
const P_VADDR: usize = 8;
const P_PADDR: usize = 12;
const P_FILESZ: usize = 16;
const PHDR_MIN_LEN: usize = 32;

/// One contiguous run of firmware bytes and its flash load address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSegment {
    pub address: u32,
    pub data: Vec<u8>,
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// Split a firmware payload into load segments.
///
/// ELF32 little-endian images yield their `PT_LOAD` segments sorted by
/// load address (`p_paddr` preferred when nonzero, `p_vaddr`
/// otherwise). A payload without the ELF magic is a flat binary for
/// [`FLASH_BASE_ADDRESS`].
pub fn parse_firmware_image(bytes: &[u8]) -> DriverResult<Vec<LoadSegment>> {
    if bytes.len() < 4 || bytes[..4] != ELF_MAGIC {
        debug!("no ELF magic, treating as flat binary ({} bytes)", bytes.len());
        return Ok(vec![LoadSegment {
            address: FLASH_BASE_ADDRESS,
            data: bytes.to_vec(),
        }]);
    }
    parse_elf32(bytes)
}

fn parse_elf32(bytes: &[u8]) -> DriverResult<Vec<LoadSegment>> {
    if bytes.len() < EHDR_LEN {
        return Err(DriverError::ImageFormat {
            reason: "truncated ELF header".to_string(),
        });
    }
    if bytes[4] != ELFCLASS32 {
        return Err(DriverError::ImageFormat {
            reason: format!("not ELF32 (EI_CLASS {})", bytes[4]),
        });
    }
    if bytes[5] != ELFDATA2LSB {
        return Err(DriverError::ImageFormat {
            reason: format!("not little-endian (EI_DATA {})", bytes[5]),
        });
    }

    let phoff = read_u32(bytes, E_PHOFF) as usize;
    let phentsize = read_u16(bytes, E_PHENTSIZE) as usize;
    let phnum = read_u16(bytes, E_PHNUM) as usize;

    if phentsize < PHDR_MIN_LEN {
        return Err(DriverError::ImageFormat {
            reason: format!("program header entry size {} too small", phentsize),
        });
    }
    let table_end = phoff
        .checked_add(phnum.saturating_mul(phentsize))
        .ok_or_else(|| DriverError::ImageFormat {
            reason: "program header table overflows".to_string(),
        })?;
    if table_end > bytes.len() {
        return Err(DriverError::ImageFormat {
            reason: "program header table extends past end of file".to_string(),
        });
    }

    let mut segments = Vec::new();
    for i in 0..phnum {
        let ph = phoff + i * phentsize;
        if read_u32(bytes, ph + P_TYPE) != PT_LOAD {
            continue;
        }
        let filesz = read_u32(bytes, ph + P_FILESZ) as usize;
        if filesz == 0 {
            continue;
        }
        let p_offset = read_u32(bytes, ph + P_OFFSET) as usize;
        let end = p_offset
            .checked_add(filesz)
            .ok_or_else(|| DriverError::ImageFormat {
                reason: format!("segment {} overflows", i),
            })?;
        if end > bytes.len() {
            return Err(DriverError::ImageFormat {
                reason: format!(
                    "segment {} extends past end of file ({} > {})",
                    i,
                    end,
                    bytes.len()
                ),
            });
        }

        let paddr = read_u32(bytes, ph + P_PADDR);
        let vaddr = read_u32(bytes, ph + P_VADDR);
        let address = if paddr != 0 { paddr } else { vaddr };

        segments.push(LoadSegment {
            address,
            data: bytes[p_offset..end].to_vec(),
        });
    }

    if segments.is_empty() {
        return Err(DriverError::ImageFormat {
            reason: "no loadable segments".to_string(),
        });
    }
    segments.sort_by_key(|s| s.address);
    debug!("ELF image: {} load segments", segments.len());
    Ok(segments)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a minimal ELF32 little-endian image whose program headers
    /// immediately follow the ELF header.
    pub(crate) fn build_elf32(segments: &[(u32, u32, &[u8])]) -> Vec<u8> {
        // (p_paddr, p_vaddr, data) per segment
        let phnum = segments.len();
        let phentsize = 32usize;
        let data_start = EHDR_LEN + phnum * phentsize;

        let mut elf = vec![0u8; EHDR_LEN];
        elf[..4].copy_from_slice(&ELF_MAGIC);
        elf[4] = ELFCLASS32;
        elf[5] = ELFDATA2LSB;
        elf[6] = 1; // EI_VERSION
        elf[E_PHOFF..E_PHOFF + 4].copy_from_slice(&(EHDR_LEN as u32).to_le_bytes());
        elf[E_PHENTSIZE..E_PHENTSIZE + 2].copy_from_slice(&(phentsize as u16).to_le_bytes());
        elf[E_PHNUM..E_PHNUM + 2].copy_from_slice(&(phnum as u16).to_le_bytes());

        let mut offset = data_start;
        for (paddr, vaddr, data) in segments {
            let mut ph = [0u8; 32];
            ph[P_TYPE..P_TYPE + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
            ph[P_OFFSET..P_OFFSET + 4].copy_from_slice(&(offset as u32).to_le_bytes());
            ph[P_VADDR..P_VADDR + 4].copy_from_slice(&vaddr.to_le_bytes());
            ph[P_PADDR..P_PADDR + 4].copy_from_slice(&paddr.to_le_bytes());
            ph[P_FILESZ..P_FILESZ + 4].copy_from_slice(&(data.len() as u32).to_le_bytes());
            elf.extend_from_slice(&ph);
            offset += data.len();
        }
        for (_, _, data) in segments {
            elf.extend_from_slice(data);
        }
        elf
    }

    #[test]
    fn test_flat_binary_fallback() {
        let payload = vec![0xAB; 100];
        let segments = parse_firmware_image(&payload).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].address, 0x0800_0000);
        assert_eq!(segments[0].data, payload);
    }

    #[test]
    fn test_elf_load_segments_extracted_and_sorted() {
        let elf = build_elf32(&[
            (0x0800_8000, 0x2000_0000, &[2u8; 16]),
            (0x0800_0000, 0x0800_0000, &[1u8; 8]),
        ]);
        let segments = parse_firmware_image(&elf).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].address, 0x0800_0000);
        assert_eq!(segments[0].data, vec![1u8; 8]);
        assert_eq!(segments[1].address, 0x0800_8000);
        assert_eq!(segments[1].data, vec![2u8; 16]);
    }

    #[test]
    fn test_elf_prefers_paddr_falls_back_to_vaddr() {
        let elf = build_elf32(&[(0, 0x2000_1000, &[3u8; 4])]);
        let segments = parse_firmware_image(&elf).unwrap();
        assert_eq!(segments[0].address, 0x2000_1000);
    }

    #[test]
    fn test_elf_wrong_class_fails_hard() {
        let mut elf = build_elf32(&[(0x0800_0000, 0, &[1u8; 4])]);
        elf[4] = 2; // ELFCLASS64
        assert!(matches!(
            parse_firmware_image(&elf),
            Err(DriverError::ImageFormat { .. })
        ));
    }

    #[test]
    fn test_elf_big_endian_fails_hard() {
        let mut elf = build_elf32(&[(0x0800_0000, 0, &[1u8; 4])]);
        elf[5] = 2; // ELFDATA2MSB
        assert!(parse_firmware_image(&elf).is_err());
    }

    #[test]
    fn test_elf_segment_past_eof_rejected() {
        let mut elf = build_elf32(&[(0x0800_0000, 0, &[1u8; 16])]);
        elf.truncate(elf.len() - 8);
        assert!(matches!(
            parse_firmware_image(&elf),
            Err(DriverError::ImageFormat { .. })
        ));
    }

    #[test]
    fn test_elf_without_load_segments_rejected() {
        let mut elf = build_elf32(&[(0x0800_0000, 0, &[1u8; 4])]);
        // Rewrite p_type to PT_NOTE.
        elf[EHDR_LEN..EHDR_LEN + 4].copy_from_slice(&4u32.to_le_bytes());
        assert!(parse_firmware_image(&elf).is_err());
    }

    #[test]
    fn test_elf_zero_filesz_segments_ignored() {
        let data_seg: &[u8] = &[9u8; 4];
        let elf = build_elf32(&[(0x0800_0000, 0, &[]), (0x0800_4000, 0, data_seg)]);
        let segments = parse_firmware_image(&elf).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].address, 0x0800_4000);
    }
}
