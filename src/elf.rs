//! ELF64 program-header parser: the "external parser" collaborator of
//! spec.md §6.
//!
//! The loader's correctness does not depend on this module being a general
//! ELF parser; it only needs to recover `PT_LOAD` program headers as
//! [`crate::segment::Segment`]s. Validation is deliberately shallow (spec.md
//! §1, "validation of the executable beyond what the parser guarantees" is
//! out of scope).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::error::LoaderError;
use crate::segment::{Perm, Segment, SegmentTable};

const EI_NIDENT: usize = 16;
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 0x3E;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;
const PF_R: u32 = 1 << 2;

/// The fixed-size ELF64 file header.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct Elf64Header {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

const ELF64_HEADER_SIZE: usize = 64;
const ELF64_PHDR_SIZE: usize = 56;

/// A parsed ELF64 image: its entry point and the loadable segments the
/// loader's fault handler will page in on demand.
pub struct Image {
    pub entry: usize,
    pub segments: SegmentTable,
}

/// Parses an already-open executable file into an [`Image`]. Mirrors the
/// `parse(path) -> segment_table | null` contract of spec.md §6, returning
/// `Err` instead of `null`.
///
/// Opening the file is deliberately the caller's responsibility: spec.md
/// §7 item 3 treats "the image path cannot be opened" as its own error
/// kind (exit status 1, no diagnostic beyond a message), distinct from
/// "parse failure" (item 2), which is what this function reports.
pub fn parse_file(file: &mut File) -> Result<Image, LoaderError> {
    let header = read_header(file)?;
    validate(&header)?;

    let segments = read_load_segments(file, &header)?;

    Ok(Image {
        entry: header.e_entry as usize,
        segments: SegmentTable::new(segments),
    })
}

/// Opens `path` and parses it into an [`Image`], for callers that do not
/// need to distinguish open failures from parse failures (e.g. tests).
pub fn parse(path: &std::path::Path) -> Result<(File, Image), LoaderError> {
    let mut file = File::open(path)?;
    let image = parse_file(&mut file)?;
    Ok((file, image))
}

fn read_header(file: &mut File) -> Result<Elf64Header, LoaderError> {
    let mut buf = [0u8; ELF64_HEADER_SIZE];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)
        .map_err(|_| LoaderError::Parse("truncated ELF header".into()))?;

    let mut e_ident = [0u8; EI_NIDENT];
    e_ident.copy_from_slice(&buf[0..EI_NIDENT]);

    Ok(Elf64Header {
        e_ident,
        e_type: u16::from_le_bytes(buf[16..18].try_into().unwrap()),
        e_machine: u16::from_le_bytes(buf[18..20].try_into().unwrap()),
        e_version: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        e_entry: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        e_phoff: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        e_shoff: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
        e_flags: u32::from_le_bytes(buf[48..52].try_into().unwrap()),
        e_ehsize: u16::from_le_bytes(buf[52..54].try_into().unwrap()),
        e_phentsize: u16::from_le_bytes(buf[54..56].try_into().unwrap()),
        e_phnum: u16::from_le_bytes(buf[56..58].try_into().unwrap()),
        e_shentsize: u16::from_le_bytes(buf[58..60].try_into().unwrap()),
        e_shnum: u16::from_le_bytes(buf[60..62].try_into().unwrap()),
        e_shstrndx: u16::from_le_bytes(buf[62..64].try_into().unwrap()),
    })
}

fn validate(header: &Elf64Header) -> Result<(), LoaderError> {
    if header.e_ident[0..4] != ELF_MAGIC {
        return Err(LoaderError::Parse("bad ELF magic".into()));
    }
    if header.e_ident[4] != ELFCLASS64 {
        return Err(LoaderError::Parse("not a 64-bit ELF".into()));
    }
    if header.e_ident[5] != ELFDATA2LSB {
        return Err(LoaderError::Parse("not little-endian".into()));
    }
    if header.e_machine != EM_X86_64 {
        return Err(LoaderError::Parse("not an x86-64 image".into()));
    }
    if header.e_type != ET_EXEC {
        return Err(LoaderError::Parse(
            "not a statically linked executable (PIE/shared objects are a non-goal)".into(),
        ));
    }
    if header.e_phentsize as usize != ELF64_PHDR_SIZE {
        return Err(LoaderError::Parse("unexpected program header size".into()));
    }
    Ok(())
}

fn read_load_segments(file: &mut File, header: &Elf64Header) -> Result<Vec<Segment>, LoaderError> {
    let mut buf = vec![0u8; header.e_phnum as usize * ELF64_PHDR_SIZE];
    file.seek(SeekFrom::Start(header.e_phoff))?;
    file.read_exact(&mut buf)
        .map_err(|_| LoaderError::Parse("truncated program header table".into()))?;

    let mut segments = Vec::with_capacity(header.e_phnum as usize);
    for chunk in buf.chunks_exact(ELF64_PHDR_SIZE) {
        let p_type = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
        if p_type != PT_LOAD {
            continue;
        }
        let p_flags = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
        let p_offset = u64::from_le_bytes(chunk[8..16].try_into().unwrap());
        let p_vaddr = u64::from_le_bytes(chunk[16..24].try_into().unwrap());
        let p_filesz = u64::from_le_bytes(chunk[32..40].try_into().unwrap());
        let p_memsz = u64::from_le_bytes(chunk[40..48].try_into().unwrap());

        segments.push(Segment {
            vaddr: p_vaddr as usize,
            offset: p_offset,
            file_size: p_filesz,
            mem_size: p_memsz,
            perm: permission_from_flags(p_flags),
        });
    }
    Ok(segments)
}

fn permission_from_flags(p_flags: u32) -> Perm {
    let mut perm = Perm::empty();
    if p_flags & PF_R != 0 {
        perm |= Perm::READ;
    }
    if p_flags & PF_W != 0 {
        perm |= Perm::WRITE;
    }
    if p_flags & PF_X != 0 {
        perm |= Perm::EXEC;
    }
    perm
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_minimal_elf(phdrs: &[(u32, u64, u64, u64, u64)]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        let phoff = ELF64_HEADER_SIZE as u64;
        let mut header = vec![0u8; ELF64_HEADER_SIZE];
        header[0..4].copy_from_slice(&ELF_MAGIC);
        header[4] = ELFCLASS64;
        header[5] = ELFDATA2LSB;
        header[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        header[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        header[24..32].copy_from_slice(&0x400000u64.to_le_bytes());
        header[32..40].copy_from_slice(&phoff.to_le_bytes());
        header[54..56].copy_from_slice(&(ELF64_PHDR_SIZE as u16).to_le_bytes());
        header[56..58].copy_from_slice(&(phdrs.len() as u16).to_le_bytes());
        f.write_all(&header).unwrap();

        for (p_type, p_offset, p_vaddr, p_filesz, p_memsz) in phdrs {
            let mut phdr = vec![0u8; ELF64_PHDR_SIZE];
            phdr[0..4].copy_from_slice(&p_type.to_le_bytes());
            phdr[4..8].copy_from_slice(&(PF_R | PF_X).to_le_bytes());
            phdr[8..16].copy_from_slice(&p_offset.to_le_bytes());
            phdr[16..24].copy_from_slice(&p_vaddr.to_le_bytes());
            phdr[32..40].copy_from_slice(&p_filesz.to_le_bytes());
            phdr[40..48].copy_from_slice(&p_memsz.to_le_bytes());
            f.write_all(&phdr).unwrap();
        }
        f
    }

    #[test]
    fn rejects_bad_magic() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 64]).unwrap();
        let err = parse(f.path()).unwrap_err();
        assert!(matches!(err, LoaderError::Parse(_)));
    }

    #[test]
    fn parses_load_segments_and_skips_others() {
        let f = write_minimal_elf(&[
            (PT_LOAD, 0, 0x400000, 0x600, 0x600),
            (2 /* PT_DYNAMIC */, 0, 0x500000, 0x10, 0x10),
            (PT_LOAD, 0x1000, 0x401000, 0x800, 0x1200),
        ]);
        let (_file, image) = parse(f.path()).unwrap();
        assert_eq!(image.entry, 0x400000);
        assert_eq!(image.segments.len(), 2);
        let first = image.segments.iter().next().unwrap();
        assert_eq!(first.vaddr, 0x400000);
        assert_eq!(first.file_size, 0x600);
    }
}
