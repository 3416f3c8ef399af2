// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reserving and removing signature space in Mach-O binaries.

Signature data lives at the tail of the `__LINKEDIT` segment and is
referenced by an `LC_CODE_SIGNATURE` load command. Before a signature can be
written, space for it must exist: the load command must be present, its
`datasize` must cover the eventual SuperBlob and `__LINKEDIT` must be grown
to include it.

The functions in this module perform that surgery directly on raw bytes.
Load commands are walked by hand rather than through a full parser so that
every offset and size read from the binary is bounds checked before use.
All arithmetic combining values read from the binary is checked.

Universal binaries are rewritten slice by slice. Slices are re-laid out at
16 KiB aligned offsets and the fat header is rewritten to match.
*/

use {
    crate::error::CodeSignError,
    goblin::mach::{
        fat::{FatArch, FAT_MAGIC, SIZEOF_FAT_ARCH, SIZEOF_FAT_HEADER},
        header::{Header, SIZEOF_HEADER_32, SIZEOF_HEADER_64},
        load_command::{
            LC_CODE_SIGNATURE, LC_SEGMENT, LC_SEGMENT_64, SIZEOF_LINKEDIT_DATA_COMMAND,
        },
        parse_magic_and_ctx,
    },
    log::{debug, info},
    scroll::{Endian, Pread, Pwrite},
    std::path::Path,
};

/// Alignment of signature data within a slice.
pub const SIGNATURE_ALIGNMENT: u64 = 16;

/// Granularity `__LINKEDIT`'s vmsize is rounded to.
pub const SEGMENT_ALIGNMENT: u64 = 16384;

/// Minimum alignment (as a power of 2) of slices in a universal binary.
const FAT_MINIMUM_ALIGN: u32 = 14;

const FAT_MAGIC_64: u32 = 0xcafe_babf;

fn align_up(value: u64, alignment: u64, what: &'static str) -> Result<u64, CodeSignError> {
    value
        .checked_add(alignment - 1)
        .map(|v| v / alignment * alignment)
        .ok_or(CodeSignError::ArithmeticOverflow(what))
}

fn to_u32(value: u64, what: &'static str) -> Result<u32, CodeSignError> {
    u32::try_from(value).map_err(|_| CodeSignError::ArithmeticOverflow(what))
}

fn malformed(message: &str) -> CodeSignError {
    CodeSignError::InvalidBinary(message.to_string())
}

#[derive(Clone, Copy, Debug)]
struct SegmentInfo {
    command_offset: usize,
    fileoff: u64,
    filesize: u64,
}

impl SegmentInfo {
    fn end(&self) -> Result<u64, CodeSignError> {
        self.fileoff
            .checked_add(self.filesize)
            .ok_or(CodeSignError::ArithmeticOverflow("segment end"))
    }
}

#[derive(Clone, Copy, Debug)]
struct SignatureCommand {
    command_offset: usize,
    cmdsize: u32,
    dataoff: u32,
    datasize: u32,
}

impl SignatureCommand {
    fn end(&self) -> u64 {
        self.dataoff as u64 + self.datasize as u64
    }
}

/// Load command facts about a single Mach-O slice.
#[derive(Debug)]
struct SliceLayout {
    is_64: bool,
    endian: Endian,
    cputype: u32,
    cpusubtype: u32,
    ncmds: u32,
    sizeofcmds: u32,
    commands_end: usize,
    linkedit: SegmentInfo,
    code_signature: Option<SignatureCommand>,
    first_data_offset: Option<u64>,
}

fn read_segment_name(data: &[u8], offset: usize) -> Result<&str, CodeSignError> {
    let raw = data
        .get(offset + 8..offset + 24)
        .ok_or_else(|| malformed("truncated segment command"))?;

    Ok(std::str::from_utf8(raw).unwrap_or("").trim_end_matches('\0'))
}

impl SliceLayout {
    fn parse(data: &[u8]) -> Result<Self, CodeSignError> {
        let ctx = parse_magic_and_ctx(data, 0)?
            .1
            .ok_or_else(|| malformed("not a Mach-O binary"))?;
        let header: Header = data.pread_with(0, ctx)?;

        let is_64 = ctx.container.is_big();
        let endian = ctx.le;

        let header_size = if is_64 {
            SIZEOF_HEADER_64
        } else {
            SIZEOF_HEADER_32
        };
        let commands_end = header_size
            .checked_add(header.sizeofcmds as usize)
            .ok_or(CodeSignError::ArithmeticOverflow("load commands end"))?;
        if commands_end > data.len() {
            return Err(malformed("load commands extend past end of binary"));
        }

        let (segment_command, section_size, section_offset_field) = if is_64 {
            (LC_SEGMENT_64, 80usize, 48usize)
        } else {
            (LC_SEGMENT, 68usize, 40usize)
        };
        let segment_header_size = if is_64 { 72usize } else { 56usize };

        let mut segments = vec![];
        let mut linkedit = None;
        let mut code_signature = None;
        let mut first_section_offset: Option<u64> = None;

        let mut offset = header_size;
        for _ in 0..header.ncmds {
            if offset + 8 > commands_end {
                return Err(malformed("truncated load command"));
            }

            let cmd: u32 = data.pread_with(offset, endian)?;
            let cmdsize: u32 = data.pread_with(offset + 4, endian)?;
            let end = offset
                .checked_add(cmdsize as usize)
                .ok_or(CodeSignError::ArithmeticOverflow("load command end"))?;
            if cmdsize < 8 || end > commands_end {
                return Err(malformed("load command size out of bounds"));
            }

            if cmd == LC_CODE_SIGNATURE {
                if (cmdsize as usize) < SIZEOF_LINKEDIT_DATA_COMMAND {
                    return Err(malformed("LC_CODE_SIGNATURE too small"));
                }

                code_signature = Some(SignatureCommand {
                    command_offset: offset,
                    cmdsize,
                    dataoff: data.pread_with(offset + 8, endian)?,
                    datasize: data.pread_with(offset + 12, endian)?,
                });
            } else if cmd == segment_command {
                if (cmdsize as usize) < segment_header_size {
                    return Err(malformed("segment command too small"));
                }

                let (fileoff, filesize, nsects) = if is_64 {
                    (
                        data.pread_with::<u64>(offset + 40, endian)?,
                        data.pread_with::<u64>(offset + 48, endian)?,
                        data.pread_with::<u32>(offset + 64, endian)?,
                    )
                } else {
                    (
                        data.pread_with::<u32>(offset + 32, endian)? as u64,
                        data.pread_with::<u32>(offset + 36, endian)? as u64,
                        data.pread_with::<u32>(offset + 48, endian)?,
                    )
                };

                let sections_end = (nsects as usize)
                    .checked_mul(section_size)
                    .and_then(|v| v.checked_add(segment_header_size))
                    .ok_or(CodeSignError::ArithmeticOverflow("section table"))?;
                if sections_end > cmdsize as usize {
                    return Err(malformed("section table exceeds segment command"));
                }

                for i in 0..nsects as usize {
                    let section = offset + segment_header_size + i * section_size;
                    let section_offset =
                        data.pread_with::<u32>(section + section_offset_field, endian)? as u64;

                    // Zero-fill sections have no file data.
                    if section_offset != 0 {
                        first_section_offset = Some(
                            first_section_offset.map_or(section_offset, |v| v.min(section_offset)),
                        );
                    }
                }

                let segment = SegmentInfo {
                    command_offset: offset,
                    fileoff,
                    filesize,
                };
                segment.end()?;

                if read_segment_name(data, offset)? == "__LINKEDIT" {
                    linkedit = Some(segment);
                } else {
                    segments.push(segment);
                }
            }

            offset = end;
        }

        let linkedit = linkedit.ok_or_else(|| malformed("no __LINKEDIT segment"))?;

        if segments
            .iter()
            .any(|s| s.filesize > 0 && s.fileoff >= linkedit.fileoff)
        {
            return Err(CodeSignError::LinkeditNotLast);
        }

        let first_data_offset = first_section_offset.or_else(|| {
            segments
                .iter()
                .filter(|s| s.filesize > 0 && s.fileoff > 0)
                .map(|s| s.fileoff)
                .chain(std::iter::once(linkedit.fileoff))
                .min()
        });

        Ok(Self {
            is_64,
            endian,
            cputype: header.cputype,
            cpusubtype: header.cpusubtype,
            ncmds: header.ncmds as u32,
            sizeofcmds: header.sizeofcmds,
            commands_end,
            linkedit,
            code_signature,
            first_data_offset,
        })
    }

    /// Validate an existing signature sits at the end of the slice.
    fn check_signature_at_end(
        &self,
        signature: &SignatureCommand,
        data_len: usize,
    ) -> Result<(), CodeSignError> {
        let end = signature.end();

        if end > data_len as u64 || align_up(end, SIGNATURE_ALIGNMENT, "signature end")? < data_len as u64
        {
            return Err(CodeSignError::DataAfterSignature);
        }

        if (signature.dataoff as u64) < self.linkedit.fileoff {
            return Err(malformed("signature data starts before __LINKEDIT"));
        }
        if (signature.dataoff as usize) < self.commands_end {
            return Err(malformed("signature data overlaps load commands"));
        }
        if end > self.linkedit.end()? {
            return Err(malformed("signature data extends past __LINKEDIT"));
        }

        Ok(())
    }

    fn write_linkedit_size(&self, data: &mut [u8], filesize: u64) -> Result<(), CodeSignError> {
        let vmsize = align_up(filesize, SEGMENT_ALIGNMENT, "__LINKEDIT vmsize")?;
        let offset = self.linkedit.command_offset;

        if self.is_64 {
            data.pwrite_with(vmsize, offset + 32, self.endian)?;
            data.pwrite_with(filesize, offset + 48, self.endian)?;
        } else {
            data.pwrite_with(to_u32(vmsize, "__LINKEDIT vmsize")?, offset + 28, self.endian)?;
            data.pwrite_with(
                to_u32(filesize, "__LINKEDIT filesize")?,
                offset + 36,
                self.endian,
            )?;
        }

        Ok(())
    }

    fn write_command_counts(
        &self,
        data: &mut [u8],
        ncmds: u32,
        sizeofcmds: u32,
    ) -> Result<(), CodeSignError> {
        data.pwrite_with(ncmds, 16, self.endian)?;
        data.pwrite_with(sizeofcmds, 20, self.endian)?;

        Ok(())
    }
}

/// Reserve `size` bytes of signature space in a single Mach-O slice.
fn allocate_slice(data: &[u8], size: u32) -> Result<Vec<u8>, CodeSignError> {
    let layout = SliceLayout::parse(data)?;
    let size = align_up(size as u64, SIGNATURE_ALIGNMENT, "signature size")?;

    let (mut out, dataoff) = if let Some(signature) = &layout.code_signature {
        layout.check_signature_at_end(signature, data.len())?;

        debug!(
            "resizing signature space at offset {} from {} to {} bytes",
            signature.dataoff, signature.datasize, size
        );

        // Everything after the start of the old signature is discarded and
        // the new region is emitted as zeros.
        (
            data[..signature.dataoff as usize].to_vec(),
            signature.dataoff as u64,
        )
    } else {
        if layout.linkedit.end()? != data.len() as u64 {
            return Err(CodeSignError::DataAfterSignature);
        }

        let command_end = layout
            .commands_end
            .checked_add(SIZEOF_LINKEDIT_DATA_COMMAND)
            .ok_or(CodeSignError::ArithmeticOverflow("load commands end"))?;

        let room = layout
            .first_data_offset
            .map(|offset| offset >= command_end as u64)
            .unwrap_or(false);
        let gap = data
            .get(layout.commands_end..command_end)
            .ok_or_else(|| malformed("no space after load commands"))?;
        if !room || gap.iter().any(|b| *b != 0) {
            return Err(CodeSignError::LoadCommandNoRoom);
        }

        let dataoff = align_up(data.len() as u64, SIGNATURE_ALIGNMENT, "signature offset")?;
        debug!(
            "adding LC_CODE_SIGNATURE for {} bytes at offset {}",
            size, dataoff
        );

        (data.to_vec(), dataoff)
    };

    let new_end = dataoff
        .checked_add(size)
        .ok_or(CodeSignError::ArithmeticOverflow("signature end"))?;
    let dataoff32 = to_u32(dataoff, "signature offset")?;
    let size32 = to_u32(size, "signature size")?;
    out.resize(
        usize::try_from(new_end)
            .map_err(|_| CodeSignError::ArithmeticOverflow("signature end"))?,
        0,
    );

    if let Some(signature) = &layout.code_signature {
        out.pwrite_with(size32, signature.command_offset + 12, layout.endian)?;
    } else {
        let offset = layout.commands_end;
        out.pwrite_with(LC_CODE_SIGNATURE, offset, layout.endian)?;
        out.pwrite_with(SIZEOF_LINKEDIT_DATA_COMMAND as u32, offset + 4, layout.endian)?;
        out.pwrite_with(dataoff32, offset + 8, layout.endian)?;
        out.pwrite_with(size32, offset + 12, layout.endian)?;

        let ncmds = layout
            .ncmds
            .checked_add(1)
            .ok_or(CodeSignError::ArithmeticOverflow("ncmds"))?;
        let sizeofcmds = layout
            .sizeofcmds
            .checked_add(SIZEOF_LINKEDIT_DATA_COMMAND as u32)
            .ok_or(CodeSignError::ArithmeticOverflow("sizeofcmds"))?;
        layout.write_command_counts(&mut out, ncmds, sizeofcmds)?;
    }

    layout.write_linkedit_size(&mut out, new_end - layout.linkedit.fileoff)?;

    Ok(out)
}

/// Remove signature space from a single Mach-O slice.
fn deallocate_slice(data: &[u8]) -> Result<Vec<u8>, CodeSignError> {
    let layout = SliceLayout::parse(data)?;

    let signature = match &layout.code_signature {
        Some(signature) => *signature,
        None => {
            debug!("slice has no signature space; leaving as-is");
            return Ok(data.to_vec());
        }
    };

    layout.check_signature_at_end(&signature, data.len())?;

    let dataoff = signature.dataoff as usize;
    let mut out = data[..dataoff].to_vec();

    // Segment sizes are updated before load commands shift.
    layout.write_linkedit_size(&mut out, dataoff as u64 - layout.linkedit.fileoff)?;

    let start = signature.command_offset;
    let cmdsize = signature.cmdsize as usize;
    let end = layout.commands_end;

    out.copy_within(start + cmdsize..end, start);
    out[end - cmdsize..end].iter_mut().for_each(|b| *b = 0);

    layout.write_command_counts(
        &mut out,
        layout.ncmds - 1,
        layout.sizeofcmds - signature.cmdsize,
    )?;

    Ok(out)
}

/// Parse the fat header, if present.
fn parse_fat_arches(data: &[u8]) -> Result<Option<Vec<FatArch>>, CodeSignError> {
    let magic: u32 = data.pread_with(0, scroll::BE)?;

    if magic == FAT_MAGIC_64 {
        return Err(CodeSignError::Unsupported("64-bit universal binaries"));
    }
    if magic != FAT_MAGIC {
        return Ok(None);
    }

    let count: u32 = data.pread_with(4, scroll::BE)?;
    let table_end = (count as usize)
        .checked_mul(SIZEOF_FAT_ARCH)
        .and_then(|v| v.checked_add(SIZEOF_FAT_HEADER))
        .ok_or(CodeSignError::ArithmeticOverflow("fat arch table"))?;
    if table_end > data.len() {
        return Err(malformed("fat arch table extends past end of file"));
    }

    (0..count as usize)
        .map(|i| {
            let arch: FatArch =
                data.pread_with(SIZEOF_FAT_HEADER + i * SIZEOF_FAT_ARCH, scroll::BE)?;

            let end = (arch.offset as usize)
                .checked_add(arch.size as usize)
                .ok_or(CodeSignError::ArithmeticOverflow("fat slice end"))?;
            if (arch.offset as usize) < table_end || end > data.len() {
                return Err(malformed("fat slice out of bounds"));
            }

            Ok(arch)
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn fat_slice<'a>(data: &'a [u8], arch: &FatArch) -> &'a [u8] {
    // Bounds were checked by parse_fat_arches().
    &data[arch.offset as usize..arch.offset as usize + arch.size as usize]
}

/// Assemble a universal binary from rewritten slices.
fn assemble_fat(slices: Vec<(FatArch, Vec<u8>)>) -> Result<Vec<u8>, CodeSignError> {
    let header_len = SIZEOF_FAT_HEADER + SIZEOF_FAT_ARCH * slices.len();

    let mut out = vec![0u8; header_len];
    out.pwrite_with(FAT_MAGIC, 0, scroll::BE)?;
    out.pwrite_with(slices.len() as u32, 4, scroll::BE)?;

    for (i, (arch, slice)) in slices.into_iter().enumerate() {
        let align = arch.align.max(FAT_MINIMUM_ALIGN);
        if align >= 32 {
            return Err(malformed("fat slice alignment too large"));
        }

        let offset = align_up(out.len() as u64, 1u64 << align, "fat slice offset")?;
        out.resize(offset as usize, 0);

        let entry = FatArch {
            cputype: arch.cputype,
            cpusubtype: arch.cpusubtype,
            offset: to_u32(offset, "fat slice offset")?,
            size: to_u32(slice.len() as u64, "fat slice size")?,
            align,
        };
        out.pwrite_with(entry, SIZEOF_FAT_HEADER + i * SIZEOF_FAT_ARCH, scroll::BE)?;

        out.extend_from_slice(&slice);
    }

    Ok(out)
}

/// Reserve signature space in every slice of a thin or universal binary.
///
/// `size_for` receives each slice's CPU type and subtype and returns the
/// number of bytes to reserve. If it returns 0 for every slice, existing
/// signature space is removed instead. Mixing 0 and non-0 sizes is an error.
pub fn allocate_data(
    data: &[u8],
    size_for: impl Fn(u32, u32) -> u32,
) -> Result<Vec<u8>, CodeSignError> {
    if let Some(arches) = parse_fat_arches(data)? {
        let sizes = arches
            .iter()
            .map(|arch| size_for(arch.cputype, arch.cpusubtype))
            .collect::<Vec<_>>();

        if sizes.iter().all(|size| *size == 0) {
            info!("removing signature space from all architectures");
            return deallocate_data(data);
        }
        if sizes.iter().any(|size| *size == 0) {
            return Err(CodeSignError::MixedSignatureRemoval);
        }

        let slices = arches
            .iter()
            .zip(sizes)
            .enumerate()
            .map(|(index, (arch, size))| {
                info!(
                    "reserving {} bytes of signature space in slice {}",
                    size, index
                );
                Ok((*arch, allocate_slice(fat_slice(data, arch), size)?))
            })
            .collect::<Result<Vec<_>, CodeSignError>>()?;

        assemble_fat(slices)
    } else {
        let layout = SliceLayout::parse(data)?;
        let size = size_for(layout.cputype, layout.cpusubtype);

        if size == 0 {
            info!("removing signature space");
            deallocate_slice(data)
        } else {
            info!("reserving {} bytes of signature space", size);
            allocate_slice(data, size)
        }
    }
}

/// Remove signature space from every slice of a thin or universal binary.
pub fn deallocate_data(data: &[u8]) -> Result<Vec<u8>, CodeSignError> {
    if let Some(arches) = parse_fat_arches(data)? {
        let slices = arches
            .iter()
            .map(|arch| Ok((*arch, deallocate_slice(fat_slice(data, arch))?)))
            .collect::<Result<Vec<_>, CodeSignError>>()?;

        assemble_fat(slices)
    } else {
        deallocate_slice(data)
    }
}

/// Reserve signature space in the binary at `input_path`, writing `output_path`.
pub fn allocate(
    input_path: &Path,
    output_path: &Path,
    size_for: impl Fn(u32, u32) -> u32,
) -> Result<(), CodeSignError> {
    let data = std::fs::read(input_path)?;
    let out = allocate_data(&data, size_for)?;
    std::fs::write(output_path, out)?;

    Ok(())
}

/// Remove signature space from the binary at `input_path`, writing `output_path`.
pub fn deallocate(input_path: &Path, output_path: &Path) -> Result<(), CodeSignError> {
    let data = std::fs::read(input_path)?;
    let out = deallocate_data(&data)?;
    std::fs::write(output_path, out)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            macho::{parse_slices, MachOSignable},
            testutil::{fat_binary, MachOBuilder},
        },
        goblin::mach::{cputype::CPU_TYPE_ARM64, MachO},
    };

    fn linkedit(macho: &MachO) -> (u64, u64, u64) {
        let segment = macho
            .segments
            .iter()
            .find(|s| matches!(s.name(), Ok("__LINKEDIT")))
            .unwrap();

        (segment.fileoff, segment.filesize, segment.vmsize)
    }

    #[test]
    fn allocate_new_signature() -> Result<(), CodeSignError> {
        let original = MachOBuilder::default().build();
        let data = allocate_data(&original, |_, _| 1000)?;

        assert_eq!(data.len(), 2304 + 1008);
        assert_eq!(&data[0..16], &original[0..16]);

        let macho = MachO::parse(&data, 0)?;
        assert_eq!(macho.header.ncmds, 3);
        assert_eq!(macho.header.sizeofcmds, 240);
        let command = macho.code_signature_load_command().unwrap();
        assert_eq!(command.dataoff, 2304);
        assert_eq!(command.datasize, 1008);
        assert_eq!(linkedit(&macho), (2048, 1264, 16384));
        assert!(data[2304..].iter().all(|b| *b == 0));
        assert_eq!(&data[256..2304], &original[256..2304]);

        macho.check_signing_capability()?;

        Ok(())
    }

    #[test]
    fn reallocate_zeroes_region() -> Result<(), CodeSignError> {
        let original = MachOBuilder::default().build();
        let mut data = allocate_data(&original, |_, _| 4096)?;
        data[2304..].iter_mut().for_each(|b| *b = 0xff);

        let data = allocate_data(&data, |_, _| 500)?;
        assert_eq!(data.len(), 2304 + 512);
        assert!(data[2304..].iter().all(|b| *b == 0));

        let macho = MachO::parse(&data, 0)?;
        assert_eq!(macho.header.ncmds, 3);
        assert_eq!(macho.code_signature_load_command().unwrap().datasize, 512);

        Ok(())
    }

    #[test]
    fn deallocate_restores_original() -> Result<(), CodeSignError> {
        let original = MachOBuilder::default().build();
        let data = allocate_data(&original, |_, _| 2000)?;

        assert_eq!(deallocate_data(&data)?, original);
        // Zero sizes everywhere mean removal.
        assert_eq!(allocate_data(&data, |_, _| 0)?, original);
        // Nothing to remove.
        assert_eq!(deallocate_data(&original)?, original);

        Ok(())
    }

    #[test]
    fn unaligned_linkedit_end() -> Result<(), CodeSignError> {
        let original = MachOBuilder {
            linkedit_size: 250,
            ..Default::default()
        }
        .build();
        let data = allocate_data(&original, |_, _| 64)?;

        let macho = MachO::parse(&data, 0)?;
        let command = macho.code_signature_load_command().unwrap();
        assert_eq!(command.dataoff, 2304);
        assert_eq!(data.len(), 2304 + 64);
        assert_eq!(linkedit(&macho).1, 2304 + 64 - 2048);

        Ok(())
    }

    #[test]
    fn no_room_for_command() {
        let original = MachOBuilder {
            section_offset: 264,
            ..Default::default()
        }
        .build();

        assert!(matches!(
            allocate_data(&original, |_, _| 1000),
            Err(CodeSignError::LoadCommandNoRoom)
        ));
    }

    #[test]
    fn trailing_data_rejected() -> Result<(), CodeSignError> {
        let mut original = MachOBuilder::default().build();
        original.extend_from_slice(&[1u8; 64]);

        assert!(matches!(
            allocate_data(&original, |_, _| 1000),
            Err(CodeSignError::DataAfterSignature)
        ));

        let mut signed = allocate_data(&MachOBuilder::default().build(), |_, _| 1000)?;
        signed.extend_from_slice(&[1u8; 64]);
        assert!(matches!(
            deallocate_data(&signed),
            Err(CodeSignError::DataAfterSignature)
        ));

        Ok(())
    }

    #[test]
    fn overflowing_linkedit_rejected() {
        let mut original = MachOBuilder::default().build();
        // __LINKEDIT filesize lives at +48 of its command, which starts at 32 + 152.
        original[184 + 48..184 + 56].copy_from_slice(&u64::MAX.to_le_bytes());

        assert!(allocate_data(&original, |_, _| 1000).is_err());
    }

    #[test]
    fn commands_at_end_of_file_rejected() {
        // __TEXT is emptied and __LINKEDIT covers the whole 256 byte file,
        // which ends right where the load commands do.
        let mut data = MachOBuilder::default().build();
        data.truncate(256);
        data[80..88].copy_from_slice(&0u64.to_le_bytes());
        data[152..156].copy_from_slice(&0x10_0000u32.to_le_bytes());
        data[224..232].copy_from_slice(&0u64.to_le_bytes());
        data[232..240].copy_from_slice(&256u64.to_le_bytes());

        assert!(matches!(
            allocate_data(&data, |_, _| 1000),
            Err(CodeSignError::InvalidBinary(_))
        ));
    }

    #[test]
    fn signature_overlapping_commands_rejected() -> Result<(), CodeSignError> {
        let mut data = allocate_data(&MachOBuilder::default().build(), |_, _| 1000)?;
        data.truncate(272);
        data[80..88].copy_from_slice(&0u64.to_le_bytes());
        data[224..232].copy_from_slice(&0u64.to_le_bytes());
        data[232..240].copy_from_slice(&272u64.to_le_bytes());
        // LC_CODE_SIGNATURE follows __LINKEDIT at 256.
        data[264..268].copy_from_slice(&96u32.to_le_bytes());
        data[268..272].copy_from_slice(&176u32.to_le_bytes());

        assert!(matches!(
            deallocate_data(&data),
            Err(CodeSignError::InvalidBinary(_))
        ));
        assert!(matches!(
            allocate_data(&data, |_, _| 1000),
            Err(CodeSignError::InvalidBinary(_))
        ));

        Ok(())
    }

    #[test]
    fn signature_past_linkedit_rejected() -> Result<(), CodeSignError> {
        let mut data = allocate_data(&MachOBuilder::default().build(), |_, _| 1000)?;
        // Shrink __LINKEDIT so it stops short of the signature.
        data[232..240].copy_from_slice(&256u64.to_le_bytes());

        assert!(matches!(
            deallocate_data(&data),
            Err(CodeSignError::InvalidBinary(_))
        ));

        Ok(())
    }

    #[test]
    fn fat_allocation() -> Result<(), CodeSignError> {
        let x86 = MachOBuilder::default().build();
        let arm = MachOBuilder::arm64().build();
        let fat = fat_binary(&[&x86, &arm]);

        let data = allocate_data(&fat, |cputype, _| {
            if cputype == CPU_TYPE_ARM64 {
                3000
            } else {
                1000
            }
        })?;

        let slices = parse_slices(&data)?;
        assert_eq!(slices.len(), 2);
        for slice in &slices {
            assert_eq!(slice.offset % 16384, 0);
        }

        let x86_command = slices[0].macho.code_signature_load_command().unwrap();
        assert_eq!(x86_command.datasize, 1008);
        let arm_command = slices[1].macho.code_signature_load_command().unwrap();
        assert_eq!(arm_command.datasize, 3008);
        assert_eq!(slices[1].data.len(), 2304 + 3008);

        assert_eq!(deallocate_data(&data)?, fat);

        Ok(())
    }

    #[test]
    fn mixed_removal_rejected() -> Result<(), CodeSignError> {
        let x86 = MachOBuilder::default().build();
        let arm = MachOBuilder::arm64().build();
        let fat = fat_binary(&[&x86, &arm]);

        let res = allocate_data(&fat, |cputype, _| {
            if cputype == CPU_TYPE_ARM64 {
                0
            } else {
                1000
            }
        });
        assert!(matches!(res, Err(CodeSignError::MixedSignatureRemoval)));

        Ok(())
    }

    #[test]
    fn path_forms() -> Result<(), CodeSignError> {
        let temp = tempfile::TempDir::new()?;
        let input = temp.path().join("input");
        let allocated = temp.path().join("allocated");
        let stripped = temp.path().join("stripped");

        let original = MachOBuilder::default().build();
        std::fs::write(&input, &original)?;

        allocate(&input, &allocated, |_, _| 100)?;
        assert_eq!(std::fs::metadata(&allocated)?.len(), 2304 + 112);

        deallocate(&allocated, &stripped)?;
        assert_eq!(std::fs::read(&stripped)?, original);

        Ok(())
    }
}
