// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Placing signature data into its storage.

An editing session walks every architecture of a binary through the same
sequence of states:

1. `Created`: architectures are known, signature sizes are not.
2. `Sized`: every architecture has a signature size estimate.
3. `Allocated`: storage is reserved and the final layout is known.
4. `Written`: signature bytes were placed for every architecture.
5. `Committed`: results were handed off.

[MachOEditor] embeds signatures into a Mach-O binary and atomically replaces
the output file on commit. [BlobEditor] leaves the binary alone and produces
a detached signature.

Calls made out of order fail with [CodeSignError::InternalError]. No file is
touched before commit.
*/

use {
    crate::{
        embedded_signature::DetachedSignature,
        error::CodeSignError,
        macho::{parse_slices, MachOSignable, MachOSlice},
        macho_allocate::allocate_data,
    },
    log::{debug, info, warn},
    std::{
        collections::{BTreeMap, BTreeSet},
        io::Write,
        path::{Path, PathBuf},
    },
};

/// One architecture of the binary being edited.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Arch {
    /// Index of the slice within the binary.
    pub index: usize,
    pub cputype: u32,
    pub cpusubtype: u32,
}

impl Arch {
    fn from_data(data: &[u8]) -> Result<Vec<Self>, CodeSignError> {
        Ok(parse_slices(data)?
            .into_iter()
            .map(|slice| Self {
                index: slice.index,
                cputype: slice.cputype,
                cpusubtype: slice.cpusubtype,
            })
            .collect::<Vec<_>>())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EditorState {
    Created,
    Sized,
    Allocated,
    Written,
    Committed,
}

fn out_of_order(message: impl std::fmt::Display) -> CodeSignError {
    CodeSignError::InternalError(format!("signature editor: {}", message))
}

/// Tracks an editing session shared by every [ArchEditor].
#[derive(Clone, Debug)]
struct Progress {
    state: EditorState,
    arch_count: usize,
    sizes: BTreeMap<usize, u32>,
    written: BTreeSet<usize>,
    removing: bool,
}

impl Progress {
    fn new(arch_count: usize) -> Self {
        Self {
            state: EditorState::Created,
            arch_count,
            sizes: BTreeMap::new(),
            written: BTreeSet::new(),
            removing: false,
        }
    }

    fn check_index(&self, index: usize) -> Result<(), CodeSignError> {
        if index < self.arch_count {
            Ok(())
        } else {
            Err(out_of_order(format!("no architecture at index {}", index)))
        }
    }

    fn set_size(&mut self, index: usize, size: u32) -> Result<(), CodeSignError> {
        if !matches!(self.state, EditorState::Created | EditorState::Sized) {
            return Err(out_of_order("sizes are fixed once space is allocated"));
        }
        self.check_index(index)?;

        self.sizes.insert(index, size);
        if self.sizes.len() == self.arch_count {
            self.state = EditorState::Sized;
        }

        Ok(())
    }

    fn begin_allocate(&mut self) -> Result<(), CodeSignError> {
        if self.state != EditorState::Sized {
            return Err(out_of_order("every architecture must be sized before allocation"));
        }

        let zero = self.sizes.values().filter(|size| **size == 0).count();
        if zero == self.sizes.len() {
            self.removing = true;
        } else if zero > 0 {
            return Err(CodeSignError::MixedSignatureRemoval);
        }

        Ok(())
    }

    fn check_allocated(&self) -> Result<(), CodeSignError> {
        if matches!(self.state, EditorState::Allocated | EditorState::Written) {
            Ok(())
        } else {
            Err(out_of_order("space has not been allocated"))
        }
    }

    fn record_write(&mut self, index: usize) -> Result<(), CodeSignError> {
        self.check_allocated()?;
        self.check_index(index)?;

        if self.removing {
            return Err(out_of_order("cannot write signatures while removing them"));
        }

        self.written.insert(index);
        self.state = EditorState::Written;

        Ok(())
    }

    fn begin_commit(&self) -> Result<(), CodeSignError> {
        let ready = if self.removing {
            self.state == EditorState::Allocated
        } else {
            self.state == EditorState::Written && self.written.len() == self.arch_count
        };

        if ready {
            Ok(())
        } else {
            Err(out_of_order("every architecture must be written before commit"))
        }
    }
}

/// Storage for the signatures of every architecture of a binary.
pub trait ArchEditor {
    /// The architectures being edited, in slice order.
    fn architectures(&self) -> &[Arch];

    /// Current state of the session.
    fn state(&self) -> EditorState;

    /// Record the signature size needed by an architecture.
    ///
    /// A size of 0 for every architecture removes signatures.
    fn set_size(&mut self, index: usize, size: u32) -> Result<(), CodeSignError>;

    /// Reserve storage for every architecture.
    fn allocate(&mut self) -> Result<(), CodeSignError>;

    /// Whether allocation removed signatures rather than reserving space.
    fn is_removing(&self) -> bool;

    /// Obtain an architecture's slice as laid out after allocation.
    ///
    /// Page hashes must be computed against this view, not the input.
    fn reset(&self, index: usize) -> Result<MachOSlice<'_>, CodeSignError>;

    /// Place the signature SuperBlob of an architecture.
    fn write(&mut self, index: usize, blob: &[u8]) -> Result<(), CodeSignError>;

    /// Finish the session.
    fn commit(&mut self) -> Result<(), CodeSignError>;
}

/// Copy permissions, ownership and timestamps from one file to another.
///
/// Ownership changes need privileges; failures are logged, not fatal.
pub fn copy_metadata(source: &Path, dest: &Path) -> Result<(), CodeSignError> {
    let metadata = std::fs::metadata(source)?;

    std::fs::set_permissions(dest, metadata.permissions())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        if let Err(e) = std::os::unix::fs::chown(dest, Some(metadata.uid()), Some(metadata.gid()))
        {
            debug!("unable to preserve ownership of {}: {}", dest.display(), e);
        }
    }

    let atime = filetime::FileTime::from_last_access_time(&metadata);
    let mtime = filetime::FileTime::from_last_modification_time(&metadata);
    filetime::set_file_times(dest, atime, mtime)?;

    Ok(())
}

/// Atomically replace `dest` with `data`.
///
/// Data goes to a temporary file next to `dest`, which is renamed over it.
/// The temporary file is removed if anything fails.
pub fn write_atomic(dest: &Path, data: &[u8], metadata_from: Option<&Path>) -> Result<(), CodeSignError> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;

    if let Some(source) = metadata_from {
        copy_metadata(source, temp.path())?;
    }

    temp.persist(dest).map_err(|e| CodeSignError::Io(e.error))?;

    Ok(())
}

/// Embeds signatures into a Mach-O binary.
#[derive(Debug)]
pub struct MachOEditor {
    input: PathBuf,
    output: PathBuf,
    original: Vec<u8>,
    data: Vec<u8>,
    arches: Vec<Arch>,
    progress: Progress,
}

impl MachOEditor {
    /// Start editing the binary at `input`, to be committed to `output`.
    ///
    /// `input` and `output` may be the same path.
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<Self, CodeSignError> {
        let original = std::fs::read(input.as_ref())?;
        Self::from_data(input, output, original)
    }

    /// Start editing in-memory binary data read from `input`.
    pub fn from_data(
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
        original: Vec<u8>,
    ) -> Result<Self, CodeSignError> {
        let arches = Arch::from_data(&original)?;

        for slice in parse_slices(&original)? {
            slice.macho.check_signing_capability()?;
        }

        Ok(Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            progress: Progress::new(arches.len()),
            data: vec![],
            original,
            arches,
        })
    }

    /// The rewritten binary, once allocated.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl ArchEditor for MachOEditor {
    fn architectures(&self) -> &[Arch] {
        &self.arches
    }

    fn state(&self) -> EditorState {
        self.progress.state
    }

    fn set_size(&mut self, index: usize, size: u32) -> Result<(), CodeSignError> {
        self.progress.set_size(index, size)
    }

    fn allocate(&mut self) -> Result<(), CodeSignError> {
        self.progress.begin_allocate()?;

        let mut sizes = BTreeMap::new();
        for arch in &self.arches {
            let size = self.progress.sizes.get(&arch.index).copied().unwrap_or(0);
            let entry = sizes.entry((arch.cputype, arch.cpusubtype)).or_insert(0);
            *entry = size.max(*entry);
        }

        self.data = allocate_data(&self.original, |cputype, cpusubtype| {
            sizes.get(&(cputype, cpusubtype)).copied().unwrap_or(0)
        })?;

        self.progress.state = EditorState::Allocated;

        Ok(())
    }

    fn is_removing(&self) -> bool {
        self.progress.removing
    }

    fn reset(&self, index: usize) -> Result<MachOSlice<'_>, CodeSignError> {
        self.progress.check_allocated()?;

        parse_slices(&self.data)?
            .into_iter()
            .nth(index)
            .ok_or_else(|| out_of_order(format!("no architecture at index {}", index)))
    }

    fn write(&mut self, index: usize, blob: &[u8]) -> Result<(), CodeSignError> {
        self.progress.check_allocated()?;

        let (start, available) = {
            let slice = self.reset(index)?;
            let command = slice
                .macho
                .code_signature_load_command()
                .ok_or_else(|| out_of_order("no signature space reserved"))?;

            let start = slice
                .offset
                .checked_add(command.dataoff as usize)
                .ok_or(CodeSignError::ArithmeticOverflow("signature offset"))?;

            (start, command.datasize as usize)
        };

        if blob.len() > available {
            return Err(CodeSignError::SignatureTooLarge {
                needed: blob.len(),
                available,
            });
        }

        let end = start + blob.len();
        let region = self.data.get_mut(start..end).ok_or_else(|| {
            CodeSignError::InvalidBinary("signature space extends past end of file".into())
        })?;
        region.copy_from_slice(blob);

        debug!(
            "wrote {} byte signature into {} reserved bytes of architecture {}",
            blob.len(),
            available,
            index
        );

        self.progress.record_write(index)
    }

    fn commit(&mut self) -> Result<(), CodeSignError> {
        self.progress.begin_commit()?;

        info!("writing Mach-O to {}", self.output.display());
        write_atomic(&self.output, &self.data, Some(&self.input))?;

        self.progress.state = EditorState::Committed;

        Ok(())
    }
}

/// Produces a detached signature for a binary, leaving it untouched.
#[derive(Debug)]
pub struct BlobEditor {
    output: Option<PathBuf>,
    data: Vec<u8>,
    arches: Vec<Arch>,
    blobs: BTreeMap<usize, Vec<u8>>,
    global: Vec<u8>,
    progress: Progress,
    signature: Option<Vec<u8>>,
}

impl BlobEditor {
    /// Start producing a detached signature for binary data.
    ///
    /// On commit the detached signature is written to `output`, if given.
    pub fn new(data: Vec<u8>, output: Option<PathBuf>) -> Result<Self, CodeSignError> {
        let arches = Arch::from_data(&data)?;

        Ok(Self {
            output,
            progress: Progress::new(arches.len()),
            data,
            arches,
            blobs: BTreeMap::new(),
            global: vec![],
            signature: None,
        })
    }

    /// Set the content of the global sub-blob.
    pub fn set_global(&mut self, data: Vec<u8>) {
        self.global = data;
    }

    /// The detached signature, once committed.
    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }
}

impl ArchEditor for BlobEditor {
    fn architectures(&self) -> &[Arch] {
        &self.arches
    }

    fn state(&self) -> EditorState {
        self.progress.state
    }

    fn set_size(&mut self, index: usize, size: u32) -> Result<(), CodeSignError> {
        self.progress.set_size(index, size)
    }

    fn allocate(&mut self) -> Result<(), CodeSignError> {
        self.progress.begin_allocate()?;

        if self.progress.removing {
            return Err(CodeSignError::Unsupported(
                "detached signatures cannot be removed from binaries",
            ));
        }

        // The binary keeps its layout; nothing to reserve.
        self.progress.state = EditorState::Allocated;

        Ok(())
    }

    fn is_removing(&self) -> bool {
        self.progress.removing
    }

    fn reset(&self, index: usize) -> Result<MachOSlice<'_>, CodeSignError> {
        self.progress.check_allocated()?;

        parse_slices(&self.data)?
            .into_iter()
            .nth(index)
            .ok_or_else(|| out_of_order(format!("no architecture at index {}", index)))
    }

    fn write(&mut self, index: usize, blob: &[u8]) -> Result<(), CodeSignError> {
        self.progress.record_write(index)?;
        self.blobs.insert(index, blob.to_vec());

        Ok(())
    }

    fn commit(&mut self) -> Result<(), CodeSignError> {
        self.progress.begin_commit()?;

        let mut seen = BTreeSet::new();
        let mut architectures = vec![];
        for arch in &self.arches {
            if !seen.insert(arch.cputype) {
                warn!(
                    "multiple architectures with CPU type {}; detached signature keeps the first",
                    arch.cputype
                );
                continue;
            }

            let blob = self
                .blobs
                .get(&arch.index)
                .ok_or_else(|| out_of_order("architecture not written"))?;
            architectures.push((arch.cputype, blob.clone()));
        }

        let signature = DetachedSignature::create(self.global.clone(), architectures)?;

        if let Some(output) = &self.output {
            info!("writing detached signature to {}", output.display());
            write_atomic(output, &signature, None)?;
        }

        self.signature = Some(signature);
        self.progress.state = EditorState::Committed;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testutil::{fat_binary, MachOBuilder},
    };

    #[test]
    fn out_of_order_calls_rejected() -> Result<(), CodeSignError> {
        let data = MachOBuilder::default().build();
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("bin");
        std::fs::write(&path, &data)?;

        let mut editor = MachOEditor::new(&path, &path)?;
        assert_eq!(editor.architectures().len(), 1);

        assert!(editor.allocate().is_err());
        assert!(editor.reset(0).is_err());
        assert!(editor.write(0, b"x").is_err());
        assert!(editor.commit().is_err());
        assert!(editor.set_size(1, 100).is_err());

        editor.set_size(0, 1024)?;
        assert_eq!(editor.state(), EditorState::Sized);
        assert!(editor.commit().is_err());

        editor.allocate()?;
        assert!(editor.set_size(0, 2048).is_err());
        assert!(editor.commit().is_err());

        Ok(())
    }

    #[test]
    fn write_and_commit() -> Result<(), CodeSignError> {
        let data = MachOBuilder::default().build();
        let temp = tempfile::TempDir::new()?;
        let input = temp.path().join("in");
        let output = temp.path().join("out");
        std::fs::write(&input, &data)?;

        let mut editor = MachOEditor::new(&input, &output)?;
        editor.set_size(0, 64)?;
        editor.allocate()?;

        {
            let slice = editor.reset(0)?;
            let command = slice.macho.code_signature_load_command().unwrap();
            assert_eq!(command.datasize, 64);
            assert_eq!(slice.code_data()?.len(), command.dataoff as usize);
        }

        assert!(matches!(
            editor.write(0, &[1u8; 65]),
            Err(CodeSignError::SignatureTooLarge {
                needed: 65,
                available: 64
            })
        ));

        editor.write(0, &[0xaa; 32])?;
        assert!(!output.exists());
        editor.commit()?;
        assert_eq!(editor.state(), EditorState::Committed);

        let written = std::fs::read(&output)?;
        assert_eq!(written, editor.data());
        let tail = &written[written.len() - 64..];
        assert_eq!(&tail[..32], &[0xaa; 32][..]);
        assert_eq!(&tail[32..], &[0u8; 32][..]);

        // Only the temporary file's rename touched the directory.
        assert_eq!(std::fs::read_dir(temp.path())?.count(), 2);

        Ok(())
    }

    #[test]
    fn mixed_removal_rejected() -> Result<(), CodeSignError> {
        let data = fat_binary(&[
            &MachOBuilder::default().build(),
            &MachOBuilder::arm64().build(),
        ]);
        let temp = tempfile::TempDir::new()?;
        let path = temp.path().join("fat");
        std::fs::write(&path, &data)?;

        let mut editor = MachOEditor::new(&path, &path)?;
        editor.set_size(0, 0)?;
        editor.set_size(1, 1024)?;
        assert!(matches!(
            editor.allocate(),
            Err(CodeSignError::MixedSignatureRemoval)
        ));

        Ok(())
    }

    #[test]
    fn detached_blob() -> Result<(), CodeSignError> {
        let x86 = MachOBuilder::default().build();
        let arm = MachOBuilder::arm64().build();
        let data = fat_binary(&[&x86, &arm]);

        let mut editor = BlobEditor::new(data, None)?;
        editor.set_size(0, 100)?;
        editor.set_size(1, 100)?;
        editor.allocate()?;

        let empty = crate::embedded_signature::create_superblob(
            crate::embedded_signature::CodeSigningMagic::EmbeddedSignature,
            std::iter::empty::<&(crate::embedded_signature::CodeSigningSlot, Vec<u8>)>(),
        )?;

        editor.write(0, &empty)?;
        assert!(editor.commit().is_err());
        editor.write(1, &empty)?;
        editor.commit()?;

        let signature = editor.signature().unwrap().to_vec();
        assert_eq!(&signature[0..4], &[0xfa, 0xde, 0x0c, 0xc1]);

        let detached = DetachedSignature::from_bytes(&signature)?;
        assert_eq!(detached.architectures.len(), 2);
        assert!(detached
            .for_cpu_type(goblin::mach::cputype::CPU_TYPE_ARM64)
            .is_some());

        Ok(())
    }
}
