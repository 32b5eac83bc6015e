//! Whole-image orchestration: wraps the FAT32 partition in GPT metadata and
//! streams the finished disk out in one pass.

use crate::crc32::crc32;
use crate::fat::FatVolume;
use crate::gpt::{self, GptHeader, Guid, PartitionEntry, LBA_SIZE};

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Where the 16 random bytes for each GUID come from; split out as a seam so
/// tests can pin them.
pub trait GuidSource {
    fn next_guid(&mut self) -> [u8; 16];
}

/// The production source: the operating system's secure RNG.
pub struct OsGuidSource;

impl GuidSource for OsGuidSource {
    fn next_guid(&mut self) -> [u8; 16] {
        let mut guid = [0u8; 16];
        OsRng.fill_bytes(&mut guid);

        guid
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("can not open directory {}", path.display())]
    ReadDir { path: PathBuf, source: io::Error },

    #[error("can not read {}", path.display())]
    ReadFile { path: PathBuf, source: io::Error },

    #[error("failed to write the output image")]
    Output(#[from] io::Error),
}

/// Formats a FAT32 volume, mirrors `input_dir` into it, and writes the
/// complete disk image to `output`.
pub fn create_image<W, G>(input_dir: &Path, output: &mut W, guids: &mut G) -> Result<(), ImageError>
where
    W: Write,
    G: GuidSource,
{
    let mut volume = FatVolume::new();
    volume.format();
    volume.copy_input_directory(input_dir)?;

    write_image(&volume, output, guids)
}

/// Emits the image in layout order: protective MBR, primary GPT header,
/// primary entry array, the partition, one pad LBA, backup entry array,
/// backup header.
///
/// The pad LBA lands the backup entry array exactly at
/// `TOTAL_BLOCKS - ALIGNMENT + 1`, which is where the backup header says it
/// is. Both headers carry the same disk GUID and the same entry-array CRC;
/// each header's own CRC is computed over its 92 bytes with the field
/// zeroed.
pub fn write_image<W, G>(volume: &FatVolume, output: &mut W, guids: &mut G) -> Result<(), ImageError>
where
    W: Write,
    G: GuidSource,
{
    let entry0 = PartitionEntry::efi_system(Guid::from_bytes(guids.next_guid()));
    let entries = gpt::partition_entry_array(&entry0);
    let entries_crc32 = crc32(&entries);

    let disk_guid = Guid::from_bytes(guids.next_guid());
    let primary = GptHeader::primary(disk_guid, entries_crc32);
    let backup = GptHeader::backup(disk_guid, entries_crc32);

    output.write_all(&gpt::protective_mbr())?;
    output.write_all(&primary.to_lba())?;
    output.write_all(&entries)?;

    volume.write(output)?;

    output.write_all(&[0u8; LBA_SIZE])?;
    output.write_all(&entries)?;
    output.write_all(&backup.to_lba())?;

    Ok(())
}
