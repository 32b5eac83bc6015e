//! The FAT32 side of the image: a builder that owns the 4 GiB partition
//! buffer, formats it, and mirrors a host directory tree into it.

pub mod boot_sector;
pub mod dir;

use crate::image::ImageError;
use boot_sector::{
    BiosParameterBlock, FsInfoSector, BACKUP_BOOT_SECTOR, BYTES_PER_SECTOR, CLUSTER_COUNT,
    FAT_SIZE_32, FIRST_DATA_SECTOR, FS_INFO_FREE_COUNT_OFFSET, FS_INFO_NEXT_FREE_OFFSET,
    RESERVED_SECTOR_COUNT, ROOT_CLUSTER, SECTORS_PER_CLUSTER, TOTAL_SECTORS_32,
};
use dir::{DirEntry, ShortName, Timestamp, ENTRY_SIZE};

use log::{info, warn};

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

pub const SECTOR_SIZE: usize = BYTES_PER_SECTOR as usize;
pub const CLUSTER_SIZE: usize = SECTOR_SIZE * SECTORS_PER_CLUSTER as usize;
pub const ENTRIES_PER_CLUSTER: usize = CLUSTER_SIZE / ENTRY_SIZE;

/// End-of-chain marker; FAT32 entries only carry 28 significant bits.
pub const END_OF_CHAIN: u32 = 0x0FFF_FFFF;
/// FAT[0]: the media descriptor in the low byte, ones above.
pub const FAT_ID: u32 = 0x0FFF_FFF0;

const VOLUME_BYTES: usize = TOTAL_SECTORS_32 as usize * SECTOR_SIZE;

/// The partition under construction.
///
/// Everything lives in one linear buffer; formatting and tree ingestion are
/// in-place writes at computed offsets, and nothing is ever freed or moved
/// once placed.
pub struct FatVolume {
    buf: Vec<u8>,
    fixed_timestamp: Option<Timestamp>,
}

impl FatVolume {
    /// Allocates the zero-filled 4 GiB partition buffer.
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; VOLUME_BYTES],
            fixed_timestamp: None,
        }
    }

    /// Pins directory-entry timestamps to `stamp` instead of sampling the
    /// local clock, for reproducible output.
    pub fn set_timestamp(&mut self, stamp: Timestamp) {
        self.fixed_timestamp = Some(stamp);
    }

    fn timestamp(&self) -> Timestamp {
        self.fixed_timestamp.unwrap_or_else(Timestamp::now)
    }

    /// Writes the reserved region — BPB, FSInfo, and their backups at
    /// sectors 6 and 7 — plus the reserved FAT entries, in both FATs.
    ///
    /// The backups capture the freshly-formatted state; the live FSInfo at
    /// sector 1 is the copy the allocator keeps up to date afterwards.
    pub fn format(&mut self) {
        let bpb = BiosParameterBlock::new();
        let fs_info = FsInfoSector::new();

        bpb.write(self.sector_mut(0));
        fs_info.write(self.sector_mut(1));
        bpb.write(self.sector_mut(BACKUP_BOOT_SECTOR as usize));
        fs_info.write(self.sector_mut(BACKUP_BOOT_SECTOR as usize + 1));

        self.set_fat_entry(0, FAT_ID);
        self.set_fat_entry(1, END_OF_CHAIN);
        self.set_fat_entry(ROOT_CLUSTER, END_OF_CHAIN);
    }

    /// Mirrors the tree under `path` into the volume, rooted at cluster 2.
    pub fn copy_input_directory(&mut self, path: &Path) -> Result<(), ImageError> {
        self.copy_directory(path, ROOT_CLUSTER)
    }

    /// Emits the whole partition buffer, one sector at a time.
    pub fn write<W: Write>(&self, output: &mut W) -> io::Result<()> {
        for sector in self.buf.chunks(SECTOR_SIZE) {
            output.write_all(sector)?;
        }

        Ok(())
    }

    /// The raw partition bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn sector(&self, index: usize) -> &[u8] {
        &self.buf[index * SECTOR_SIZE..(index + 1) * SECTOR_SIZE]
    }

    fn sector_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.buf[index * SECTOR_SIZE..(index + 1) * SECTOR_SIZE]
    }

    fn cluster_offset(cluster: u32) -> usize {
        FIRST_DATA_SECTOR as usize * SECTOR_SIZE + (cluster as usize - 2) * CLUSTER_SIZE
    }

    pub fn cluster(&self, cluster: u32) -> &[u8] {
        let offset = Self::cluster_offset(cluster);
        &self.buf[offset..offset + CLUSTER_SIZE]
    }

    fn cluster_mut(&mut self, cluster: u32) -> &mut [u8] {
        let offset = Self::cluster_offset(cluster);
        &mut self.buf[offset..offset + CLUSTER_SIZE]
    }

    pub fn fat_entry(&self, cluster: u32) -> u32 {
        let offset = RESERVED_SECTOR_COUNT as usize * SECTOR_SIZE + cluster as usize * 4;

        u32::from_le_bytes(self.buf[offset..offset + 4].try_into().unwrap())
    }

    /// Every FAT write lands in both FATs; they stay identical for the whole
    /// build.
    fn set_fat_entry(&mut self, cluster: u32, value: u32) {
        let primary = RESERVED_SECTOR_COUNT as usize * SECTOR_SIZE + cluster as usize * 4;
        let mirror = primary + FAT_SIZE_32 as usize * SECTOR_SIZE;

        self.buf[primary..primary + 4].copy_from_slice(&value.to_le_bytes());
        self.buf[mirror..mirror + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// FSInfo's live free-cluster count.
    pub fn free_count(&self) -> u32 {
        let offset = SECTOR_SIZE + FS_INFO_FREE_COUNT_OFFSET;

        u32::from_le_bytes(self.buf[offset..offset + 4].try_into().unwrap())
    }

    /// FSInfo's allocation hint, which the bump allocator keeps exact.
    pub fn next_free_cluster(&self) -> u32 {
        let offset = SECTOR_SIZE + FS_INFO_NEXT_FREE_OFFSET;

        u32::from_le_bytes(self.buf[offset..offset + 4].try_into().unwrap())
    }

    /// Bump allocation backed by the live FSInfo sector. Nothing is ever
    /// freed during construction, so the hint never lies.
    fn allocate_cluster(&mut self) -> u32 {
        let cluster = self.next_free_cluster();
        assert!(cluster < CLUSTER_COUNT + 2, "volume out of clusters");

        let free_count = SECTOR_SIZE + FS_INFO_FREE_COUNT_OFFSET;
        let next_free = SECTOR_SIZE + FS_INFO_NEXT_FREE_OFFSET;
        let remaining = self.free_count() - 1;
        self.buf[free_count..free_count + 4].copy_from_slice(&remaining.to_le_bytes());
        self.buf[next_free..next_free + 4].copy_from_slice(&(cluster + 1).to_le_bytes());

        cluster
    }

    fn copy_directory(&mut self, path: &Path, parent_cluster: u32) -> Result<(), ImageError> {
        let entries = fs::read_dir(path).map_err(|source| ImageError::ReadDir {
            path: path.to_path_buf(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| ImageError::ReadDir {
                path: path.to_path_buf(),
                source,
            })?;
            let child_path = entry.path();
            let file_type = entry.file_type().map_err(|source| ImageError::ReadFile {
                path: child_path.clone(),
                source,
            })?;

            let name = ShortName::format(&entry.file_name().to_string_lossy());

            if file_type.is_dir() {
                info!("adding entry: {}", child_path.display());

                let cluster = self.add_entry(parent_cluster, &name, true, 0);
                self.copy_directory(&child_path, cluster)?;
            } else if file_type.is_file() {
                info!("adding entry: {}", child_path.display());

                let length = entry
                    .metadata()
                    .map_err(|source| ImageError::ReadFile {
                        path: child_path.clone(),
                        source,
                    })?
                    .len();
                assert!(
                    length <= u32::MAX as u64,
                    "{}: too large for FAT32",
                    child_path.display(),
                );

                let input = File::open(&child_path).map_err(|source| ImageError::ReadFile {
                    path: child_path.clone(),
                    source,
                })?;

                let cluster = self.add_entry(parent_cluster, &name, false, length as u32);
                self.copy_file_contents(input, cluster)
                    .map_err(|source| ImageError::ReadFile {
                        path: child_path.clone(),
                        source,
                    })?;
            } else {
                warn!("skipped {}: unknown file type", child_path.display());
            }
        }

        Ok(())
    }

    /// Finds or creates the entry for `name` in the directory whose chain
    /// starts at `dir_cluster`, returning the entry's first cluster.
    ///
    /// A new entry gets a freshly allocated end-of-chain cluster; a slot
    /// whose name already matches byte-for-byte is reused as-is. When every
    /// slot of the current cluster is taken the walk follows the chain,
    /// growing it by one cluster if this was the last link.
    fn add_entry(
        &mut self,
        dir_cluster: u32,
        name: &ShortName,
        is_directory: bool,
        file_size: u32,
    ) -> u32 {
        let mut cluster = dir_cluster;

        loop {
            let base = Self::cluster_offset(cluster);

            for slot in 0..ENTRIES_PER_CLUSTER {
                let offset = base + slot * ENTRY_SIZE;

                if self.buf[offset] == 0x00 {
                    // End-of-directory sentinel: claim this slot.
                    let child = self.allocate_cluster();
                    self.set_fat_entry(child, END_OF_CHAIN);

                    let stamp = self.timestamp();
                    let entry = if is_directory {
                        DirEntry::directory(name.clone(), child, stamp)
                    } else {
                        DirEntry::file(name.clone(), child, file_size, stamp)
                    };
                    entry.write(&mut self.buf[offset..offset + ENTRY_SIZE]);

                    if is_directory {
                        self.write_dot_entries(child, dir_cluster);
                    }

                    return child;
                }

                if self.buf[offset..offset + 11] == name.0 {
                    // Already present: alias to the existing entry.
                    let high =
                        u16::from_le_bytes(self.buf[offset + 20..offset + 22].try_into().unwrap());
                    let low =
                        u16::from_le_bytes(self.buf[offset + 26..offset + 28].try_into().unwrap());

                    return (high as u32) << 16 | low as u32;
                }
            }

            let next = self.fat_entry(cluster);
            cluster = if next == END_OF_CHAIN {
                let grown = self.allocate_cluster();
                self.set_fat_entry(cluster, grown);
                self.set_fat_entry(grown, END_OF_CHAIN);

                grown
            } else {
                next
            };
        }
    }

    /// "." and ".." for a fresh directory cluster. Per the FAT convention
    /// ".." stores 0 when the parent is the root directory.
    fn write_dot_entries(&mut self, cluster: u32, parent_cluster: u32) {
        let parent = if parent_cluster == ROOT_CLUSTER {
            0
        } else {
            parent_cluster
        };
        let stamp = self.timestamp();
        let base = Self::cluster_offset(cluster);

        DirEntry::directory(ShortName::DOT, cluster, stamp)
            .write(&mut self.buf[base..base + ENTRY_SIZE]);
        DirEntry::directory(ShortName::DOTDOT, parent, stamp)
            .write(&mut self.buf[base + ENTRY_SIZE..base + 2 * ENTRY_SIZE]);
    }

    /// Streams a file into the chain starting at `first_cluster`. The chain
    /// only grows while the reader still has bytes left, so a file that is
    /// an exact multiple of the cluster size terminates without an empty
    /// trailing cluster. Slack in the last cluster stays zero.
    fn copy_file_contents<R: Read>(&mut self, mut input: R, first_cluster: u32) -> io::Result<()> {
        self.set_fat_entry(first_cluster, END_OF_CHAIN);

        let mut cluster = first_cluster;
        let mut filled = read_full(&mut input, self.cluster_mut(cluster))?;

        while filled == CLUSTER_SIZE {
            let mut staged = [0u8; CLUSTER_SIZE];
            let ahead = read_full(&mut input, &mut staged)?;
            if ahead == 0 {
                break;
            }

            let next = self.allocate_cluster();
            self.set_fat_entry(cluster, next);
            self.set_fat_entry(next, END_OF_CHAIN);
            self.cluster_mut(next)[..ahead].copy_from_slice(&staged[..ahead]);

            cluster = next;
            filled = ahead;
        }

        Ok(())
    }
}

/// Reads until `buf` is full or the reader runs dry, so short reads never
/// end a cluster early.
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}
