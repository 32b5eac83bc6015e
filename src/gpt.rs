//! Utilities for creating GUID Partition Tables (GPT).
//!
//! This file (intentionally) doesn't try to expose all of GPT; it builds
//! exactly the structures a single-partition disk needs: the protective MBR,
//! the primary/backup headers, and the partition entry array.
//!
//! Field descriptions sourced from [here](https://en.wikipedia.org/wiki/GUID_Partition_Table).

use crate::crc32::crc32;

use core::fmt::{self, Debug};

pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";
pub const GPT_REVISION: u32 = 0x0001_0000;

/// Logical block size, in bytes. Everything here assumes 512B LBAs.
pub const LBA_SIZE: usize = 512;

/// Partition alignment, in LBAs (1 MiB).
pub const ALIGNMENT: u64 = 1024 * 1024 / LBA_SIZE as u64;

/// LBAs handed to the FAT32 partition (4 GiB).
pub const USABLE_BLOCKS: u64 = 4 * 1024 * 1024 * 1024 / LBA_SIZE as u64;

/// Whole-disk size in LBAs: 1 MiB of metadata on each side of the partition.
pub const TOTAL_BLOCKS: u64 = 2 * ALIGNMENT + USABLE_BLOCKS;

/// Sized so the MBR + primary header + entry array fill the first MiB
/// exactly: (`ALIGNMENT` − 2) LBAs of entries, 16 entries per LBA.
pub const NUM_PARTITION_ENTRIES: u32 = (ALIGNMENT * 4 - 8) as u32;
pub const PARTITION_ENTRY_SIZE: u32 = 128;

/// UTF-16LE, null-padded to 36 code units on disk.
pub const PARTITION_NAME: &str = "BontaOS.hdd1";

/// Represents a "middle-endian" 128 bit GUID (as used in GPT).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid {
    first: u32,
    second: u16,
    third: u16,
    fourth: u16,
    fifth_p1: u16, // Since we don't have 48 bit types...
    fifth_p2: u32,
}

impl Guid {
    pub fn from_mixed_u128(u: u128) -> Self {
        Self::from_mixed(u.to_le_bytes())
    }

    /// The well-known EFI System Partition type GUID.
    pub fn efi_system_partition() -> Self {
        Guid::from_mixed_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93Bu128)
    }

    pub fn from_mixed([
        p, o, n, m,
        l, k,
        j, i,
        g, h,
        e, f,
        a, b, c, d,
    ]: [u8; 16]) -> Self {
        Self {
            first: u32::from_le_bytes([a, b, c, d]),
            second: u16::from_le_bytes([e, f]),
            third: u16::from_le_bytes([g, h]),
            fourth: u16::from_be_bytes([i, j]),
            fifth_p1: u16::from_be_bytes([k, l]),
            fifth_p2: u32::from_be_bytes([m, n, o, p]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let [a, b, c, d] = self.first.to_le_bytes();
        let [e, f] = self.second.to_le_bytes();
        let [g, h] = self.third.to_le_bytes();
        let [i, j] = self.fourth.to_be_bytes();
        let [k, l] = self.fifth_p1.to_be_bytes();
        let [m, n, o, p] = self.fifth_p2.to_be_bytes();

        [a, b, c, d, e, f, g, h, i, j, k, l, m, n, o, p]
    }

    pub fn from_bytes([
        a, b, c, d,
        e, f,
        g, h,
        i, j,
        k, l,
        m, n, o, p
    ]: [u8; 16]) -> Self {
        Self {
            first: u32::from_le_bytes([a, b, c, d]),
            second: u16::from_le_bytes([e, f]),
            third: u16::from_le_bytes([g, h]),
            fourth: u16::from_be_bytes([i, j]),
            fifth_p1: u16::from_be_bytes([k, l]),
            fifth_p2: u32::from_be_bytes([m, n, o, p]),
        }
    }
}

impl Debug for Guid {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{:08X}-{:04X}-{:04X}-{:04X}-{:04X}{:08X}",
            self.first,
            self.second,
            self.third,
            self.fourth,
            self.fifth_p1,
            self.fifth_p2,
        )
    }
}

macro_rules! put {
    ($buf:ident, $offset:expr, $val:expr) => {{
        let bytes = $val.to_le_bytes();
        $buf[$offset..($offset + bytes.len())].copy_from_slice(&bytes);
    }};
}

/// One LBA declaring the whole disk as a single 0xEE partition so legacy
/// tools leave it alone.
pub fn protective_mbr() -> [u8; LBA_SIZE] {
    let mut mbr = [0u8; LBA_SIZE];

    // Boot code and the disk signature stay zero. Partition record 0 starts
    // at offset 446; records 1-3 stay zero.
    mbr[446] = 0x00; // BootIndicator
    mbr[447..450].copy_from_slice(&[0x00, 0x02, 0x00]); // StartingCHS
    mbr[450] = 0xEE; // OsType: GPT protective
    mbr[451..454].copy_from_slice(&[0xFF, 0xFF, 0xFF]); // EndingCHS
    put!(mbr, 454, 1u32); // StartingLBA
    put!(mbr, 458, (TOTAL_BLOCKS - 1) as u32); // SizeInLBA

    put!(mbr, 510, 0xAA55u16);

    mbr
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    /// Header size in little endian (always 92 bytes here).
    pub header_size: u32,
    /// CRC32 of the start of the header up to [`GptHeader::header_size`],
    /// computed with this field zeroed.
    pub header_crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    /// First usable LBA for partitions (primary partition table last LBA + 1)
    pub first_usable_lba: u64,
    /// Last usable LBA (secondary partition table first LBA − 1)
    pub last_usable_lba: u64,
    /// Disk GUID in mixed endian; shared by both headers.
    pub disk_guid: Guid,
    /// Starting LBA of array of partition entries (always 2 in primary copy).
    pub partition_entries_starting_lba: u64,
    /// Number of partition entries in array.
    pub num_partition_entries: u32,
    /// Size of a single partition entry (usually 128 bytes).
    pub partition_entry_size: u32,
    /// CRC32 of partition entries array in little endian.
    pub partition_entries_crc32: u32,
}

impl GptHeader {
    /// The header at LBA 1.
    pub fn primary(disk_guid: Guid, partition_entries_crc32: u32) -> Self {
        Self::new(1, TOTAL_BLOCKS - 1, 2, disk_guid, partition_entries_crc32)
    }

    /// The mirror at the last LBA, pointing back at LBA 1 and at the backup
    /// entry array just below it.
    pub fn backup(disk_guid: Guid, partition_entries_crc32: u32) -> Self {
        Self::new(
            TOTAL_BLOCKS - 1,
            1,
            TOTAL_BLOCKS - ALIGNMENT + 1,
            disk_guid,
            partition_entries_crc32,
        )
    }

    fn new(
        current_lba: u64,
        backup_lba: u64,
        partition_entries_starting_lba: u64,
        disk_guid: Guid,
        partition_entries_crc32: u32,
    ) -> Self {
        let mut header = Self {
            revision: GPT_REVISION,
            header_size: 92,
            header_crc32: 0,
            current_lba,
            backup_lba,
            first_usable_lba: ALIGNMENT,
            last_usable_lba: TOTAL_BLOCKS - ALIGNMENT,
            disk_guid,
            partition_entries_starting_lba,
            num_partition_entries: NUM_PARTITION_ENTRIES,
            partition_entry_size: PARTITION_ENTRY_SIZE,
            partition_entries_crc32,
        };

        // The header CRC covers the 92 meaningful bytes with the CRC field
        // itself still zero.
        header.header_crc32 = crc32(&header.to_lba()[..92]);
        header
    }

    pub fn to_lba(&self) -> [u8; LBA_SIZE] {
        let mut sector = [0u8; LBA_SIZE];

        sector[0..8].copy_from_slice(&GPT_SIGNATURE);
        put!(sector, 8, self.revision);
        put!(sector, 12, self.header_size);
        put!(sector, 16, self.header_crc32);
        // Offset 20: reserved, zero.
        put!(sector, 24, self.current_lba);
        put!(sector, 32, self.backup_lba);
        put!(sector, 40, self.first_usable_lba);
        put!(sector, 48, self.last_usable_lba);
        sector[56..72].copy_from_slice(&self.disk_guid.to_bytes());
        put!(sector, 72, self.partition_entries_starting_lba);
        put!(sector, 80, self.num_partition_entries);
        put!(sector, 84, self.partition_entry_size);
        put!(sector, 88, self.partition_entries_crc32);

        sector
    }
}

#[derive(Clone)]
pub struct PartitionEntry {
    pub partition_type: Guid,
    pub unique_guid: Guid,
    // Little endian
    pub first_lba: u64,
    // Little endian, inclusive
    pub last_lba: u64,
    // bit 60 denotes read only
    pub attribute_flags: u64,
    // UTF-16 LE.
    pub name: [u16; 36],
}

impl Debug for PartitionEntry {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct(core::any::type_name::<Self>())
            .field("partition_type", &self.partition_type)
            .field("unique_guid", &self.unique_guid)
            .field("first_lba", &self.first_lba)
            .field("last_lba", &self.last_lba)
            .field("attribute_flags", &self.attribute_flags)
            .field(
                "name",
                &String::from_utf16_lossy(
                    &self.name[..self.name.iter().position(|u| *u == 0).unwrap_or(36)],
                ),
            )
            .finish()
    }
}

impl PartitionEntry {
    /// Entry 0 of the array: the EFI System Partition holding the FAT32
    /// volume, spanning all usable blocks.
    pub fn efi_system(unique_guid: Guid) -> Self {
        Self {
            partition_type: Guid::efi_system_partition(),
            unique_guid,
            first_lba: ALIGNMENT,
            last_lba: TOTAL_BLOCKS - ALIGNMENT,
            attribute_flags: 0,
            name: {
                let mut buf = [0u16; 36];

                for (i, unit) in PARTITION_NAME.encode_utf16().enumerate() {
                    buf[i] = unit;
                }

                buf
            },
        }
    }

    pub fn write(&self, entry: &mut [u8]) {
        assert_eq!(PARTITION_ENTRY_SIZE as usize, entry.len());

        entry[0..16].copy_from_slice(&self.partition_type.to_bytes());
        entry[16..32].copy_from_slice(&self.unique_guid.to_bytes());
        put!(entry, 32, self.first_lba);
        put!(entry, 40, self.last_lba);
        put!(entry, 48, self.attribute_flags);

        for (i, unit) in self.name.iter().enumerate() {
            put!(entry, 56 + 2 * i, *unit);
        }
    }
}

/// The full partition entry array: `entry0` followed by zeroed entries.
pub fn partition_entry_array(entry0: &PartitionEntry) -> Vec<u8> {
    let mut array = vec![0u8; (NUM_PARTITION_ENTRIES * PARTITION_ENTRY_SIZE) as usize];
    entry0.write(&mut array[..PARTITION_ENTRY_SIZE as usize]);

    array
}

#[cfg(test)]
mod gpt_tests {
    use super::*;

    // Test case comes from here: https://developer.apple.com/library/archive/technotes/tn2166/_index.html#//apple_ref/doc/uid/DTS10003927-CH1-SUBSECTION11
    #[test]
    fn guid_mixed_to_disk() {
        assert_eq!(
            Guid::efi_system_partition().to_bytes(),
            [0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e, 0xc9, 0x3b],
        )
    }

    #[test]
    fn roundtrip() {
        fn trip(a: u128) {
            let g = Guid::from_mixed_u128(a);

            assert_eq!(g, Guid::from_bytes(g.to_bytes()));
        }

        trip(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93Bu128);
    }

    #[test]
    fn geometry() {
        assert_eq!(8_392_704, TOTAL_BLOCKS);
        assert_eq!(8184, NUM_PARTITION_ENTRIES);

        // MBR + header + entry array == first alignment boundary.
        let metadata_lbas = 2 + (NUM_PARTITION_ENTRIES * PARTITION_ENTRY_SIZE) as u64 / LBA_SIZE as u64;
        assert_eq!(ALIGNMENT, metadata_lbas);
    }

    #[test]
    fn protective_mbr_record() {
        let mbr = protective_mbr();

        assert_eq!(&[0x55, 0xAA], &mbr[510..]);
        assert_eq!(0x00, mbr[446]);
        assert_eq!(0xEE, mbr[450]);
        assert_eq!(1, u32::from_le_bytes(mbr[454..458].try_into().unwrap()));
        assert_eq!(
            (TOTAL_BLOCKS - 1) as u32,
            u32::from_le_bytes(mbr[458..462].try_into().unwrap()),
        );

        // Boot code area untouched.
        assert!(mbr[..446].iter().all(|b| *b == 0));
        // Records 1-3 untouched.
        assert!(mbr[462..510].iter().all(|b| *b == 0));
    }

    #[test]
    fn header_serialization() {
        let guid = Guid::from_mixed_u128(0x11223344_5566_7788_99AA_BBCCDDEEFF00u128);
        let header = GptHeader::primary(guid, 0xDEAD_BEEF);
        let lba = header.to_lba();

        assert_eq!(GPT_SIGNATURE, lba[0..8]);
        assert_eq!(GPT_REVISION, u32::from_le_bytes(lba[8..12].try_into().unwrap()));
        assert_eq!(92, u32::from_le_bytes(lba[12..16].try_into().unwrap()));
        assert_eq!(1, u64::from_le_bytes(lba[24..32].try_into().unwrap()));
        assert_eq!(TOTAL_BLOCKS - 1, u64::from_le_bytes(lba[32..40].try_into().unwrap()));
        assert_eq!(ALIGNMENT, u64::from_le_bytes(lba[40..48].try_into().unwrap()));
        assert_eq!(TOTAL_BLOCKS - ALIGNMENT, u64::from_le_bytes(lba[48..56].try_into().unwrap()));
        assert_eq!(guid.to_bytes(), lba[56..72]);
        assert_eq!(2, u64::from_le_bytes(lba[72..80].try_into().unwrap()));
        assert_eq!(NUM_PARTITION_ENTRIES, u32::from_le_bytes(lba[80..84].try_into().unwrap()));
        assert_eq!(PARTITION_ENTRY_SIZE, u32::from_le_bytes(lba[84..88].try_into().unwrap()));
        assert_eq!(0xDEAD_BEEF, u32::from_le_bytes(lba[88..92].try_into().unwrap()));

        // Rest of the LBA is reserved-zero.
        assert!(lba[92..].iter().all(|b| *b == 0));
    }

    #[test]
    fn header_crc_verifies() {
        let guid = Guid::from_mixed_u128(0x01020304_0506_0708_090A_0B0C0D0E0F10u128);

        for header in [GptHeader::primary(guid, 123), GptHeader::backup(guid, 123)] {
            let mut lba = header.to_lba();
            let stored = u32::from_le_bytes(lba[16..20].try_into().unwrap());

            lba[16..20].copy_from_slice(&[0; 4]);
            assert_eq!(stored, crate::crc32::crc32(&lba[..92]));
        }
    }

    #[test]
    fn primary_and_backup_mirror_each_other() {
        let guid = Guid::from_mixed_u128(0xC0FFEE);
        let primary = GptHeader::primary(guid, 7);
        let backup = GptHeader::backup(guid, 7);

        assert_eq!(primary.current_lba, backup.backup_lba);
        assert_eq!(primary.backup_lba, backup.current_lba);
        assert_eq!(primary.disk_guid, backup.disk_guid);
        assert_eq!(primary.first_usable_lba, backup.first_usable_lba);
        assert_eq!(primary.last_usable_lba, backup.last_usable_lba);
        assert_eq!(
            TOTAL_BLOCKS - ALIGNMENT + 1,
            backup.partition_entries_starting_lba,
        );
    }

    #[test]
    fn entry_array_layout() {
        let unique = Guid::from_mixed_u128(0xAABBCCDD_EEFF_0011_2233_445566778899u128);
        let array = partition_entry_array(&PartitionEntry::efi_system(unique));

        assert_eq!((NUM_PARTITION_ENTRIES * PARTITION_ENTRY_SIZE) as usize, array.len());

        assert_eq!(Guid::efi_system_partition().to_bytes(), array[0..16]);
        assert_eq!(unique.to_bytes(), array[16..32]);
        assert_eq!(ALIGNMENT, u64::from_le_bytes(array[32..40].try_into().unwrap()));
        assert_eq!(
            TOTAL_BLOCKS - ALIGNMENT,
            u64::from_le_bytes(array[40..48].try_into().unwrap()),
        );

        // "BontaOS.hdd1" in UTF-16LE, null-padded to 36 units.
        let mut name = [0u8; 72];
        for (i, unit) in PARTITION_NAME.encode_utf16().enumerate() {
            name[2 * i..2 * i + 2].copy_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(name, array[56..128]);

        // Entries 1.. are all zero.
        assert!(array[128..].iter().all(|b| *b == 0));
    }
}
