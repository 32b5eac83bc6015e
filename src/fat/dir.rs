//! Directory entries: the 32-byte records, 8.3 short names, and the FAT
//! time/date encoding.

use chrono::{Datelike, Local, NaiveDateTime, Timelike};

use core::fmt::{self, Debug};

pub const ENTRY_SIZE: usize = 32;

pub enum Attribute {
    ReadOnly = 0x01,
    Hidden = 0x02,
    System = 0x04,
    VolumeId = 0x08,
    Directory = 0x10,
    Archive = 0x20,
}

/// An 8.3 short name as stored on disk: 8 base bytes then 3 extension
/// bytes, space-padded, no dot.
#[repr(transparent)]
#[derive(Clone, PartialEq, Eq)]
pub struct ShortName(pub [u8; 11]);

impl ShortName {
    pub const DOT: ShortName = ShortName(*b".          ");
    pub const DOTDOT: ShortName = ShortName(*b"..         ");

    /// Formats a host file name: base characters go left-to-right, the
    /// extension (the part after the first '.') goes right-aligned into the
    /// last three bytes. Extensions longer than three characters keep their
    /// last three. Names are expected to already be valid 8.3; no case
    /// conversion happens.
    pub fn format(name: &str) -> Self {
        let mut out = [b' '; 11];
        let bytes = name.as_bytes();

        for (i, b) in bytes.iter().enumerate() {
            if *b == b'.' {
                let ext = &bytes[i + 1..];
                let ext = &ext[ext.len().saturating_sub(3)..];
                out[11 - ext.len()..].copy_from_slice(ext);

                return Self(out);
            }

            if i < out.len() {
                out[i] = *b;
            }
        }

        Self(out)
    }
}

impl Debug for ShortName {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            if *b != 0x20 {
                write!(fmt, "{}", *b as char)?;
            }
        }

        Ok(())
    }
}

/// A moment in FAT's packed encoding.
///
/// Date: `((year - 1980) << 9) | (month << 5) | day`.
/// Time: `(hour << 11) | (minute << 5) | (seconds / 2)`, seconds clamped to
/// 59 first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub time: u16,
    pub date: u16,
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    pub fn from_datetime(moment: NaiveDateTime) -> Self {
        let date = (((moment.year() - 1980) as u16) << 9)
            | ((moment.month() as u16) << 5)
            | (moment.day() as u16);

        let time = ((moment.hour() as u16) << 11)
            | ((moment.minute() as u16) << 5)
            | ((moment.second().min(59) as u16) / 2);

        Self { time, date }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    // Offset: 00
    pub name: ShortName,
    // Offset: 11
    pub attributes: u8,
    // Offset: 12
    pub nt_reserved: u8,
    // Offset: 13
    pub creation_time_tenth: u8,
    // Offset: 14
    pub creation_time: u16,
    // Offset: 16
    pub creation_date: u16,
    // Offset: 18
    pub last_access_date: u16,
    // Offset: 20
    pub first_cluster_high: u16,
    // Offset: 22
    pub write_time: u16,
    // Offset: 24
    pub write_date: u16,
    // Offset: 26
    pub first_cluster_low: u16,
    // Offset: 28
    pub file_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Exists,
    Deleted,
    End,
}

impl DirEntry {
    pub fn file(name: ShortName, first_cluster: u32, file_size: u32, stamp: Timestamp) -> Self {
        Self::new(name, 0, first_cluster, file_size, stamp)
    }

    pub fn directory(name: ShortName, first_cluster: u32, stamp: Timestamp) -> Self {
        Self::new(name, Attribute::Directory as u8, first_cluster, 0, stamp)
    }

    fn new(
        name: ShortName,
        attributes: u8,
        first_cluster: u32,
        file_size: u32,
        stamp: Timestamp,
    ) -> Self {
        Self {
            name,
            attributes,
            nt_reserved: 0,
            creation_time_tenth: 0,
            creation_time: stamp.time,
            creation_date: stamp.date,
            last_access_date: stamp.date,
            first_cluster_high: (first_cluster >> 16) as u16,
            write_time: stamp.time,
            write_date: stamp.date,
            first_cluster_low: first_cluster as u16,
            file_size,
        }
    }

    pub fn state(&self) -> State {
        match self.name.0[0] {
            0x00 => State::End,
            0xE5 => State::Deleted,
            _ => State::Exists,
        }
    }

    pub fn first_cluster(&self) -> u32 {
        (self.first_cluster_high as u32) << 16 | (self.first_cluster_low as u32)
    }

    pub fn is_directory(&self) -> bool {
        self.attributes & (Attribute::Directory as u8) != 0
    }

    pub fn write(&self, raw: &mut [u8]) {
        assert_eq!(ENTRY_SIZE, raw.len());

        macro_rules! put {
            ($offset:literal, $val:expr) => {{
                let bytes = $val.to_le_bytes();
                raw[$offset..($offset + bytes.len())].copy_from_slice(&bytes);
            }};
        }

        raw[0..11].copy_from_slice(&self.name.0);
        raw[11] = self.attributes;
        raw[12] = self.nt_reserved;
        raw[13] = self.creation_time_tenth;
        put!(14, self.creation_time);
        put!(16, self.creation_date);
        put!(18, self.last_access_date);
        put!(20, self.first_cluster_high);
        put!(22, self.write_time);
        put!(24, self.write_date);
        put!(26, self.first_cluster_low);
        put!(28, self.file_size);
    }

    pub fn parse(raw: &[u8]) -> Self {
        assert_eq!(ENTRY_SIZE, raw.len());

        macro_rules! e {
            ($ty:tt, $offset:literal) => {
                $ty::from_le_bytes(
                    raw[$offset..($offset + core::mem::size_of::<$ty>())]
                        .try_into()
                        .unwrap(),
                )
            };
        }

        Self {
            name: ShortName(raw[0..11].try_into().unwrap()),
            attributes: raw[11],
            nt_reserved: raw[12],
            creation_time_tenth: raw[13],
            creation_time: e!(u16, 14),
            creation_date: e!(u16, 16),
            last_access_date: e!(u16, 18),
            first_cluster_high: e!(u16, 20),
            write_time: e!(u16, 22),
            write_date: e!(u16, 24),
            first_cluster_low: e!(u16, 26),
            file_size: e!(u32, 28),
        }
    }
}

#[cfg(test)]
mod dir_tests {
    use super::*;

    use chrono::NaiveDate;

    #[test]
    fn short_names() {
        assert_eq!(*b"A       TXT", ShortName::format("A.TXT").0);
        assert_eq!(*b"KERNEL     ", ShortName::format("KERNEL").0);
        assert_eq!(*b"STARTUP NSH", ShortName::format("STARTUP.NSH").0);

        // Short extensions land right-aligned.
        assert_eq!(*b"A        IO", ShortName::format("A.IO").0);
        // Overlong extensions keep their tail and never spill into the base.
        assert_eq!(*b"B       PEG", ShortName::format("B.JPEG").0);
        // A trailing dot means an empty extension.
        assert_eq!(*b"FOO        ", ShortName::format("FOO.").0);
    }

    #[test]
    fn dot_names() {
        assert_eq!(*b".          ", ShortName::DOT.0);
        assert_eq!(*b"..         ", ShortName::DOTDOT.0);
    }

    #[test]
    fn timestamp_encoding() {
        let moment = NaiveDate::from_ymd_opt(2024, 5, 17)
            .unwrap()
            .and_hms_opt(14, 30, 59)
            .unwrap();
        let stamp = Timestamp::from_datetime(moment);

        assert_eq!(((2024 - 1980) << 9) | (5 << 5) | 17, stamp.date);
        assert_eq!((14 << 11) | (30 << 5) | 29, stamp.time);
    }

    #[test]
    fn entry_layout() {
        let stamp = Timestamp { time: 0x1234, date: 0x5678 };
        let entry = DirEntry::file(ShortName::format("A.TXT"), 0x0001_0002, 42, stamp);

        let mut raw = [0u8; ENTRY_SIZE];
        entry.write(&mut raw);

        assert_eq!(*b"A       TXT", raw[0..11]);
        assert_eq!(0x00, raw[11]);
        assert_eq!([0x34, 0x12], raw[14..16]); // creation time
        assert_eq!([0x78, 0x56], raw[16..18]); // creation date
        assert_eq!([0x78, 0x56], raw[18..20]); // last access date
        assert_eq!([0x01, 0x00], raw[20..22]); // first cluster, high half
        assert_eq!([0x34, 0x12], raw[22..24]); // write time
        assert_eq!([0x78, 0x56], raw[24..26]); // write date
        assert_eq!([0x02, 0x00], raw[26..28]); // first cluster, low half
        assert_eq!([42, 0, 0, 0], raw[28..32]);

        assert_eq!(entry, DirEntry::parse(&raw));
        assert_eq!(0x0001_0002, entry.first_cluster());
    }

    #[test]
    fn directory_entries_carry_the_attribute() {
        let stamp = Timestamp { time: 0, date: 0 };
        let entry = DirEntry::directory(ShortName::format("SUB"), 3, stamp);

        assert!(entry.is_directory());
        assert_eq!(0, entry.file_size);
        assert_eq!(3, entry.first_cluster());
        assert_eq!(State::Exists, entry.state());
    }

    #[test]
    fn sentinels() {
        let mut raw = [0u8; ENTRY_SIZE];
        assert_eq!(State::End, DirEntry::parse(&raw).state());

        raw[0] = 0xE5;
        assert_eq!(State::Deleted, DirEntry::parse(&raw).state());
    }
}
