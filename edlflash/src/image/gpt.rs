//! GUID Partition Table codec.
//!
//! ```text
//! LBA 0            protective MBR
//! LBA 1            primary header (92 bytes used)
//! LBA 2..          primary entry array
//! ...
//! LBA last-N..     backup entry array
//! LBA last         backup header
//! ```
//!
//! Both the header and the entry array carry a CRC32 (ISO-HDLC). The header
//! CRC covers `header_size` bytes with its own CRC field zeroed.

use {
    crate::error::{Error, Result},
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    crc::{CRC_32_ISO_HDLC, Crc},
    std::io::{Cursor, Read},
};

/// CRC used by every GPT checksum.
pub const GPT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// `EFI PART`.
pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// Revision 1.0.
pub const GPT_REVISION: u32 = 0x0001_0000;

/// Size of the header proper.
pub const GPT_HEADER_SIZE: usize = 92;

/// Standard entry size.
pub const GPT_ENTRY_SIZE: usize = 128;

/// Largest entry count accepted from a header.
pub const GPT_MAX_ENTRIES: u32 = 1024;

/// Largest entry size accepted from a header.
pub const GPT_MAX_ENTRY_SIZE: u32 = 4096;

/// CRC32 over `bytes`.
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    GPT_CRC.checksum(bytes)
}

fn short(what: &str) -> Error {
    Error::InvalidImage(format!("{what} is truncated"))
}

/// GPT header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    /// Header revision.
    pub revision: u32,
    /// Bytes covered by the header CRC.
    pub header_size: u32,
    /// CRC stored in the header.
    pub header_crc32: u32,
    /// LBA of this copy.
    pub my_lba: u64,
    /// LBA of the other copy.
    pub alternate_lba: u64,
    /// First LBA available to partitions.
    pub first_usable_lba: u64,
    /// Last LBA available to partitions.
    pub last_usable_lba: u64,
    /// Disk GUID, on-disk byte order.
    pub disk_guid: [u8; 16],
    /// First LBA of this copy's entry array.
    pub partition_entry_lba: u64,
    /// Number of entries.
    pub num_entries: u32,
    /// Size of one entry.
    pub entry_size: u32,
    /// CRC of the entry array.
    pub entries_crc32: u32,
}

impl GptHeader {
    /// Parse a header from the start of `bytes` (usually one sector).
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GPT_HEADER_SIZE {
            return Err(short("GPT header"));
        }
        if bytes[..8] != GPT_SIGNATURE {
            return Err(Error::InvalidImage("missing EFI PART signature".into()));
        }

        let mut cur = Cursor::new(&bytes[8..]);
        let header = read_header_fields(&mut cur).map_err(|_| short("GPT header"))?;

        if (header.header_size as usize) < GPT_HEADER_SIZE || header.header_size as usize > bytes.len() {
            return Err(Error::InvalidImage(format!(
                "GPT header size {} is out of range",
                header.header_size
            )));
        }
        if !(GPT_ENTRY_SIZE as u32..=GPT_MAX_ENTRY_SIZE).contains(&header.entry_size)
            || header.entry_size % GPT_ENTRY_SIZE as u32 != 0
        {
            return Err(Error::InvalidImage(format!(
                "GPT entry size {} is invalid",
                header.entry_size
            )));
        }
        if header.num_entries == 0 || header.num_entries > GPT_MAX_ENTRIES {
            return Err(Error::InvalidImage(format!(
                "GPT entry count {} is out of range",
                header.num_entries
            )));
        }
        Ok(header)
    }

    /// Serialize to `header_size` bytes with a freshly computed header CRC.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.encode(0);
        let crc = crc32(&buf);
        buf[16..20].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    fn encode(&self, crc: u32) -> Vec<u8> {
        let size = (self.header_size as usize).max(GPT_HEADER_SIZE);
        let mut buf = Vec::with_capacity(size);
        buf.extend_from_slice(&GPT_SIGNATURE);
        buf.write_u32::<LittleEndian>(self.revision).unwrap();
        buf.write_u32::<LittleEndian>(self.header_size).unwrap();
        buf.write_u32::<LittleEndian>(crc).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u64::<LittleEndian>(self.my_lba).unwrap();
        buf.write_u64::<LittleEndian>(self.alternate_lba).unwrap();
        buf.write_u64::<LittleEndian>(self.first_usable_lba).unwrap();
        buf.write_u64::<LittleEndian>(self.last_usable_lba).unwrap();
        buf.extend_from_slice(&self.disk_guid);
        buf.write_u64::<LittleEndian>(self.partition_entry_lba).unwrap();
        buf.write_u32::<LittleEndian>(self.num_entries).unwrap();
        buf.write_u32::<LittleEndian>(self.entry_size).unwrap();
        buf.write_u32::<LittleEndian>(self.entries_crc32).unwrap();
        buf.resize(size, 0);
        buf
    }

    /// Whether the stored header CRC matches the contents.
    #[must_use]
    pub fn header_crc_valid(&self) -> bool {
        crc32(&self.encode(0)) == self.header_crc32
    }

    /// Bytes occupied by the entry array.
    #[must_use]
    pub fn entries_len(&self) -> usize {
        (self.num_entries as usize).saturating_mul(self.entry_size as usize)
    }

    /// Sectors occupied by the entry array.
    #[must_use]
    pub fn entry_sectors(&self, sector_size: usize) -> u64 {
        self.entries_len()
            .div_ceil(sector_size) as u64
    }

    /// Check both CRCs against `entries` (the raw array for this copy).
    pub fn verify(&self, entries: &[u8]) -> std::result::Result<(), String> {
        if !self.header_crc_valid() {
            return Err(format!("header CRC mismatch at LBA {}", self.my_lba));
        }
        let len = self.entries_len();
        let Some(array) = entries.get(..len) else {
            return Err(format!("entry array shorter than {len} bytes"));
        };
        let actual = crc32(array);
        if actual != self.entries_crc32 {
            return Err(format!(
                "entry array CRC 0x{actual:08x} does not match header 0x{:08x}",
                self.entries_crc32
            ));
        }
        Ok(())
    }

    /// Header for the backup copy, with its entry array just before it.
    ///
    /// The backup array must lie entirely after the primary one.
    pub fn backup(&self, sector_size: usize) -> Result<Self> {
        let entry_sectors = self.entry_sectors(sector_size);
        let primary_end = self
            .partition_entry_lba
            .saturating_add(entry_sectors);
        let entry_lba = self
            .alternate_lba
            .checked_sub(entry_sectors)
            .filter(|lba| *lba >= primary_end)
            .ok_or_else(|| {
                Error::InvalidImage(format!(
                    "backup GPT at LBA {} leaves no room for {entry_sectors} entry sectors",
                    self.alternate_lba
                ))
            })?;

        let mut backup = self.clone();
        backup.my_lba = self.alternate_lba;
        backup.alternate_lba = self.my_lba;
        backup.partition_entry_lba = entry_lba;
        backup.header_crc32 = crc32(&backup.encode(0));
        Ok(backup)
    }
}

fn read_header_fields(cur: &mut Cursor<&[u8]>) -> std::io::Result<GptHeader> {
    let revision = cur.read_u32::<LittleEndian>()?;
    let header_size = cur.read_u32::<LittleEndian>()?;
    let header_crc32 = cur.read_u32::<LittleEndian>()?;
    let _reserved = cur.read_u32::<LittleEndian>()?;
    let my_lba = cur.read_u64::<LittleEndian>()?;
    let alternate_lba = cur.read_u64::<LittleEndian>()?;
    let first_usable_lba = cur.read_u64::<LittleEndian>()?;
    let last_usable_lba = cur.read_u64::<LittleEndian>()?;
    let mut disk_guid = [0u8; 16];
    cur.read_exact(&mut disk_guid)?;

    Ok(GptHeader {
        revision,
        header_size,
        header_crc32,
        my_lba,
        alternate_lba,
        first_usable_lba,
        last_usable_lba,
        disk_guid,
        partition_entry_lba: cur.read_u64::<LittleEndian>()?,
        num_entries: cur.read_u32::<LittleEndian>()?,
        entry_size: cur.read_u32::<LittleEndian>()?,
        entries_crc32: cur.read_u32::<LittleEndian>()?,
    })
}

/// One partition entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptEntry {
    /// Partition type GUID, on-disk byte order.
    pub type_guid: [u8; 16],
    /// Unique partition GUID, on-disk byte order.
    pub unique_guid: [u8; 16],
    /// First LBA.
    pub first_lba: u64,
    /// Last LBA (inclusive).
    pub last_lba: u64,
    /// Attribute flags.
    pub attributes: u64,
    /// Partition name.
    pub name: String,
}

impl GptEntry {
    /// Parse one entry.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GPT_ENTRY_SIZE {
            return Err(short("GPT entry"));
        }
        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&bytes[..16]);
        let mut unique_guid = [0u8; 16];
        unique_guid.copy_from_slice(&bytes[16..32]);

        let word = |at: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(w)
        };

        let units: Vec<u16> = bytes[56..128]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|u| *u != 0)
            .collect();

        Ok(Self {
            type_guid,
            unique_guid,
            first_lba: word(32),
            last_lba: word(40),
            attributes: word(48),
            name: String::from_utf16_lossy(&units),
        })
    }

    /// Serialize to 128 bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; GPT_ENTRY_SIZE] {
        let mut buf = [0u8; GPT_ENTRY_SIZE];
        buf[..16].copy_from_slice(&self.type_guid);
        buf[16..32].copy_from_slice(&self.unique_guid);
        buf[32..40].copy_from_slice(&self.first_lba.to_le_bytes());
        buf[40..48].copy_from_slice(&self.last_lba.to_le_bytes());
        buf[48..56].copy_from_slice(&self.attributes.to_le_bytes());
        for (i, unit) in self
            .name
            .encode_utf16()
            .take(36)
            .enumerate()
        {
            buf[56 + i * 2..58 + i * 2].copy_from_slice(&unit.to_le_bytes());
        }
        buf
    }

    /// Unused slots have an all-zero type GUID.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.type_guid != [0u8; 16]
    }

    /// Number of sectors covered.
    pub fn sectors(&self) -> Result<u64> {
        self.last_lba
            .checked_sub(self.first_lba)
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| {
                Error::InvalidImage(format!(
                    "partition \"{}\" ends at LBA {} before it starts at LBA {}",
                    self.name, self.last_lba, self.first_lba
                ))
            })
    }
}

/// A parsed table: one header plus the entries it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gpt {
    /// Header of this copy.
    pub header: GptHeader,
    /// Used entries, in table order.
    pub entries: Vec<GptEntry>,
    /// The raw entry array as stored.
    pub raw_entries: Vec<u8>,
}

impl Gpt {
    /// Build from a header and the raw array it points at.
    pub fn from_parts(header: GptHeader, raw_entries: Vec<u8>) -> Result<Self> {
        if raw_entries.len() < header.entries_len() {
            return Err(short("GPT entry array"));
        }
        let entries = raw_entries[..header.entries_len()]
            .chunks_exact(header.entry_size as usize)
            .map(GptEntry::parse)
            .filter(|e| e.as_ref().map_or(true, GptEntry::is_used))
            .collect::<Result<Vec<_>>>()?;
        for entry in &entries {
            entry.sectors()?;
        }
        Ok(Self {
            header,
            entries,
            raw_entries,
        })
    }

    /// Parse a primary table image starting at LBA 0 (protective MBR first).
    pub fn parse_primary(image: &[u8], sector_size: usize) -> Result<Self> {
        let header_bytes = image
            .get(sector_size..2 * sector_size)
            .ok_or_else(|| short("GPT image"))?;
        let header = GptHeader::parse(header_bytes)?;

        let len = header.entries_len();
        let raw = usize::try_from(header.partition_entry_lba)
            .ok()
            .and_then(|lba| lba.checked_mul(sector_size))
            .and_then(|start| image.get(start..start.checked_add(len)?))
            .ok_or_else(|| short("GPT image"))?
            .to_vec();
        Self::from_parts(header, raw)
    }

    /// Look a partition up by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&GptEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name)
    }

    /// Verify both CRCs of this copy.
    pub fn verify(&self) -> std::result::Result<(), String> {
        self.header
            .verify(&self.raw_entries)
    }

    /// Sectors from LBA 0 through the end of the primary entry array.
    #[must_use]
    pub fn primary_sectors(&self, sector_size: usize) -> u64 {
        self.header
            .partition_entry_lba
            .saturating_add(self.header.entry_sectors(sector_size))
    }

    /// The backup copy: entry array sectors followed by the header sector,
    /// and the LBA where they start.
    pub fn backup_image(&self, sector_size: usize) -> Result<(u64, Vec<u8>)> {
        let header = self.header.backup(sector_size)?;
        let entry_bytes = header.entry_sectors(sector_size) as usize * sector_size;

        let mut image = vec![0u8; entry_bytes + sector_size];
        let len = self.header.entries_len();
        image[..len].copy_from_slice(&self.raw_entries[..len]);
        let header_bytes = header.to_bytes();
        image[entry_bytes..entry_bytes + header_bytes.len()].copy_from_slice(&header_bytes);

        Ok((header.partition_entry_lba, image))
    }
}

/// Build a minimal primary GPT image (protective MBR, header, entries).
///
/// Used to create fresh tables and in tests.
#[must_use]
pub fn build_primary(
    entries: &[GptEntry],
    disk_sectors: u64,
    sector_size: usize,
    disk_guid: [u8; 16],
) -> Vec<u8> {
    const NUM_ENTRIES: u32 = 128;

    let entry_sectors = (NUM_ENTRIES as usize * GPT_ENTRY_SIZE).div_ceil(sector_size) as u64;
    let mut raw = vec![0u8; NUM_ENTRIES as usize * GPT_ENTRY_SIZE];
    for (i, entry) in entries
        .iter()
        .take(NUM_ENTRIES as usize)
        .enumerate()
    {
        raw[i * GPT_ENTRY_SIZE..(i + 1) * GPT_ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
    }

    let mut header = GptHeader {
        revision: GPT_REVISION,
        header_size: GPT_HEADER_SIZE as u32,
        header_crc32: 0,
        my_lba: 1,
        alternate_lba: disk_sectors - 1,
        first_usable_lba: 2 + entry_sectors,
        last_usable_lba: disk_sectors - 2 - entry_sectors,
        disk_guid,
        partition_entry_lba: 2,
        num_entries: NUM_ENTRIES,
        entry_size: GPT_ENTRY_SIZE as u32,
        entries_crc32: crc32(&raw),
    };
    header.header_crc32 = crc32(&header.encode(0));

    let total = (2 + entry_sectors) as usize * sector_size;
    let mut image = vec![0u8; total];

    // Protective MBR: one 0xEE partition spanning the disk.
    let mbr = &mut image[..512];
    mbr[446 + 4] = 0xEE;
    mbr[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
    #[allow(clippy::cast_possible_truncation)]
    let span = (disk_sectors - 1).min(u64::from(u32::MAX)) as u32;
    mbr[446 + 12..446 + 16].copy_from_slice(&span.to_le_bytes());
    mbr[510] = 0x55;
    mbr[511] = 0xAA;

    let header_bytes = header.to_bytes();
    image[sector_size..sector_size + header_bytes.len()].copy_from_slice(&header_bytes);
    image[2 * sector_size..2 * sector_size + raw.len()].copy_from_slice(&raw);
    image
}
