//! `rawprogram*.xml` and `patch*.xml` flashing descriptions.
//!
//! A rawprogram file lists `<program>` elements naming an image file and
//! the sectors it goes to. The matching patch file lists `<patch>` elements
//! that fix up table fields (usually GPT sizes) once the images are written.

use {
    crate::{
        error::{Error, Result},
        protocol::firehose::{PatchParams, parse_number},
    },
    log::debug,
    std::{
        fs,
        path::{Path, PathBuf},
    },
    xmltree::{Element, XMLNode},
};

/// Where a program entry starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorStart {
    /// Absolute sector.
    Absolute(u64),
    /// `NUM_DISK_SECTORS-n.`: counted back from the end of the disk.
    FromEnd(u64),
}

impl SectorStart {
    /// Parse a number or a `NUM_DISK_SECTORS-n.` expression.
    pub fn parse(value: &str) -> Result<Self> {
        if let Some(n) = parse_number(value) {
            return Ok(Self::Absolute(n));
        }
        value
            .trim()
            .trim_end_matches('.')
            .strip_prefix("NUM_DISK_SECTORS-")
            .and_then(parse_number)
            .map(Self::FromEnd)
            .ok_or_else(|| Error::InvalidImage(format!("unsupported start_sector \"{value}\"")))
    }

    /// Absolute sector on a disk of `disk_sectors` sectors.
    #[must_use]
    pub fn resolve(self, disk_sectors: Option<u64>) -> Option<u64> {
        match self {
            Self::Absolute(n) => Some(n),
            Self::FromEnd(n) => disk_sectors.and_then(|d| d.checked_sub(n)),
        }
    }
}

/// One `<program>` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramEntry {
    /// Image file, relative to the XML file.
    pub filename: String,
    /// Partition label.
    pub label: String,
    /// First sector.
    pub start_sector: SectorStart,
    /// Sectors reserved for the image.
    pub num_sectors: u64,
    /// Physical partition (LUN).
    pub partition: u32,
    /// Offset into the image file, in sectors.
    pub file_sector_offset: u64,
    /// Sector size named by the entry.
    pub sector_size: Option<usize>,
}

fn attr<'a>(e: &'a Element, name: &str) -> Option<&'a str> {
    e.attributes
        .get(name)
        .map(String::as_str)
}

fn number(e: &Element, name: &str) -> Result<u64> {
    match attr(e, name) {
        None | Some("") => Ok(0),
        Some(v) => parse_number(v).ok_or_else(|| {
            Error::InvalidImage(format!("<{}> {name}=\"{v}\" is not a number", e.name))
        }),
    }
}

fn elements<'a>(root: &'a Element, tag: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
    root.children
        .iter()
        .filter_map(move |n| match n {
            XMLNode::Element(e) if e.name == tag => Some(e),
            _ => None,
        })
}

fn parse_root(bytes: &[u8]) -> Result<Element> {
    Element::parse(bytes).map_err(|e| Error::InvalidImage(format!("bad XML: {e}")))
}

/// Parse a rawprogram document. Entries without a file are skipped.
#[allow(clippy::cast_possible_truncation)]
pub fn parse_rawprogram(bytes: &[u8]) -> Result<Vec<ProgramEntry>> {
    let root = parse_root(bytes)?;
    let mut entries = Vec::new();

    for e in elements(&root, "program") {
        let filename = attr(e, "filename").unwrap_or_default();
        if filename.is_empty() {
            debug!(
                "Skipping program entry without a file ({})",
                attr(e, "label").unwrap_or("unlabeled")
            );
            continue;
        }

        let sector_size = number(e, "SECTOR_SIZE_IN_BYTES")?;
        entries.push(ProgramEntry {
            filename: filename.to_string(),
            label: attr(e, "label")
                .unwrap_or_default()
                .to_string(),
            start_sector: SectorStart::parse(attr(e, "start_sector").unwrap_or("0"))?,
            num_sectors: number(e, "num_partition_sectors")?,
            partition: number(e, "physical_partition_number")? as u32,
            file_sector_offset: number(e, "file_sector_offset")?,
            sector_size: (sector_size > 0).then_some(sector_size as usize),
        });
    }

    Ok(entries)
}

/// Parse a patch document, keeping only entries aimed at the device.
#[allow(clippy::cast_possible_truncation)]
pub fn parse_patch(bytes: &[u8], default_sector_size: usize) -> Result<Vec<PatchParams>> {
    let root = parse_root(bytes)?;
    let mut patches = Vec::new();

    for e in elements(&root, "patch") {
        if attr(e, "filename") != Some("DISK") {
            continue;
        }
        let sector_size = number(e, "SECTOR_SIZE_IN_BYTES")? as usize;
        patches.push(PatchParams {
            sector_size: if sector_size == 0 {
                default_sector_size
            } else {
                sector_size
            },
            byte_offset: number(e, "byte_offset")?,
            partition: number(e, "physical_partition_number")? as u32,
            size_in_bytes: number(e, "size_in_bytes")? as u32,
            start_sector: attr(e, "start_sector")
                .unwrap_or("0")
                .to_string(),
            value: attr(e, "value")
                .unwrap_or("0")
                .to_string(),
        });
    }

    Ok(patches)
}

/// A rawprogram file loaded from disk.
#[derive(Debug, Clone)]
pub struct ProgramFile {
    /// Path of the XML file.
    pub path: PathBuf,
    /// Its entries.
    pub entries: Vec<ProgramEntry>,
    /// Directory holding the images; `None` means next to the XML file.
    pub image_dir: Option<PathBuf>,
}

impl ProgramFile {
    /// Load and parse.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            entries: parse_rawprogram(&bytes)?,
            image_dir: None,
        })
    }

    /// Look for images in `dir` instead of next to the XML file.
    #[must_use]
    pub fn with_image_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.image_dir = dir;
        self
    }

    /// Full path of an entry's image file.
    #[must_use]
    pub fn image_path(&self, entry: &ProgramEntry) -> PathBuf {
        match &self.image_dir {
            Some(dir) => dir.join(&entry.filename),
            None => self
                .path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(&entry.filename),
        }
    }

    /// Whether this is a `rawprogram` file that may have a patch companion.
    #[must_use]
    pub fn is_rawprogram(&self) -> bool {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains("rawprogram"))
    }

    /// `rawprogramN.xml` pairs with `patchN.xml` in the same directory.
    #[must_use]
    pub fn patch_path(&self) -> Option<PathBuf> {
        let name = self
            .path
            .file_name()?
            .to_str()?;
        if !name.contains("rawprogram") {
            return None;
        }
        let candidate = self
            .path
            .with_file_name(name.replacen("rawprogram", "patch", 1));
        candidate
            .is_file()
            .then_some(candidate)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::io::Write};

    const RAWPROGRAM: &[u8] = br#"<?xml version="1.0" ?>
<data>
  <program SECTOR_SIZE_IN_BYTES="4096" file_sector_offset="0" filename="xbl.elf" label="xbl_a" num_partition_sectors="896" physical_partition_number="1" start_sector="6" />
  <program SECTOR_SIZE_IN_BYTES="4096" file_sector_offset="0" filename="" label="reserved" num_partition_sectors="32" physical_partition_number="1" start_sector="902" />
  <program SECTOR_SIZE_IN_BYTES="4096" file_sector_offset="0" filename="gpt_backup1.bin" label="BackupGPT" num_partition_sectors="5" physical_partition_number="1" start_sector="NUM_DISK_SECTORS-5." />
</data>"#;

    const PATCH: &[u8] = br#"<?xml version="1.0" ?>
<patches>
  <patch SECTOR_SIZE_IN_BYTES="4096" byte_offset="48" filename="DISK" physical_partition_number="1" size_in_bytes="8" start_sector="1" value="NUM_DISK_SECTORS-6." what="Update last partition" />
  <patch SECTOR_SIZE_IN_BYTES="4096" byte_offset="48" filename="gpt_main1.bin" physical_partition_number="1" size_in_bytes="8" start_sector="1" value="NUM_DISK_SECTORS-6." what="host copy" />
</patches>"#;

    #[test]
    fn test_parse_rawprogram_entries() {
        let entries = parse_rawprogram(RAWPROGRAM).unwrap();
        assert_eq!(entries.len(), 2);

        let xbl = &entries[0];
        assert_eq!(xbl.filename, "xbl.elf");
        assert_eq!(xbl.label, "xbl_a");
        assert_eq!(xbl.start_sector, SectorStart::Absolute(6));
        assert_eq!(xbl.num_sectors, 896);
        assert_eq!(xbl.partition, 1);
        assert_eq!(xbl.sector_size, Some(4096));

        assert_eq!(entries[1].start_sector, SectorStart::FromEnd(5));
        assert_eq!(entries[1].start_sector.resolve(Some(1000)), Some(995));
        assert_eq!(entries[1].start_sector.resolve(None), None);
    }

    #[test]
    fn test_parse_patch_keeps_disk_entries() {
        let patches = parse_patch(PATCH, 512).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].byte_offset, 48);
        assert_eq!(patches[0].sector_size, 4096);
        assert_eq!(patches[0].value, "NUM_DISK_SECTORS-6.");
    }

    #[test]
    fn test_bad_number_is_invalid_image() {
        let doc = br#"<data><program filename="a.bin" num_partition_sectors="lots" start_sector="0"/></data>"#;
        assert!(matches!(
            parse_rawprogram(doc),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_patch_companion_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("rawprogram3.xml");
        fs::File::create(&raw)
            .unwrap()
            .write_all(RAWPROGRAM)
            .unwrap();

        let file = ProgramFile::load(&raw).unwrap();
        assert!(file.is_rawprogram());
        assert!(file.patch_path().is_none());

        fs::write(dir.path().join("patch3.xml"), PATCH).unwrap();
        assert_eq!(file.patch_path(), Some(dir.path().join("patch3.xml")));
        assert_eq!(
            file.image_path(&file.entries[0]),
            dir.path().join("xbl.elf")
        );
    }

    #[test]
    fn test_image_dir_overrides_xml_location() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("rawprogram0.xml");
        fs::write(&raw, RAWPROGRAM).unwrap();

        let images = dir.path().join("images");
        let file = ProgramFile::load(&raw)
            .unwrap()
            .with_image_dir(Some(images.clone()));
        assert_eq!(file.image_path(&file.entries[0]), images.join("xbl.elf"));
        // the patch companion still sits next to the XML
        fs::write(dir.path().join("patch0.xml"), PATCH).unwrap();
        assert_eq!(file.patch_path(), Some(dir.path().join("patch0.xml")));
    }
}
