//! Flashing a set of rawprogram files.
//!
//! Each `<program>` entry is one unit of work. A rejected entry is recorded
//! and the batch moves on; anything that costs the session its loader stops
//! the batch, since nothing after it could be sent.

use {
    super::Session,
    crate::{
        engine::CommandState,
        error::{Error, Result},
        image::{
            rawprogram::{ProgramEntry, ProgramFile, parse_patch},
            source::{FileSource, ImageSource},
        },
        protocol::firehose::SectorRange,
        transport::Transport,
    },
    log::{info, warn},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// What happened to one unit of a batch.
#[derive(Debug)]
pub enum Outcome {
    /// Image written.
    Written {
        /// Sectors programmed.
        sectors: u64,
    },
    /// Patch file applied.
    Patched {
        /// Patch entries sent.
        entries: usize,
    },
    /// Boot partition selected.
    Activated {
        /// Partition index.
        partition: u32,
    },
    /// Nothing to do.
    Skipped(String),
    /// Failed; the batch continued unless it was stopped here.
    Failed(Error),
}

/// One line of a [`BatchReport`].
#[derive(Debug)]
pub struct BatchEntry {
    /// XML file the entry came from.
    pub source: PathBuf,
    /// Partition label or image name.
    pub label: String,
    /// Result.
    pub outcome: Outcome,
}

/// Per-entry results of [`Session::flash_batch`].
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Results in the order the work was attempted.
    pub entries: Vec<BatchEntry>,
    /// Why the batch ended early, if it did.
    pub stopped: Option<String>,
}

impl BatchReport {
    fn record(&mut self, source: &Path, label: &str, outcome: Outcome) {
        self.entries.push(BatchEntry {
            source: source.to_path_buf(),
            label: label.to_string(),
            outcome,
        });
    }

    /// Entries that failed.
    pub fn failures(&self) -> impl Iterator<Item = &BatchEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, Outcome::Failed(_)))
    }

    /// Number of images written.
    #[must_use]
    pub fn written(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, Outcome::Written { .. }))
            .count()
    }

    /// Whether everything succeeded and the batch ran to the end.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.stopped.is_none() && self.failures().next().is_none()
    }
}

fn label_of(entry: &ProgramEntry) -> &str {
    if entry.label.is_empty() {
        &entry.filename
    } else {
        &entry.label
    }
}

impl<T: Transport> Session<T> {
    /// Program every entry of `files` in order.
    ///
    /// `progress` receives `(label, bytes_done, bytes_total)`. A file named
    /// `rawprogramN.xml` is followed by its `patchN.xml` when all of its
    /// entries were written. The configured active partition is selected
    /// at the end of a batch that was not stopped.
    pub fn flash_batch<P, F>(&mut self, files: &[P], progress: F) -> BatchReport
    where
        P: AsRef<Path>,
        F: FnMut(&str, u64, u64),
    {
        self.flash_batch_from(files, None, progress)
    }

    /// [`Session::flash_batch`] with images taken from `image_dir` rather
    /// than from the directory of each XML file.
    pub fn flash_batch_from<P, F>(
        &mut self,
        files: &[P],
        image_dir: Option<&Path>,
        mut progress: F,
    ) -> BatchReport
    where
        P: AsRef<Path>,
        F: FnMut(&str, u64, u64),
    {
        let mut report = BatchReport::default();

        'files: for path in files {
            let path = path.as_ref();
            let file = match ProgramFile::load(path) {
                Ok(file) => file.with_image_dir(image_dir.map(Path::to_path_buf)),
                Err(e) => {
                    warn!("Cannot use {}: {e}", path.display());
                    report.record(path, "", Outcome::Failed(e));
                    continue;
                },
            };
            info!(
                "Flashing {} ({} entries)",
                path.display(),
                file.entries.len()
            );

            let mut clean = true;
            for entry in &file.entries {
                let label = label_of(entry);
                match self.program_entry(&file, entry, &mut progress) {
                    Ok(outcome) => report.record(path, label, outcome),
                    Err(e) => {
                        clean = false;
                        let fatal =
                            e.is_fatal_to_session() || self.command.state() != CommandState::Ready;
                        warn!("{label}: {e}");
                        report.record(path, label, Outcome::Failed(e));
                        if fatal {
                            report.stopped = Some(format!("session lost while writing {label}"));
                            break 'files;
                        }
                    },
                }
            }

            let Some(patch) = file.patch_path() else {
                continue;
            };
            if !clean {
                warn!(
                    "Not applying {} after failures in {}",
                    patch.display(),
                    path.display()
                );
                report.record(
                    &patch,
                    "patch",
                    Outcome::Skipped("earlier entries failed".into()),
                );
                continue;
            }
            match self.apply_patch_file(&patch) {
                Ok(entries) => report.record(&patch, "patch", Outcome::Patched { entries }),
                Err(e) => {
                    let fatal = e.is_fatal_to_session();
                    report.record(&patch, "patch", Outcome::Failed(e));
                    if fatal {
                        report.stopped = Some(format!("session lost while applying {}", patch.display()));
                        break;
                    }
                },
            }
        }

        if report.stopped.is_none() {
            if let Some(partition) = self.config.active_partition {
                let outcome = match self.set_active_partition(partition) {
                    Ok(()) => Outcome::Activated { partition },
                    Err(e) => Outcome::Failed(e),
                };
                report.record(Path::new(""), "active partition", outcome);
            }
        }

        report
    }

    fn program_entry<F>(
        &mut self,
        file: &ProgramFile,
        entry: &ProgramEntry,
        progress: &mut F,
    ) -> Result<Outcome>
    where
        F: FnMut(&str, u64, u64),
    {
        let ss = self.sector_size();
        if let Some(declared) = entry.sector_size.filter(|s| *s != ss) {
            return Err(Error::Config(format!(
                "{} is laid out for {declared}-byte sectors, the session uses {ss}",
                label_of(entry)
            )));
        }

        let path = file.image_path(entry);
        if !path.is_file() {
            warn!("{} not found, skipping", path.display());
            return Ok(Outcome::Skipped(format!("{} not found", path.display())));
        }

        let offset = entry
            .file_sector_offset
            .checked_mul(ss as u64)
            .ok_or_else(|| {
                Error::InvalidImage(format!("{}: file_sector_offset out of range", label_of(entry)))
            })?;
        let mut source = FileSource::open_at(&path, offset)?;
        if entry.num_sectors > 0 {
            let window = entry.num_sectors.saturating_mul(ss as u64);
            if source.total_len().is_some_and(|len| len > window) {
                info!(
                    "{}: writing the first {} sectors of {}",
                    label_of(entry),
                    entry.num_sectors,
                    path.display()
                );
            }
            source = source.limit(window);
        }
        let len = source.total_len().unwrap_or(0);
        if len == 0 {
            return Ok(Outcome::Skipped("empty image".into()));
        }
        let sectors = len.div_ceil(ss as u64);

        let start = match entry.start_sector.resolve(None) {
            Some(start) => start,
            None => {
                let info = self.storage_info_for(entry.partition)?;
                entry
                    .start_sector
                    .resolve(info.total_blocks())
                    .ok_or_else(|| {
                        Error::Unsupported(format!(
                            "loader did not report the size of LUN {}",
                            entry.partition
                        ))
                    })?
            },
        };

        let label = label_of(entry);
        self.write_range_on(
            entry.partition,
            SectorRange::new(start, sectors),
            &mut source,
            |done, total| progress(label, done, total),
        )?;
        info!("{label}: {sectors} sectors at {start} on LUN {}", entry.partition);
        Ok(Outcome::Written { sectors })
    }

    /// Send every `filename="DISK"` entry of a patch file; returns how many
    /// were applied.
    pub fn apply_patch_file<P: AsRef<Path>>(&mut self, path: P) -> Result<usize> {
        let bytes = fs::read(path.as_ref())?;
        let patches = parse_patch(&bytes, self.sector_size())?;
        let count = patches.len();
        for params in patches {
            self.patch(params)?;
        }
        info!("Applied {count} patches from {}", path.as_ref().display());
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::ProtocolError,
            session::tests::{DISK_SECTORS, config, loader, ready, ready_with},
            sim::Fault,
        },
        tempfile::TempDir,
    };

    fn program(file: &str, label: &str, start: &str, sectors: u64) -> String {
        format!(
            r#"<program SECTOR_SIZE_IN_BYTES="512" file_sector_offset="0" filename="{file}" label="{label}" num_partition_sectors="{sectors}" physical_partition_number="0" start_sector="{start}" />"#
        )
    }

    fn write_batch(dir: &TempDir, name: &str, programs: &[String]) -> PathBuf {
        let path = dir.path().join(name);
        let body = format!("<?xml version=\"1.0\" ?>\n<data>\n{}\n</data>\n", programs.join("\n"));
        fs::write(&path, body).unwrap();
        path
    }

    fn image(dir: &TempDir, name: &str, fill: u8, len: usize) -> Vec<u8> {
        let data = vec![fill; len];
        fs::write(dir.path().join(name), &data).unwrap();
        data
    }

    #[test]
    fn test_nak_mid_batch_continues_with_next_file() {
        let dir = tempfile::tempdir().unwrap();
        image(&dir, "a.bin", 0xA1, 1024);
        image(&dir, "b.bin", 0xB2, 1024);
        let c = image(&dir, "c.bin", 0xC3, 1024);
        let xml = write_batch(
            &dir,
            "rawprogram0.xml",
            &[
                program("a.bin", "a", "8", 4),
                program("b.bin", "b", "16", 4),
                program("c.bin", "c", "32", 4),
            ],
        );

        let mut session = ready(loader().with_nak_program_at(16));
        let report = session.flash_batch(&[xml], |_, _, _| {});

        assert_eq!(report.entries.len(), 3);
        assert!(matches!(
            report.entries[0].outcome,
            Outcome::Written { sectors: 2 }
        ));
        assert!(matches!(
            report.entries[1].outcome,
            Outcome::Failed(Error::Protocol(ProtocolError::WriteRejected(_)))
        ));
        assert!(matches!(
            report.entries[2].outcome,
            Outcome::Written { sectors: 2 }
        ));
        assert!(report.stopped.is_none());
        assert!(!report.is_success());
        assert_eq!(report.written(), 2);

        let disk = session.transport_mut().loader.disk(0);
        assert_eq!(&disk[32 * 512..34 * 512], &c[..]);
        assert!(disk[16 * 512..18 * 512].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_clean_batch_patches_and_activates() {
        let dir = tempfile::tempdir().unwrap();
        let boot = image(&dir, "boot.img", 0x11, 1536);
        let backup = image(&dir, "gpt_backup0.bin", 0x22, 1024);
        let xml = write_batch(
            &dir,
            "rawprogram0.xml",
            &[
                program("boot.img", "boot", "64", 8),
                program("", "reserved", "72", 8),
                program("missing.img", "vendor", "80", 8),
                program("gpt_backup0.bin", "BackupGPT", "NUM_DISK_SECTORS-4.", 4),
            ],
        );
        fs::write(
            dir.path().join("patch0.xml"),
            r#"<patches>
  <patch SECTOR_SIZE_IN_BYTES="512" byte_offset="16" filename="DISK" physical_partition_number="0" size_in_bytes="4" start_sector="NUM_DISK_SECTORS-1." value="0x12345678" what="test" />
  <patch SECTOR_SIZE_IN_BYTES="512" byte_offset="16" filename="gpt_main0.bin" physical_partition_number="0" size_in_bytes="4" start_sector="1" value="0x1" what="host only" />
</patches>"#,
        )
        .unwrap();

        let mut session = ready_with(loader(), config().with_active_partition(Some(1)));
        let mut labels = Vec::new();
        let report = session.flash_batch(&[xml], |label, done, total| {
            if done == total {
                labels.push(label.to_string());
            }
        });

        assert!(report.is_success(), "{report:?}");
        assert_eq!(labels, vec!["boot".to_string(), "BackupGPT".to_string()]);
        assert!(matches!(
            report.entries[1].outcome,
            Outcome::Skipped(_)
        ));
        assert!(matches!(
            report.entries[3].outcome,
            Outcome::Patched { entries: 1 }
        ));
        assert!(matches!(
            report.entries[4].outcome,
            Outcome::Activated { partition: 1 }
        ));

        let device = &mut session.transport_mut().loader;
        assert_eq!(device.bootable(), Some(1));
        let disk = device.disk(0);
        assert_eq!(&disk[64 * 512..64 * 512 + 1536], &boot[..]);
        let tail = (DISK_SECTORS as usize - 4) * 512;
        assert_eq!(&disk[tail..tail + 1024], &backup[..]);
        let patched = (DISK_SECTORS as usize - 1) * 512 + 16;
        assert_eq!(&disk[patched..patched + 4], &0x1234_5678u32.to_le_bytes());
    }

    #[test]
    fn test_fatal_error_stops_batch() {
        let dir = tempfile::tempdir().unwrap();
        image(&dir, "a.bin", 1, 512);
        image(&dir, "b.bin", 2, 512);
        let xml = write_batch(
            &dir,
            "rawprogram0.xml",
            &[program("a.bin", "a", "8", 1), program("b.bin", "b", "16", 1)],
        );

        let mut session = ready(loader());
        session
            .transport_mut()
            .loader
            .inject(Fault::TruncatedXml);
        let report = session.flash_batch(&[xml], |_, _, _| {});

        assert_eq!(report.entries.len(), 1);
        assert!(report.stopped.is_some());
        assert_eq!(
            session
                .transport()
                .loader
                .requests_named("program")
                .len(),
            1
        );
    }

    #[test]
    fn test_image_longer_than_window_is_cut_to_window() {
        let dir = tempfile::tempdir().unwrap();
        let data = image(&dir, "big.bin", 0x5A, 4 * 512);
        let xml = write_batch(&dir, "rawprogram0.xml", &[program("big.bin", "big", "8", 2)]);

        let mut session = ready(loader());
        let report = session.flash_batch(&[xml], |_, _, _| {});

        assert!(report.is_success(), "{report:?}");
        assert!(matches!(
            report.entries[0].outcome,
            Outcome::Written { sectors: 2 }
        ));
        let disk = session.transport_mut().loader.disk(0);
        assert_eq!(&disk[8 * 512..10 * 512], &data[..2 * 512]);
        assert!(disk[10 * 512..12 * 512].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_images_come_from_image_dir() {
        let dir = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        image(&dir, "a.bin", 0x01, 512);
        let wanted = image(&images, "a.bin", 0x7E, 512);
        let xml = write_batch(&dir, "rawprogram0.xml", &[program("a.bin", "a", "8", 1)]);

        let mut session = ready(loader());
        let report = session.flash_batch_from(&[xml], Some(images.path()), |_, _, _| {});

        assert!(report.is_success(), "{report:?}");
        let disk = session.transport_mut().loader.disk(0);
        assert_eq!(&disk[8 * 512..9 * 512], &wanted[..]);
    }

    #[test]
    fn test_unreadable_file_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("rawprogram1.xml");
        fs::write(&bad, "<data><program").unwrap();
        image(&dir, "a.bin", 1, 512);
        let good = write_batch(&dir, "rawprogram2.xml", &[program("a.bin", "a", "8", 1)]);

        let mut session = ready(loader());
        let report = session.flash_batch(&[bad, good], |_, _, _| {});
        assert_eq!(report.entries.len(), 2);
        assert!(matches!(
            report.entries[0].outcome,
            Outcome::Failed(Error::InvalidImage(_))
        ));
        assert!(matches!(
            report.entries[1].outcome,
            Outcome::Written { sectors: 1 }
        ));
    }
}
