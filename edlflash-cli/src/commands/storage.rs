//! Storage commands: flash, dump, erase, gpt, write-part, restore-gpt.

use {
    super::{
        Stage, confirm_destructive, done, ensure_not_interrupted, open_session, session_config,
        status, transfer_bar,
    },
    crate::{Cli, CliError, Target, config::Config},
    anyhow::{Context, Result, anyhow},
    console::style,
    edlflash::{FileSource, Gpt, ImageSource, Outcome, ProgramFile, SectorRange},
    std::{
        fs::{self, File},
        io::{BufWriter, Write as _},
        path::{Path, PathBuf},
    },
};

/// What a [`Target`] points at.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Region {
    Partition(String),
    Sectors(SectorRange),
}

impl Region {
    fn from_target(target: &Target) -> Result<Self> {
        match (&target.partition, target.start, target.count) {
            (Some(name), _, _) => Ok(Self::Partition(name.clone())),
            (None, Some(_), Some(0)) => Err(CliError::Usage("--count must be at least 1".into()).into()),
            (None, Some(start), Some(count)) => Ok(Self::Sectors(SectorRange::new(start, count))),
            _ => Err(CliError::Usage(
                "name a region with --partition NAME or --start N --count N".into(),
            )
            .into()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Partition(name) => format!("partition {name}"),
            Self::Sectors(range) => format!("sectors {range}"),
        }
    }
}

/// `flash`: program rawprogram files, applying their patch files.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    files: &[PathBuf],
    image_dir: Option<&Path>,
    set_active: Option<u32>,
    reset: bool,
) -> Result<()> {
    let mut images = 0;
    for file in files {
        let program = ProgramFile::load(file)
            .with_context(|| format!("cannot load {}", file.display()))?
            .with_image_dir(image_dir.map(Path::to_path_buf));
        let missing = program
            .entries
            .iter()
            .filter(|e| !e.filename.is_empty() && !program.image_path(e).is_file())
            .count();
        if missing > 0 {
            status(cli, "-", format!("{}: {missing} images not found", file.display()));
        }
        status(
            cli,
            "📦",
            format!("{}: {} images", file.display(), program.entries.len()),
        );
        images += program.entries.len();
    }
    confirm_destructive(
        cli,
        &format!("Program {images} images from {} files", files.len()),
    )?;

    let session_config = session_config(cli, config)?
        .with_active_partition(set_active.or(config.session.active_partition));
    let mut session = open_session(cli, config, session_config, Stage::Loader)?;

    let pb = transfer_bar(cli, 0, "");
    let mut current = String::new();
    let report = session.flash_batch_from(files, image_dir, |label, sent, total| {
        if label != current {
            current = label.to_string();
            pb.set_message(current.clone());
            pb.set_length(total);
        }
        pb.set_position(sent);
    });
    pb.finish_and_clear();

    for entry in &report.entries {
        let name = style(&entry.label).bold();
        match &entry.outcome {
            Outcome::Written { sectors } => done(cli, format!("{name}: {sectors} sectors")),
            Outcome::Patched { entries } => done(cli, format!("{name}: {entries} patches")),
            Outcome::Activated { partition } => {
                done(cli, format!("Boot partition {partition} selected"));
            },
            Outcome::Skipped(reason) => status(cli, "-", format!("{name}: skipped ({reason})")),
            Outcome::Failed(e) => eprintln!("{} {name}: {e}", style("✗").red()),
        }
    }

    if let Some(reason) = &report.stopped {
        return Err(anyhow!("flashing stopped: {reason}"));
    }
    let failed = report.failures().count();
    if failed > 0 {
        return Err(anyhow!(
            "{failed} of {} entries failed",
            report.entries.len()
        ));
    }
    done(cli, format!("{} images written", report.written()));

    if reset {
        ensure_not_interrupted()?;
        session.reset_device()?;
        done(cli, "Device reset");
    }
    Ok(())
}

/// `dump`: read a partition or sector range into a file.
pub(crate) fn cmd_dump(cli: &Cli, config: &mut Config, output: &Path, target: &Target) -> Result<()> {
    let region = Region::from_target(target)?;
    let file = File::create(output)
        .with_context(|| format!("cannot create {}", output.display()))?;
    let mut writer = BufWriter::new(file);

    let session_config = session_config(cli, config)?;
    let mut session = open_session(cli, config, session_config, Stage::Loader)?;
    let range = match &region {
        Region::Partition(name) => {
            let entry = session.find_partition(name)?;
            SectorRange::new(entry.first_lba, entry.sectors()?)
        },
        Region::Sectors(range) => *range,
    };

    status(
        cli,
        "📥",
        format!("Reading {} to {}", region.describe(), output.display()),
    );
    let pb = transfer_bar(cli, range.byte_len(session.sector_size()), "reading");
    let bytes = session
        .read_range(range, &mut writer, |sent, _| pb.set_position(sent))
        .with_context(|| format!("reading {}", region.describe()))?;
    pb.finish_and_clear();
    writer
        .flush()
        .with_context(|| format!("writing {}", output.display()))?;

    done(cli, format!("{bytes} bytes written to {}", output.display()));
    Ok(())
}

/// `erase`: erase a partition or sector range.
pub(crate) fn cmd_erase(cli: &Cli, config: &mut Config, target: &Target) -> Result<()> {
    let region = Region::from_target(target)?;
    confirm_destructive(cli, &format!("Erase {}", region.describe()))?;

    let session_config = session_config(cli, config)?;
    let mut session = open_session(cli, config, session_config, Stage::Loader)?;
    status(cli, "🗑", format!("Erasing {}", region.describe()));
    match &region {
        Region::Partition(name) => session.erase_partition(name)?,
        Region::Sectors(range) => session.erase(*range)?,
    }

    done(cli, format!("Erased {}", region.describe()));
    Ok(())
}

fn gpt_json(gpt: &Gpt, sector_size: usize) -> serde_json::Value {
    let partitions: Vec<serde_json::Value> = gpt
        .entries
        .iter()
        .filter(|e| e.is_used())
        .map(|e| {
            let sectors = e.sectors().unwrap_or(0);
            serde_json::json!({
                "name": e.name,
                "first_lba": e.first_lba,
                "last_lba": e.last_lba,
                "sectors": sectors,
                "bytes": sectors * sector_size as u64,
            })
        })
        .collect();
    serde_json::json!({
        "sector_size": sector_size,
        "first_usable_lba": gpt.header.first_usable_lba,
        "last_usable_lba": gpt.header.last_usable_lba,
        "valid": gpt.verify().is_ok(),
        "partitions": partitions,
    })
}

/// `gpt`: print the partition table of the selected LUN.
pub(crate) fn cmd_gpt(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let session_config = session_config(cli, config)?;
    let mut session = open_session(cli, config, session_config, Stage::Loader)?;
    let gpt = session.read_gpt()?;
    let sector_size = session.sector_size();

    if let Err(reason) = gpt.verify() {
        log::warn!("Partition table failed verification: {reason}");
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&gpt_json(&gpt, sector_size))?
        );
        return Ok(());
    }

    println!(
        "{:<36} {:>12} {:>12} {:>12}",
        "Name", "First LBA", "Last LBA", "Size (KiB)"
    );
    for entry in gpt.entries.iter().filter(|e| e.is_used()) {
        println!(
            "{:<36} {:>12} {:>12} {:>12}",
            entry.name,
            entry.first_lba,
            entry.last_lba,
            entry.sectors().unwrap_or(0).saturating_mul(sector_size as u64) / 1024
        );
    }
    Ok(())
}

/// `write-part`: write an image into a named partition.
pub(crate) fn cmd_write_part(
    cli: &Cli,
    config: &mut Config,
    partition: &str,
    image: &Path,
) -> Result<()> {
    let mut source =
        FileSource::open(image).with_context(|| format!("cannot open {}", image.display()))?;
    confirm_destructive(
        cli,
        &format!("Overwrite partition {partition} with {}", image.display()),
    )?;

    let session_config = session_config(cli, config)?;
    let mut session = open_session(cli, config, session_config, Stage::Loader)?;

    let pb = transfer_bar(cli, source.total_len().unwrap_or_default(), partition);
    session
        .write_partition(partition, &mut source, |sent, _| pb.set_position(sent))
        .with_context(|| format!("writing {partition}"))?;
    pb.finish_and_clear();

    done(cli, format!("{} written to {partition}", image.display()));
    Ok(())
}

/// `restore-gpt`: write primary and backup tables and verify both.
pub(crate) fn cmd_restore_gpt(cli: &Cli, config: &mut Config, image: &Path) -> Result<()> {
    let bytes = fs::read(image).with_context(|| format!("cannot read {}", image.display()))?;
    confirm_destructive(cli, "Replace the partition table")?;

    let session_config = session_config(cli, config)?;
    let mut session = open_session(cli, config, session_config, Stage::Loader)?;
    status(cli, "🧭", format!("Writing {}", image.display()));
    let gpt = session.restore_gpt(&bytes)?;

    done(
        cli,
        format!(
            "Partition table restored ({} partitions, both copies verified)",
            gpt.entries.iter().filter(|e| e.is_used()).count()
        ),
    );
    Ok(())
}
