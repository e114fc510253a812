//! Device commands: info, reset, peek, storage-info, set-active, create-gpp.

use {
    super::{Stage, confirm_destructive, done, open_session, session_config, status},
    crate::{Cli, config::Config},
    anyhow::{Context, Result},
    edlflash::{Protocol, StorageType},
    log::warn,
};

/// `info`: identity read from the boot ROM.
pub(crate) fn cmd_info(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let session_config = session_config(cli, config)?.with_identify(true);
    let session = open_session(cli, config, session_config, Stage::Connected)?;

    let info = session.dump_device_info().with_context(|| {
        if session.state().protocol == Some(Protocol::Command) {
            "the loader is already running; reboot the device into EDL to read its identity"
        } else {
            "no identity available"
        }
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("{info}");
    }
    Ok(())
}

/// `reset`: reboot through whichever protocol is running.
pub(crate) fn cmd_reset(cli: &Cli, config: &mut Config) -> Result<()> {
    let session_config = session_config(cli, config)?.with_identify(false);
    let mut session = open_session(cli, config, session_config, Stage::Connected)?;
    session.reset_device()?;
    done(cli, "Device reset");
    Ok(())
}

/// `peek`: dump device memory through the loader's log.
pub(crate) fn cmd_peek(cli: &Cli, config: &mut Config, address: u64, size: u64) -> Result<()> {
    let session_config = session_config(cli, config)?;
    let mut session = open_session(cli, config, session_config, Stage::Loader)?;
    for line in session.peek(address, size)? {
        println!("{line}");
    }
    Ok(())
}

/// `storage-info`: what the loader reports about the selected LUN.
pub(crate) fn cmd_storage_info(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let session_config = session_config(cli, config)?;
    let mut session = open_session(cli, config, session_config, Stage::Loader)?;
    let info = session.storage_info()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }
    for line in &info.lines {
        println!("{line}");
    }
    if let (Some(blocks), Some(block_size)) = (info.total_blocks(), info.block_size()) {
        status(
            cli,
            "ℹ",
            format!(
                "LUN {}: {blocks} blocks of {block_size} bytes ({} MiB)",
                info.partition,
                blocks * block_size / (1024 * 1024)
            ),
        );
    }
    Ok(())
}

/// `set-active`: select the boot partition.
pub(crate) fn cmd_set_active(cli: &Cli, config: &mut Config, partition: u32) -> Result<()> {
    let session_config = session_config(cli, config)?;
    let mut session = open_session(cli, config, session_config, Stage::Loader)?;
    session
        .set_active_partition(partition)
        .with_context(|| format!("selecting boot partition {partition}"))?;
    done(cli, format!("Boot partition {partition} selected"));
    Ok(())
}

/// Pad GPP sizes to the four drives the request carries.
fn gpp_sizes(sizes: &[u32]) -> [u32; 4] {
    let mut out = [0; 4];
    for (slot, size) in out.iter_mut().zip(sizes) {
        *slot = *size;
    }
    out
}

/// `create-gpp`: carve the general-purpose partitions.
pub(crate) fn cmd_create_gpp(cli: &Cli, config: &mut Config, sizes: &[u32]) -> Result<()> {
    let sizes = gpp_sizes(sizes);
    confirm_destructive(
        cli,
        &format!("Create GPP1..GPP4 of {sizes:?} KiB (one-time, cannot be undone)"),
    )?;

    let session_config = session_config(cli, config)?;
    if session_config.memory != StorageType::Emmc {
        warn!(
            "General-purpose partitions are an eMMC feature; memory is {}",
            session_config.memory
        );
    }
    let mut session = open_session(cli, config, session_config, Stage::Loader)?;
    session.create_partitions(sizes)?;
    done(cli, "General-purpose partitions created; boot partition 1 selected");
    Ok(())
}
