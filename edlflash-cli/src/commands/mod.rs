//! Command implementations.
//!
//! Each group of subcommands lives in its own module; the helpers here open
//! the session, draw progress and ask for confirmation.

pub(crate) mod completions;
pub(crate) mod device;
pub(crate) mod ports;
pub(crate) mod storage;

use {
    crate::{Cli, CliError, config::Config, get_port, use_fancy_output, was_interrupted},
    anyhow::{Context, Result},
    console::style,
    dialoguer::{Confirm, theme::ColorfulTheme},
    edlflash::{
        Protocol, Session, SessionConfig, StorageType, Transport,
        transport::serial::{SerialConfig, SerialTransport},
    },
    indicatif::{ProgressBar, ProgressStyle},
    std::{fmt::Display, io::IsTerminal},
};

/// Session over whichever transport was selected.
pub(crate) type EdlSession = Session<Box<dyn Transport>>;

/// How far [`open_session`] should take the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    /// Stop once the device answers (boot ROM or a running loader).
    Connected,
    /// Make sure the loader is running.
    Loader,
}

pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Print a status line on stderr unless `--quiet`.
pub(crate) fn status(cli: &Cli, icon: &str, message: impl Display) {
    if !cli.quiet {
        if use_fancy_output() {
            eprintln!("{} {message}", style(icon).cyan());
        } else {
            eprintln!("{message}");
        }
    }
}

pub(crate) fn done(cli: &Cli, message: impl Display) {
    if !cli.quiet {
        eprintln!("{} {message}", style("✓").green());
    }
}

/// Session parameters from flags, then the config file, then defaults.
pub(crate) fn session_config(cli: &Cli, config: &Config) -> Result<SessionConfig> {
    let memory = match (cli.memory, config.session.memory.as_deref()) {
        (Some(memory), _) => memory,
        (None, Some(name)) => name
            .parse::<StorageType>()
            .map_err(|e| CliError::Usage(format!("[session] memory: {e}")))?,
        (None, None) => StorageType::default(),
    };

    let mut session = SessionConfig::new(memory)
        .with_partition(cli.lun.or(config.session.lun).unwrap_or(0))
        .with_active_partition(config.session.active_partition)
        .with_verbose(cli.verbose > 0)
        .with_skip_write(cli.skip_write || config.session.skip_write)
        .with_skip_storage_init(cli.skip_storage_init || config.session.skip_storage_init);
    if let Some(sector_size) = cli.sector_size.or(config.session.sector_size) {
        session = session.with_sector_size(sector_size);
    }
    if let Some(max_payload) = cli.max_payload.or(config.session.max_payload) {
        session = session.with_max_payload(max_payload);
    }
    Ok(session)
}

#[cfg(feature = "usb")]
fn open_transport(cli: &Cli, config: &mut Config) -> Result<Box<dyn Transport>> {
    if cli.usb {
        let usb = edlflash::UsbTransport::open(edlflash::UsbConfig::default())
            .context("cannot open the USB device")?;
        status(cli, "🔌", format!("Using {}", usb.name()));
        return Ok(Box::new(usb));
    }
    open_serial(cli, config)
}

#[cfg(not(feature = "usb"))]
fn open_transport(cli: &Cli, config: &mut Config) -> Result<Box<dyn Transport>> {
    open_serial(cli, config)
}

fn open_serial(cli: &Cli, config: &mut Config) -> Result<Box<dyn Transport>> {
    let port = get_port(cli, config)?;
    status(cli, "🔌", format!("Using port {port}"));
    let serial = SerialTransport::open(SerialConfig::new(port.as_str()))
        .with_context(|| format!("cannot open {port}"))?;
    Ok(Box::new(serial))
}

/// Connect to the device and, for [`Stage::Loader`], start the loader.
pub(crate) fn open_session(
    cli: &Cli,
    config: &mut Config,
    session_config: SessionConfig,
    stage: Stage,
) -> Result<EdlSession> {
    let loader = cli
        .loader
        .clone()
        .or_else(|| config.session.loader.clone());
    let io = open_transport(cli, config)?;
    let mut session = Session::new(io, session_config);

    status(cli, "⏳", "Waiting for the device...");
    let protocol = session
        .connect()
        .context("device did not answer")?;
    match protocol {
        Protocol::Bootstrap => done(cli, "Boot ROM connected"),
        Protocol::Command => done(cli, "Loader already running"),
    }

    if stage == Stage::Loader && protocol == Protocol::Bootstrap {
        let path = loader.ok_or_else(|| {
            CliError::Usage(
                "the device is in the boot ROM; pass --loader or set `loader` under [session]"
                    .to_string(),
            )
        })?;
        ensure_not_interrupted()?;

        let pb = transfer_bar(cli, 0, "loader");
        let negotiated = session
            .load_agent(&path, |sent, total| {
                pb.set_length(total as u64);
                pb.set_position(sent as u64);
            })
            .with_context(|| format!("cannot start loader {}", path.display()))?;
        pb.finish_and_clear();
        done(
            cli,
            format!(
                "Loader running ({} byte sectors, {} byte payloads)",
                negotiated.sector_size, negotiated.max_payload
            ),
        );
    }

    Ok(session)
}

/// Byte progress bar on stderr, hidden when quiet or not a terminal.
pub(crate) fn transfer_bar(cli: &Cli, len: u64, message: &str) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    let style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.set_message(message.to_string());
    pb
}

/// Ask before changing the device layout; `--yes` skips the prompt.
pub(crate) fn confirm_destructive(cli: &Cli, what: &str) -> Result<()> {
    if cli.yes {
        return Ok(());
    }
    if cli.non_interactive || !std::io::stdin().is_terminal() || !std::io::stderr().is_terminal()
    {
        return Err(CliError::Usage(format!("{what}: pass --yes to confirm")).into());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("{what}. Continue?"))
        .default(false)
        .interact_opt()
        .map_err(|e| CliError::Usage(format!("prompt failed: {e}")))?
        .unwrap_or(false);

    if confirmed {
        Ok(())
    } else {
        Err(CliError::Cancelled("aborted".to_string()).into())
    }
}
