//! edlflash CLI - flash Qualcomm devices in Emergency Download mode.
//!
//! ## Features
//!
//! - Upload the flashing loader and drive it
//! - Program rawprogram/patch XML sets
//! - Dump, erase and write by sector range or GPT partition name
//! - Restore partition tables, carve general-purpose partitions
//! - Interactive port selection and shell completions

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    edlflash::{StorageType, protocol::firehose::parse_number},
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod serial;

use {
    config::Config,
    serial::{SerialOptions, ask_remember_port, select_serial_port},
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Bad invocation or missing setup; exit code 2.
    #[error("{0}")]
    Usage(String),
    /// Stopped by the user; exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

/// edlflash - flash Qualcomm devices in Emergency Download (EDL) mode.
///
/// Environment variables:
///   EDLFLASH_PORT              - Serial port of the EDL device
///   EDLFLASH_LOADER            - Loader image uploaded to the boot ROM
///   EDLFLASH_MEMORY            - Storage type (emmc, ufs, nand, nvme, spinor)
///   EDLFLASH_LUN               - Physical partition (LUN)
///   EDLFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "edlflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "EDLFLASH_PORT")]
    port: Option<String>,

    /// Talk to the device over raw USB instead of the serial driver.
    #[cfg(feature = "usb")]
    #[arg(long, global = true)]
    usb: bool,

    /// Loader image (programmer) uploaded to the boot ROM.
    #[arg(short, long, global = true, env = "EDLFLASH_LOADER", value_name = "PATH")]
    loader: Option<PathBuf>,

    /// Storage type behind the loader.
    #[arg(short, long, global = true, env = "EDLFLASH_MEMORY", value_parser = parse_memory)]
    memory: Option<StorageType>,

    /// Sector size in bytes (default depends on the storage type).
    #[arg(long, global = true, value_parser = parse_sector_size)]
    sector_size: Option<usize>,

    /// Payload size to request from the loader.
    #[arg(long, global = true, value_parser = parse_size)]
    max_payload: Option<usize>,

    /// Physical partition (LUN) to operate on.
    #[arg(long, global = true, env = "EDLFLASH_LUN")]
    lun: Option<u32>,

    /// Ask the loader to accept writes without committing them.
    #[arg(long, global = true)]
    skip_write: bool,

    /// Ask the loader not to initialise storage.
    #[arg(long, global = true)]
    skip_storage_init: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "EDLFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Assume "yes" for confirmation of destructive operations.
    #[arg(short, long, global = true)]
    yes: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// Offer all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Show the identity reported by the boot ROM.
    Info {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// Program one or more rawprogram XML files (patch files are applied).
    Flash {
        /// rawprogram*.xml files, in order.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Directory holding the images (default: next to each XML file).
        #[arg(long, value_name = "DIR")]
        image_dir: Option<PathBuf>,

        /// Boot partition to select afterwards.
        #[arg(long, value_name = "N")]
        set_active: Option<u32>,

        /// Reset the device when done.
        #[arg(long)]
        reset: bool,
    },

    /// Read a partition or sector range into a file.
    Dump {
        /// Output file.
        output: PathBuf,

        #[command(flatten)]
        target: Target,
    },

    /// Erase a partition or sector range.
    Erase {
        #[command(flatten)]
        target: Target,
    },

    /// Print the partition table.
    Gpt {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// Write an image into a named partition.
    WritePart {
        /// Partition name.
        partition: String,

        /// Image file.
        image: PathBuf,
    },

    /// Write a primary GPT image and its backup copy, then verify both.
    RestoreGpt {
        /// Primary GPT image (protective MBR, header and entries).
        image: PathBuf,
    },

    /// Create the general-purpose partitions (eMMC).
    CreateGpp {
        /// Sizes of GPP1..GPP4 in KiB, not MB (missing ones are 0).
        #[arg(required = true, num_args = 1..=4, value_name = "KIB")]
        sizes: Vec<u32>,
    },

    /// Select the boot partition.
    SetActive {
        /// Partition index (1 = boot A, 2 = boot B, ...).
        partition: u32,
    },

    /// Reset the device.
    Reset,

    /// Dump device memory through the loader log.
    Peek {
        /// Start address (decimal or 0x-hex).
        #[arg(value_parser = parse_u64)]
        address: u64,

        /// Number of bytes.
        #[arg(value_parser = parse_u64)]
        size: u64,
    },

    /// Show storage information for the selected LUN.
    StorageInfo {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected with --install if omitted).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install the completion script for the shell.
        #[arg(long)]
        install: bool,
    },
}

/// A partition name or a sector range.
#[derive(clap::Args, Debug, Clone)]
struct Target {
    /// GPT partition name.
    #[arg(long, conflicts_with_all = ["start", "count"])]
    partition: Option<String>,

    /// First sector.
    #[arg(long, value_parser = parse_u64, requires = "count")]
    start: Option<u64>,

    /// Number of sectors.
    #[arg(long, value_parser = parse_u64, requires = "start")]
    count: Option<u64>,
}

fn parse_u64(s: &str) -> Result<u64, String> {
    parse_number(s).ok_or_else(|| format!("invalid number: {s}"))
}

fn parse_size(s: &str) -> Result<usize, String> {
    let n = parse_u64(s)?;
    usize::try_from(n)
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| format!("invalid size: {s}"))
}

fn parse_sector_size(s: &str) -> Result<usize, String> {
    let n = parse_size(s)?;
    if n.is_power_of_two() && n >= 512 {
        Ok(n)
    } else {
        Err(format!("sector size must be a power of two >= 512, got {n}"))
    }
}

fn parse_memory(s: &str) -> Result<StorageType, String> {
    s.parse().map_err(|e: edlflash::Error| e.to_string())
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            std::process::exit(130);
        }
        eprintln!("\nInterrupted; stopping after the current operation (Ctrl-C again to abort)");
    }) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    edlflash::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "edlflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    let interrupted = err
        .chain()
        .any(|cause| {
            matches!(
                cause.downcast_ref::<edlflash::Error>(),
                Some(edlflash::Error::Interrupted)
            )
        });
    if interrupted { 130 } else { 1 }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Info { json } => commands::device::cmd_info(cli, &mut config, *json),
        Commands::Flash {
            files,
            image_dir,
            set_active,
            reset,
        } => commands::storage::cmd_flash(
            cli,
            &mut config,
            files,
            image_dir.as_deref(),
            *set_active,
            *reset,
        ),
        Commands::Dump { output, target } => {
            commands::storage::cmd_dump(cli, &mut config, output, target)
        },
        Commands::Erase { target } => commands::storage::cmd_erase(cli, &mut config, target),
        Commands::Gpt { json } => commands::storage::cmd_gpt(cli, &mut config, *json),
        Commands::WritePart { partition, image } => {
            commands::storage::cmd_write_part(cli, &mut config, partition, image)
        },
        Commands::RestoreGpt { image } => {
            commands::storage::cmd_restore_gpt(cli, &mut config, image)
        },
        Commands::CreateGpp { sizes } => commands::device::cmd_create_gpp(cli, &mut config, sizes),
        Commands::SetActive { partition } => {
            commands::device::cmd_set_active(cli, &mut config, *partition)
        },
        Commands::Reset => commands::device::cmd_reset(cli, &mut config),
        Commands::Peek { address, size } => {
            commands::device::cmd_peek(cli, &mut config, *address, *size)
        },
        Commands::StorageInfo { json } => {
            commands::device::cmd_storage_info(cli, &mut config, *json)
        },
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json);
            Ok(())
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell, e.g. `edlflash completions bash`, or use --install"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get the serial port from CLI args, config or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;
    if !selected.is_known && !cli.non_interactive && cli.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
