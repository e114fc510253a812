//! Choosing the port the EDL device is attached to.
//!
//! Selection order: `--port`, then the configured port, then discovery.
//! Discovered ports in emergency download mode win over other Qualcomm
//! interfaces, which win over everything else. Interactive prompts use
//! dialoguer; `--non-interactive` never prompts.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    edlflash::{DetectedPort, DeviceKind, TransportKind, discover_ports},
    log::{debug, error, info},
    std::io::IsTerminal,
};

/// Options for port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port from the command line.
    pub port: Option<String>,
    /// Offer every port, not only recognised ones.
    pub list_all_ports: bool,
    /// Fail instead of prompting.
    pub non_interactive: bool,
    /// Ask even when exactly one recognised port exists.
    pub confirm_port: bool,
}

/// Selected port and whether it was recognised.
pub struct SelectedPort {
    pub port: DetectedPort,
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("port selection cancelled".to_string()).into()
}

/// Rank used to order candidates: EDL first, then other known interfaces.
fn rank(port: &DetectedPort, config: &Config) -> u8 {
    if port.is_edl() {
        0
    } else if is_known_device(port, config) {
        1
    } else {
        2
    }
}

fn select_non_interactive_port(
    mut candidates: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    match candidates.len() {
        0 => Err(usage_err(
            "no EDL device found; connect one or pass --port",
        )),
        1 => {
            let port = candidates.remove(0);
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        n => Err(usage_err(&format!(
            "{n} candidate ports found; pass --port to choose one"
        ))),
    }
}

/// Select the port to talk to.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(name) = &options.port {
        return Ok(find_port_by_name(name));
    }
    if let Some(name) = &config.port.connection.serial {
        debug!("Using port from config: {name}");
        return Ok(find_port_by_name(name));
    }

    let mut ports = discover_ports();
    if ports.is_empty() {
        return Err(usage_err("no serial ports found"));
    }
    ports.sort_by_key(|p| rank(p, config));

    let best = rank(&ports[0], config);
    let candidates: Vec<DetectedPort> = if options.list_all_ports || best == 2 {
        ports
    } else {
        ports
            .into_iter()
            .filter(|p| rank(p, config) == best)
            .collect()
    };

    if options.non_interactive {
        return select_non_interactive_port(candidates, config);
    }

    if candidates.len() == 1 {
        let port = candidates
            .into_iter()
            .next()
            .ok_or_else(|| usage_err("no serial ports available"))?;
        let is_known = is_known_device(&port, config);
        if is_known && !options.confirm_port {
            info!("Auto-selected port: {} [{}]", port.name, port.device.name());
            return Ok(SelectedPort { port, is_known });
        }
        ensure_interactive_terminal()?;
        return confirm_single_port(port, config);
    }

    ensure_interactive_terminal()?;
    select_port_interactive(candidates, config)
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs a terminal; pass --port or --non-interactive",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            cancelled()
        },
        DialoguerError::IO(io_err) => usage_err(&format!("prompt failed: {io_err}")),
    }
}

fn find_port_by_name(name: &str) -> SelectedPort {
    let ports = discover_ports();
    let found = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| {
            ports
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case(name))
        });

    match found {
        Some(port) => SelectedPort {
            port: port.clone(),
            is_known: port.device.is_known(),
        },
        // Not enumerated (yet); trust the user.
        None => SelectedPort {
            port: DetectedPort {
                name: name.to_string(),
                transport: TransportKind::Serial,
                device: DeviceKind::Unknown,
                vid: None,
                pid: None,
                manufacturer: None,
                product: None,
                serial: None,
            },
            is_known: false,
        },
    }
}

/// Recognised by VID/PID or listed in the configuration.
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.device.is_known() {
        return true;
    }
    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|d| d.matches(vid, pid)),
        _ => false,
    }
}

fn port_label(port: &DetectedPort, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };
    let kind = if port.device.is_known() {
        format!(" [{}]", style(port.device.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{name}{kind}{product}")
}

fn select_port_interactive(ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} {} ports found",
        style("ℹ").blue(),
        ports.len()
    );

    let width = console::Term::stderr().size().1 as usize;
    let labels: Vec<String> = ports
        .iter()
        .map(|p| {
            console::truncate_str(&port_label(p, config), width.saturating_sub(4), "\u{2026}")
                .into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the EDL port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    let index = selection.ok_or_else(cancelled)?;
    let port = ports
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
    Ok(SelectedPort {
        is_known: is_known_device(&port, config),
        port,
    })
}

fn confirm_single_port(port: DetectedPort, config: &Config) -> Result<SelectedPort> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}?", port_label(&port, config)))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            is_known: is_known_device(&port, config),
            port,
        })
    } else {
        Err(cancelled())
    }
}

/// Offer to remember an unrecognised USB ID.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config
        .port
        .usb_device
        .iter()
        .any(|d| d.matches(vid, pid))
    {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {vid:04X}:{pid:04X} as an EDL device?"))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, crate::config::UsbDevice};

    fn port(name: &str, device: DeviceKind, ids: Option<(u16, u16)>) -> DetectedPort {
        DetectedPort {
            name: name.to_string(),
            transport: TransportKind::Serial,
            device,
            vid: ids.map(|(v, _)| v),
            pid: ids.map(|(_, p)| p),
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    fn is_usage(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_)))
    }

    #[test]
    fn test_serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.list_all_ports);
        assert!(!options.non_interactive);
        assert!(!options.confirm_port);
    }

    #[test]
    fn test_edl_ports_rank_first() {
        let config = Config::default();
        let edl = port("/dev/ttyUSB1", DeviceKind::QualcommEdl, Some((0x05C6, 0x9008)));
        let diag = port("/dev/ttyUSB0", DeviceKind::QualcommDiag, Some((0x05C6, 0x900E)));
        let other = port("/dev/ttyS0", DeviceKind::Unknown, None);

        assert!(rank(&edl, &config) < rank(&diag, &config));
        assert!(rank(&diag, &config) < rank(&other, &config));
    }

    #[test]
    fn test_is_known_device_from_config() {
        let unknown = port("/dev/ttyACM0", DeviceKind::Unknown, Some((0xABCD, 0x1234)));
        let mut config = Config::default();
        assert!(!is_known_device(&unknown, &config));

        config.port.usb_device.push(UsbDevice { vid: 0xABCD, pid: 0x1234 });
        assert!(is_known_device(&unknown, &config));
    }

    #[test]
    fn test_is_known_device_no_ids() {
        let bare = port("/dev/ttyS0", DeviceKind::Unknown, None);
        assert!(!is_known_device(&bare, &Config::default()));
    }

    #[test]
    fn test_label_is_plain_without_colors() {
        console::set_colors_enabled(false);
        let mut p = port("COM7", DeviceKind::QualcommEdl, Some((0x05C6, 0x9008)));
        p.product = Some("QDLoader 9008".to_string());
        let label = port_label(&p, &Config::default());
        assert!(label.starts_with("COM7"));
        assert!(label.contains("QDLoader 9008"));
    }

    #[test]
    fn test_non_interactive_no_ports_is_usage_error() {
        let err = select_non_interactive_port(vec![], &Config::default())
            .err()
            .expect("expected error");
        assert!(is_usage(&err));
    }

    #[test]
    fn test_non_interactive_multiple_ports_is_usage_error() {
        let ports = vec![
            port("/dev/ttyUSB0", DeviceKind::QualcommEdl, None),
            port("/dev/ttyUSB1", DeviceKind::QualcommEdl, None),
        ];
        let err = select_non_interactive_port(ports, &Config::default())
            .err()
            .expect("expected error");
        assert!(is_usage(&err));
    }

    #[test]
    fn test_non_interactive_single_port_is_selected() {
        let ports = vec![port("/dev/ttyUSB0", DeviceKind::QualcommEdl, Some((0x05C6, 0x9008)))];
        let selected = select_non_interactive_port(ports, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyUSB0");
        assert!(selected.is_known);
    }

    #[test]
    fn test_explicit_unknown_port_is_trusted() {
        let selected = find_port_by_name("/dev/does-not-exist-edl");
        assert_eq!(selected.port.name, "/dev/does-not-exist-edl");
        assert!(!selected.is_known);
        assert_eq!(selected.port.device, DeviceKind::Unknown);
    }
}
