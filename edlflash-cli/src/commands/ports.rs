//! `list-ports`.

use {
    console::style,
    edlflash::{DetectedPort, auto_detect_port, discover_ports},
};

fn port_json(port: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "device": port.device.name(),
        "known": port.device.is_known(),
        "edl": port.is_edl(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}

/// List ports; JSON goes to stdout, the human listing to stderr.
pub(crate) fn cmd_list_ports(json: bool) {
    let detected = discover_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected.iter().map(port_json).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_else(|_| "[]".to_string())
        );
        return;
    }

    eprintln!("{}", style("Available ports").bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style("(none)").dim());
        return;
    }

    for port in &detected {
        let kind = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let ids = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        let bullet = if port.is_edl() {
            style("•").green().bold()
        } else {
            style("•").dim()
        };
        eprintln!("  {bullet} {}{kind}{ids}{product}", style(&port.name).cyan());
    }

    if let Ok(port) = auto_detect_port() {
        eprintln!(
            "\n{} EDL device: {}",
            style("→").green().bold(),
            style(&port.name).cyan().bold()
        );
    }
}
