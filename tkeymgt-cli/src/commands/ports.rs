//! Port listing.

use {
    anyhow::Result,
    console::style,
    tkeymgt::{DetectedPort, auto_detect_port, detect_ports, device::format_port_list},
};

/// List-ports command implementation.
pub(crate) fn cmd_list_ports(json: bool, all: bool) -> Result<()> {
    let detected: Vec<DetectedPort> = detect_ports()
        .into_iter()
        .filter(|p| all || p.is_tkey())
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&detected)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style(if all { "Serial ports" } else { "TKeys" }).bold().underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("none found").dim());
        return Ok(());
    }

    for line in format_port_list(&detected) {
        eprintln!("  {} {}", style("•").green(), line);
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }
    Ok(())
}
