//! Interactive serial port selection.
//!
//! The port comes from, in order: `--port` / `UARTBOOT_PORT`, the config
//! file, then the list of ports present on the system. A single USB-UART
//! bridge is picked automatically; anything else asks the user, or fails
//! with a usage error in non-interactive mode.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::{cmp::Ordering, io::IsTerminal},
    uartboot::{NativePortEnumerator, PortEnumerator, PortInfo},
};

/// USB-UART bridges commonly wired to the bootloader UART (VID, PID).
const KNOWN_BRIDGES: &[(u16, u16)] = &[
    (0x1A86, 0x7523), // CH340
    (0x1A86, 0x55D4), // CH9102
    (0x10C4, 0xEA60), // CP210x
    (0x0403, 0x6001), // FT232R
    (0x0403, 0x6015), // FT231X
    (0x0483, 0x374B), // ST-LINK/V2-1 VCP
    (0x0483, 0x374E), // STLINK-V3 VCP
];

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: PortInfo,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn named_port(name: &str) -> PortInfo {
    PortInfo {
        name: name.to_string(),
        vid: None,
        pid: None,
        manufacturer: None,
        product: None,
        serial_number: None,
    }
}

/// Check if a port matches a known bridge or a configured device.
fn is_known_device(port: &PortInfo, config: &Config) -> bool {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return false;
    };
    KNOWN_BRIDGES.contains(&(vid, pid))
        || config
            .connection
            .usb_device
            .iter()
            .any(|d| d.matches(vid, pid))
}

fn select_non_interactive_port(ports: Vec<PortInfo>, config: &Config) -> Result<SelectedPort> {
    match ports.len().cmp(&1) {
        Ordering::Equal => {
            let port = ports
                .into_iter()
                .next()
                .ok_or_else(|| usage_err("No serial ports available"))?;
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        Ordering::Greater => Err(usage_err(
            "multiple serial ports found; pass --port or set UARTBOOT_PORT",
        )),
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(name) = &options.port {
        return Ok(SelectedPort {
            port: named_port(name),
            is_known: true,
        });
    }

    if let Some(name) = &config.connection.port {
        debug!("Using port from config: {name}");
        return Ok(SelectedPort {
            port: named_port(name),
            is_known: true,
        });
    }

    let ports = NativePortEnumerator::list_ports().unwrap_or_else(|e| {
        debug!("Port enumeration failed: {e}");
        Vec::new()
    });
    if ports.is_empty() {
        return Err(usage_err("No serial ports found"));
    }

    // Known bridges first; everything when none is recognized
    let known: Vec<PortInfo> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();
    let candidates = if known.is_empty() { ports } else { known };

    if options.non_interactive {
        return select_non_interactive_port(candidates, config);
    }

    if candidates.len() == 1 && is_known_device(&candidates[0], config) {
        let port = candidates
            .into_iter()
            .next()
            .ok_or_else(|| usage_err("No serial ports available"))?;
        info!("Auto-selected port: {} [{}]", port.name, port.description());
        return Ok(SelectedPort {
            port,
            is_known: true,
        });
    }

    ensure_interactive_terminal()?;
    select_port_interactive(candidates, config)
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs a terminal; pass --port or use --non-interactive",
        ))
    }
}

pub(crate) fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Selection cancelled".to_string()).into()
            } else {
                usage_err("Prompt failed")
            }
        },
    }
}

/// Label shown in the selection list.
fn port_label(port: &PortInfo, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => format!("{name} ({vid:04X}:{pid:04X}){product}"),
        _ => format!("{name}{product}"),
    }
}

/// Interactive port selection.
fn select_port_interactive(mut ports: Vec<PortInfo>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Detected {} serial port(s)",
        style("ℹ").blue(),
        ports.len()
    );

    ports.sort_by_key(|p| !is_known_device(p, config));

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p, config), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the bootloader serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, config);
            Ok(SelectedPort { port, is_known })
        },
        None => Err(CliError::Cancelled("Selection cancelled".to_string()).into()),
    }
}

/// Ask user if they want to remember this adapter.
pub fn ask_remember_port(port: &PortInfo, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if is_known_device(port, config) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!(
            "Remember {vid:04X}:{pid:04X} for automatic selection?"
        ))
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
    use super::*;
    use crate::config::UsbDevice;

    fn usb_port(name: &str, vid: u16, pid: u16) -> PortInfo {
        PortInfo {
            vid: Some(vid),
            pid: Some(pid),
            product: Some("USB Serial".to_string()),
            ..named_port(name)
        }
    }

    #[test]
    fn test_explicit_port_wins() {
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyS1".to_string());
        let options = SerialOptions {
            port: Some("COM7".to_string()),
            non_interactive: true,
        };

        let selected = select_serial_port(&options, &config).unwrap();
        assert_eq!(selected.port.name, "COM7");
    }

    #[test]
    fn test_config_port_used_without_enumeration() {
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyS1".to_string());

        let selected = select_serial_port(&SerialOptions::default(), &config).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyS1");
        assert!(selected.is_known);
    }

    #[test]
    fn test_known_bridge_and_configured_device() {
        let mut config = Config::default();
        assert!(is_known_device(&usb_port("a", 0x1A86, 0x7523), &config));
        assert!(!is_known_device(&usb_port("b", 0x1234, 0x5678), &config));
        assert!(!is_known_device(&named_port("c"), &config));

        config
            .connection
            .usb_device
            .push(UsbDevice { vid: 0x1234, pid: 0x5678 });
        assert!(is_known_device(&usb_port("b", 0x1234, 0x5678), &config));
    }

    #[test]
    fn test_non_interactive_multiple_ports_is_usage_error() {
        let ports = vec![
            usb_port("/dev/ttyUSB0", 0x1A86, 0x7523),
            usb_port("/dev/ttyUSB1", 0x10C4, 0xEA60),
        ];

        let err = select_non_interactive_port(ports, &Config::default())
            .err()
            .unwrap();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(m)) if m.contains("multiple")));
    }

    #[test]
    fn test_non_interactive_no_ports_is_usage_error() {
        let err = select_non_interactive_port(vec![], &Config::default())
            .err()
            .unwrap();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_non_interactive_single_port_selected() {
        let ports = vec![usb_port("/dev/ttyUSB0", 0x0403, 0x6001)];
        let selected = select_non_interactive_port(ports, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyUSB0");
        assert!(selected.is_known);
    }

    #[test]
    fn test_port_label_shows_ids() {
        console::set_colors_enabled(false);
        let label = port_label(&usb_port("/dev/ttyUSB0", 0x1A86, 0x7523), &Config::default());
        assert_eq!(label, "/dev/ttyUSB0 (1A86:7523) - USB Serial");
    }
}
