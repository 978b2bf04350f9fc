//! Interactive serial port selection.
//!
//! - Explicit `--port` or a configured port wins
//! - Known USB devices (built-in or remembered) are offered first
//! - Non-interactive mode never prompts and fails on ambiguity

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    espburn::{DetectedPort, discover_ports},
    log::{debug, error, info},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// List all ports (including unknown types).
    pub list_all_ports: bool,
    /// Non-interactive mode (fail if multiple ports).
    pub non_interactive: bool,
    /// Force confirmation even for single recognized port.
    pub confirm_port: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known/configured device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("port selection cancelled".to_string()).into()
}

fn single(mut ports: Vec<DetectedPort>) -> Option<DetectedPort> {
    if ports.len() == 1 { ports.pop() } else { None }
}

fn select_non_interactive_port(
    selection_ports: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    match selection_ports.len() {
        0 => Err(usage_err("no serial ports available")),
        1 => {
            let port = single(selection_ports).ok_or_else(|| usage_err("no serial ports available"))?;
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        _ => Err(usage_err(
            "multiple serial ports found; pass --port in non-interactive mode",
        )),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name));
    }

    if let Some(port_name) = &config.port.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name));
    }

    let ports = discover_ports();
    if ports.is_empty() {
        return Err(usage_err("no serial ports found"));
    }

    let known_ports: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();

    let selection_ports = if options.list_all_ports || known_ports.is_empty() {
        ports
    } else {
        known_ports
    };

    if options.non_interactive {
        return select_non_interactive_port(selection_ports, config);
    }

    if selection_ports.len() > 1 {
        ensure_interactive_terminal()?;
        return select_port_interactive(selection_ports, config);
    }

    let port = single(selection_ports).ok_or_else(|| usage_err("no serial ports available"))?;
    let is_known = is_known_device(&port, config);
    if is_known && !options.confirm_port {
        info!("Auto-selected port: {} [{}]", port.name, port.device.name());
        Ok(SelectedPort { port, is_known })
    } else {
        ensure_interactive_terminal()?;
        confirm_single_port(port)
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs an interactive terminal; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => cancelled(),
        DialoguerError::IO(io_err) => usage_err(&format!("port prompt failed: {io_err}")),
    }
}

/// Find a port by name, falling back to a bare entry for unlisted names.
fn find_port_by_name(name: &str) -> SelectedPort {
    let ports = discover_ports();

    let found = ports
        .iter()
        .find(|p| p.name == name)
        .or_else(|| ports.iter().find(|p| p.name.eq_ignore_ascii_case(name)));

    match found {
        Some(port) => SelectedPort {
            port: port.clone(),
            is_known: port.device.is_known(),
        },
        None => SelectedPort {
            port: DetectedPort::serial(name),
            is_known: false,
        },
    }
}

/// Check if a port matches a known device (from config or built-in list).
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.device.is_known() {
        return true;
    }

    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid)),
        _ => false,
    }
}

/// Sort for display: native USB first, then known devices, then the rest.
fn sort_for_selection(ports: &mut [DetectedPort], config: &Config) {
    ports.sort_by_key(|p| (!p.device.is_native_usb(), !is_known_device(p, config)));
}

fn port_label(port: &DetectedPort, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = if port.device.is_known() {
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

    format!("{name}{device_info}{product}")
}

fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!("{}", style("Ports that match a known USB device are highlighted").dim());

    sort_for_selection(&mut ports, config);

    // keep labels on one line in narrow terminals
    let max_item_width = usize::from(console::Term::stderr().size().1).saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| console::truncate_str(&port_label(port, config), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    let index = selection.ok_or_else(cancelled)?;
    let port = ports
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
    let is_known = is_known_device(&port, config);
    Ok(SelectedPort { port, is_known })
}

fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use serial port '{}'{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(cancelled())
    }
}

/// Offer to remember an unrecognized USB device for auto-selection.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config.port.usb_device.iter().any(|d| d.matches(vid, pid)) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this device for future auto-selection?")
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
    use {
        super::*,
        console::{measure_text_width, truncate_str},
    };

    fn usage_kind(result: Result<SelectedPort>) -> bool {
        result
            .err()
            .and_then(|err| err.downcast::<CliError>().ok())
            .is_some_and(|err| matches!(err, CliError::Usage(_)))
    }

    #[test]
    fn test_is_known_device_builtin_and_configured() {
        let config = Config::default();
        let bridge = DetectedPort::serial("/dev/ttyUSB0").with_usb(0x10C4, 0xEA60);
        assert!(is_known_device(&bridge, &config));

        let custom = DetectedPort::serial("/dev/ttyUSB1").with_usb(0xABCD, 0x1234);
        assert!(!is_known_device(&custom, &config));

        let mut config = Config::default();
        config.port.usb_device.push(crate::config::UsbDevice {
            vid: 0xABCD,
            pid: 0x1234,
        });
        assert!(is_known_device(&custom, &config));
        assert!(!is_known_device(&DetectedPort::serial("/dev/ttyS0"), &config));
    }

    #[test]
    fn test_sort_puts_native_usb_first() {
        let mut ports = vec![
            DetectedPort::serial("/dev/ttyS0"),
            DetectedPort::serial("/dev/ttyUSB0").with_usb(0x1A86, 0x7523),
            DetectedPort::serial("/dev/ttyACM0").with_usb(0x303A, 0x1001),
        ];
        sort_for_selection(&mut ports, &Config::default());
        let names: Vec<_> = ports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["/dev/ttyACM0", "/dev/ttyUSB0", "/dev/ttyS0"]);
    }

    #[test]
    fn test_port_label_truncates_to_width() {
        let mut port = DetectedPort::serial("/dev/verylongttyusb0").with_usb(0x10C4, 0xEA60);
        port.product = Some("CP2102N USB to UART Bridge Controller".to_string());
        let label = port_label(&port, &Config::default());
        let truncated = truncate_str(&label, 26, "\u{2026}").into_owned();
        assert!(!truncated.contains('\n'));
        assert!(measure_text_width(&truncated) <= 26);
    }

    #[test]
    fn test_select_non_interactive_multiple_ports_is_usage_error() {
        let ports = vec![DetectedPort::serial("/dev/ttyUSB0"), DetectedPort::serial("/dev/ttyUSB1")];
        assert!(usage_kind(select_non_interactive_port(ports, &Config::default())));
    }

    #[test]
    fn test_select_non_interactive_no_ports_is_usage_error() {
        assert!(usage_kind(select_non_interactive_port(Vec::new(), &Config::default())));
    }

    #[test]
    fn test_select_non_interactive_single_port() {
        let ports = vec![DetectedPort::serial("/dev/ttyUSB0").with_usb(0x0403, 0x6001)];
        let selected = select_non_interactive_port(ports, &Config::default()).unwrap();
        assert_eq!(selected.port.name, "/dev/ttyUSB0");
        assert!(selected.is_known);
    }
}
