//! Chip info and port listing command implementations.

use {
    super::{SessionOptions, connect, session_config},
    crate::{Cli, config::Config},
    anyhow::Result,
    console::style,
    espburn::{ChipInfo, SecurityInfo, auto_detect_port, discover_ports},
    log::debug,
};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let detected = discover_ports();

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "ports": detected,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            device_type,
            vid_pid,
            product
        );
    }

    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} Auto-selected port: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }

    Ok(())
}

fn info_json(chip: &ChipInfo, security: Option<&SecurityInfo>) -> serde_json::Value {
    serde_json::json!({
        "ok": true,
        "data": {
            "chip": chip,
            "security": security.map(|s| serde_json::json!({
                "flags": s.flags,
                "flash_crypt_cnt": s.flash_crypt_cnt,
                "key_purposes": s.key_purposes,
                "chip_id": s.chip_id,
                "api_version": s.api_version,
                "secure_boot": s.secure_boot_enabled(),
                "flash_encryption": s.flash_encryption_enabled(),
            })),
        }
    })
}

fn print_info(chip: &ChipInfo, security: Option<&SecurityInfo>) {
    eprintln!("\n{}", style("Chip information").bold().underlined());
    eprintln!("  Chip:        {}", style(&chip.description).cyan().bold());
    eprintln!("  Model:       {}", chip.model);
    if let Some(mac) = &chip.mac {
        eprintln!("  MAC:         {mac}");
    }
    if let Some(flash) = chip.flash_size_mb {
        eprintln!("  Flash:       {flash} MB (embedded)");
    }
    if let Some(psram) = chip.psram_size_mb {
        eprintln!("  PSRAM:       {psram} MB (embedded)");
    }

    let Some(security) = security else {
        return;
    };
    let on_off = |enabled: bool| if enabled { "enabled" } else { "disabled" };
    eprintln!("\n{}", style("Security").bold().underlined());
    eprintln!("  Flags:            0x{:08X}", security.flags);
    eprintln!("  Secure boot:      {}", on_off(security.secure_boot_enabled()));
    eprintln!("  Flash encryption: {}", on_off(security.flash_encryption_enabled()));
    eprintln!("  Key purposes:     {:?}", security.key_purposes);
    if let Some(chip_id) = security.chip_id {
        eprintln!("  Chip id:          {chip_id}");
    }
    if let Some(api) = security.api_version {
        eprintln!("  API version:      {api}");
    }
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let settings = session_config(
        cli,
        config,
        &SessionOptions {
            use_stub: false,
            compress: true,
            flash_baud: None,
        },
    )?;
    let mut session = connect(cli, config, settings, |_| {})?;

    // older ROMs reject GET_SECURITY_INFO
    let security = match session.security_info() {
        Ok(info) => Some(info),
        Err(e) => {
            debug!("Security info unavailable: {e}");
            None
        },
    };
    let chip = session
        .chip_info()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("connected without chip information"))?;
    session.close();

    if json {
        println!("{}", serde_json::to_string_pretty(&info_json(&chip, security.as_ref()))?);
    } else {
        print_info(&chip, security.as_ref());
    }
    Ok(())
}
