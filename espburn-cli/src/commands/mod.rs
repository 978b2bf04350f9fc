//! Command implementations.
//!
//! Each subcommand is implemented in its own module; connecting to a chip is
//! shared here.

pub(crate) mod completions;
pub(crate) mod flash;
pub(crate) mod info;

use {
    crate::{Cli, CliError, config::Config, get_port, was_interrupted},
    anyhow::{Context, Result},
    console::style,
    espburn::{
        Event, FrameTracer, NativePort, Session, SessionConfig, StubStore,
        session::{DEFAULT_BAUD, DEFAULT_FLASH_BAUD},
    },
    log::warn,
};

/// What a command needs from the session beyond the global flags.
pub(crate) struct SessionOptions {
    /// Upload the stub when one is available.
    pub use_stub: bool,
    /// Compress flash data.
    pub compress: bool,
    /// Explicit post-stub baud rate.
    pub flash_baud: Option<u32>,
}

pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

fn load_stubs(cli: &Cli, config: &Config) -> Result<StubStore> {
    let dir = cli
        .stub_dir
        .as_ref()
        .or(config.flash.stub_dir.as_ref());
    match dir {
        Some(dir) => StubStore::from_dir(dir)
            .with_context(|| format!("Failed to load stubs from {}", dir.display())),
        None => Ok(StubStore::new()),
    }
}

/// Build the session settings from flags, config and defaults.
pub(crate) fn session_config(cli: &Cli, config: &Config, options: &SessionOptions) -> Result<SessionConfig> {
    let stubs = if options.use_stub {
        load_stubs(cli, config)?
    } else {
        StubStore::new()
    };
    if options.use_stub && stubs.is_empty() {
        warn!("No stub images configured (--stub-dir); using the ROM loader");
    }

    let tracer = if cli.trace {
        FrameTracer::log()
    } else {
        FrameTracer::disabled()
    };

    Ok(SessionConfig::default()
        .with_baud(
            cli.baud
                .or(config.port.connection.baud)
                .unwrap_or(DEFAULT_BAUD),
        )
        .with_flash_baud(
            options
                .flash_baud
                .or(config.flash.baud)
                .unwrap_or(DEFAULT_FLASH_BAUD),
        )
        .with_compression(options.compress && config.flash.compress.unwrap_or(true))
        .with_stub(options.use_stub)
        .with_stubs(stubs)
        .with_tracer(tracer))
}

/// Select a port, open it and connect.
///
/// `on_event` receives every session event after the connect banner has been
/// printed.
pub(crate) fn connect<F>(
    cli: &Cli,
    config: &mut Config,
    settings: SessionConfig,
    mut on_event: F,
) -> Result<Session<NativePort>>
where
    F: FnMut(&Event) + Send + 'static,
{
    let port_name = get_port(cli, config)?;
    ensure_not_interrupted()?;
    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} baud",
            style("🔌").cyan(),
            style(&port_name).cyan(),
            settings.baud
        );
    }

    let port = espburn::host::open_port(&port_name)
        .with_context(|| format!("Failed to open serial port {port_name}"))?;

    let quiet = cli.quiet;
    let mut session = Session::new(settings).on_event(move |event| {
        if let (Event::Connect(chip), false) = (event, quiet) {
            eprintln!("{} Connected to {}", style("✓").green(), chip.description);
        }
        on_event(event);
    });

    if !cli.quiet {
        eprintln!("{} Waiting for the bootloader...", style("⏳").yellow());
    }
    session
        .open(port)
        .context("Failed to connect to the chip")?;
    Ok(session)
}
