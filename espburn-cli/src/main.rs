//! espburn CLI - Command-line tool for flashing Espressif chips.
//!
//! ## Features
//!
//! - Write one or more binaries to flash through the ROM loader or stub
//! - Read chip identity and security state
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress bars and symbols should be drawn.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors that map to a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or setup the user has to fix (exit 2).
    #[error("{0}")]
    Usage(String),
    /// The user cancelled (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

/// Exit code for an error returned from a command.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return match cli_err {
                CliError::Usage(_) => 2,
                CliError::Cancelled(_) => 130,
            };
        }
        if let Some(espburn::Error::Interrupted) = cause.downcast_ref::<espburn::Error>() {
            return 130;
        }
    }
    1
}

/// espburn - A cross-platform tool for flashing Espressif chips.
///
/// Environment variables:
///   ESPBURN_PORT              - Default serial port
///   ESPBURN_BAUD              - ROM loader baud rate (default: 115200)
///   ESPBURN_STUB_DIR          - Directory with stub_flasher_*.json files
///   ESPBURN_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "espburn")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "ESPBURN_PORT")]
    port: Option<String>,

    /// Baud rate for the ROM loader.
    #[arg(short, long, global = true, env = "ESPBURN_BAUD")]
    baud: Option<u32>,

    /// Directory holding `stub_flasher_<chip>.json` stub images.
    #[arg(long, global = true, value_name = "DIR", env = "ESPBURN_STUB_DIR")]
    stub_dir: Option<PathBuf>,

    /// Log every frame sent and received (needs -vv to show).
    #[arg(long, global = true)]
    trace: bool,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ESPBURN_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
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
    /// Write binaries to flash and reset into them.
    Flash {
        /// Binary to write, as `file:address` (repeatable).
        #[arg(long = "bin", required = true, value_parser = parse_bin_arg)]
        bins: Vec<(PathBuf, u32)>,

        /// SPI flash mode written into the image header (qio, qout, dio, dout, keep).
        #[arg(long)]
        flash_mode: Option<espburn::FlashMode>,

        /// SPI flash frequency written into the image header (40m, 26m, 20m, 80m, keep).
        #[arg(long)]
        flash_freq: Option<espburn::FlashFreq>,

        /// Flash size written into the image header (e.g. 4MB, keep).
        #[arg(long)]
        flash_size: Option<espburn::FlashSize>,

        /// Baud rate to switch to once the stub runs.
        #[arg(long)]
        flash_baud: Option<u32>,

        /// Send data uncompressed.
        #[arg(long)]
        no_compress: bool,

        /// Stay on the ROM loader even when a stub is available.
        #[arg(long)]
        no_stub: bool,
    },

    /// Connect and show the chip's identity and security state.
    Info {
        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Parse binary argument in format "file:address".
///
/// The split happens at the last colon so Windows drive letters survive.
fn parse_bin_arg(s: &str) -> Result<(PathBuf, u32), String> {
    let (path, addr) = s.rsplit_once(':').ok_or_else(|| {
        format!("Invalid format: '{s}'. Expected 'file:address' (e.g., 'app.bin:0x10000')")
    })?;
    if path.is_empty() {
        return Err(format!("Missing file name in '{s}'"));
    }
    Ok((PathBuf::from(path), parse_hex_u32(addr)?))
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
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
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    debug!(
        "espburn v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    espburn::set_interrupt_checker(was_interrupted);

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code(&err));
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    match &cli.command {
        Commands::Flash {
            bins,
            flash_mode,
            flash_freq,
            flash_size,
            flash_baud,
            no_compress,
            no_stub,
        } => commands::flash::cmd_flash(
            cli,
            &mut config,
            &commands::flash::FlashOptions {
                bins,
                flash_mode: *flash_mode,
                flash_freq: *flash_freq,
                flash_size: flash_size.clone(),
                flash_baud: *flash_baud,
                compress: !*no_compress,
                use_stub: !*no_stub,
            },
        ),
        Commands::Info { json } => commands::info::cmd_info(cli, &mut config, *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: espburn completions bash \
                         (or use --install to auto-detect)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get serial port from CLI args or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
