//! uartboot CLI - Command-line tool for flashing MCUs through a UART bootloader.
//!
//! ## Features
//!
//! - Query the bootloader version and application address
//! - Flash raw binary images with progress and optional verification
//! - Read, erase and checksum flash regions
//! - Jump to the application
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
    uartboot::{BaudRate, ErrorKind, NativePort, Session},
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

/// Default application start address, right after the 32 KiB bootloader.
pub(crate) const DEFAULT_ADDRESS: u32 = 0x0800_8000;

/// Default baud rate of the bootloader UART.
const DEFAULT_BAUD: u32 = 115_200;

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Errors that select the process exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad arguments, missing setup, or a rejected request (exit 2).
    #[error("{0}")]
    Usage(String),
    /// The operation ran and failed (exit 1).
    #[error("{0}")]
    Failed(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Failed(_) => 1,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for any error returned by a command.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }
    match err
        .downcast_ref::<uartboot::Error>()
        .map(uartboot::Error::kind)
    {
        Some(ErrorKind::Rejected) => 2,
        Some(ErrorKind::Cancelled) => 130,
        _ => 1,
    }
}

/// uartboot - Flash MCUs through a UART command/response bootloader.
///
/// Environment variables:
///   UARTBOOT_PORT              - Default serial port
///   UARTBOOT_BAUD              - Default baud rate (default: 115200)
///   UARTBOOT_ADDRESS           - Default flash address (default: 0x08008000)
///   UARTBOOT_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "uartboot")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:
  uartboot --port /dev/ttyUSB0 info
  uartboot flash app.bin --address 0x08008000 --verify --jump
  uartboot read --address 0x08008000 --size 64")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (selected interactively if not specified).
    #[arg(short, long, global = true, env = "UARTBOOT_PORT")]
    pub(crate) port: Option<String>,

    /// Baud rate (9600, 19200, 38400, 57600, 115200, 230400).
    #[arg(short, long, global = true, env = "UARTBOOT_BAUD", value_parser = parse_baud)]
    pub(crate) baud: Option<u32>,

    /// Base read timeout in milliseconds.
    #[arg(long, global = true, value_name = "MS")]
    pub(crate) timeout_ms: Option<u64>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "UARTBOOT_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    /// Print every frame sent and received.
    #[arg(long, global = true)]
    pub(crate) trace_bytes: bool,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Show the bootloader version and application address.
    Info {
        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Erase and program a raw binary image.
    Flash {
        /// Path to the firmware binary.
        firmware: PathBuf,

        /// Flash address of the first byte.
        #[arg(short, long, env = "UARTBOOT_ADDRESS", value_parser = parse_u32)]
        address: Option<u32>,

        /// Compare the device checksum with the image afterwards.
        #[arg(long)]
        verify: bool,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Start the application after flashing.
        #[arg(long)]
        jump: bool,

        /// Output the flash summary as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Read up to 256 bytes of flash.
    Read {
        /// Start address.
        #[arg(short, long, default_value = "0x08008000", value_parser = parse_u32)]
        address: u32,

        /// Number of bytes (1-256).
        #[arg(short, long, default_value = "16", value_parser = parse_u32)]
        size: u32,

        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Erase a flash region.
    Erase {
        /// Start address.
        #[arg(short, long, default_value = "0x08008000", value_parser = parse_u32)]
        address: u32,

        /// Number of bytes.
        #[arg(short, long, default_value = "32768", value_parser = parse_u32)]
        size: u32,

        /// Skip the confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Ask the device for the checksum of a flash region.
    Checksum {
        /// Start address.
        #[arg(short, long, default_value = "0x08008000", value_parser = parse_u32)]
        address: u32,

        /// Number of bytes.
        #[arg(short, long, value_parser = parse_u32)]
        size: u32,

        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Leave the bootloader and start the application.
    Jump,

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse a number as `0x` hexadecimal or decimal, with optional underscores.
pub(crate) fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let (digits, radix) = match s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    let digits: String = digits
        .chars()
        .filter(|c| *c != '_')
        .collect();
    u32::from_str_radix(&digits, radix).map_err(|e| format!("Invalid number '{s}': {e}"))
}

/// Parse and validate a baud rate.
fn parse_baud(s: &str) -> Result<u32, String> {
    let value = parse_u32(s)?;
    BaudRate::try_from(value)
        .map(BaudRate::as_u32)
        .map_err(|e| e.to_string())
}

impl Cli {
    /// Baud rate from the CLI, then config, then the default.
    pub(crate) fn baud_rate(&self, config: &Config) -> Result<BaudRate> {
        let value = self
            .baud
            .or(config.connection.baud)
            .unwrap_or(DEFAULT_BAUD);
        BaudRate::try_from(value).map_err(|e| CliError::Usage(e.to_string()).into())
    }
}

/// Resolve the port, open it, and start a session.
pub(crate) fn open_session(
    cli: &Cli,
    config: &mut Config,
) -> Result<(Session<NativePort>, std::sync::mpsc::Receiver<uartboot::Event>)> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    let selected = select_serial_port(&options, config)?;
    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    let mut link_config = uartboot::LinkConfig::new(&selected.port.name, cli.baud_rate(config)?);
    if let Some(ms) = cli.timeout_ms.or(config.connection.timeout_ms) {
        link_config = link_config.with_timeout(std::time::Duration::from_millis(ms));
    }
    debug!(
        "Opening {} at {} baud",
        link_config.port_name, link_config.baud_rate
    );

    let link = uartboot::LinkChannel::open(&link_config)?;
    let (session, events) = Session::new(link);

    let token = session.cancel_token();
    if let Err(e) = ctrlc::set_handler(move || {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            // Second Ctrl-C: stop waiting for the chunk boundary
            std::process::exit(130);
        }
        token.cancel();
    }) {
        debug!("Ctrl-C handler not installed: {e}");
    }

    Ok((session, events))
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

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Info { json } => commands::device::cmd_info(cli, &mut config, *json),
        Commands::Flash {
            firmware,
            address,
            verify,
            yes,
            jump,
            json,
        } => commands::flash::cmd_flash(
            cli,
            &mut config,
            &commands::flash::FlashArgs {
                firmware: firmware.clone(),
                address: *address,
                verify: *verify,
                yes: *yes,
                jump: *jump,
                json: *json,
            },
        ),
        Commands::Read {
            address,
            size,
            json,
        } => commands::device::cmd_read(cli, &mut config, *address, *size, *json),
        Commands::Erase { address, size, yes } => {
            commands::device::cmd_erase(cli, &mut config, *address, *size, *yes)
        },
        Commands::Checksum {
            address,
            size,
            json,
        } => commands::device::cmd_checksum(cli, &mut config, *address, *size, *json),
        Commands::Jump => commands::device::cmd_jump(cli, &mut config),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

fn main() -> ExitCode {
    // Help, version and usage errors exit here with clap's own codes
    let cli = Cli::parse();

    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    init_logging(&cli);
    debug!(
        "uartboot v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", console::style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}
