//! Flash command implementation.

use {
    super::{
        device::print_json,
        operation::{Feedback, confirm, drive, ensure_not_interrupted},
    },
    crate::{Cli, DEFAULT_ADDRESS, config::Config, open_session},
    anyhow::{Result, anyhow},
    console::style,
    log::debug,
    std::{io::IsTerminal, path::PathBuf},
    uartboot::{CHUNK_SIZE, FirmwareImage, FlashSummary, Report, Request},
};

/// Arguments of `uartboot flash`.
#[derive(Debug, Clone)]
pub(crate) struct FlashArgs {
    pub firmware: PathBuf,
    pub address: Option<u32>,
    pub verify: bool,
    pub yes: bool,
    pub jump: bool,
    pub json: bool,
}

impl FlashArgs {
    /// Target address: argument, then config, then the default.
    fn start_address(&self, config: &Config) -> u32 {
        self.address
            .or(config.flash.address)
            .unwrap_or(DEFAULT_ADDRESS)
    }
}

fn summary_json(summary: &FlashSummary) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(summary)?)
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &mut Config, args: &FlashArgs) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware {}",
            style("📦").cyan(),
            args.firmware.display()
        );
    }

    // Unreadable or empty images fail before any port is opened
    let image = FirmwareImage::from_file(&args.firmware)?;
    let start_address = args.start_address(config);
    let verify = args.verify || config.flash.verify;
    let bytes = image.len();

    let request = Request::FlashFirmware {
        image: image.into_data(),
        start_address,
        verify,
    };
    request.validate()?;

    if !cli.quiet {
        eprintln!(
            "{} {bytes} bytes in {} chunks to 0x{start_address:08X}{}",
            style("ℹ").blue(),
            bytes.div_ceil(CHUNK_SIZE),
            if verify { " (verify)" } else { "" }
        );
    }

    if !args.yes && !cli.non_interactive && std::io::stdin().is_terminal() {
        confirm(
            cli,
            false,
            &format!("Erase and program {bytes} bytes at 0x{start_address:08X}?"),
        )?;
    }

    let (session, events) = open_session(cli, config)?;
    let result = (|| -> Result<()> {
        ensure_not_interrupted()?;
        let handle = session.submit(request)?;
        let report = drive(handle, &events, Feedback::for_cli(cli, true, true))?;
        let Report::Flashed(summary) = report else {
            return Err(anyhow!("Unexpected report from the device session: {report:?}"));
        };

        if !cli.quiet {
            eprintln!(
                "{} Flashed {} bytes in {} chunks at 0x{:08X}",
                style("✓").green(),
                summary.bytes,
                summary.chunks,
                summary.start_address
            );
            if let Some(checksum) = summary.checksum {
                eprintln!(
                    "{} Verified checksum 0x{checksum:08X}",
                    style("✓").green()
                );
            }
        }

        if args.jump {
            ensure_not_interrupted()?;
            let handle = session.jump_to_application()?;
            drive(handle, &events, Feedback::for_cli(cli, false, true))?;
        }
        if args.json {
            print_json(summary_json(&summary)?)?;
        }
        Ok(())
    })();

    if let Err(e) = session.close() {
        debug!("Closing the link failed: {e}");
    }

    if result.is_ok() && !cli.quiet {
        eprintln!("\n{} Flash completed", style("🎉").green().bold());
    }
    result
}
