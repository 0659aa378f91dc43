//! Single-request commands: info, read, erase, checksum and jump.

use {
    super::operation::{Feedback, confirm, drive, ensure_not_interrupted},
    crate::{Cli, config::Config, open_session},
    anyhow::{Result, anyhow},
    console::style,
    log::debug,
    uartboot::{BootloaderInfo, Report, Request},
};

/// Bytes per line of the read hex dump.
const DUMP_WIDTH: usize = 16;

/// Open a session, run one request and close the link again.
///
/// Invalid requests are refused before the port is touched.
pub(crate) fn run_request(
    cli: &Cli,
    config: &mut Config,
    feedback: Feedback,
    request: Request,
) -> Result<Report> {
    request.validate()?;
    let (session, events) = open_session(cli, config)?;
    ensure_not_interrupted()?;

    let result = session
        .submit(request)
        .map_err(anyhow::Error::from)
        .and_then(|handle| drive(handle, &events, feedback));

    if let Err(e) = session.close() {
        debug!("Closing the link failed: {e}");
    }
    result
}

fn unexpected(report: &Report) -> anyhow::Error {
    anyhow!("Unexpected report from the device session: {report:?}")
}

fn hex_string(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect()
}

/// Hex dump with one `0xADDRESS:` prefixed line per 16 bytes.
pub(crate) fn hex_dump(address: u32, data: &[u8]) -> Vec<String> {
    data.chunks(DUMP_WIDTH)
        .enumerate()
        .map(|(i, line)| {
            let offset = (i * DUMP_WIDTH) as u32;
            let bytes: Vec<String> = line
                .iter()
                .map(|b| format!("{b:02X}"))
                .collect();
            format!(
                "0x{:08X}: {}",
                address.wrapping_add(offset),
                bytes.join(" ")
            )
        })
        .collect()
}

/// Print `data` inside the `{"ok": true, "data": ...}` envelope.
pub(crate) fn print_json(data: serde_json::Value) -> Result<()> {
    let output = serde_json::json!({
        "ok": true,
        "data": data,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn info_json(info: &BootloaderInfo) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(info)?)
}

/// Info command implementation.
pub(crate) fn cmd_info(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let report = run_request(
        cli,
        config,
        Feedback::for_cli(cli, false, false),
        Request::GetInfo,
    )?;
    let Report::Info(info) = report else {
        return Err(unexpected(&report));
    };

    if json {
        return print_json(info_json(&info)?);
    }

    println!("Bootloader version:  {}", info.version);
    println!("Application address: 0x{:08X}", info.app_address);
    Ok(())
}

/// Read command implementation.
pub(crate) fn cmd_read(
    cli: &Cli,
    config: &mut Config,
    address: u32,
    size: u32,
    json: bool,
) -> Result<()> {
    let report = run_request(
        cli,
        config,
        Feedback::for_cli(cli, false, false),
        Request::ReadFlash { address, size },
    )?;
    let Report::Read { address, data } = report else {
        return Err(unexpected(&report));
    };

    if json {
        return print_json(serde_json::json!({
            "address": format!("0x{address:08X}"),
            "size": data.len(),
            "data": hex_string(&data),
        }));
    }

    for line in hex_dump(address, &data) {
        println!("{line}");
    }
    Ok(())
}

/// Erase command implementation.
pub(crate) fn cmd_erase(
    cli: &Cli,
    config: &mut Config,
    address: u32,
    size: u32,
    yes: bool,
) -> Result<()> {
    let request = Request::EraseFlash { address, size };
    request.validate()?;
    confirm(
        cli,
        yes,
        &format!("Erase {size} bytes at 0x{address:08X}?"),
    )?;

    let report = run_request(cli, config, Feedback::for_cli(cli, false, true), request)?;
    if !matches!(report, Report::Erased { .. }) {
        return Err(unexpected(&report));
    }

    if !cli.quiet {
        eprintln!(
            "{} Erased {size} bytes at 0x{address:08X}",
            style("✓").green()
        );
    }
    Ok(())
}

/// Checksum command implementation.
pub(crate) fn cmd_checksum(
    cli: &Cli,
    config: &mut Config,
    address: u32,
    size: u32,
    json: bool,
) -> Result<()> {
    let report = run_request(
        cli,
        config,
        Feedback::for_cli(cli, false, false),
        Request::Checksum { address, size },
    )?;
    let Report::Checksum {
        address,
        size,
        value,
    } = report
    else {
        return Err(unexpected(&report));
    };

    if json {
        return print_json(serde_json::json!({
            "address": format!("0x{address:08X}"),
            "size": size,
            "checksum": format!("0x{value:08X}"),
        }));
    }

    println!("0x{value:08X}");
    Ok(())
}

/// Jump command implementation.
pub(crate) fn cmd_jump(cli: &Cli, config: &mut Config) -> Result<()> {
    let report = run_request(
        cli,
        config,
        Feedback::for_cli(cli, false, true),
        Request::JumpToApplication,
    )?;
    if report != Report::Jumped {
        return Err(unexpected(&report));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_dump_single_line() {
        assert_eq!(
            hex_dump(0x0800_8000, &[0xDE, 0xAD, 0xBE, 0xEF]),
            vec!["0x08008000: DE AD BE EF".to_string()]
        );
    }

    #[test]
    fn test_hex_dump_wraps_every_sixteen_bytes() {
        let data: Vec<u8> = (0..20).collect();
        let lines = hex_dump(0x0800_8000, &data);
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "0x08008000: 00 01 02 03 04 05 06 07 08 09 0A 0B 0C 0D 0E 0F"
        );
        assert_eq!(lines[1], "0x08008010: 10 11 12 13");
    }

    #[test]
    fn test_hex_dump_empty() {
        assert!(hex_dump(0, &[]).is_empty());
    }

    #[test]
    fn test_info_json_fields() {
        let info = BootloaderInfo {
            version: 2,
            app_address: 0x0800_8000,
        };
        assert_eq!(
            info_json(&info).unwrap(),
            serde_json::json!({"version": 2, "app_address": 0x0800_8000u32})
        );
    }

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(&[0x00, 0xFF, 0x5A]), "00FF5A");
    }
}
