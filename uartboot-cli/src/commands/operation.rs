//! Running one session operation and rendering its notifications.

use {
    crate::{Cli, CliError, serial::map_prompt_error, use_fancy_output, was_interrupted},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, theme::ColorfulTheme},
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::debug,
    std::{
        io::IsTerminal,
        sync::mpsc::{Receiver, RecvTimeoutError},
        time::Duration,
    },
    uartboot::{ErrorKind, Event, OperationHandle, Outcome, Report},
};

/// How long to wait for an event before checking the worker again.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to show while an operation runs.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Feedback {
    /// Draw a progress bar from progress notifications.
    pub progress: bool,
    /// Echo status lines on stderr.
    pub status: bool,
    /// Dump every frame sent and received.
    pub trace_bytes: bool,
}

impl Feedback {
    /// Feedback settings for `cli`; `status` applies unless `--quiet`.
    pub(crate) fn for_cli(cli: &Cli, progress: bool, status: bool) -> Self {
        Self {
            progress: progress && !cli.quiet,
            status: status && !cli.quiet,
            trace_bytes: cli.trace_bytes,
        }
    }
}

pub(crate) fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Ask before a destructive operation unless `--yes` was given.
pub(crate) fn confirm(cli: &Cli, yes: bool, prompt: &str) -> Result<()> {
    if yes {
        return Ok(());
    }
    if cli.non_interactive || !std::io::stdin().is_terminal() {
        return Err(CliError::Usage(format!("{prompt} Pass --yes to proceed without asking")).into());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);
    if confirmed {
        Ok(())
    } else {
        Err(CliError::Cancelled("Aborted".to_string()).into())
    }
}

fn progress_bar(feedback: Feedback) -> ProgressBar {
    if !feedback.progress || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

/// One line of a frame dump: `TX (  5): 12 00 80 00 08 | .....`.
pub(crate) fn format_frame(direction: &str, bytes: &[u8]) -> String {
    let hex: Vec<String> = bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect();
    let ascii: String = bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect();
    format!("{direction} ({:3}): {} | {ascii}", bytes.len(), hex.join(" "))
}

fn render(pb: &ProgressBar, feedback: Feedback, event: Event) {
    match event {
        Event::Progress(percent) => pb.set_position(u64::from(percent)),
        Event::Status(line) => {
            debug!("{line}");
            if feedback.status {
                pb.suspend(|| eprintln!("{} {line}", style("ℹ").blue()));
            }
        },
        Event::Tx(bytes) if feedback.trace_bytes => {
            pb.suspend(|| eprintln!("{}", style(format_frame("TX", &bytes)).cyan()));
        },
        Event::Rx(bytes) if feedback.trace_bytes => {
            pb.suspend(|| eprintln!("{}", style(format_frame("RX", &bytes)).green()));
        },
        Event::Tx(_) | Event::Rx(_) | Event::Finished(_) => {},
    }
}

/// Map a terminal outcome to the report or an exit-code carrying error.
pub(crate) fn into_report(outcome: Outcome) -> Result<Report> {
    match outcome {
        Outcome::Succeeded(report) => Ok(report),
        Outcome::Failed(failure) => Err(match failure.kind {
            ErrorKind::Cancelled => CliError::Cancelled(failure.message),
            ErrorKind::Rejected => CliError::Usage(failure.message),
            _ => CliError::Failed(failure.message),
        }
        .into()),
    }
}

/// Render `events` until `handle` finishes, then return its report.
pub(crate) fn drive(
    handle: OperationHandle,
    events: &Receiver<Event>,
    feedback: Feedback,
) -> Result<Report> {
    let pb = progress_bar(feedback);
    debug!("Waiting for {}", handle.kind());

    loop {
        match events.recv_timeout(POLL_INTERVAL) {
            Ok(Event::Finished(_)) => break,
            Ok(event) => render(&pb, feedback, event),
            Err(RecvTimeoutError::Timeout) => {
                if handle.is_finished() {
                    // Worker gone without a Finished notification
                    while let Ok(event) = events.try_recv() {
                        render(&pb, feedback, event);
                    }
                    break;
                }
            },
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let outcome = handle.wait();
    if outcome.is_success() {
        pb.finish_and_clear();
    } else {
        pb.abandon();
    }
    into_report(outcome)
}
