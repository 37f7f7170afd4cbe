mod pretty_list;

use std::fmt::Write as FmtWrite;

use anyhow::{Context, Result};
use flexi_logger::{DeferredNow, Logger, LoggerHandle, Record};
use textwrap::{termwidth, Options};

pub use self::pretty_list::PrettyList;

/// Setup console logging for this application.
///
/// Logging stops when the returned handle is dropped, so keep it alive for
/// the life of the program.
pub fn setup() -> Result<LoggerHandle> {
    let handle = Logger::try_with_env_or_str("info")
        .context("Invalid RUST_LOG log specification")?
        .format(multiline_format)
        .start()
        .context("Unable to start the logger")?;

    log::info!(
        "Adjust the log level by setting RUST_LOG. By default RUST_LOG=info"
    );

    Ok(handle)
}

/// An opinionated formatting function for flexi_logger which automatically
/// wraps content to the terminal width.
pub fn multiline_format(
    w: &mut dyn std::io::Write,
    now: &mut DeferredNow,
    record: &Record,
) -> Result<(), std::io::Error> {
    let size = termwidth().min(74);
    let wrap_options = Options::new(size)
        .initial_indent("┏ ")
        .subsequent_indent("┃ ");

    writeln!(w, "{}", textwrap::fill(&format_record(now, record), wrap_options))
}

fn format_record(now: &mut DeferredNow, record: &Record) -> String {
    let mut full_line = String::new();

    // Writing to a String only fails if a Display impl fails, which leaves
    // the partial line in place.
    let _ = writeln!(
        full_line,
        "{} [{}] [{}:{}]",
        record.level(),
        now.now().format("%H:%M:%S%.6f"),
        record.file().unwrap_or("<unnamed>"),
        record.line().unwrap_or(0),
    );
    let _ = write!(full_line, "{}", record.args());
    full_line
}

#[cfg(test)]
mod tests {
    use {super::*, log::Level};

    #[test]
    fn records_carry_level_location_and_message() {
        let mut now = DeferredNow::new();

        let line = format_record(
            &mut now,
            &Record::builder()
                .level(Level::Debug)
                .file(Some("src/sync/sync_manager.rs"))
                .line(Some(42))
                .args(format_args!("Created {} frames in flight", 2))
                .build(),
        );

        assert!(line.starts_with("DEBUG ["));
        assert!(line.contains("[src/sync/sync_manager.rs:42]"));
        assert!(line.ends_with("Created 2 frames in flight"));
    }
}
