use std::fs::{self, File, OpenOptions};
use std::io::{self, Stdout, Write};

use anyhow::{anyhow, Result};
use slog::{o, Drain, Logger};

use mqflux_conf::logging::{Log, Output};

/// Installs the slog root logger and routes the `log` facade into it.
///
/// The returned guard flushes the async drain when dropped.
pub fn logger_init(cfg: &Log) -> Result<Option<slog_async::AsyncGuard>> {
    if cfg.output == Output::Off {
        log::set_max_level(log::LevelFilter::Off);
        return Ok(None);
    }
    let (logger, guard) = config_logger(cfg)?;
    log::set_boxed_logger(Box::new(LoggerEx { logger, cfg: cfg.clone() }))?;
    log::set_max_level(slog_log_to_level(cfg.max_level()).to_level_filter());
    Ok(Some(guard))
}

fn config_logger(cfg: &Log) -> Result<(Logger, slog_async::AsyncGuard)> {
    let file = if cfg.output.file() { Some(open_file(cfg)?) } else { None };
    let writer = WriteFilter { output: cfg.output, file, console: io::stdout() };
    let decorator = slog_term::PlainSyncDecorator::new(writer);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let (drain, guard) = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build_with_guard();
    Ok((Logger::root(drain.fuse(), o!()), guard))
}

/// Bridges `log` records into slog, applying the per-target thresholds.
struct LoggerEx {
    logger: Logger,
    cfg: Log,
}

impl log::Log for LoggerEx {
    fn enabled(&self, m: &log::Metadata) -> bool {
        log_to_slog_level(m.level()).is_at_least(self.cfg.level_for(m.target()))
    }

    fn log(&self, r: &log::Record) {
        if !self.enabled(r.metadata()) {
            return;
        }
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.logger.log(&slog::Record::new(&s, args, slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_log_to_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error => log::Level::Error,
        slog::Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

struct WriteFilter {
    output: Output,
    file: Option<File>,
    console: Stdout,
}

impl Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.output.console() {
            self.console.write_all(buf)?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.output.console() {
            self.console.flush()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_file(cfg: &Log) -> Result<File> {
    if let Some(dir) = cfg.file_dir() {
        fs::create_dir_all(dir).map_err(|e| anyhow!("log dir {} can not be created, {}", dir.display(), e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&cfg.file)
        .map_err(|e| anyhow!("log file {} can not be opened, {}", cfg.file, e))
}
