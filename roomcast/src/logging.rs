use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    sync::Mutex,
};

use chrono::Local;
use tracing_subscriber::{fmt::MakeWriter, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// With a non-empty `log_file`, output is appended to `<log_file>.YYYYMMDD`,
/// one file per calendar day; otherwise it goes to stdout. An unwritable log
/// path falls back to stdout.
pub fn init(log_file: &str) {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();

    if log_file.is_empty() || DailyFile::probe(log_file).is_err() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(DailyFile::new(log_file))
            .init();
    }
}

/// Appends to `<base>.YYYYMMDD`, reopening the file when the day changes.
#[derive(Debug)]
struct DailyFile {
    base: String,
    current: Mutex<Option<(String, File)>>,
}

impl DailyFile {
    fn new(base: &str) -> Self {
        Self {
            base: base.to_owned(),
            current: Mutex::new(None),
        }
    }

    fn probe(base: &str) -> io::Result<()> {
        open_append(&format!("{base}.{}", day_suffix())).map(|_| ())
    }

    fn append(&self, buf: &[u8]) -> io::Result<usize> {
        let suffix = day_suffix();
        let mut current = match self.current.lock() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };

        let reopen = match current.as_ref() {
            Some((day, _)) => *day != suffix,
            None => true,
        };
        if reopen {
            let file = open_append(&format!("{}.{suffix}", self.base))?;
            *current = Some((suffix, file));
        }

        if let Some((_, file)) = current.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }
}

fn day_suffix() -> String {
    Local::now().format("%Y%m%d").to_string()
}

fn open_append(path: &str) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

struct DailyWriter<'a>(&'a DailyFile);

impl Write for DailyWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.append(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DailyFile {
    type Writer = DailyWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        DailyWriter(self)
    }
}
