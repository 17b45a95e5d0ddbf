//! Structured logging capability handed to every probe.
//!
//! Probes never reach for a global logger: they receive an `Arc<dyn Logger>`
//! at construction. [`LogLogger`] forwards to the [`log`] facade, passing its
//! fields as `log` key-values, so the binary decides where records end up and
//! how they look (see [`init`]); [`NullLogger`] drops them.
use std::fmt::{self, Display, Write as _};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write as _};
use std::path::Path;
use std::sync::Arc;

use log::kv::{self, Key, Value, VisitSource};
use log::{Level, Record};

use crate::error::Error;

/// A key/value pair attached to a log record.
pub type Field<'a> = (&'a str, &'a dyn Display);

/// Logging capability with structured context.
pub trait Logger: Send + Sync {
    /// Emits one record. `fields` are attached after the logger's own fields.
    fn log(&self, level: Level, msg: &str, fields: &[Field<'_>]);

    /// Returns a logger that attaches `fields` to every record, on top of the
    /// fields this logger already carries.
    fn with_fields(&self, fields: &[Field<'_>]) -> Arc<dyn Logger>;

    fn debug(&self, msg: &str, fields: &[Field<'_>]) {
        self.log(Level::Debug, msg, fields);
    }

    fn info(&self, msg: &str, fields: &[Field<'_>]) {
        self.log(Level::Info, msg, fields);
    }

    fn warn(&self, msg: &str, fields: &[Field<'_>]) {
        self.log(Level::Warn, msg, fields);
    }

    fn error(&self, msg: &str, fields: &[Field<'_>]) {
        self.log(Level::Error, msg, fields);
    }

    /// Logs at error level, marked `fatal=true`. Does not exit; callers decide.
    fn fatal(&self, msg: &str, fields: &[Field<'_>]) {
        let mut all: Vec<Field<'_>> = fields.to_vec();
        all.push(("fatal", &true));
        self.log(Level::Error, msg, &all);
    }
}

/// Forwards records to the `log` facade with fields as key-values.
#[derive(Debug, Clone)]
pub struct LogLogger {
    target: &'static str,
    fields: Vec<(String, String)>,
}

impl LogLogger {
    pub const fn new(target: &'static str) -> Self {
        Self {
            target,
            fields: Vec::new(),
        }
    }

    /// A copy carrying `fields` as well. A repeated key takes the new value.
    fn scoped(&self, fields: &[Field<'_>]) -> Self {
        let mut scoped = self.clone();
        for (key, value) in fields {
            let value = value.to_string();
            match scoped.fields.iter_mut().find(|(k, _)| k == key) {
                Some(existing) => existing.1 = value,
                None => scoped.fields.push(((*key).to_owned(), value)),
            }
        }
        scoped
    }

    /// Persistent fields followed by the call's fields.
    fn pairs(&self, fields: &[Field<'_>]) -> Vec<(String, String)> {
        self.fields
            .iter()
            .cloned()
            .chain(fields.iter().map(|(k, v)| ((*k).to_owned(), v.to_string())))
            .collect()
    }
}

impl Default for LogLogger {
    fn default() -> Self {
        Self::new("netprobe")
    }
}

impl Logger for LogLogger {
    fn log(&self, level: Level, msg: &str, fields: &[Field<'_>]) {
        if level > log::max_level() {
            return;
        }

        let pairs = self.pairs(fields);
        let kvs: Vec<(&str, &str)> = pairs
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let kvs = kvs.as_slice();

        log::logger().log(
            &Record::builder()
                .args(format_args!("{msg}"))
                .level(level)
                .target(self.target)
                .key_values(&kvs)
                .build(),
        );
    }

    fn with_fields(&self, fields: &[Field<'_>]) -> Arc<dyn Logger> {
        Arc::new(self.scoped(fields))
    }
}

/// Discards everything. Handy for tests and library callers without logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: Level, _msg: &str, _fields: &[Field<'_>]) {}

    fn with_fields(&self, _fields: &[Field<'_>]) -> Arc<dyn Logger> {
        Arc::new(Self)
    }
}

/// Output format of the process-wide log backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("invalid log format: {other}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Json => "json",
        })
    }
}

/// Installs `env_logger` as the `log` backend. `RUST_LOG` still wins over
/// `level` when set.
///
/// Records go to stderr. With `file` they are also appended to that file,
/// whose parent directories are created as needed.
pub fn init(level: log::LevelFilter, format: LogFormat, file: Option<&Path>) -> Result<(), Error> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_default_env();

    builder.format(move |buf, record| {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let message = record.args().to_string();
        let fields = record_fields(record);
        match format {
            LogFormat::Text => writeln!(
                buf,
                "{}",
                text_line(&timestamp, record.level(), &message, &fields)
            ),
            LogFormat::Json => writeln!(
                buf,
                "{}",
                json_line(&timestamp, record.level(), &message, &fields)
            ),
        }
    });

    if let Some(path) = file {
        let tee = Tee {
            primary: io::stderr(),
            secondary: open_log_file(path)?,
        };
        builder.target(env_logger::Target::Pipe(Box::new(tee)));
    }

    // A second init (tests, embedding) keeps the first backend.
    let _ = builder.try_init();
    Ok(())
}

fn record_fields(record: &Record<'_>) -> Vec<(String, String)> {
    struct Collect(Vec<(String, String)>);

    impl<'kvs> VisitSource<'kvs> for Collect {
        fn visit_pair(&mut self, key: Key<'kvs>, value: Value<'kvs>) -> Result<(), kv::Error> {
            self.0.push((key.to_string(), value.to_string()));
            Ok(())
        }
    }

    let mut collect = Collect(Vec::new());
    let _ = record.key_values().visit(&mut collect);
    collect.0
}

fn text_line(timestamp: &str, level: Level, message: &str, fields: &[(String, String)]) -> String {
    let mut line = format!("{timestamp} {level:<5} {message}");
    for (key, value) in fields {
        let _ = write!(line, " {key}={value}");
    }
    line
}

/// Fields become top-level keys; `timestamp`, `level` and `message` win over
/// a field of the same name.
fn json_line(
    timestamp: &str,
    level: Level,
    message: &str,
    fields: &[(String, String)],
) -> serde_json::Value {
    let mut object: serde_json::Map<String, serde_json::Value> = fields
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::from(v.as_str())))
        .collect();
    object.insert("timestamp".to_owned(), timestamp.into());
    object.insert(
        "level".to_owned(),
        level.as_str().to_ascii_lowercase().into(),
    );
    object.insert("message".to_owned(), message.into());
    serde_json::Value::Object(object)
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Duplicates every write into two sinks.
struct Tee<A, B> {
    primary: A,
    secondary: B,
}

impl<A: io::Write, B: io::Write> io::Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.primary.write_all(buf)?;
        self.secondary.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.primary.flush()?;
        self.secondary.flush()
    }
}
