use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Debug categories that can be switched on independently of the global level.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Category {
    BlockStorage,
    Prune,
    Reindex,
    Validation,
    Coins,
    Lock,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::BlockStorage,
        Category::Prune,
        Category::Reindex,
        Category::Validation,
        Category::Coins,
        Category::Lock,
    ];

    pub const fn bit(self) -> u32 {
        match self {
            Category::BlockStorage => 1 << 0,
            Category::Prune => 1 << 1,
            Category::Reindex => 1 << 2,
            Category::Validation => 1 << 3,
            Category::Coins => 1 << 4,
            Category::Lock => 1 << 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::BlockStorage => "blockstorage",
            Category::Prune => "prune",
            Category::Reindex => "reindex",
            Category::Validation => "validation",
            Category::Coins => "coins",
            Category::Lock => "lock",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|category| category.as_str() == raw)
    }
}

/// Parses a comma separated category list into a mask. `all` and `1` enable
/// everything, `none` and `0` clear the mask.
pub fn parse_categories(raw: &str) -> Result<u32, String> {
    let mut mask = 0u32;
    for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        match item.to_ascii_lowercase().as_str() {
            "all" | "1" => {
                mask = Category::ALL
                    .iter()
                    .fold(0, |acc, category| acc | category.bit())
            }
            "none" | "0" => mask = 0,
            other => match Category::parse(other) {
                Some(category) => mask |= category.bit(),
                None => return Err(format!("unknown debug category '{other}'")),
            },
        }
    }
    Ok(mask)
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
    pub categories: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
            categories: 0,
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static LOG_FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static LOG_TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static LOG_CATEGORIES: AtomicU32 = AtomicU32::new(0);

pub fn init(config: LogConfig) {
    LOG_LEVEL.store(config.level as u8, Ordering::Relaxed);
    LOG_FORMAT.store(config.format as u8, Ordering::Relaxed);
    LOG_TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
    LOG_CATEGORIES.store(config.categories, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn category_enabled(category: Category) -> bool {
    LOG_CATEGORIES.load(Ordering::Relaxed) & category.bit() != 0
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    emit(&Record {
        level,
        category: None,
        target,
        file,
        line,
        args,
    });
}

pub fn log_for(
    category: Category,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    emit(&Record {
        level: Level::Debug,
        category: Some(category),
        target,
        file,
        line,
        args,
    });
}

struct Record<'a> {
    level: Level,
    category: Option<Category>,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'a>,
}

impl Record<'_> {
    fn write_text(&self, out: &mut impl Write, now: Option<Duration>) -> io::Result<()> {
        if let Some(now) = now {
            write!(out, "{} ", utc_timestamp(now))?;
        }
        write!(out, "{}", self.level.as_str())?;
        if let Some(category) = self.category {
            write!(out, " [{}]", category.as_str())?;
        }
        writeln!(out, " {}: {}", self.target, self.args)
    }

    fn to_json(&self, now: Duration) -> serde_json::Value {
        json!({
            "ts_ms": u64::try_from(now.as_millis()).unwrap_or(u64::MAX),
            "level": self.level.as_str(),
            "category": self.category.map(Category::as_str),
            "target": self.target,
            "file": self.file,
            "line": self.line,
            "msg": self.args.to_string(),
        })
    }
}

fn emit(record: &Record<'_>) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut out = io::stderr().lock();
    let _ = if LOG_FORMAT.load(Ordering::Relaxed) == Format::Json as u8 {
        writeln!(out, "{}", record.to_json(now))
    } else {
        let stamp = LOG_TIMESTAMPS.load(Ordering::Relaxed).then_some(now);
        record.write_text(&mut out, stamp)
    };
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

/// Logs at debug level when `$category` is enabled, whatever the global level.
#[macro_export]
macro_rules! log_category {
    ($category:expr, $($arg:tt)*) => {{
        if $crate::category_enabled($category) || $crate::enabled($crate::Level::Trace) {
            $crate::log_for($category, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

/// RFC 3339 UTC with millisecond precision.
fn utc_timestamp(since_epoch: Duration) -> String {
    let secs = since_epoch.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let of_day = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        of_day / 3600,
        of_day % 3600 / 60,
        of_day % 60,
        since_epoch.subsec_millis(),
    )
}

// Howard Hinnant's days-to-civil conversion.
fn civil_from_days(days_since_unix_epoch: i64) -> (i32, u32, u32) {
    let z = days_since_unix_epoch + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = (yoe as i32) + (era as i32) * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = y + if m <= 2 { 1 } else { 0 };
    (year, m, d)
}
