use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use blockd_chainstate::blockstorage::PruneMode;
use blockd_chainstate::verify::{DEFAULT_CHECKBLOCKS, DEFAULT_CHECKLEVEL, MAX_CHECKLEVEL};
use blockd_consensus::{chain_params, Network};

use crate::logging;

pub(crate) const CONF_FILE_NAME: &str = "blockd.conf";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60;
/// Smallest automatic prune target, in MiB.
pub(crate) const MIN_PRUNE_TARGET_MIB: u64 = 550;

/// Options that take a value. Everything else on the command line is a flag.
const VALUE_OPTIONS: &[&str] = &[
    "data-dir",
    "blocks-dir",
    "conf",
    "network",
    "backend",
    "prune",
    "loadblock",
    "checkblocks",
    "checklevel",
    "log-level",
    "log-format",
    "debug",
    "flush-interval",
    "db-cache",
];

const FLAG_OPTIONS: &[&str] = &[
    "fast-prune",
    "reindex",
    "reindex-chainstate",
    "stop-after-import",
    "log-timestamps",
    "db-info",
];

/// Only meaningful on the command line; ignored when found in the conf file.
const CLI_ONLY_OPTIONS: &[&str] = &["data-dir", "conf", "db-info"];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Config {
    pub(crate) backend: Backend,
    pub(crate) data_dir: PathBuf,
    pub(crate) blocks_dir: PathBuf,
    pub(crate) conf_path: PathBuf,
    pub(crate) network: Network,
    pub(crate) prune: PruneMode,
    pub(crate) fast_prune: bool,
    pub(crate) reindex: bool,
    pub(crate) reindex_chainstate: bool,
    pub(crate) loadblock: Vec<PathBuf>,
    pub(crate) check_blocks: i32,
    pub(crate) check_level: u32,
    pub(crate) stop_after_import: bool,
    pub(crate) flush_interval_secs: u64,
    /// fjall block cache per database, in MiB. `None` keeps the fjall default.
    pub(crate) db_cache_mib: Option<u64>,
    pub(crate) db_info: bool,
    pub(crate) log_level: logging::Level,
    pub(crate) log_format: logging::Format,
    pub(crate) log_timestamps: bool,
    pub(crate) debug_categories: u32,
}

#[derive(Debug)]
pub(crate) enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

type OptionMap = HashMap<String, Vec<String>>;

pub(crate) fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub(crate) fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut cli: OptionMap = HashMap::new();
    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "help" | "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "version" | "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "db-info" => {
                push_option(&mut cli, "db-info", "1");
                continue;
            }
            _ => {}
        }
        let Some(stripped) = arg
            .strip_prefix("--")
            .or_else(|| arg.strip_prefix('-'))
            .filter(|stripped| !stripped.is_empty())
        else {
            return Err(format!("unexpected argument '{arg}'\n\n{}", usage()));
        };
        let (name, inline) = match stripped.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (stripped, None),
        };
        let name = name.to_ascii_lowercase();
        if let Some(positive) = name.strip_prefix("no-") {
            if !FLAG_OPTIONS.contains(&positive) {
                return Err(format!("unknown option '--{name}'"));
            }
            if inline.is_some() {
                return Err(format!("--{name} does not take a value"));
            }
            push_option(&mut cli, positive, "0");
        } else if VALUE_OPTIONS.contains(&name.as_str()) {
            let value = match inline {
                Some(value) => value,
                None => args
                    .next()
                    .ok_or_else(|| format!("missing value for --{name}"))?,
            };
            push_option(&mut cli, &name, &value);
        } else if FLAG_OPTIONS.contains(&name.as_str()) {
            push_option(&mut cli, &name, inline.as_deref().unwrap_or("1"));
        } else {
            return Err(format!("unknown option '--{name}'"));
        }
    }

    let data_dir = last_value(&cli, "data-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_path = last_value(&cli, "conf")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let conf_explicit = cli.contains_key("conf");
    let conf = match load_conf(&conf_path)? {
        Some(conf) => conf,
        None if conf_explicit => {
            return Err(format!("config file {} not found", conf_path.display()))
        }
        None => HashMap::new(),
    };

    let merged = merge_options(cli, conf)?;
    build_config(&merged, data_dir, conf_path).map(CliAction::Run)
}

fn push_option(map: &mut OptionMap, name: &str, value: &str) {
    map.entry(name.to_string())
        .or_default()
        .push(value.to_string());
}

fn last_value<'a>(map: &'a OptionMap, name: &str) -> Option<&'a str> {
    map.get(name)
        .and_then(|values| values.last())
        .map(String::as_str)
}

/// Command-line values replace conf-file values key by key.
fn merge_options(mut cli: OptionMap, conf: OptionMap) -> Result<OptionMap, String> {
    for (key, values) in conf {
        if CLI_ONLY_OPTIONS.contains(&key.as_str()) {
            continue;
        }
        if !VALUE_OPTIONS.contains(&key.as_str()) && !FLAG_OPTIONS.contains(&key.as_str()) {
            return Err(format!("unknown key '{key}' in config file"));
        }
        cli.entry(key).or_insert(values);
    }
    Ok(cli)
}

fn flag(map: &OptionMap, name: &str, default: bool) -> Result<bool, String> {
    match last_value(map, name) {
        Some(value) => {
            parse_conf_bool(value).ok_or_else(|| format!("invalid value '{value}' for {name}"))
        }
        None => Ok(default),
    }
}

fn build_config(map: &OptionMap, data_dir: PathBuf, conf_path: PathBuf) -> Result<Config, String> {
    let backend = match last_value(map, "backend") {
        Some(value) => {
            Backend::parse(value).ok_or_else(|| format!("invalid backend '{value}'"))?
        }
        None => Backend::Fjall,
    };
    let network = match last_value(map, "network") {
        Some(value) => {
            Network::parse(value).ok_or_else(|| format!("invalid network '{value}'"))?
        }
        None => Network::Mainnet,
    };
    let suffix = chain_params(network).data_dir_suffix;
    let data_dir = if suffix.is_empty() {
        data_dir
    } else {
        data_dir.join(suffix)
    };
    let blocks_dir = last_value(map, "blocks-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("blocks"));

    let prune = match last_value(map, "prune") {
        Some(value) => parse_prune(value)?,
        None => PruneMode::Disabled,
    };
    let reindex = flag(map, "reindex", false)?;
    let reindex_chainstate = flag(map, "reindex-chainstate", false)?;
    if prune.is_enabled() && reindex_chainstate {
        return Err(
            "prune mode is incompatible with --reindex-chainstate; use full --reindex instead"
                .to_string(),
        );
    }

    let check_blocks = match last_value(map, "checkblocks") {
        Some(value) => value
            .trim()
            .parse::<i32>()
            .map_err(|_| format!("invalid --checkblocks '{value}'"))?,
        None => DEFAULT_CHECKBLOCKS,
    };
    let check_level = match last_value(map, "checklevel") {
        Some(value) => value
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|level| *level <= MAX_CHECKLEVEL)
            .ok_or_else(|| format!("invalid --checklevel '{value}' (0..{MAX_CHECKLEVEL})"))?,
        None => DEFAULT_CHECKLEVEL,
    };
    let flush_interval_secs = match last_value(map, "flush-interval") {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid --flush-interval '{value}'"))?,
        None => DEFAULT_FLUSH_INTERVAL_SECS,
    };
    let db_cache_mib = match last_value(map, "db-cache") {
        Some(value) => Some(
            value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|mib| *mib > 0)
                .ok_or_else(|| format!("invalid --db-cache '{value}'"))?,
        ),
        None => None,
    };

    let log_level = match last_value(map, "log-level") {
        Some(value) => {
            logging::Level::parse(value).ok_or_else(|| format!("invalid log level '{value}'"))?
        }
        None => logging::Level::Info,
    };
    let log_format = match last_value(map, "log-format") {
        Some(value) => {
            logging::Format::parse(value).ok_or_else(|| format!("invalid log format '{value}'"))?
        }
        None => logging::Format::Text,
    };
    let mut debug_categories = 0u32;
    for value in map.get("debug").into_iter().flatten() {
        let mask = logging::parse_categories(value)?;
        debug_categories = if mask == 0 { 0 } else { debug_categories | mask };
    }

    let loadblock = map
        .get("loadblock")
        .into_iter()
        .flatten()
        .map(PathBuf::from)
        .collect();

    Ok(Config {
        backend,
        data_dir,
        blocks_dir,
        conf_path,
        network,
        prune,
        fast_prune: flag(map, "fast-prune", false)?,
        reindex,
        reindex_chainstate,
        loadblock,
        check_blocks,
        check_level,
        stop_after_import: flag(map, "stop-after-import", false)?,
        flush_interval_secs,
        db_cache_mib,
        db_info: flag(map, "db-info", false)?,
        log_level,
        log_format,
        log_timestamps: flag(map, "log-timestamps", true)?,
        debug_categories,
    })
}

/// `0` disables pruning, `1` allows manual pruning only, anything else is a
/// target size in MiB.
pub(crate) fn parse_prune(value: &str) -> Result<PruneMode, String> {
    let mib = value
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("invalid --prune '{value}'"))?;
    match mib {
        0 => Ok(PruneMode::Disabled),
        1 => Ok(PruneMode::Manual),
        mib if mib < MIN_PRUNE_TARGET_MIB => Err(format!(
            "prune configured below the minimum of {MIN_PRUNE_TARGET_MIB} MiB; please use a higher number"
        )),
        mib => Ok(PruneMode::Target(mib.saturating_mul(1024 * 1024))),
    }
}

pub(crate) fn load_conf(path: &Path) -> Result<Option<OptionMap>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: OptionMap = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        push_option(&mut out, &key.to_ascii_lowercase(), value);
    }
    Ok(Some(out))
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub(crate) fn usage() -> String {
    [
        "Usage:",
        "  blockd [options]",
        "  blockd db-info [options]",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "  db-info  Print block tree and flat file summary as JSON, then exit",
        "",
        "Options:",
        "  --data-dir <dir>  Base data directory; testnet and regtest use a subdirectory (default: ./data)",
        "  --blocks-dir <dir>  Block and undo file directory (default: <data-dir>/blocks)",
        "  --conf <path>  Config file (default: <data-dir>/blockd.conf)",
        "  --network <name>  mainnet|testnet|regtest (default: mainnet)",
        "  --backend <name>  Storage backend, memory|fjall (default: fjall)",
        "  --prune <MiB>  0 = off, 1 = manual pruning only, >= 550 = keep block files under this size",
        "  --fast-prune  Use small block files (testing)",
        "  --reindex  Rebuild the block index and coins from the block files",
        "  --reindex-chainstate  Rebuild the coins database from the block index",
        "  --loadblock <path>  Import blocks from an external file (repeatable)",
        "  --checkblocks <n>  Blocks to verify at startup (default: 6, 0 = all)",
        "  --checklevel <0-4>  Thoroughness of startup verification (default: 3)",
        "  --stop-after-import  Shut down once block import finishes",
        "  --flush-interval <secs>  Seconds between periodic flushes (default: 60, 0 = off)",
        "  --db-cache <MiB>  fjall block cache size per database",
        "  --log-level <level>  error|warn|info|debug|trace (default: info)",
        "  --log-format <fmt>  text|json (default: text)",
        "  --no-log-timestamps  Omit timestamps from text logs",
        "  --debug <category>  Enable a debug category (blockstorage, prune, reindex, validation, coins, lock, all)",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "",
        "Config file keys use the option names without dashes, e.g. prune=550.",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn run_config(values: &[&str]) -> Config {
        match parse_args_from(args(values)).expect("parse") {
            CliAction::Run(config) => config,
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn defaults_without_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().into_owned();
        let config = run_config(&["--data-dir", &data_dir]);
        assert_eq!(config.backend, Backend::Fjall);
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.prune, PruneMode::Disabled);
        assert_eq!(config.blocks_dir, dir.path().join("blocks"));
        assert_eq!(config.check_blocks, DEFAULT_CHECKBLOCKS);
        assert_eq!(config.check_level, DEFAULT_CHECKLEVEL);
        assert!(config.log_timestamps);
        assert!(config.loadblock.is_empty());
        assert!(!config.db_info);
        assert_eq!(config.db_cache_mib, None);
    }

    #[test]
    fn prune_values_map_to_modes() {
        assert_eq!(parse_prune("0").expect("off"), PruneMode::Disabled);
        assert_eq!(parse_prune("1").expect("manual"), PruneMode::Manual);
        assert_eq!(
            parse_prune("550").expect("target"),
            PruneMode::Target(550 * 1024 * 1024)
        );
        assert!(parse_prune("549").is_err());
        assert!(parse_prune("lots").is_err());
    }

    #[test]
    fn prune_with_reindex_chainstate_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().into_owned();
        let err = parse_args_from(args(&[
            "--data-dir",
            &data_dir,
            "--prune=550",
            "--reindex-chainstate",
        ]))
        .expect_err("rejected");
        assert!(err.contains("use full --reindex instead"), "{err}");
    }

    #[test]
    fn command_line_overrides_conf_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONF_FILE_NAME),
            "# node settings\nnetwork=regtest\nbackend = memory ; inline comment\nprune=1000\ncheckblocks=20\nloadblock=/tmp/a.dat\nloadblock=/tmp/b.dat\nreindex\n",
        )
        .expect("write conf");
        let data_dir = dir.path().to_string_lossy().into_owned();
        let config = run_config(&["--data-dir", &data_dir, "--prune", "1", "--network=testnet"]);
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.data_dir, dir.path().join("testnet"));
        assert_eq!(config.blocks_dir, dir.path().join("testnet").join("blocks"));
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.prune, PruneMode::Manual);
        assert_eq!(config.check_blocks, 20);
        assert!(config.reindex);
        assert_eq!(
            config.loadblock,
            vec![PathBuf::from("/tmp/a.dat"), PathBuf::from("/tmp/b.dat")]
        );
    }

    #[test]
    fn repeated_loadblock_and_debug_accumulate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().into_owned();
        let config = run_config(&[
            "--data-dir",
            &data_dir,
            "--loadblock",
            "one.dat",
            "--loadblock=two.dat",
            "--debug",
            "prune",
            "-debug=reindex",
            "--no-log-timestamps",
            "db-info",
        ]);
        assert_eq!(config.loadblock.len(), 2);
        let expected = logging::Category::Prune.bit() | logging::Category::Reindex.bit();
        assert_eq!(config.debug_categories, expected);
        assert!(!config.log_timestamps);
        assert!(config.db_info);
    }

    #[test]
    fn bad_values_are_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().to_string_lossy().into_owned();
        for bad in [
            vec!["--checklevel", "5"],
            vec!["--backend", "rocks"],
            vec!["--network", "moon"],
            vec!["--debug", "gossip"],
            vec!["--db-cache", "0"],
            vec!["--frobnicate"],
            vec!["stray"],
        ] {
            let mut raw = vec!["--data-dir", data_dir.as_str()];
            raw.extend(bad.iter().copied());
            assert!(parse_args_from(args(&raw)).is_err(), "{bad:?} accepted");
        }
        assert!(parse_args_from(args(&["--checkblocks"])).is_err());
    }

    #[test]
    fn explicit_missing_conf_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join("elsewhere.conf");
        let conf = conf.to_string_lossy().into_owned();
        assert!(parse_args_from(args(&["--conf", &conf])).is_err());
    }

    #[test]
    fn unknown_conf_keys_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONF_FILE_NAME), "rpcport=1234\n").expect("write conf");
        let data_dir = dir.path().to_string_lossy().into_owned();
        assert!(parse_args_from(args(&["--data-dir", &data_dir])).is_err());
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert!(matches!(
            parse_args_from(args(&["--help", "--bogus"])),
            Ok(CliAction::PrintHelp)
        ));
        assert!(matches!(
            parse_args_from(args(&["version"])),
            Ok(CliAction::PrintVersion)
        ));
    }
}
