use blockd_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

mod config;
mod db_info;
mod store;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use blockd_chainstate::blockstorage::BlockManagerOptions;
use blockd_chainstate::index::BlockTreeDb;
use blockd_chainstate::validation::PowValidator;
use blockd_chainstate::{
    ChainstateLoadOptions, ChainstateManager, ChainstateManagerOptions, FlushMode, GenesisSignal,
    ImportOptions, ImportOutcome, LoadOutcome, LoggingNotifications, SignalInterrupt,
    StartupEvent,
};
use blockd_consensus::{chain_params, hash256_to_hex};
use fs2::FileExt;
use tokio::sync::watch;

use crate::config::{CliAction, Config};
use crate::store::{coins_factory, fjall_options, open_block_tree_store, Store};

pub(crate) const REINDEX_REQUEST_FILE_NAME: &str = "reindex.flag";
const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";

type Chainman = ChainstateManager<Store>;

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            if holder.is_empty() {
                Err(format!(
                    "data dir {} is already locked (another blockd instance may be running); lock file {}",
                    data_dir.display(),
                    lock_path.display()
                ))
            } else {
                Err(format!(
                    "data dir {} is already locked (another blockd instance may be running); lock file {} ({holder})",
                    data_dir.display(),
                    lock_path.display()
                ))
            }
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

pub async fn run_entry() -> Result<(), String> {
    match config::parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", config::usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("blockd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(Instant::now(), config).await,
    }
}

async fn run_with_config(start_time: Instant, config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
        categories: config.debug_categories,
    });

    fs::create_dir_all(&config.data_dir).map_err(|err| {
        format!(
            "failed to create data dir {}: {err}",
            config.data_dir.display()
        )
    })?;
    let _data_dir_lock = lock_data_dir(&config.data_dir)?;
    fs::create_dir_all(&config.blocks_dir).map_err(|err| {
        format!(
            "failed to create blocks dir {}: {err}",
            config.blocks_dir.display()
        )
    })?;

    let db_options = fjall_options(config.db_cache_mib);
    let store = Arc::new(open_block_tree_store(
        config.backend,
        &config.blocks_dir,
        db_options.clone(),
    )?);
    let coins = coins_factory(config.backend, &config.data_dir, db_options);

    if config.db_info {
        let block_tree = BlockTreeDb::new(Arc::clone(&store));
        let info = db_info::collect_db_info(&config, &block_tree, coins.as_ref())?;
        let rendered = serde_json::to_string_pretty(&info).map_err(|err| err.to_string())?;
        println!("{rendered}");
        return Ok(());
    }

    log_info!(
        "Startup: begin (backend={}, network={}, data_dir={}, blocks_dir={})",
        config.backend.as_str(),
        config.network.as_str(),
        config.data_dir.display(),
        config.blocks_dir.display()
    );

    let reindex_flag_path = config.data_dir.join(REINDEX_REQUEST_FILE_NAME);
    let reindex = config.reindex || reindex_flag_path.exists();
    if reindex && !config.reindex {
        log_info!("Reindex requested by {}", reindex_flag_path.display());
    }
    if config.prune.is_enabled() {
        log_info!("Prune mode {:?} enabled", config.prune);
    }

    let interrupt = SignalInterrupt::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(interrupt.clone());
    spawn_shutdown_bridge(interrupt.clone(), shutdown_tx)?;

    let chain = chain_params(config.network);
    let params = chain.consensus.clone();
    let opts = ChainstateManagerOptions {
        blockman: BlockManagerOptions {
            blocks_dir: config.blocks_dir.clone(),
            message_start: chain.message_start,
            prune: config.prune,
            fast_prune: config.fast_prune,
        },
        ..ChainstateManagerOptions::default()
    };
    let chainman: Arc<Chainman> = Arc::new(ChainstateManager::new(
        opts,
        params.clone(),
        store,
        coins,
        Arc::new(PowValidator::new(params)),
        Arc::new(LoggingNotifications::new(interrupt.clone())),
        interrupt.clone(),
    ));

    let load_options = ChainstateLoadOptions {
        reindex,
        reindex_chainstate: config.reindex_chainstate,
        check_blocks: config.check_blocks,
        check_level: config.check_level,
    };
    let loader = Arc::clone(&chainman);
    let loaded = tokio::task::spawn_blocking(move || loader.load_chainstate(&load_options))
        .await
        .map_err(|err| format!("chainstate loader panicked: {err}"))?;
    match loaded {
        Ok(LoadOutcome::Ready) => {
            log_info!(
                "Startup: chainstate loaded in {}ms",
                start_time.elapsed().as_millis()
            );
        }
        Ok(LoadOutcome::Interrupted) => {
            log_info!("Shutdown requested during startup; exiting.");
            return Ok(());
        }
        Err(err) => {
            log_error!("{err}");
            return Err(format!(
                "Error loading databases: {err}. Please restart with {} to recover.",
                err.advice()
            ));
        }
    }
    if reindex {
        if let Err(err) = fs::remove_file(&reindex_flag_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log_warn!(
                    "failed to remove {}: {err}",
                    reindex_flag_path.display()
                );
            }
        }
    }

    let (signal, genesis_rx) = GenesisSignal::new();
    let import_thread = spawn_import(
        Arc::clone(&chainman),
        ImportOptions {
            files: config.loadblock.clone(),
            stop_after_import: config.stop_after_import,
        },
        signal,
    )?;

    let shutdown_signal = interrupt.subscribe();
    let started = tokio::task::spawn_blocking(move || {
        crossbeam_channel::select! {
            recv(genesis_rx) -> event => matches!(event, Ok(StartupEvent::GenesisConnected)),
            recv(shutdown_signal) -> _ => false,
        }
    })
    .await
    .map_err(|err| format!("startup wait panicked: {err}"))?;

    if started {
        if let Some(tip) = chainman.active_tip() {
            log_info!(
                "Startup: ready at height {} ({}) after {}ms",
                tip.height,
                hash256_to_hex(&tip.hash),
                start_time.elapsed().as_millis()
            );
        }
        flush_loop(
            Arc::clone(&chainman),
            config.flush_interval_secs,
            shutdown_rx,
        )
        .await;
    }

    interrupt.request();
    log_info!("Shutdown: waiting for block import");
    if import_thread.join().is_err() {
        log_error!("block import thread panicked");
    }
    let flusher = Arc::clone(&chainman);
    let flushed = tokio::task::spawn_blocking(move || flusher.flush_state(FlushMode::Always))
        .await
        .map_err(|err| format!("final flush panicked: {err}"))?;
    if let Err(err) = flushed {
        return Err(format!("final flush failed: {err}"));
    }
    log_info!("Shutdown: done");
    Ok(())
}

fn spawn_import(
    chainman: Arc<Chainman>,
    options: ImportOptions,
    signal: GenesisSignal,
) -> Result<thread::JoinHandle<()>, String> {
    thread::Builder::new()
        .name("blockd-import".to_string())
        .spawn(move || match chainman.import_blocks(&options, &signal) {
            Ok(ImportOutcome::Completed) => log_info!("Block import finished"),
            Ok(ImportOutcome::Interrupted) => log_info!("Block import interrupted"),
            Err(err) => {
                log_error!("Block import failed: {err}");
                chainman.interrupt().request();
            }
        })
        .map_err(|err| format!("failed to spawn import thread: {err}"))
}

fn spawn_signal_handler(interrupt: SignalInterrupt) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    log_warn!("failed to install SIGTERM handler: {err}");
                    let _ = tokio::signal::ctrl_c().await;
                    interrupt.request();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        log_info!("Signal received; requesting shutdown.");
        interrupt.request();
    });
}

/// Forwards the engine's interrupt into the async shutdown channel.
fn spawn_shutdown_bridge(
    interrupt: SignalInterrupt,
    shutdown_tx: watch::Sender<bool>,
) -> Result<(), String> {
    let requested = interrupt.subscribe();
    thread::Builder::new()
        .name("blockd-shutdown".to_string())
        .spawn(move || {
            let _ = requested.recv();
            let _ = shutdown_tx.send(true);
        })
        .map(|_| ())
        .map_err(|err| format!("failed to spawn shutdown thread: {err}"))
}

async fn flush_loop(chainman: Arc<Chainman>, interval_secs: u64, mut shutdown_rx: watch::Receiver<bool>) {
    if *shutdown_rx.borrow() {
        return;
    }
    if interval_secs == 0 {
        let _ = shutdown_rx.changed().await;
        return;
    }
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => return,
        }
        let flusher = Arc::clone(&chainman);
        match tokio::task::spawn_blocking(move || flusher.flush_state(FlushMode::Always)).await {
            Ok(Ok(())) => {
                if let Some(tip) = chainman.active_tip() {
                    log_info!(
                        "Flushed state at height {} ({} block files, {} bytes)",
                        tip.height,
                        chainman.blockman().file_count(),
                        chainman.blockman().calculate_current_usage()
                    );
                }
            }
            Ok(Err(err)) => log_warn!("periodic flush failed: {err}"),
            Err(err) => {
                log_error!("periodic flush panicked: {err}");
                return;
            }
        }
    }
}
