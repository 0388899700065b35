//! Block storage and chainstate management: the in-memory block index, flat
//! block/undo files, pruning, coin databases and the startup sequence.

pub mod blockindex;
pub mod blockstorage;
pub mod chainstate;
pub mod coins;
pub mod filemeta;
pub mod flatfiles;
pub mod genesis;
pub mod import;
pub mod index;
pub mod loader;
pub mod manager;
pub mod notifications;
pub mod prune;
pub mod undo;
pub mod validation;
pub mod verify;

pub use chainstate::ChainstateRole;
pub use import::{GenesisSignal, ImportError, ImportOptions, ImportOutcome, StartupEvent};
pub use loader::{ChainstateLoadOptions, ChainstateLoadingError, LoadOutcome};
pub use manager::{ChainstateError, ChainstateManager, ChainstateManagerOptions, FlushMode};
pub use notifications::{LoggingNotifications, Notifications, SignalInterrupt};
