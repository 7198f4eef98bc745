//! Declarative sync engine (§4.6, §4.7, §4.8): file sync, block sync, and
//! script execution, orchestrated by [`service::SyncService`] against a
//! single declared host.

pub mod block_sync;
pub mod file_sync;
pub mod models;
pub mod script_exec;
pub mod service;

pub use block_sync::{sync_block_group, sync_block_groups};
pub use file_sync::{sync_file, sync_files};
pub use models::{
    resolve_machine_id, BlockGroup, BlockMode, ExecMode, FileSync, FileSyncMode, GlobalEnv, GroupMode, MachineRecord,
    RemoteHostState, ScriptExec, ScriptMode, TextBlock,
};
pub use script_exec::{run_script, run_scripts, ScriptOutput};
pub use service::SyncService;
