//! # remote-ops
//!
//! A toolkit for SSH-based remote-host operations: reverse proxy tunnels,
//! resumable chunked file transfer, and a declarative sync engine for
//! files, text blocks, and provisioning scripts.
//!
//! ## Reverse Proxy Tunnel
//!
//! ```no_run
//! use remote_ops::config::{ConnectionParams, ProxyConfig, ProxyMode};
//! use remote_ops::proxy::ProxyService;
//!
//! let conn = ConnectionParams::new("example.com", "deploy").with_key("~/.ssh/id_ed25519");
//! let config = ProxyConfig {
//!     local_port: 1080,
//!     remote_port: 1081,
//!     mode: ProxyMode::Socks5,
//!     local_host: "localhost".into(),
//!     use_builtin: true,
//! };
//!
//! let service = ProxyService::new("work");
//! let pid = service.start(config, conn, "example.com", true).unwrap();
//! println!("proxy running as pid {}", pid);
//! ```
//!
//! ## Resumable Chunked Transfer
//!
//! ```no_run
//! use remote_ops::config::TransferConfig;
//! use remote_ops::transfer::{ManifestStore, TransferService, RemoteAuth};
//!
//! let service = TransferService::with_default_store();
//! let config = TransferConfig::default();
//! let auth = RemoteAuth { key_path: Some("~/.ssh/id_ed25519".into()), ..Default::default() };
//!
//! let (transferred, total) = service
//!     .transfer("big_file.bin", "deploy@example.com:/data/big_file.bin", &config, &auth, None)
//!     .unwrap();
//! println!("{}/{} bytes", transferred, total);
//! ```
//!
//! ## Declarative Sync
//!
//! ```no_run
//! use remote_ops::config::ConnectionParams;
//! use remote_ops::sync::{FileSync, FileSyncMode, SyncService};
//!
//! let conn = ConnectionParams::new("example.com", "deploy").with_password("hunter2");
//! let files = vec![FileSync {
//!     src: "app.conf".into(),
//!     dist: "deploy@example.com:/etc/app.conf".into(),
//!     mode: FileSyncMode::Sync,
//! }];
//!
//! let service = SyncService::new(22);
//! service.sync(&conn, &files, &[], &[], &Default::default(), false).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod proxy;
pub mod ssh;
pub mod state;
pub mod sync;
pub mod transfer;

pub use error::{RemoteError, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    //! Convenient re-exports for common usage
    //!
    //! ```no_run
    //! use remote_ops::prelude::*;
    //! ```

    pub use crate::config::{
        AuthMethod, ConnectionParams, ProxyConfig, ProxyMode, ProxyState, SshConfigHost, SshConfigLoader, TransferConfig,
        TunnelConfig,
    };
    pub use crate::error::{RemoteError, Result};
    pub use crate::proxy::ProxyService;
    pub use crate::ssh::SshClient;
    pub use crate::state::FileStateStore;
    pub use crate::sync::{
        BlockGroup, FileSync, FileSyncMode, GlobalEnv, RemoteHostState, ScriptExec, SyncService, TextBlock,
    };
    pub use crate::transfer::{ManifestStore, RemoteAuth, TransferService};
}
