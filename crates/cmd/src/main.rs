// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use roost_app::AppConfig;
use roost_common_runtime::{RuntimeOptions, create_current_thread_runtime};
use roost_common_storage_queue::{FlushMode, QueueConfig, StorageKind};
use roost_common_telemetry::{LogFormat, LoggingOptions};
use roost_server::MemcacheServerConfig;
use snafu::{ResultExt, Whatever};

mod build_info;

#[derive(Debug, Parser)]
#[clap(
name = "roost",
about= "A memcache-protocol durable queue broker",
author = build_info::AUTHOR,
version = build_info::FULL_VERSION)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Server(ServerArgs),
    Version(VersionArgs),
}

#[derive(Debug, Clone, Args)]
#[command(long_about = r"

Print the version, commit and toolchain of this build.
Examples:

roost version

")]
struct VersionArgs {}

impl VersionArgs {
    fn run(&self) -> Result<(), Whatever> {
        print!("{}", build_info::version_report());
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Starts the roost broker.
Examples:

roost server -q /var/spool/roost
roost server --port 22133 --storage composite --sync

")]
struct ServerArgs {
    /// Interface to listen on
    #[arg(long, env = "ROOST_HOST", default_value = "127.0.0.1")]
    host: String,

    /// TCP port to listen on
    #[arg(long, env = "ROOST_PORT", default_value_t = roost_server::config::DEFAULT_PORT)]
    port: u16,

    /// Directory holding the queue journals
    #[arg(short = 'q', long, env = "ROOST_QUEUE_PATH", default_value = "/var/spool/roost")]
    queue_path: PathBuf,

    /// Idle seconds before a connection is closed, 0 to disable
    #[arg(short = 't', long, env = "ROOST_TIMEOUT", default_value_t = 60)]
    timeout: u64,

    /// Largest accepted item in bytes
    #[arg(long, env = "ROOST_MAX_ITEM_SIZE", default_value_t = roost_server::config::DEFAULT_MAX_ITEM_SIZE)]
    max_item_size: usize,

    /// Storage backend for every queue
    #[arg(long, env = "ROOST_STORAGE", default_value_t = StorageKind::Transactional)]
    storage: StorageKind,

    /// Journal size in bytes that triggers rotation once a queue drains
    #[arg(long, env = "ROOST_SOFT_LOG_MAX_SIZE", default_value_t = roost_common_storage_queue::config::DEFAULT_SOFT_LOG_MAX_SIZE)]
    soft_log_max_size: u64,

    /// Items kept in the journaled tier of a composite queue
    #[arg(long, env = "ROOST_PRIMARY_CAPACITY", default_value_t = roost_common_storage_queue::config::DEFAULT_PRIMARY_CAPACITY)]
    primary_capacity: u64,

    /// Items per overflow segment file of a composite queue
    #[arg(long, env = "ROOST_SEGMENT_MAX_ITEMS", default_value_t = roost_common_storage_queue::config::DEFAULT_SEGMENT_MAX_ITEMS)]
    segment_max_items: u64,

    /// fdatasync after every journal and segment write
    #[arg(long, env = "ROOST_SYNC")]
    sync: bool,

    /// Write rotated log files to this directory
    #[arg(short = 'L', long, env = "ROOST_LOG_DIR")]
    log_dir: Option<String>,

    /// Level filter, e.g. "info" or "roost_server=debug"
    #[arg(long, env = "ROOST_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, env = "ROOST_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Runtime worker threads; 0 runs everything on one reactor thread
    #[arg(long, env = "ROOST_WORKER_THREADS", default_value_t = 0)]
    worker_threads: usize,
}

impl ServerArgs {
    fn app_config(&self) -> AppConfig {
        AppConfig::builder()
            .server(
                MemcacheServerConfig::builder()
                    .bind_address(format!("{}:{}", self.host, self.port))
                    .idle_timeout_secs(self.timeout)
                    .max_item_size(self.max_item_size)
                    .build(),
            )
            .storage(QueueConfig {
                base_path: self.queue_path.clone(),
                storage_kind: self.storage,
                soft_log_max_size: self.soft_log_max_size,
                segment_max_items: self.segment_max_items,
                primary_capacity: self.primary_capacity,
                flush_mode: if self.sync { FlushMode::Sync } else { FlushMode::Os },
            })
            .logging(LoggingOptions {
                dir: self.log_dir.clone().unwrap_or_default(),
                level: self.log_level.clone(),
                log_format: self.log_format,
                ..Default::default()
            })
            .build()
    }

    fn run(&self) -> Result<(), Whatever> {
        let runtime = if self.worker_threads == 0 {
            create_current_thread_runtime("roost-reactor")
        } else {
            RuntimeOptions::builder()
                .worker_threads(self.worker_threads)
                .build()
                .create()
        }
        .whatever_context("Failed to build runtime")?;

        let app = self.app_config().open();
        runtime.block_on(app.run())
    }
}

fn main() -> Result<(), Whatever> {
    human_panic::setup_panic!();

    let cli = Cli::parse();
    match cli.commands {
        Commands::Server(args) => args.run(),
        Commands::Version(args) => args.run(),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn server_args(argv: &[&str]) -> ServerArgs {
        let cli = Cli::try_parse_from(std::iter::once("roost").chain(argv.iter().copied())).unwrap();
        match cli.commands {
            Commands::Server(args) => args,
            Commands::Version(_) => panic!("expected server subcommand"),
        }
    }

    #[test]
    fn test_cli_definition_is_valid() { Cli::command().debug_assert(); }

    #[test]
    fn test_server_defaults() {
        let config = server_args(&["server"]).app_config();
        assert_eq!(config.server.bind_address, "127.0.0.1:22122");
        assert_eq!(config.server.idle_timeout_secs, 60);
        assert_eq!(config.storage, QueueConfig::default());
        assert!(config.logging.dir.is_empty());
    }

    #[test]
    fn test_server_flags_map_to_config() {
        let args = server_args(&[
            "server",
            "--host",
            "0.0.0.0",
            "--port",
            "22133",
            "-q",
            "/tmp/spool",
            "-t",
            "0",
            "--max-item-size",
            "4096",
            "--storage",
            "composite",
            "--primary-capacity",
            "5",
            "--sync",
            "-L",
            "/tmp/logs",
            "--log-format",
            "json",
            "--worker-threads",
            "4",
        ]);
        assert_eq!(args.worker_threads, 4);

        let config = args.app_config();
        assert_eq!(config.server.bind_address, "0.0.0.0:22133");
        assert_eq!(config.server.idle_timeout_secs, 0);
        assert_eq!(config.server.max_item_size, 4096);
        assert_eq!(config.storage.base_path, PathBuf::from("/tmp/spool"));
        assert_eq!(config.storage.storage_kind, StorageKind::Composite);
        assert_eq!(config.storage.primary_capacity, 5);
        assert_eq!(config.storage.flush_mode, FlushMode::Sync);
        assert_eq!(config.logging.dir, "/tmp/logs");
        assert_eq!(config.logging.log_format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_storage_kind_is_rejected() {
        let result = Cli::try_parse_from(["roost", "server", "--storage", "memory"]);
        assert!(result.is_err());
    }
}
