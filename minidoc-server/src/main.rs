//! minidoc collaboration server.
//!
//! Serves `ws://<bind>/ws/documents/{id}` and offers a couple of document
//! maintenance commands against the same RocksDB directory.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use minidoc_collab::{DocumentRepository, RocksStore, ServerConfig, StoreConfig, SyncServer};

#[derive(Parser, Debug)]
#[command(name = "minidoc-server")]
#[command(about = "Real-time collaboration server for minidoc documents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket server
    Serve {
        /// Address to listen on
        #[arg(long, env = "MINIDOC_BIND", default_value = "127.0.0.1:9090")]
        bind: String,

        /// RocksDB directory. Without it documents live in memory and start
        /// empty, so there is nothing to save to and every SAVE or
        /// TITLE_UPDATE answers "Document not found". Create documents with
        /// `create` before starting the server.
        #[arg(long, env = "MINIDOC_DATA_DIR", value_name = "PATH")]
        data_dir: Option<PathBuf>,

        /// Shared token clients must present
        #[arg(long, env = "MINIDOC_TOKEN")]
        token: Option<String>,

        /// Seconds an empty room keeps its replica loaded
        #[arg(long, env = "MINIDOC_ROOM_IDLE_SECS", default_value_t = 0)]
        room_idle_secs: u64,

        /// Per-room broadcast buffer
        #[arg(long, env = "MINIDOC_BROADCAST_CAPACITY", default_value_t = 256)]
        broadcast_capacity: usize,
    },

    /// Create a document and print its id
    ///
    /// Opens the RocksDB directory directly, so it cannot run while a server
    /// holds the same directory.
    Create {
        title: String,

        #[arg(long, env = "MINIDOC_DATA_DIR", value_name = "PATH")]
        data_dir: PathBuf,
    },

    /// List stored documents, most recently updated first
    ///
    /// Like `create`, needs the directory not to be held by a running server.
    List {
        #[arg(long, env = "MINIDOC_DATA_DIR", value_name = "PATH")]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Serve {
            bind,
            data_dir,
            token,
            room_idle_secs,
            broadcast_capacity,
        } => {
            let config = ServerConfig {
                bind_addr: bind,
                broadcast_capacity,
                storage_path: data_dir,
                room_idle_timeout: Duration::from_secs(room_idle_secs),
                auth_token: token,
                ..ServerConfig::default()
            };
            match &config.storage_path {
                Some(path) => log::info!("Storing documents in {}", path.display()),
                None => log::warn!("No data directory given, documents are kept in memory"),
            }

            let server = SyncServer::new(config)?;
            server.run().await?;
        }

        Command::Create { title, data_dir } => {
            let store = open(data_dir)?;
            let doc = store.create(&title)?;
            println!("{}", doc.id);
        }

        Command::List { data_dir } => {
            let store = open(data_dir)?;
            for doc in store.list()? {
                println!("{}\t{}\t{}", doc.id, doc.updated_at, doc.title);
            }
        }
    }

    Ok(())
}

fn open(path: PathBuf) -> Result<RocksStore, minidoc_collab::StoreError> {
    RocksStore::open(StoreConfig {
        path,
        ..StoreConfig::default()
    })
}
