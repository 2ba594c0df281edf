mod upload;

use clap::{Parser, Subcommand};
use librarian_core::{
    Backends, Librarian, LibrarianConfig, LibrarianError, PlacementRequest, Result,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use upload::{UploadOptions, upload_all};

#[derive(Parser)]
#[command(name = "librarian")]
#[command(about = "Store placement and capacity accounting for the observatory archive")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the stores and run the reconciliation sweep until interrupted
    Start {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "librarian.yaml")]
        conf: String,
    },
    /// Place local files or directories on stores and deliver them
    Upload {
        #[arg(long = "conf", default_value = "librarian.yaml")]
        conf: String,

        /// Pipeline that produced the files
        #[arg(long)]
        pipeline: String,

        /// Preferred store; ignored when it cannot hold the file
        #[arg(long)]
        store: Option<String>,

        /// Directory prefix for the names on the store, e.g. a JD
        #[arg(long)]
        prefix: Option<String>,

        /// Expose the files for pulling instead of pushing them
        #[arg(long = "on-demand", default_value_t = false)]
        on_demand: bool,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show the store a file of the given size would land on
    Recommend {
        #[arg(long = "conf", default_value = "librarian.yaml")]
        conf: String,

        /// File size in bytes
        #[arg(long)]
        size: u64,

        #[arg(long, default_value = "unknown")]
        pipeline: String,
    },
    /// Print per-store usage as JSON
    Status {
        #[arg(long = "conf", default_value = "librarian.yaml")]
        conf: String,

        /// Reconcile against the stores before reporting
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },
    /// Stop placing new files on a store
    Decommission {
        #[arg(long = "conf", default_value = "librarian.yaml")]
        conf: String,

        store: String,
    },
    /// Forget a decommissioned store that holds nothing
    Purge {
        #[arg(long = "conf", default_value = "librarian.yaml")]
        conf: String,

        store: String,
    },
    /// Run one reconciliation pass and print what changed
    Sweep {
        #[arg(long = "conf", default_value = "librarian.yaml")]
        conf: String,
    },
}

#[derive(Debug, Serialize)]
struct Recommendation {
    store: String,
    capacity: u64,
    free: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "librarian=info,librarian_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(error) = run(cli.command).await {
        tracing::error!("{}", error);
        std::process::exit(1);
    }
}

async fn open(conf: &str) -> Result<Librarian> {
    tracing::info!("loading config: {}", conf);
    let config = LibrarianConfig::from_file(conf)?;
    open_with(&config).await
}

/// Opens the core for a command whose changes must reach later runs and
/// other processes, which only a journal provides.
async fn open_durable(conf: &str, command: &str) -> Result<Librarian> {
    tracing::info!("loading config: {}", conf);
    let config = LibrarianConfig::from_file(conf)?;
    if config.journal.is_none() {
        return Err(LibrarianError::Config(format!(
            "{} needs journal.path in {} so its changes are kept",
            command, conf
        )));
    }
    open_with(&config).await
}

async fn open_with(config: &LibrarianConfig) -> Result<Librarian> {
    let backends = Backends::from_config(config)?;
    Librarian::open(config, backends).await
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Start { conf } => {
            let librarian = open(&conf).await?;
            librarian.start_reconciliation().await;
            tokio::signal::ctrl_c().await?;
            tracing::info!("interrupt received, shutting down");
            librarian.shutdown().await;
        }
        Commands::Upload {
            conf,
            pipeline,
            store,
            prefix,
            on_demand,
            files,
        } => {
            let librarian = open_durable(&conf, "upload").await?;
            let options = UploadOptions {
                pipeline,
                store,
                prefix,
                on_demand,
            };
            let outcomes = upload_all(&librarian, &files, &options).await;
            print_json(&outcomes)?;

            let failed = outcomes.iter().filter(|outcome| !outcome.succeeded()).count();
            if failed > 0 {
                return Err(LibrarianError::TransferFailed {
                    reason: format!("{} of {} uploads failed", failed, outcomes.len()),
                });
            }
        }
        Commands::Recommend {
            conf,
            size,
            pipeline,
        } => {
            let librarian = open(&conf).await?;
            let candidate = librarian
                .recommend(&PlacementRequest::new(size, pipeline.as_str()))
                .await?;
            print_json(&Recommendation {
                store: candidate.store.name.clone(),
                capacity: candidate.usage.capacity,
                free: candidate.usage.free,
            })?;
        }
        Commands::Status { conf, refresh } => {
            let librarian = open(&conf).await?;
            if refresh {
                librarian.sweep_once().await?;
            }
            print_json(&librarian.usage_report().await)?;
        }
        Commands::Decommission { conf, store } => {
            open_durable(&conf, "decommission")
                .await?
                .decommission_store(&store)
                .await?;
        }
        Commands::Purge { conf, store } => {
            open_durable(&conf, "purge").await?.purge_store(&store).await?;
        }
        Commands::Sweep { conf } => {
            let librarian = open(&conf).await?;
            print_json(&librarian.sweep_once().await?)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use librarian_core::StoreStatus;
    use std::path::Path;

    fn write_config(dir: &Path, journal: bool) -> String {
        let mut yaml = format!(
            "stores:\n  - name: \"Store 0\"\n    capacity: 1000\n    path: \"{}\"\ntransfer:\n  driver: local\n",
            dir.join("store0").display()
        );
        if journal {
            yaml.push_str(&format!(
                "journal:\n  path: \"{}\"\n",
                dir.join("state.sqlite3").display()
            ));
        }
        let path = dir.join("librarian.yaml");
        std::fs::write(&path, yaml).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn changes_without_a_journal_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let conf = write_config(dir.path(), false);

        for command in [
            Commands::Decommission {
                conf: conf.clone(),
                store: "Store 0".to_string(),
            },
            Commands::Purge {
                conf: conf.clone(),
                store: "Store 0".to_string(),
            },
        ] {
            let err = run(command).await.unwrap_err();
            assert!(matches!(err, LibrarianError::Config(ref reason) if reason.contains("journal")));
        }

        run(Commands::Sweep { conf: conf.clone() }).await.unwrap();
    }

    #[tokio::test]
    async fn decommission_is_kept_for_later_runs() {
        let dir = tempfile::tempdir().unwrap();
        let conf = write_config(dir.path(), true);

        run(Commands::Decommission {
            conf: conf.clone(),
            store: "Store 0".to_string(),
        })
        .await
        .unwrap();

        let report = open(&conf).await.unwrap().usage_report().await;
        assert_eq!(report[0].status, StoreStatus::Decommissioned);
    }

    #[test]
    fn upload_collects_files_and_flags() {
        let cli = Cli::try_parse_from([
            "librarian",
            "upload",
            "--pipeline",
            "Correlator",
            "--on-demand",
            "--store",
            "Store 1",
            "a.uvh5",
            "b.uvh5",
        ])
        .unwrap();

        match cli.command {
            Commands::Upload {
                conf,
                pipeline,
                store,
                on_demand,
                files,
                ..
            } => {
                assert_eq!(conf, "librarian.yaml");
                assert_eq!(pipeline, "Correlator");
                assert_eq!(store.as_deref(), Some("Store 1"));
                assert!(on_demand);
                assert_eq!(files, vec![PathBuf::from("a.uvh5"), PathBuf::from("b.uvh5")]);
            }
            _ => panic!("expected upload command"),
        }
    }

    #[test]
    fn upload_requires_files() {
        assert!(Cli::try_parse_from(["librarian", "upload", "--pipeline", "RTP"]).is_err());
    }

    #[test]
    fn recommend_parses_size() {
        let cli = Cli::try_parse_from([
            "librarian",
            "recommend",
            "--conf",
            "/etc/librarian.yaml",
            "--size",
            "5000000000000",
        ])
        .unwrap();

        match cli.command {
            Commands::Recommend {
                conf,
                size,
                pipeline,
            } => {
                assert_eq!(conf, "/etc/librarian.yaml");
                assert_eq!(size, 5_000_000_000_000);
                assert_eq!(pipeline, "unknown");
            }
            _ => panic!("expected recommend command"),
        }
    }
}
