use project_file_server::{Config, ProjectId, ServerManager};
use std::path::PathBuf;
use tracing::{error, info};

/// Standalone demo of the host-app contract (spec §6): registers one
/// project root per `name=path` CLI argument, prints an authenticated
/// preview URL for each, then serves until interrupted.
///
/// The real desktop app is the only intended caller of `ServerManager`;
/// this binary exists so the contract can be exercised outside of it.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let projects = parse_args();
    if projects.is_empty() {
        eprintln!("usage: preview-server <name>=<path> [<name>=<path> ...]");
        std::process::exit(2);
    }

    let config = Config::from_env();
    config.log_summary();

    let manager = match ServerManager::new(config).await {
        Ok(manager) => manager,
        Err(err) => {
            error!(error = %err, "failed to initialize server manager");
            std::process::exit(1);
        }
    };

    for (name, path) in &projects {
        let project_id = match ProjectId::new(name.clone()) {
            Ok(id) => id,
            Err(err) => {
                error!(project = %name, error = %err, "skipping invalid project id");
                continue;
            }
        };
        manager.register_project_root(project_id.clone(), path.clone());

        match manager.url_for(&project_id, "").await {
            // The URL embeds the instance's access token (spec §9: "the host
            // app must not log URLs"); the log line names the project only,
            // and the URL itself goes to stdout, not through `tracing`.
            Ok(url) => {
                info!(project = %name, "project file server ready");
                println!("{name}: {url}");
            }
            Err(err) => error!(project = %name, error = %err, "failed to start project file server"),
        }
    }

    info!("preview server running, press ctrl-c to stop");
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
    }

    info!("shutting down");
    manager.shutdown().await;
}

fn parse_args() -> Vec<(String, PathBuf)> {
    std::env::args()
        .skip(1)
        .filter_map(|arg| {
            let (name, path) = arg.split_once('=')?;
            Some((name.to_string(), PathBuf::from(path)))
        })
        .collect()
}
