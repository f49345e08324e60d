use std::sync::Arc;

use tracing::{error, info};

use downpour::core::logging::LogManager;
use downpour::{
    ConfigManager, Engine, JobRequest, JsonHistory, ProgressEvent, TcpProbe, YtDlpFetcher,
};

#[tokio::main]
async fn main() {
    let urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        eprintln!("usage: downpour <url>...");
        std::process::exit(2);
    }

    let config_manager = ConfigManager::new();
    let config = config_manager.get();
    let _log_manager = LogManager::init(&config.log_level);

    let history = match JsonHistory::open(JsonHistory::default_path()) {
        Ok(history) => Arc::new(history),
        Err(e) => {
            error!("cannot open history store: {}", e);
            std::process::exit(1);
        }
    };

    let fetcher = Arc::new(YtDlpFetcher::new((&config).into()));
    let engine = Engine::with_collaborators(
        config,
        fetcher,
        history.clone(),
        Arc::new(TcpProbe::default()),
    );

    let requests: Vec<JobRequest> = urls.into_iter().map(JobRequest::new).collect();
    let ids = match engine.submit(requests, None) {
        Ok(ids) => ids,
        Err(e) => {
            error!("submission rejected: {}", e);
            std::process::exit(1);
        }
    };
    info!("submitted {} job(s)", ids.len());

    let mut events = engine.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ProgressEvent::Started { id, attempt }) => {
                    println!("{id} attempt {attempt} started");
                }
                Ok(ProgressEvent::Progress {
                    id, percent, speed, ..
                }) => {
                    if let Some(percent) = percent {
                        println!(
                            "{id} {percent:5.1}% {}",
                            speed.unwrap_or_default()
                        );
                    }
                }
                Ok(ProgressEvent::Retrying { id, attempt, failure }) => {
                    println!("{id} retrying after {failure} (attempt {attempt})");
                }
                Ok(ProgressEvent::Finished { id, status, output_path, failure }) => {
                    match failure {
                        Some(failure) => println!("{id} {status:?}: {failure}"),
                        None => println!(
                            "{id} {status:?} {}",
                            output_path
                                .map(|p| p.display().to_string())
                                .unwrap_or_default()
                        ),
                    }
                }
                Ok(ProgressEvent::Queued { .. }) => {}
                // Coalesced updates under lag are fine for a console view.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    engine.wait_idle().await;
    engine.shutdown().await;
    history.close();
    printer.abort();

    let failed = engine
        .list()
        .iter()
        .filter(|snap| snap.status == downpour::JobStatus::Failed)
        .count();
    if failed > 0 {
        std::process::exit(1);
    }
}
