use anyhow::{Context, Result};
use clap::Parser;
use neurasense_relay::{
    attach_render_sink,
    cli::{Cli, Commands, RunArgs},
    EventKind, EventRouter, PatientRecord, PipelineEvent, RelayClient, RelayConfig,
    SessionCoordinator, SessionStore, SqliteSessionStore, UdpSampleSource, WaveformBuffer,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "neurasense_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = RelayConfig::from_env().context("Invalid configuration")?;
    if let Some(path) = cli.database {
        config.database_path = path;
    }

    match cli.command {
        Commands::Run(args) => run_session(config, args).await,
        Commands::AddPatient {
            health_number,
            name,
            birthdate,
            reason,
        } => {
            let store = SqliteSessionStore::open(&config.database_path)?;
            let mut patient = PatientRecord::new(health_number, name, birthdate);
            patient.ecmo_reason = reason;
            store.add_patient(&patient)?;
            info!("Registered patient {}", patient.health_number);
            Ok(())
        }
        Commands::Sessions { health_number } => {
            let store = SqliteSessionStore::open(&config.database_path)?;
            let sessions = store.sessions_for_patient(&health_number).await?;
            if sessions.is_empty() {
                println!("No sessions recorded for patient {}", health_number);
            }
            for session in sessions {
                let minutes = session
                    .duration()
                    .map(|d| d.num_minutes().to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>6}  {}  {} min",
                    session.id.unwrap_or_default(),
                    session.started_at.format("%Y-%m-%d %H:%M:%S"),
                    minutes
                );
            }
            Ok(())
        }
        Commands::DeleteSession { id } => {
            let store = SqliteSessionStore::open(&config.database_path)?;
            store.delete_session(id).await?;
            info!("Deleted session {}", id);
            Ok(())
        }
    }
}

async fn run_session(mut config: RelayConfig, args: RunArgs) -> Result<()> {
    args.apply(&mut config);

    info!("Starting NeuraSense relay");
    info!("   UDP ingest:  {}:{}", config.udp_host, config.udp_port);
    info!("   Backend:     {}", config.backend_url);

    let store = if args.in_memory {
        SqliteSessionStore::in_memory()?
    } else {
        SqliteSessionStore::open(&config.database_path)?
    };
    if store.patient(&args.patient)?.is_none() {
        warn!(
            "Patient {} is not registered; the session record will not be saved",
            args.patient
        );
    }

    let router = EventRouter::new();

    let waveform = Arc::new(WaveformBuffer::new(config.display_points));
    let _display = attach_render_sink(&router, waveform.clone());

    router.on(EventKind::ProcessedResultReceived, |event| {
        if let PipelineEvent::ProcessedResultReceived(result) = event {
            info!(
                "Backend result: DAR={:?} DBR={:?} stroke={:?}",
                result.number("DAR"),
                result.number("DBR"),
                result.stroke_risk()
            );
        }
        Ok(())
    });
    router.on(EventKind::RelayError, |event| {
        if let PipelineEvent::RelayError(failure) = event {
            warn!(
                "Relay to {} lost: {} (local display continues)",
                failure.url, failure.message
            );
        }
        Ok(())
    });

    let relay = RelayClient::new(router.clone(), config.relay_client_config());
    let source = UdpSampleSource::new(
        router.clone(),
        config.udp_buffer_size,
        config.channel_count,
    );

    let mut coordinator = SessionCoordinator::new(
        config.session_config(),
        router.clone(),
        Box::new(source),
        Arc::new(relay),
        Arc::new(store),
    );
    coordinator.set_simulation(args.simulate);

    coordinator
        .start(&args.patient)
        .await
        .context("Failed to start session")?;
    info!("Session running, press Ctrl-C to end it");

    let mut status = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    status.tick().await;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
            _ = status.tick() => {
                let stats = coordinator.stats();
                info!(
                    "relay {} | batches {} (malformed {}) | sent {} dropped {} | results {} \
                     | channels {}",
                    coordinator.relay_state(),
                    stats.source.batches_received,
                    stats.source.malformed_datagrams,
                    stats.relay.frames_sent,
                    stats.relay.frames_dropped,
                    stats.relay.results_received,
                    waveform.num_channels()
                );
            }
        }
    }

    let summary = coordinator.end().await?;
    for failure in &summary.failures {
        warn!("Teardown step '{}' failed: {}", failure.step, failure.message);
    }
    match summary.record.id {
        Some(id) => info!("Session saved as record {}", id),
        None => warn!("Session was not saved"),
    }

    Ok(())
}
