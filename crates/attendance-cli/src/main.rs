use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use attendance_core::location::FixedPosition;
use attendance_core::{
    CheckInCoordinator, CheckInState, GeolocationProbe, Location, LocationError, PositionSource,
    PresenceHandle,
};
use attendance_hw::{Camera, GpsdSource};
use clap::{Parser, Subcommand};

mod client;
mod config;
mod engine;

use client::HttpApi;
use config::Config;

/// How often presence is polled while waiting for a face.
const PRESENCE_POLL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "attendance", about = "Attendance check-in client")]
struct Cli {
    /// Attendance service URL (overrides ATTENDANCE_SERVER_URL)
    #[arg(long, global = true)]
    server: Option<String>,
    /// Use this latitude instead of asking gpsd
    #[arg(long, global = true, requires = "lng", allow_negative_numbers = true)]
    lat: Option<f64>,
    /// Use this longitude instead of asking gpsd
    #[arg(long, global = true, requires = "lat", allow_negative_numbers = true)]
    lng: Option<f64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check in: detect a face, verify location, capture and upload
    CheckIn {
        /// Period label recorded with the check-in (e.g., "เช้า")
        #[arg(short, long)]
        period: String,
        /// Seconds to wait for a face before giving up
        #[arg(long, default_value_t = 5)]
        face_wait: u64,
    },
    /// Report the current position and whether it is inside the geofence
    Locate,
    /// List stored attendance records
    Records {
        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },
    /// Show service and database status
    Health,
    /// Run camera diagnostics
    Test,
}

/// Where position fixes come from.
enum Position {
    Fixed(FixedPosition),
    Gpsd(GpsdSource),
}

#[async_trait]
impl PositionSource for Position {
    async fn current_position(&self) -> Result<Location, LocationError> {
        match self {
            Position::Fixed(fixed) => fixed.current_position().await,
            Position::Gpsd(gpsd) => gpsd.current_position().await,
        }
    }
}

impl Position {
    fn from_args(lat: Option<f64>, lng: Option<f64>, config: &Config) -> Self {
        match (lat, lng) {
            (Some(lat), Some(lng)) => Position::Fixed(FixedPosition(Location::new(lat, lng))),
            _ => Position::Gpsd(GpsdSource::new(config.gpsd_addr.clone())),
        }
    }
}

/// Status line for one coordinator state.
fn describe(state: &CheckInState) -> String {
    match state {
        CheckInState::Idle => "Ready".to_string(),
        CheckInState::AwaitingLocation => "Checking location...".to_string(),
        CheckInState::AwaitingCapture => "Location OK, taking photo...".to_string(),
        CheckInState::Submitting => "Uploading...".to_string(),
        CheckInState::Succeeded {
            record_id,
            created_at,
        } => format!(
            "Checked in (record #{record_id} at {})",
            created_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
        ),
        CheckInState::LocationRejected { reason } => format!("Location rejected: {reason}"),
        CheckInState::Failed { reason } => format!("Check-in failed: {reason}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    match cli.command {
        Commands::CheckIn { period, face_wait } => {
            let source = Position::from_args(cli.lat, cli.lng, &config);
            check_in(&config, source, &period, Duration::from_secs(face_wait)).await?;
        }
        Commands::Locate => {
            let source = Position::from_args(cli.lat, cli.lng, &config);
            locate(&config, source).await?;
        }
        Commands::Records { json } => {
            let api = HttpApi::new(&config.server_url)?;
            let listing = api.records().await.context("failed to fetch records")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else if listing.degraded {
                println!(
                    "Records unavailable: {}",
                    listing.message.as_deref().unwrap_or("database unavailable")
                );
            } else if listing.data.is_empty() {
                println!("No records");
            } else {
                for record in &listing.data {
                    let at = record
                        .created_at
                        .with_timezone(&chrono::Local)
                        .format("%Y-%m-%d %H:%M:%S");
                    let coords = match (record.latitude, record.longitude) {
                        (Some(lat), Some(lng)) => format!("{lat:.6},{lng:.6}"),
                        _ => "-".to_string(),
                    };
                    println!(
                        "#{:<5} {at}  {:<8} {coords:<22} {}",
                        record.id, record.period, record.image
                    );
                }
            }
        }
        Commands::Health => {
            let api = HttpApi::new(&config.server_url)?;
            let health = api
                .health()
                .await
                .with_context(|| format!("service at {} not reachable", config.server_url))?;
            println!("service:  running ({})", config.server_url);
            println!("database: {}", health.database);
        }
        Commands::Test => camera_test(&config)?,
    }

    Ok(())
}

async fn check_in(
    config: &Config,
    source: Position,
    period: &str,
    face_wait: Duration,
) -> Result<()> {
    let api = HttpApi::new(&config.server_url)?;
    let presence = PresenceHandle::new();

    let engine = match engine::spawn_engine(
        &config.camera_device,
        &config.scrfd_model_path(),
        config.warmup_frames,
        presence.clone(),
    ) {
        Ok(engine) => Some(engine),
        Err(err) => {
            tracing::error!(error = %err, "presence engine unavailable");
            presence.set_device_unavailable(err.to_string());
            None
        }
    };

    if presence.device_unavailable().is_none() {
        println!("Looking for a face...");
        let deadline = tokio::time::Instant::now() + face_wait;
        while !presence.is_present()
            && presence.device_unavailable().is_none()
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(PRESENCE_POLL).await;
        }
    }

    let coordinator = CheckInCoordinator::new(
        presence,
        GeolocationProbe::new(source, config.location_timeout()),
        api,
        config.geofence(),
        config.capture_wait(),
    );

    let mut states = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            println!("{}", describe(&state));
        }
    });

    let result = coordinator.check_in(period).await;
    drop(coordinator);
    let _ = printer.await;

    if let Some(engine) = engine {
        match engine.shutdown().await {
            Ok(stats) => tracing::debug!(
                frames = stats.frames,
                faces = stats.face_frames,
                "presence engine stopped"
            ),
            Err(err) => tracing::debug!(error = %err, "presence engine already stopped"),
        }
    }

    match result {
        Ok(receipt) => {
            println!(
                "Saved {} ({} m from the office)",
                receipt.record.image,
                receipt.distance_m.round()
            );
            Ok(())
        }
        Err(err) => anyhow::bail!("{err} [{}]", err.code()),
    }
}

async fn locate(config: &Config, source: Position) -> Result<()> {
    let probe = GeolocationProbe::new(source, config.location_timeout());
    let location = probe
        .get_current_location()
        .await
        .context("failed to get location")?;

    let verdict = config.geofence().check(location);
    println!("position: {:.6}, {:.6}", location.latitude, location.longitude);
    println!(
        "distance: {} m from the office (limit {} m)",
        verdict.rounded_distance_m(),
        config.radius_m
    );
    if verdict.within {
        println!("inside the allowed area");
    } else {
        println!("outside the allowed area");
    }
    Ok(())
}

fn camera_test(config: &Config) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for device in &devices {
        println!("  {}  {} ({}, {})", device.path, device.name, device.driver, device.bus);
    }

    let camera = Camera::open(&config.camera_device)
        .with_context(|| format!("failed to open {}", config.camera_device))?;
    println!(
        "Opened {} at {}x{} ({:?})",
        camera.device_path, camera.width, camera.height, camera.fourcc
    );

    let mut stream = camera.stream()?;
    for _ in 0..config.warmup_frames {
        let _ = stream.next_frame();
    }
    let frame = stream.next_frame().context("failed to capture a frame")?;
    println!(
        "Captured frame #{}: average brightness {:.1}{}",
        frame.sequence,
        frame.avg_brightness(),
        if attendance_hw::frame::is_dark_frame(&frame.data, 0.95) {
            " (dark)"
        } else {
            ""
        }
    );

    let model = config.scrfd_model_path();
    match attendance_core::ScrfdDetector::load(&model) {
        Ok(mut detector) => {
            use attendance_core::FaceDetector;
            let faces = detector.detect(&frame)?;
            println!("Faces detected: {}", faces.len());
        }
        Err(err) => println!("Detector not loaded ({err}); skipping face check"),
    }

    Ok(())
}
