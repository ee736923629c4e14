use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};
use facegate_core::{GeoPoint, Identity, IdentityStore, Shift};
use facegate_store::SqliteStore;
use std::path::{Path, PathBuf};

// `#[zbus::proxy]` generates `AttendanceProxy` (async) and `AttendanceProxyBlocking`.
#[zbus::proxy(
    interface = "io.facegate.Attendance1",
    default_service = "io.facegate.Attendance1",
    default_path = "/io/facegate/Attendance1"
)]
trait Attendance {
    fn register(&self, identity_id: &str, image: Vec<u8>) -> zbus::Result<String>;
    fn update(&self, identity_id: &str, image: Vec<u8>) -> zbus::Result<String>;
    fn reset(&self, identity_id: &str) -> zbus::Result<String>;
    fn verify(
        &self,
        identity_id: &str,
        image: Vec<u8>,
        has_location: bool,
        latitude: f64,
        longitude: f64,
        device_id: &str,
    ) -> zbus::Result<String>;
    fn shift_window(&self, identity_id: &str, date: &str) -> zbus::Result<String>;
    fn track(&self, identity_id: &str, latitude: f64, longitude: f64) -> zbus::Result<String>;
    fn latest_locations(&self) -> zbus::Result<String>;
    fn historical_path(&self, identity_id: &str, date: &str) -> zbus::Result<String>;
    fn filtered_historical_paths(
        &self,
        identity_ids: Vec<String>,
        date: &str,
    ) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "facegate attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus
    #[arg(long, global = true, env = "FACEGATE_SYSTEM_BUS")]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the first reference photo of an identity
    Register(PhotoArgs),
    /// Replace the reference photo of an identity
    Update(PhotoArgs),
    /// Remove the reference photo of an identity
    Reset {
        identity: String,
    },
    /// Verify a photo and check in when inside the geofence
    Verify {
        #[command(flatten)]
        photo: PhotoArgs,
        #[command(flatten)]
        location: LocationArgs,
        /// Device that captured the photo
        #[arg(long)]
        device: Option<String>,
    },
    /// Show the shift window of an identity for a date
    ShiftWindow {
        identity: String,
        /// YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Record the current position of an identity
    Track {
        identity: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    /// Latest position of every identity
    Latest,
    /// Positions recorded during the shift on a date
    History {
        /// One or more identities
        #[arg(required = true)]
        identities: Vec<String>,
        /// YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show daemon status
    Status,
    /// Manage identities directly in the database
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
    /// Manage shifts directly in the database
    Shift {
        #[command(subcommand)]
        action: ShiftAction,
    },
}

#[derive(Args)]
struct PhotoArgs {
    identity: String,
    /// Path to a JPEG or PNG photo
    #[arg(long)]
    image: PathBuf,
}

#[derive(Args)]
struct LocationArgs {
    #[arg(long, requires = "lon", allow_hyphen_values = true)]
    lat: Option<f64>,
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lon: Option<f64>,
}

#[derive(Args)]
struct DbArgs {
    /// SQLite database (default: FACEGATE_DB_PATH or the daemon's default)
    #[arg(long, env = "FACEGATE_DB_PATH")]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Create or update an identity
    Add {
        id: String,
        #[command(flatten)]
        anchor: LocationArgs,
        /// Geofence radius in km (default 0.5)
        #[arg(long, value_parser = parse_radius)]
        radius_km: Option<f64>,
        #[arg(long)]
        shift: Option<String>,
        #[command(flatten)]
        db: DbArgs,
    },
    Show {
        id: String,
        #[command(flatten)]
        db: DbArgs,
    },
    List {
        #[command(flatten)]
        db: DbArgs,
    },
}

#[derive(Subcommand)]
enum ShiftAction {
    /// Create or update a shift
    Add {
        id: String,
        /// HH:MM
        #[arg(long, value_parser = parse_hm)]
        start: NaiveTime,
        /// HH:MM
        #[arg(long, value_parser = parse_hm)]
        end: NaiveTime,
        #[arg(long)]
        overnight: bool,
        #[command(flatten)]
        db: DbArgs,
    },
}

fn parse_hm(raw: &str) -> Result<NaiveTime, chrono::ParseError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
}

fn parse_radius(raw: &str) -> Result<f64, String> {
    let km: f64 = raw.parse().map_err(|e| format!("{e}"))?;
    if !km.is_finite() || km <= 0.0 {
        return Err(format!("radius must be a positive number of km, got {raw}"));
    }
    Ok(km)
}

impl LocationArgs {
    fn point(&self) -> Option<GeoPoint> {
        self.lat.zip(self.lon).map(|(lat, lon)| GeoPoint::new(lat, lon))
    }
}

impl DbArgs {
    fn open(&self) -> Result<SqliteStore> {
        let path = self
            .db
            .clone()
            .unwrap_or_else(|| facegate_core::data_dir().join("facegate.db"));
        SqliteStore::open(&path).with_context(|| format!("open database {}", path.display()))
    }
}

fn read_photo(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("read photo {}", path.display()))
}

fn today(date: Option<NaiveDate>) -> String {
    date.unwrap_or_else(|| Local::now().date_naive())
        .format("%Y-%m-%d")
        .to_string()
}

/// Pretty-print a daemon response; a failed response becomes the exit status.
fn print_response(raw: &str) -> Result<()> {
    let body: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    if body["ok"] == false {
        bail!("{}", body["reason"].as_str().unwrap_or("unknown failure"));
    }
    Ok(())
}

async fn connect(system: bool) -> Result<zbus::Connection> {
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    };
    let conn = conn.context("connect to D-Bus")?;
    tracing::debug!(system, name = ?conn.unique_name(), "connected to D-Bus");
    Ok(conn)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Identity { action } => identity(action),
        Commands::Shift { action } => shift(action),
        command => {
            let conn = connect(cli.system).await?;
            let proxy = AttendanceProxy::new(&conn).await?;
            print_response(&call(&proxy, command).await?)
        }
    }
}

async fn call(proxy: &AttendanceProxy<'_>, command: Commands) -> Result<String> {
    let raw = match command {
        Commands::Register(args) => {
            proxy
                .register(&args.identity, read_photo(&args.image)?)
                .await?
        }
        Commands::Update(args) => proxy.update(&args.identity, read_photo(&args.image)?).await?,
        Commands::Reset { identity } => proxy.reset(&identity).await?,
        Commands::Verify {
            photo,
            location,
            device,
        } => {
            let point = location.point();
            proxy
                .verify(
                    &photo.identity,
                    read_photo(&photo.image)?,
                    point.is_some(),
                    point.map_or(0.0, |p| p.latitude),
                    point.map_or(0.0, |p| p.longitude),
                    device.as_deref().unwrap_or(""),
                )
                .await?
        }
        Commands::ShiftWindow { identity, date } => {
            proxy.shift_window(&identity, &today(date)).await?
        }
        Commands::Track { identity, lat, lon } => proxy.track(&identity, lat, lon).await?,
        Commands::Latest => proxy.latest_locations().await?,
        Commands::History { identities, date } => {
            let date = today(date);
            match identities.as_slice() {
                [single] => proxy.historical_path(single, &date).await?,
                _ => proxy.filtered_historical_paths(identities, &date).await?,
            }
        }
        Commands::Status => proxy.status().await?,
        Commands::Identity { .. } | Commands::Shift { .. } => {
            bail!("administration commands do not go through the daemon")
        }
    };
    Ok(raw)
}

fn identity(action: IdentityAction) -> Result<()> {
    match action {
        IdentityAction::Add {
            id,
            anchor,
            radius_km,
            shift,
            db,
        } => {
            let store = db.open()?;
            let mut identity = store.identity(&id)?.unwrap_or_else(|| Identity::new(&id));
            if let Some(point) = anchor.point() {
                if !point.is_valid() {
                    bail!("anchor coordinates out of range");
                }
                identity.anchor = Some(point);
            }
            if radius_km.is_some() {
                identity.geofence_radius_km = radius_km;
            }
            if shift.is_some() {
                identity.shift_id = shift;
            }
            store.upsert_identity(&identity)?;
            println!("{}", serde_json::to_string_pretty(&identity)?);
        }
        IdentityAction::Show { id, db } => {
            let store = db.open()?;
            match store.identity(&id)? {
                Some(identity) => println!("{}", serde_json::to_string_pretty(&identity)?),
                None => bail!("unknown identity: {id}"),
            }
        }
        IdentityAction::List { db } => {
            let identities = db.open()?.list_identities()?;
            if identities.is_empty() {
                println!("No identities");
            }
            for identity in identities {
                let registered = if identity.face_registered { "registered" } else { "-" };
                let anchor = identity
                    .anchor
                    .map(|a| format!("{:.5},{:.5}", a.latitude, a.longitude))
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<20} {:<11} {:<22} {:.2} km  {}",
                    identity.id,
                    registered,
                    anchor,
                    identity.radius_km(),
                    identity.shift_id.as_deref().unwrap_or("-"),
                );
            }
        }
    }
    Ok(())
}

fn shift(action: ShiftAction) -> Result<()> {
    let ShiftAction::Add {
        id,
        start,
        end,
        overnight,
        db,
    } = action;
    let shift = Shift {
        id,
        start,
        end,
        overnight,
    };
    db.open()?.upsert_shift(&shift)?;
    println!("{}", serde_json::to_string_pretty(&shift)?);
    Ok(())
}
