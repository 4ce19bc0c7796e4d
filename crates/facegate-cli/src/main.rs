use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{Frame, FrameSource};
use facegate_hw::Camera;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Live sessions can take a while; the daemon bounds them itself.
const METHOD_TIMEOUT: Duration = Duration::from_secs(180);

#[zbus::proxy(
    interface = "org.facegate.FaceGate1",
    default_service = "org.facegate.FaceGate1",
    default_path = "/org/facegate/FaceGate1"
)]
trait FaceGate {
    async fn enroll(&self, user: &str, frames: u32) -> zbus::Result<String>;
    async fn enroll_descriptors(&self, user: &str, descriptors_json: &str) -> zbus::Result<String>;
    async fn login(&self, max_attempts: u32, threshold: f64) -> zbus::Result<String>;
    async fn verify_descriptor(
        &self,
        descriptor_json: &str,
        threshold: f64,
    ) -> zbus::Result<String>;
    async fn verify_image(&self, image: &[u8], threshold: f64) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_users(&self) -> zbus::Result<String>;
    async fn remove_user(&self, user: &str) -> zbus::Result<String>;
    async fn cancel(&self) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "FaceGate face enrollment and login CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a user from live camera frames
    Enroll {
        user: String,
        /// Descriptors to capture (0 = daemon default)
        #[arg(short, long, default_value_t = 0)]
        frames: u32,
    },
    /// Enroll a user from a JSON file holding an array of descriptors
    EnrollDescriptors {
        user: String,
        /// Path to a JSON array of number arrays
        file: PathBuf,
    },
    /// Log in with the live camera
    Login {
        /// Frame attempt cap (0 = daemon default)
        #[arg(short = 'n', long, default_value_t = 0)]
        max_attempts: u32,
        /// Acceptance threshold (0 = daemon default)
        #[arg(short, long, default_value_t = 0.0)]
        threshold: f64,
    },
    /// Check an image or a descriptor against every enrolled user
    Verify {
        /// Encoded image file (PNG, JPEG, ...)
        #[arg(long, conflicts_with = "descriptor", required_unless_present = "descriptor")]
        image: Option<PathBuf>,
        /// JSON file holding one descriptor as an array of numbers
        #[arg(long)]
        descriptor: Option<PathBuf>,
        /// Acceptance threshold (0 = daemon default)
        #[arg(short, long, default_value_t = 0.0)]
        threshold: f64,
    },
    /// Show daemon and store status
    Status,
    /// List enrolled users
    List,
    /// Remove an enrolled user
    Remove { user: String },
    /// Stop a running enrollment or login
    Cancel,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Frames to grab
        #[arg(short = 'n', long, default_value_t = 10)]
        frames: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Test { device, frames } => camera_test(&device, frames),
        command => run_remote(command, cli.system).await,
    }
}

async fn run_remote(command: Commands, system: bool) -> Result<()> {
    let builder = if system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .method_timeout(METHOD_TIMEOUT)
        .build()
        .await
        .context("connecting to D-Bus")?;
    let proxy = FaceGateProxy::new(&conn).await.context("facegated is not running")?;

    let reply = match command {
        Commands::Enroll { user, frames } => {
            println!("Enrolling {user}; look at the camera...");
            proxy.enroll(&user, frames).await?
        }
        Commands::EnrollDescriptors { user, file } => {
            let json = read_text(&file)?;
            proxy.enroll_descriptors(&user, &json).await?
        }
        Commands::Login { max_attempts, threshold } => {
            println!("Looking for a known face...");
            proxy.login(max_attempts, threshold).await?
        }
        Commands::Verify {
            image,
            descriptor,
            threshold,
        } => match (image, descriptor) {
            (Some(path), _) => {
                let bytes =
                    std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
                proxy.verify_image(&bytes, threshold).await?
            }
            (None, Some(path)) => {
                let json = read_text(&path)?;
                proxy.verify_descriptor(&json, threshold).await?
            }
            (None, None) => bail!("one of --image or --descriptor is required"),
        },
        Commands::Status => proxy.status().await?,
        Commands::List => {
            let users: Value = serde_json::from_str(&proxy.list_users().await?)?;
            print_users(&users);
            return Ok(());
        }
        Commands::Remove { user } => proxy.remove_user(&user).await?,
        Commands::Cancel => {
            proxy.cancel().await?;
            println!("Cancel requested");
            return Ok(());
        }
        Commands::Test { .. } => bail!("camera diagnostics run locally"),
    };

    report(&reply)
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// Pretty-print a daemon reply; a `success: false` reply becomes an error exit.
fn report(reply: &str) -> Result<()> {
    let value: Value = serde_json::from_str(reply).context("daemon sent malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    if value["success"] == Value::Bool(false) {
        bail!("{}", value["error"].as_str().unwrap_or("operation did not succeed"));
    }
    Ok(())
}

fn print_users(users: &Value) {
    let Some(list) = users.as_array().filter(|l| !l.is_empty()) else {
        println!("No users enrolled");
        return;
    };
    for user in list {
        println!(
            "{:<24} {:>4} descriptors  enrolled {}",
            user["username"].as_str().unwrap_or("?"),
            user["descriptors"].as_u64().unwrap_or(0),
            user["enrolled_at"].as_str().unwrap_or("?"),
        );
    }
}

fn camera_test(device: &str, frames: usize) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}  {} ({})", d.path, d.name, d.driver);
    }

    let camera = Camera::open(device, 640, 480, false)?;
    println!(
        "Opened {} at {}x{} ({:?})",
        camera.device_path, camera.width, camera.height, camera.fourcc
    );

    let mut stream = camera.stream()?;
    let mut usable: Vec<Frame> = Vec::new();
    let mut skipped = 0usize;
    for _ in 0..frames {
        match stream.next_frame()? {
            Some(frame) => usable.push(frame),
            None => skipped += 1,
        }
    }

    for frame in &usable {
        println!("  frame {:>6}: brightness {:.1}", frame.sequence, frame.avg_brightness());
    }
    println!("{} usable, {} skipped (dark or dropped)", usable.len(), skipped);
    if usable.is_empty() {
        bail!("camera produced no usable frames");
    }
    Ok(())
}
