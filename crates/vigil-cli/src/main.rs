use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use vigil_hw::{Camera, CameraSettings};

#[zbus::proxy(
    interface = "org.vigil.Vigil1",
    default_service = "org.vigil.Vigil1",
    default_path = "/org/vigil/Vigil1",
    gen_blocking = false
)]
trait Vigil {
    async fn enroll(&self, identity_id: &str, image: &[u8]) -> zbus::Result<String>;
    async fn verify(&self, image: &[u8]) -> zbus::Result<String>;
    async fn start_monitor(&self, target: &str, interval_secs: u64) -> zbus::Result<String>;
    async fn stop_monitor(&self, session_id: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil identity verification and presence monitoring CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Daemon(DaemonCommand),
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// V4L2 device to test
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Save the captured frame as PNG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Commands served by vigild over D-Bus.
#[derive(Subcommand)]
enum DaemonCommand {
    /// Enroll a reference image for an identity
    Enroll {
        /// Identity id (e.g., an employee number)
        #[arg(short, long)]
        id: String,
        /// Image file containing exactly the face to enroll
        image: PathBuf,
    },
    /// Identify the face in an image
    Verify {
        image: PathBuf,
    },
    /// Control presence monitoring sessions
    Monitor {
        #[command(subcommand)]
        action: MonitorCommand,
    },
    /// List enrolled identities
    List,
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum MonitorCommand {
    /// Start watching for an identity
    Start {
        #[arg(short, long)]
        target: String,
        /// Polling interval in seconds (daemon default when omitted)
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Stop a session and print its report
    Stop {
        session: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Test { device, output } => camera_test(&device, output.as_deref()),
        Commands::Daemon(command) => call_daemon(command).await,
    }
}

async fn call_daemon(command: DaemonCommand) -> Result<()> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = VigilProxy::new(&conn)
        .await
        .context("vigild is not reachable; is the daemon running?")?;

    match command {
        DaemonCommand::Enroll { id, image } => {
            let bytes = read_image(&image)?;
            let reply = proxy.enroll(&id, &bytes).await?;
            report_outcome(&reply, "success")?;
        }
        DaemonCommand::Verify { image } => {
            let bytes = read_image(&image)?;
            let reply = proxy.verify(&bytes).await?;
            report_outcome(&reply, "matched")?;
        }
        DaemonCommand::Monitor { action } => match action {
            MonitorCommand::Start { target, interval } => {
                let session = proxy.start_monitor(&target, interval.unwrap_or(0)).await?;
                println!("Monitoring {target}; session {session}");
            }
            MonitorCommand::Stop { session } => {
                let reply = proxy.stop_monitor(&session).await?;
                print_json(&reply)?;
            }
        },
        DaemonCommand::List => {
            let reply = proxy.list_identities().await?;
            let identities: Vec<serde_json::Value> = serde_json::from_str(&reply)?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!(
                    "{}\t{} reference(s)",
                    identity["identity_id"].as_str().unwrap_or("?"),
                    identity["references"]
                );
            }
        }
        DaemonCommand::Status => {
            let reply = proxy.status().await?;
            print_json(&reply)?;
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Print the outcome message; a negative outcome becomes a non-zero exit.
fn report_outcome(reply: &str, flag: &str) -> Result<()> {
    let outcome: serde_json::Value = serde_json::from_str(reply)?;
    let message = outcome["message"].as_str().unwrap_or_default();
    if outcome[flag].as_bool() == Some(true) {
        match outcome["distance"].as_f64() {
            Some(d) => println!("{message} (distance {d:.4})"),
            None => println!("{message}"),
        }
        return Ok(());
    }
    match outcome["kind"].as_str() {
        Some(kind) => bail!("{kind}: {message}"),
        None => bail!("{message}"),
    }
}

fn camera_test(device: &str, output: Option<&Path>) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for info in &devices {
        println!("  {}  {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    tracing::debug!(device, "opening camera");
    let camera = Camera::open(&CameraSettings {
        device_path: device.to_string(),
        width: 640,
        height: 480,
    })?;
    let frame = camera.capture_frame()?;
    println!(
        "Captured {}x{} frame #{} (avg brightness {:.1}{})",
        frame.width,
        frame.height,
        frame.sequence,
        frame.avg_brightness(),
        if frame.is_dark { ", dark" } else { "" }
    );

    if let Some(path) = output {
        let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image
            .save_with_format(path, image::ImageFormat::Png)
            .with_context(|| format!("failed to save {}", path.display()))?;
        println!("Saved frame to {}", path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_monitor_start() {
        let cli = Cli::parse_from(["vigil", "monitor", "start", "--target", "E1", "--interval", "30"]);
        match cli.command {
            Commands::Daemon(DaemonCommand::Monitor {
                action: MonitorCommand::Start { target, interval },
            }) => {
                assert_eq!(target, "E1");
                assert_eq!(interval, Some(30));
            }
            _ => panic!("expected monitor start"),
        }
    }

    #[test]
    fn test_parse_enroll() {
        let cli = Cli::parse_from(["vigil", "enroll", "--id", "E1", "face.png"]);
        assert!(matches!(
            cli.command,
            Commands::Daemon(DaemonCommand::Enroll { ref id, ref image })
                if id == "E1" && image == Path::new("face.png")
        ));
    }

    #[test]
    fn test_camera_test_is_not_a_daemon_command() {
        let cli = Cli::parse_from(["vigil", "test", "--output", "frame.png"]);
        assert!(matches!(
            cli.command,
            Commands::Test { ref device, output: Some(_) } if device == "/dev/video0"
        ));

        let cli = Cli::parse_from(["vigil", "status"]);
        assert!(matches!(cli.command, Commands::Daemon(DaemonCommand::Status)));
    }

    #[test]
    fn test_report_outcome() {
        assert!(report_outcome(r#"{"success":true,"message":"identity E1 enrolled"}"#, "success").is_ok());
        let err = report_outcome(
            r#"{"matched":false,"message":"no face detected","kind":"validation"}"#,
            "matched",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "validation: no face detected");
        assert!(report_outcome(r#"{"matched":false,"message":"no match found"}"#, "matched").is_err());
    }
}
