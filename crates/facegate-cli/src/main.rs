use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "facegate", about = "facegate access-control CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new member from a face photo
    Enroll {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "")]
        phone: String,
        /// Image file (JPEG/PNG, or a text file holding a data: URL)
        image: PathBuf,
    },
    /// Check a face photo against enrolled members
    Verify {
        /// Image file (JPEG/PNG, or a text file holding a data: URL)
        image: PathBuf,
    },
    /// List enrolled members
    List,
    /// Remove an enrolled member
    Remove {
        /// Member ID to remove
        id: i64,
    },
    /// Save a member's photo as JPEG
    Photo {
        id: i64,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.facegate.AccessControl1",
    default_service = "org.facegate.AccessControl1",
    default_path = "/org/facegate/AccessControl1"
)]
trait AccessControl {
    async fn enroll(
        &self,
        first_name: &str,
        last_name: &str,
        email: &str,
        phone: &str,
        image: &[u8],
    ) -> zbus::Result<i64>;
    async fn verify(&self, image: &[u8]) -> zbus::Result<String>;
    async fn remove_member(&self, member_id: i64) -> zbus::Result<bool>;
    async fn list_members(&self) -> zbus::Result<String>;
    async fn member_photo(&self, member_id: i64) -> zbus::Result<Vec<u8>>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(session = cli.session, "connecting to facegated");

    let connection = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = AccessControlProxy::new(&connection)
        .await
        .context("facegated is not reachable")?;

    match cli.command {
        Commands::Enroll {
            first_name,
            last_name,
            email,
            phone,
            image,
        } => {
            let bytes = read_image(&image)?;
            let id = proxy
                .enroll(&first_name, &last_name, &email, &phone, &bytes)
                .await?;
            println!("Enrolled {first_name} {last_name} as member {id}");
        }
        Commands::Verify { image } => {
            let bytes = read_image(&image)?;
            let result: Value = serde_json::from_str(&proxy.verify(&bytes).await?)?;
            let distance = result["distance"]
                .as_f64()
                .map(|d| format!(" (distance {d:.2})"))
                .unwrap_or_default();
            if result["decision"] == "accepted" {
                println!(
                    "ACCESS GRANTED: {} [member {}]{distance}",
                    result["member_name"].as_str().unwrap_or("?"),
                    result["member_id"]
                );
            } else {
                println!(
                    "ACCESS DENIED: {}{distance}",
                    result["reason"]["kind"].as_str().unwrap_or("unknown")
                );
                return Ok(ExitCode::from(1));
            }
        }
        Commands::List => {
            let members: Vec<Value> = serde_json::from_str(&proxy.list_members().await?)?;
            if members.is_empty() {
                println!("No members enrolled");
            }
            for m in members {
                println!(
                    "{:>5}  {} {}  <{}>  {}{}",
                    m["id"].as_i64().unwrap_or_default(),
                    m["first_name"].as_str().unwrap_or_default(),
                    m["last_name"].as_str().unwrap_or_default(),
                    m["email"].as_str().unwrap_or_default(),
                    m["registered_at"].as_str().unwrap_or_default(),
                    if m["has_photo"] == true { "" } else { "  (no photo)" },
                );
            }
        }
        Commands::Remove { id } => {
            proxy.remove_member(id).await?;
            println!("Removed member {id}");
        }
        Commands::Photo { id, output } => {
            let jpeg = proxy.member_photo(id).await?;
            std::fs::write(&output, jpeg)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Saved photo of member {id} to {}", output.display());
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}
