use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::io::BufRead;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.freedesktop.Presence1",
    default_service = "org.freedesktop.Presence1",
    default_path = "/org/freedesktop/Presence1"
)]
trait Presence {
    fn mark_attendance(&self, roll_no: &str, image: &[u8]) -> zbus::Result<String>;
    fn attendance_status(&self, roll_no: &str) -> zbus::Result<String>;
    fn attendance_status_list(&self) -> zbus::Result<String>;
    fn most_absent(&self, token: &str, days: u32, class_group: &str) -> zbus::Result<String>;
    fn export_attendance(
        &self,
        token: &str,
        from: &str,
        to: &str,
        class_group: &str,
    ) -> zbus::Result<String>;
    fn admin_login(&self, pin: &str) -> zbus::Result<String>;
    fn register_subject(
        &self,
        token: &str,
        roll_no: &str,
        name: &str,
        department: &str,
        batch: &str,
        class_group: &str,
        image: &[u8],
    ) -> zbus::Result<String>;
    fn reenroll(&self, token: &str, roll_no: &str, image: &[u8]) -> zbus::Result<String>;
    fn backfill_templates(&self, token: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence face-verified attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    /// Admin token (falls back to PRESENCE_ADMIN_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mark attendance for a subject from a photo
    Mark {
        roll_no: String,
        image: PathBuf,
    },
    /// Show today's record for one subject
    Status { roll_no: String },
    /// Show today's status for every subject
    Today,
    /// Rank subjects by absences over a recent window (admin)
    Report {
        #[arg(short, long, default_value_t = 7)]
        days: u32,
        #[arg(short, long)]
        class: Option<String>,
    },
    /// Export attendance for a date range as CSV (admin)
    Export {
        /// First day, YYYY-MM-DD
        #[arg(long)]
        from: String,
        /// Last day, YYYY-MM-DD (inclusive)
        #[arg(long)]
        to: String,
        #[arg(short, long)]
        class: Option<String>,
    },
    /// Exchange the admin PIN for a session token
    Login {
        /// PIN; read from stdin when omitted
        #[arg(long)]
        pin: Option<String>,
    },
    /// Register or update a subject (admin)
    Register {
        roll_no: String,
        name: String,
        #[arg(long)]
        department: Option<String>,
        #[arg(long)]
        batch: Option<String>,
        #[arg(long)]
        class: Option<String>,
        /// Registration photo used to build the face template
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Replace a subject's face template from a new photo (admin)
    Reenroll { roll_no: String, image: PathBuf },
    /// Build missing templates from stored registration photos (admin)
    Backfill,
    /// Show daemon status
    DaemonStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let token = cli
        .token
        .or_else(|| std::env::var("PRESENCE_ADMIN_TOKEN").ok())
        .unwrap_or_default();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = PresenceProxy::new(&conn)
        .await
        .context("presenced is not reachable")?;

    match cli.command {
        Commands::Mark { roll_no, image } => {
            let bytes = read_image(&image)?;
            let reply = proxy.mark_attendance(&roll_no, &bytes).await?;
            let value: Value = serde_json::from_str(&reply)?;
            print_json(&value)?;
            if value["status"] == "error" {
                std::process::exit(1);
            }
        }
        Commands::Status { roll_no } => {
            print_reply(&proxy.attendance_status(&roll_no).await?)?;
        }
        Commands::Today => {
            print_reply(&proxy.attendance_status_list().await?)?;
        }
        Commands::Report { days, class } => {
            let reply = proxy
                .most_absent(&token, days, class.as_deref().unwrap_or_default())
                .await?;
            print_reply(&reply)?;
        }
        Commands::Export { from, to, class } => {
            let reply = proxy
                .export_attendance(&token, &from, &to, class.as_deref().unwrap_or_default())
                .await?;
            print!("{}", to_csv(&serde_json::from_str(&reply)?));
        }
        Commands::Login { pin } => {
            let pin = match pin {
                Some(pin) => pin,
                None => {
                    eprint!("Admin PIN: ");
                    let mut line = String::new();
                    std::io::stdin().lock().read_line(&mut line)?;
                    line.trim().to_string()
                }
            };
            let reply: Value = serde_json::from_str(&proxy.admin_login(&pin).await?)?;
            eprintln!("Token valid until {}", reply["expires_at"].as_str().unwrap_or("?"));
            println!("{}", reply["token"].as_str().unwrap_or_default());
        }
        Commands::Register {
            roll_no,
            name,
            department,
            batch,
            class,
            image,
        } => {
            let bytes = match image {
                Some(path) => read_image(&path)?,
                None => Vec::new(),
            };
            let reply = proxy
                .register_subject(
                    &token,
                    &roll_no,
                    &name,
                    department.as_deref().unwrap_or_default(),
                    batch.as_deref().unwrap_or_default(),
                    class.as_deref().unwrap_or_default(),
                    &bytes,
                )
                .await?;
            print_reply(&reply)?;
        }
        Commands::Reenroll { roll_no, image } => {
            let bytes = read_image(&image)?;
            print_reply(&proxy.reenroll(&token, &roll_no, &bytes).await?)?;
        }
        Commands::Backfill => {
            print_reply(&proxy.backfill_templates(&token).await?)?;
        }
        Commands::DaemonStatus => {
            print_reply(&proxy.status().await?)?;
        }
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_reply(reply: &str) -> Result<()> {
    print_json(&serde_json::from_str(reply)?)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Render an export table (`{header, rows}`) as CSV.
fn to_csv(table: &Value) -> String {
    let header: Vec<&str> = table["header"]
        .as_array()
        .map(|h| h.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut out = header.join(",");
    out.push('\n');
    for row in table["rows"].as_array().into_iter().flatten() {
        let cells: Vec<String> = header.iter().map(|col| csv_cell(&row[*col])).collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

fn csv_cell(value: &Value) -> String {
    let text = match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_csv() {
        let table = json!({
            "header": ["date", "roll_no", "name", "class", "present"],
            "rows": [
                {
                    "date": "2026-03-05", "roll_no": "S1", "name": "Rai, Asha",
                    "class": "10A", "present": true
                },
                {
                    "date": "2026-03-05", "roll_no": "S2", "name": "Bina",
                    "class": null, "present": false
                },
            ]
        });
        assert_eq!(
            to_csv(&table),
            "date,roll_no,name,class,present\n\
             2026-03-05,S1,\"Rai, Asha\",10A,true\n\
             2026-03-05,S2,Bina,,false\n"
        );
    }

    #[test]
    fn test_cli_parses_admin_flags() {
        let cli = Cli::try_parse_from([
            "presence", "--token", "abc", "report", "--days", "30", "--class", "10A",
        ])
        .unwrap();
        assert_eq!(cli.token.as_deref(), Some("abc"));
        assert!(matches!(cli.command, Commands::Report { days: 30, class: Some(_) }));
    }
}
