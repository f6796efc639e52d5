use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance daemon CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a class session
    Start {
        /// Course code (e.g. CSC401)
        course: String,
        /// Planned start time, RFC 3339 (defaults to now)
        #[arg(short, long)]
        scheduled: Option<String>,
        /// Minutes after start during which arrivals count as present
        #[arg(short, long, default_value_t = 0)]
        late_after: i64,
    },
    /// End the active session
    End {
        /// Session id returned by start
        session_id: String,
    },
    /// Show the active session
    Session,
    /// Show attendance for a session
    Attendance { session_id: String },
    /// Delete an ended session and its records
    DeleteSession { session_id: String },
    /// Register a new student
    Register {
        /// Matriculation number
        student_id: String,
        name: String,
        #[arg(short, long, default_value = "")]
        level: String,
        /// Course codes the student takes
        #[arg(short, long)]
        course: Vec<String>,
    },
    /// Rename a student id (cascades to attendance history)
    Rename { old_id: String, new_id: String },
    /// List enrolled students
    Students,
    /// Begin a guided face enrollment capture
    EnrollBegin,
    /// Show enrollment capture progress
    EnrollProgress,
    /// Restart the capture from stage 0
    EnrollReset,
    /// Abandon the capture
    EnrollCancel,
    /// Store the completed capture for a student
    EnrollCommit { student_id: String },
    /// Show daemon status
    Status,
    /// Pull one frame from a camera URL (bypasses the daemon)
    Test {
        /// MJPEG or snapshot URL
        url: String,
    },
}

async fn proxy(connection: &zbus::Connection) -> Result<zbus::Proxy<'static>> {
    zbus::Proxy::new(
        connection,
        "org.rollcall.Attendance1",
        "/org/rollcall/Attendance1",
        "org.rollcall.Attendance1",
    )
    .await
    .context("connect to rollcalld (is the daemon running?)")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Camera diagnostics work without the daemon.
    if let Commands::Test { url } = &cli.command {
        return test_stream(url);
    }

    let connection = zbus::Connection::session()
        .await
        .context("connect to session bus")?;
    let proxy = proxy(&connection).await?;

    match cli.command {
        Commands::Start {
            course,
            scheduled,
            late_after,
        } => {
            let session_id: String = proxy
                .call(
                    "StartSession",
                    &(
                        course.as_str(),
                        scheduled.as_deref().unwrap_or(""),
                        late_after,
                        "",
                    ),
                )
                .await?;
            println!("session started: {session_id}");
        }
        Commands::End { session_id } => {
            proxy.call::<_, _, ()>("EndSession", &(session_id.as_str(),)).await?;
            println!("session ended");
        }
        Commands::Session => {
            let json: String = proxy.call("ActiveSession", &()).await?;
            println!("{}", pretty(&json));
        }
        Commands::Attendance { session_id } => {
            let json: String = proxy
                .call("SessionAttendance", &(session_id.as_str(),))
                .await?;
            println!("{}", pretty(&json));
        }
        Commands::DeleteSession { session_id } => {
            let deleted: bool = proxy
                .call("DeleteSession", &(session_id.as_str(),))
                .await?;
            println!("{}", if deleted { "deleted" } else { "not found" });
        }
        Commands::Register {
            student_id,
            name,
            level,
            course,
        } => {
            let courses = serde_json::to_string(&course)?;
            proxy
                .call::<_, _, ()>(
                    "RegisterStudent",
                    &(
                        student_id.as_str(),
                        name.as_str(),
                        level.as_str(),
                        courses.as_str(),
                    ),
                )
                .await?;
            println!("registered {student_id}");
        }
        Commands::Rename { old_id, new_id } => {
            let renamed: bool = proxy
                .call("RenameStudent", &(old_id.as_str(), new_id.as_str()))
                .await?;
            println!("{}", if renamed { "renamed" } else { "not found" });
        }
        Commands::Students => {
            let json: String = proxy.call("ListStudents", &()).await?;
            println!("{}", pretty(&json));
        }
        Commands::EnrollBegin => {
            proxy.call::<_, _, ()>("BeginEnrollment", &()).await?;
            println!("enrollment armed — follow the on-screen pose instructions");
        }
        Commands::EnrollProgress => {
            let json: String = proxy.call("EnrollmentProgress", &()).await?;
            println!("{}", pretty(&json));
        }
        Commands::EnrollReset => {
            proxy.call::<_, _, ()>("ResetEnrollment", &()).await?;
            println!("capture reset to stage 0");
        }
        Commands::EnrollCancel => {
            proxy.call::<_, _, ()>("CancelEnrollment", &()).await?;
            println!("capture abandoned");
        }
        Commands::EnrollCommit { student_id } => {
            proxy
                .call::<_, _, ()>("CommitEnrollment", &(student_id.as_str(),))
                .await?;
            println!("signatures stored for {student_id}");
        }
        Commands::Status => {
            let json: String = proxy.call("Status", &()).await?;
            println!("{}", pretty(&json));
        }
        Commands::Test { .. } => unreachable!("handled before bus connect"),
    }

    Ok(())
}

/// Pull one frame directly from the camera and report its geometry.
fn test_stream(url: &str) -> Result<()> {
    use rollcall_hw::{FrameSource, MjpegSource, StreamConfig};

    let mut source = MjpegSource::new(StreamConfig {
        url: url.to_string(),
        ..Default::default()
    })?;
    let frame = source.next_frame()?;
    println!(
        "ok: {}x{} frame, avg brightness {:.1}",
        frame.width,
        frame.height,
        frame.avg_brightness()
    );
    Ok(())
}

fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}
