use anyhow::Result;
use backup_orchestrator::application::*;
use backup_orchestrator::naming;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "backup-orchestrator")]
#[command(about = "Scheduled remote backups over SSH")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon until SIGINT/SIGTERM
    Start,
    /// Run a backup profile now and wait for it to finish
    Run {
        /// Backup profile id
        profile_id: i64,
    },
    /// Show what a run of the profile would do, without connecting
    DryRun {
        /// Backup profile id
        profile_id: i64,
    },
    /// Expand a naming pattern with placeholder values
    Preview {
        /// Pattern such as "{SERVER_NAME}/{date}"
        pattern: String,
        /// List the recognized tokens as well
        #[arg(long)]
        tokens: bool,
    },
    /// Inspect and delete backup runs
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Remote server helpers
    Servers {
        #[command(subcommand)]
        command: ServerCommands,
    },
    /// Create the database tables
    InitDb,
}

#[derive(Subcommand)]
enum RunCommands {
    /// List runs, newest first
    List {
        #[arg(long)]
        profile: Option<i64>,
        /// pending, running, succeeded or failed
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one run
    Show { run_id: i64 },
    /// Files retrieved by a run
    Files { run_id: i64 },
    /// Log entries of a run
    Logs { run_id: i64 },
    /// Delete a run with its files and log entries
    Delete { run_id: i64 },
    /// Print the local path of a retrieved file
    File { file_id: i64 },
}

#[derive(Subcommand)]
enum ServerCommands {
    /// Connect and run a trivial command
    Test { server_id: i64 },
    /// List a directory on the server
    Ls {
        server_id: i64,
        /// Directory to list (default: /home)
        path: Option<String>,
    },
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        std::env::var("LOG_LEVEL")
            .unwrap_or_else(|_| "info".to_string())
            .into()
    });
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();
    init_tracing();

    // Needs neither the database nor the engine
    if let Some(Commands::Preview { pattern, tokens }) = &cli.command {
        println!("{}", naming::preview(pattern, &chrono::Local::now()));
        if *tokens {
            for (token, description) in naming::tokens() {
                println!("  {token:<14} {description}");
            }
        }
        return Ok(());
    }

    let app = Application::new().await?;
    app.initialize().await?;

    let result = match cli.command {
        Some(Commands::Start) | None => app.run_daemon().await,
        Some(Commands::Run { profile_id }) => {
            BackupCommandHandler::new(app.container.clone())
                .run(profile_id)
                .await
        }
        Some(Commands::DryRun { profile_id }) => {
            BackupCommandHandler::new(app.container.clone())
                .dry_run(profile_id)
                .await
        }
        Some(Commands::Runs { command }) => handle_run_command(command, &app).await,
        Some(Commands::Servers { command }) => handle_server_command(command, &app).await,
        Some(Commands::InitDb) => DatabaseCommandHandler::new(app.container.clone()).init().await,
        Some(Commands::Preview { .. }) => Ok(()),
    };

    app.shutdown().await?;
    result
}

async fn handle_run_command(command: RunCommands, app: &Application) -> Result<()> {
    let handler = RunCommandHandler::new(app.container.clone());
    match command {
        RunCommands::List { profile, status } => handler.list(profile, status).await,
        RunCommands::Show { run_id } => handler.show(run_id).await,
        RunCommands::Files { run_id } => handler.files(run_id).await,
        RunCommands::Logs { run_id } => handler.logs(run_id).await,
        RunCommands::Delete { run_id } => handler.delete(run_id).await,
        RunCommands::File { file_id } => handler.locate_file(file_id).await,
    }
}

async fn handle_server_command(command: ServerCommands, app: &Application) -> Result<()> {
    let handler = ServerCommandHandler::new(app.container.clone());
    match command {
        ServerCommands::Test { server_id } => handler.test(server_id).await,
        ServerCommands::Ls { server_id, path } => handler.list_files(server_id, path).await,
    }
}
