use anyhow::Result;
use clap::{Parser, Subcommand};
use docchat_lib::commands::{self, Context};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "Chat with your documents from the terminal.")]
struct Cli {
    /// SQLite file holding tokens, settings and the local transcript.
    #[arg(long, global = true, env = "DOCCHAT_DB")]
    db: Option<PathBuf>,

    /// Backend base URL for this run (overrides the stored setting).
    #[arg(long, global = true, env = "DOCCHAT_API_BASE")]
    api_base: Option<String>,

    /// Debug logging on stderr.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat (default).
    Chat,
    /// Ask a single question.
    Ask {
        question: Vec<String>,
        /// Wait for the whole answer instead of streaming it.
        #[arg(long)]
        no_stream: bool,
    },
    /// Print the chat history.
    History,
    /// Delete the chat history locally and, when signed in, on the server.
    Clear,
    /// List documents available as a chat filter.
    Documents {
        /// Include documents that are still processing.
        #[arg(long)]
        all: bool,
    },
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    Logout,
    /// Show the signed-in user.
    Whoami,
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Get { key: Option<String> },
    Set { key: String, value: String },
    Unset { key: String },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let level = if verbose { "debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("docchat={level},docchat_lib={level}")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let db_path = cli.db.unwrap_or_else(commands::default_db_path);
    let ctx = Context::open(&db_path, cli.api_base)?;
    tracing::debug!(db = %db_path.display(), api_base = %ctx.config.api_base, "starting");

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => commands::chat::repl(&ctx).await,
        Command::Ask {
            question,
            no_stream,
        } => commands::chat::ask(&ctx, &question.join(" "), no_stream).await,
        Command::History => commands::chat::history(&ctx).await,
        Command::Clear => commands::chat::clear(&ctx).await,
        Command::Documents { all } => commands::documents::list(&ctx, all).await,
        Command::Login { email } => commands::auth::login(&ctx, email).await,
        Command::Logout => commands::auth::logout(&ctx).await,
        Command::Whoami => commands::auth::whoami(&ctx).await,
        Command::Settings { command } => match command {
            SettingsCommand::Get { key } => commands::settings::get(&ctx, key.as_deref()),
            SettingsCommand::Set { key, value } => commands::settings::set(&ctx, &key, &value),
            SettingsCommand::Unset { key } => commands::settings::unset(&ctx, &key),
        },
    }
}
