mod app;
mod commands;
mod settings;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flashmark", about = "Keep Markdown notes and flashcards in sync", version)]
struct Cli {
    /// Collection file (default: configuration, then the platform data directory)
    #[arg(long, global = true, env = "FLASHMARK_COLLECTION")]
    collection: Option<PathBuf>,

    /// Configuration file (default: ~/.config/flashmark/config.json)
    #[arg(long, global = true, env = "FLASHMARK_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "plain")]
    format: OutputFormat,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Synchronize Markdown documents into the collection
    Sync {
        /// Documents to synchronize
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[command(flatten)]
        options: commands::sync::SyncOptions,
    },

    /// Print a stored note as a Markdown block
    Show {
        /// Note id
        nid: i64,
    },

    /// Create an empty collection with the stock models
    Init,

    /// List the collection's models and their fields
    Models,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let app = app::App::new(cli.config.as_deref(), cli.collection.as_deref())?;
    match cli.command {
        Command::Sync { files, options } => commands::sync::run(app, &files, &options, cli.format)?,
        Command::Show { nid } => commands::show::run(&app, nid, cli.format)?,
        Command::Init => commands::init::run(&app, cli.format)?,
        Command::Models => commands::models::run(&app, cli.format)?,
    }

    Ok(())
}
