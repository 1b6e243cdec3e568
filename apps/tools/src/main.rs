use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::domain::ClientId;
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the stored conversation between two client identifiers.
    History { a: String, b: String },
    /// Delete the stored conversation between two client identifiers.
    Purge { a: String, b: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::History { a, b } => {
            let history = storage
                .history_between(&ClientId::new(a), &ClientId::new(b))
                .await?;
            for message in history {
                println!("{} {}> {}", message.stored_at, message.sender, message.text);
            }
        }
        Command::Purge { a, b } => {
            let purged = storage
                .purge_history(&ClientId::new(a), &ClientId::new(b))
                .await?;
            println!("purged {purged} message(s)");
        }
    }

    Ok(())
}
