//! Wipes the persisted trade history: discovery records, paper
//! positions and the aggregate stats document. Run it before pointing
//! the bot at a new target account.

use anyhow::Result;
use colored::Colorize;

use polymarket_mirror::config::{connect_db, load_env, Store};

#[tokio::main]
async fn main() -> Result<()> {
    let env = load_env()?;

    let confirmed = std::env::args().any(|a| a == "--yes");
    if !confirmed {
        println!(
            "{} This deletes all discovery records, paper positions and stats.",
            "!".red().bold()
        );
        println!("  Re-run with {} to confirm.", "--yes".cyan());
        return Ok(());
    }

    let db = connect_db(&env.mongo_uri).await?;
    let store = Store::new(&db);
    let (records, positions, stats) = store.reset_all().await?;

    println!(
        "{} History reset: {} records, {} positions, {} stats documents removed",
        "✓".green(),
        records,
        positions,
        stats
    );
    Ok(())
}
