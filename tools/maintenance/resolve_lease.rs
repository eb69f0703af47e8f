/// Reset a poisoned derivation lease after the underlying problem has been
/// fixed: attempt goes back to 0 and the lease returns to FAILED, making it
/// eligible for auto-reclaim again. Optionally marks the matching indexing
/// errors resolved.

use clap::Parser;

use flowdex::config::Settings;
use flowdex::db::PgStore;

#[derive(Parser, Debug)]
#[command(name = "resolve-lease")]
struct Args {
    /// Derivation kind, e.g. token_transfers or evm
    #[arg(long)]
    worker_type: String,

    /// Range start height of the lease to reset
    #[arg(long)]
    from_height: u64,

    /// Also mark matching indexing errors resolved
    #[arg(long, default_value_t = true)]
    resolve_errors: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut settings = Settings::load(Some("config.toml"))?;
    settings.skip_migration = true;
    let store = PgStore::connect(&settings).await?;

    let updated = sqlx::query(
        "UPDATE raw.worker_leases SET status = 'FAILED', attempt = 0 \
         WHERE worker_type = $1 AND from_height = $2 AND status <> 'COMPLETED'",
    )
    .bind(&args.worker_type)
    .bind(args.from_height as i64)
    .execute(&store.pool)
    .await?
    .rows_affected();

    if updated == 0 {
        println!(
            "no resettable lease at ({}, {}) - already completed or missing",
            args.worker_type, args.from_height
        );
        return Ok(());
    }
    println!("lease ({}, {}) reset for re-claim", args.worker_type, args.from_height);

    if args.resolve_errors {
        let resolved = sqlx::query(
            "UPDATE raw.indexing_errors SET resolved = true \
             WHERE worker_name = $1 AND block_height = $2 AND NOT resolved",
        )
        .bind(flowdex::derivations::checkpoint_name(&args.worker_type))
        .bind(args.from_height as i64)
        .execute(&store.pool)
        .await?
        .rows_affected();
        println!("{} indexing error(s) marked resolved", resolved);
    }

    Ok(())
}
