use sqlx::Row;

use flowdex::config::Settings;
use flowdex::db::PgStore;
use flowdex::store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = Settings::load(Some("config.toml"))?;
    settings.skip_migration = true;
    let store = PgStore::connect(&settings).await?;

    println!("=== ROW COUNTS ===");
    for table in [
        "raw.blocks",
        "raw.transactions",
        "raw.events",
        "raw.scripts",
        "raw.block_lookup",
        "raw.tx_lookup",
        "raw.event_payload_blobs",
        "raw.indexing_errors",
        "app.address_transactions",
        "app.account_keys",
        "app.token_transfers",
        "app.evm_transactions",
    ] {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&store.pool)
            .await?;
        println!("{:30} {}", table, count);
    }

    println!("\n=== CHECKPOINTS ===");
    for checkpoint in store.watermarks().await? {
        println!(
            "{:30} {} (updated {})",
            checkpoint.worker_name, checkpoint.last_height, checkpoint.updated_at
        );
    }

    println!("\n=== TIP ===");
    match store.last_persisted_block().await? {
        Some((height, id)) => println!("height {} id {}", height, id),
        None => println!("no blocks persisted"),
    }

    println!("\n=== LEASES ===");
    let rows = sqlx::query(
        "SELECT worker_type, status, COUNT(*) AS n, MAX(attempt) AS max_attempt \
         FROM raw.worker_leases GROUP BY worker_type, status ORDER BY worker_type, status",
    )
    .fetch_all(&store.pool)
    .await?;
    for row in rows {
        println!(
            "{:20} {:10} count={} max_attempt={}",
            row.get::<String, _>("worker_type"),
            row.get::<String, _>("status"),
            row.get::<i64, _>("n"),
            row.get::<i32, _>("max_attempt"),
        );
    }

    println!("\n=== UNRESOLVED INDEXING ERRORS ===");
    let rows = sqlx::query(
        "SELECT worker_name, severity, COUNT(*) AS n FROM raw.indexing_errors \
         WHERE NOT resolved GROUP BY worker_name, severity ORDER BY worker_name",
    )
    .fetch_all(&store.pool)
    .await?;
    if rows.is_empty() {
        println!("none");
    }
    for row in rows {
        println!(
            "{:30} {:8} count={}",
            row.get::<String, _>("worker_name"),
            row.get::<String, _>("severity"),
            row.get::<i64, _>("n"),
        );
    }

    Ok(())
}
