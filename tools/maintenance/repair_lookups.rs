/// Run one reconciler pass and exit: repairs tx_lookup in both directions
/// and reclaims orphaned payload blobs.

use std::sync::Arc;

use flowdex::config::Settings;
use flowdex::db::PgStore;
use flowdex::reconciler::Reconciler;
use flowdex::store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = Settings::load(Some("config.toml"))?;
    settings.skip_migration = true;
    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&settings).await?);

    let reconciler = Reconciler::new(&settings, store);
    let report = reconciler.run_once().await?;

    println!("dangling lookups deleted: {}", report.dangling_lookups_deleted);
    println!("lookups backfilled:       {}", report.lookups_backfilled);
    Ok(())
}
