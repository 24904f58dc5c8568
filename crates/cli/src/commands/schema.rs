//! `askdb schema`: print the schema description and static tables.

use std::path::Path;

use askdb_core::SchemaProvider;
use askdb_store::PostgresStore;

use super::CliResult;
use super::services::load_config;

pub async fn run(config_path: Option<&Path>) -> CliResult {
    let config = load_config(config_path)?;
    let store = PostgresStore::from_config(&config.database)?;

    let result = print_schema(&store).await;
    store.close().await;
    result
}

async fn print_schema(store: &PostgresStore) -> CliResult {
    if !store.test_connection().await {
        return Err("Database is not reachable".into());
    }

    match store.schema_description().await? {
        Some(text) => println!("{text}"),
        None => println!("Schema '{}' has no tables.", store.schema()),
    }

    let tables = store.static_tables().await;
    if tables.is_empty() {
        println!("No static tables loaded.");
    }
    for table in tables.iter() {
        println!(
            "Static table {}: {} rows, {} chars",
            table.name,
            table.rows.len(),
            table.rows.to_compact_json().chars().count()
        );
    }
    Ok(())
}
