//! `askdb doctor`: diagnose configuration and connectivity.

use std::path::Path;

use askdb_config::AppConfig;
use askdb_core::{ReasoningBackend, SchemaProvider};
use askdb_reasoner::OpenAiBackend;
use askdb_store::PostgresStore;

use super::CliResult;

pub async fn run(config_path: Option<&Path>) -> CliResult {
    println!("askdb doctor");
    println!("============\n");

    let mut issues = 0;

    let config = match AppConfig::load_with(config_path) {
        Ok(config) => {
            println!("  [ok]   Config valid");
            config
        }
        Err(e) => {
            println!("  [fail] Config invalid: {e}");
            println!("\n  1 issue found.");
            return Ok(());
        }
    };

    if config.gateway.internal_api_key.is_some() {
        println!("  [ok]   Internal API key configured");
    } else {
        println!("  [warn] No internal API key, the gateway will reject every request");
        issues += 1;
    }

    println!(
        "  [ok]   Budget: {} chars of data per step, answers up to {} chars",
        config.budget.data_budget(),
        config.budget.answer_limit()
    );

    match PostgresStore::from_config(&config.database) {
        Ok(store) => {
            if store.test_connection().await {
                println!("  [ok]   Database reachable ({})", config.database.host);
            } else {
                println!("  [fail] Database unreachable ({})", config.database.host);
                issues += 1;
            }
            store.close().await;
        }
        Err(e) => {
            println!("  [fail] Database settings invalid: {e}");
            issues += 1;
        }
    }

    match OpenAiBackend::from_config(&config.reasoner) {
        Ok(backend) => match (backend.list_files().await, backend.list_attached().await) {
            (Ok(files), Ok(attached)) => println!(
                "  [ok]   Reasoning engine reachable: {} files, {} attached",
                files.len(),
                attached.len()
            ),
            (Err(e), _) | (_, Err(e)) => {
                println!("  [fail] Reasoning engine check failed: {e}");
                issues += 1;
            }
        },
        Err(e) => {
            println!("  [fail] Reasoning engine not configured: {e}");
            issues += 1;
        }
    }

    println!();
    if issues == 0 {
        println!("  All checks passed.");
    } else {
        println!("  {issues} issue(s) found. See above for details.");
    }
    Ok(())
}
