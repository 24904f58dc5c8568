//! `askdb ask`: resolve one question and print the answer.

use std::path::Path;

use askdb_core::History;

use super::CliResult;
use super::services::{Services, history_from_file, load_config};

pub async fn run(config_path: Option<&Path>, message: &str, history: Option<&Path>) -> CliResult {
    let history = match history {
        Some(path) => history_from_file(path)?,
        None => History::empty(),
    };

    let services = Services::build(load_config(config_path)?)?;
    services.start().await?;

    let outcome = services.pipeline.resolve(message, history).await;
    services.shutdown().await;

    let answer = outcome?;
    if answer.trim().is_empty() {
        println!("(no answer)");
    } else {
        println!("{answer}");
    }
    Ok(())
}
