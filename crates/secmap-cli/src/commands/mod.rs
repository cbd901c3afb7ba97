mod candidates;
mod map_sectors;
mod refresh;
mod refresh_tickers;

use secmap_warehouse::{Warehouse, WarehouseConfig};
use serde_json::Value;

use crate::cli::{Cli, Command};
use crate::error::CliError;

pub async fn run(cli: &Cli) -> Result<Value, CliError> {
    let warehouse = open_warehouse(cli)?;

    match &cli.command {
        Command::Refresh(args) => refresh::run(args, &warehouse).await,
        Command::RefreshTickers(args) => refresh_tickers::run(args, &warehouse).await,
        Command::MapSectors(args) => map_sectors::run(args, &warehouse).await,
        Command::Candidates(args) => candidates::run(args, &warehouse),
    }
}

fn open_warehouse(cli: &Cli) -> Result<Warehouse, CliError> {
    let config = match &cli.db_path {
        Some(path) => WarehouseConfig::at(path.clone()),
        None => WarehouseConfig::default(),
    };
    tracing::debug!(db_path = %config.db_path.display(), "opening warehouse");
    Ok(Warehouse::open(config)?)
}
