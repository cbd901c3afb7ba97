use std::sync::Arc;

use secmap_core::{ReqwestHttpClient, TickerRefreshRun, YahooLookupProvider};
use secmap_warehouse::Warehouse;
use serde_json::{json, Value};

use crate::cli::RefreshTickersArgs;
use crate::error::CliError;

pub async fn run(args: &RefreshTickersArgs, warehouse: &Warehouse) -> Result<Value, CliError> {
    let config = args.to_config();
    config.validate()?;

    let provider = YahooLookupProvider::new(Arc::new(ReqwestHttpClient::new()?));
    let summary = TickerRefreshRun::new(config, warehouse, &provider)
        .execute()
        .await?;

    if summary.adaptive.stop_requested {
        tracing::warn!("ticker refresh stopped early after sustained throttling");
    }

    Ok(json!({ "ticker_refresh_summary": summary }))
}
