use std::sync::Arc;

use secmap_core::{EnrichmentRun, ReqwestHttpClient, YahooLookupProvider};
use secmap_warehouse::Warehouse;
use serde_json::{json, Value};

use crate::cli::RefreshArgs;
use crate::error::CliError;

pub async fn run(args: &RefreshArgs, warehouse: &Warehouse) -> Result<Value, CliError> {
    let config = args.to_config();
    config.validate()?;

    let provider = YahooLookupProvider::new(Arc::new(ReqwestHttpClient::new()?));
    let summary = EnrichmentRun::new(config, warehouse, &provider)
        .execute()
        .await?;

    if summary.adaptive.stop_requested {
        tracing::warn!("run stopped early after sustained throttling");
    }

    Ok(json!({ "run_summary": summary }))
}
