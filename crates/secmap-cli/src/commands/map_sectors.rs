use std::sync::Arc;

use secmap_core::{ReqwestHttpClient, SectorBackfillRun, YahooLookupProvider};
use secmap_warehouse::Warehouse;
use serde_json::{json, Value};

use crate::cli::MapSectorsArgs;
use crate::error::CliError;

pub async fn run(args: &MapSectorsArgs, warehouse: &Warehouse) -> Result<Value, CliError> {
    let config = args.to_config();
    config.validate()?;

    let provider = YahooLookupProvider::new(Arc::new(ReqwestHttpClient::new()?));
    let summary = SectorBackfillRun::new(config, warehouse, &provider)
        .execute()
        .await?;

    if summary.adaptive.stop_requested {
        tracing::warn!("sector back-fill stopped early after sustained throttling");
    }

    Ok(json!({ "sector_backfill_summary": summary }))
}
