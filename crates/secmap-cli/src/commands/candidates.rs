use secmap_warehouse::Warehouse;
use serde_json::{json, Value};

use crate::cli::CandidatesArgs;
use crate::error::CliError;

pub fn run(args: &CandidatesArgs, warehouse: &Warehouse) -> Result<Value, CliError> {
    let mut candidates = warehouse.candidates(args.top_institutions)?;
    if args.limit > 0 {
        candidates.truncate(args.limit);
    }

    Ok(json!({
        "count": candidates.len(),
        "candidates": candidates,
    }))
}
