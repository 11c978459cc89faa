//! On-demand pipeline run.

use clap::Args;
use nudgeflow_core::RecommendationContext;
use std::path::PathBuf;

use super::{print_json, read_snapshot, runtime, CliResult, Session};

#[derive(Args)]
pub struct GenerateArgs {
    /// Snapshot JSON file for the user
    #[arg(long)]
    snapshot: PathBuf,
    /// Recommendation context (momentum, daily_plan, weekly_review, on_demand)
    #[arg(long, default_value = "on_demand")]
    context: RecommendationContext,
}

pub fn run(args: GenerateArgs) -> CliResult {
    let snapshot = read_snapshot(&args.snapshot)?;
    let user_id = snapshot.user_id.clone();
    let session = Session::with_snapshots(vec![snapshot])?;
    let report = runtime()?.block_on(session.pipeline.generate(&user_id, args.context))?;
    print_json(&report)
}
