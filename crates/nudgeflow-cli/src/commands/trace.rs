//! Decision trace inspection.

use clap::Subcommand;
use nudgeflow_core::{PageRequest, RecommendationContext, RecommendationStatus, SelectionMethod, TraceFilter};

use super::{parse_time, print_json, CliResult, Session};

#[derive(Subcommand)]
pub enum TraceAction {
    /// List traces, newest first
    List {
        /// Only traces created at or after this time (RFC3339)
        #[arg(long)]
        from: Option<String>,
        /// Only traces created at or before this time (RFC3339)
        #[arg(long)]
        to: Option<String>,
        /// Filter by user ID
        #[arg(long)]
        user: Option<String>,
        /// Filter by recommendation context
        #[arg(long)]
        context: Option<RecommendationContext>,
        /// Filter by status of the linked recommendation
        #[arg(long)]
        status: Option<RecommendationStatus>,
        /// Filter by selection method (Deterministic, PlaybookLookup, Escalated, Fallback)
        #[arg(long)]
        method: Option<SelectionMethod>,
        /// Filter by final tier
        #[arg(long)]
        tier: Option<u8>,
        /// Page number, starting at 1
        #[arg(long, default_value = "1")]
        page: u32,
        /// Rows per page (max 200)
        #[arg(long, default_value = "50")]
        page_size: u32,
    },
    /// Show every trace of one pipeline run, with agent run stats
    Run {
        /// Run ID
        run_id: String,
    },
}

pub fn run(action: TraceAction) -> CliResult {
    let session = Session::open(&[])?;

    match action {
        TraceAction::List {
            from,
            to,
            user,
            context,
            status,
            method,
            tier,
            page,
            page_size,
        } => {
            let filter = TraceFilter {
                from: from.as_deref().map(parse_time).transpose()?,
                to: to.as_deref().map(parse_time).transpose()?,
                context,
                status,
                user_id: user,
                selection_method: method,
                final_tier: tier,
            };
            let page = session.pipeline.list_traces(&filter, PageRequest::new(page, page_size))?;
            print_json(&page)?;
        }
        TraceAction::Run { run_id } => {
            print_json(&session.pipeline.store().traces_for_run(&run_id)?)?;
        }
    }
    Ok(())
}
