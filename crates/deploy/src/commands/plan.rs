//! Plan command - show apply order and drift without changing anything.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::info;

use super::{print_json, CommandContext, GlobalArgs, SelectArgs};
use crate::applier::Applier;
use crate::lock::NoopLock;
use crate::ui;

/// Show the apply order and per-unit drift.
#[derive(Args, Debug)]
pub struct PlanCommand {
    #[command(flatten)]
    select: SelectArgs,

    /// Print the full diff of drifted units.
    #[arg(long, default_value = "false")]
    diff: bool,
}

impl PlanCommand {
    /// Run the plan command.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is invalid or the cluster is unreachable.
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        let ctx = CommandContext::load(global)?;
        let selection = ctx.select(&self.select)?;
        info!(units = selection.units.len(), "Planning");

        let cluster = ctx.connect().await?;
        let plan = Applier::new(cluster, Arc::new(NoopLock))
            .plan(&ctx.store, &selection)
            .await?;

        if ctx.json {
            return print_json(&plan);
        }

        ui::print_section("Apply plan");
        ui::print_plan(&plan);
        if self.diff {
            ui::print_diffs(&plan);
        }

        println!();
        let drifted = plan.drifted().len();
        if drifted == 0 {
            ui::print_success("Cluster matches the store");
        } else {
            ui::print_info(&format!("{drifted} of {} units will change", plan.units.len()));
        }
        Ok(())
    }
}
