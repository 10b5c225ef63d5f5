//! Status command - show the last recorded run.

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use super::{print_json, CommandContext, GlobalArgs};
use crate::state::RunRecord;
use crate::ui;

/// Print the last apply and verify outcome recorded for the store.
#[derive(Args, Debug)]
pub struct StatusCommand {}

impl StatusCommand {
    /// Run the status command.
    ///
    /// # Errors
    ///
    /// Returns an error if the run record exists but cannot be read.
    #[allow(clippy::unused_async)]
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        let ctx = CommandContext::load(global)?;
        let Some(record) = RunRecord::load(&ctx.state_dir())? else {
            if ctx.json {
                return print_json(&serde_json::Value::Null);
            }
            ui::print_info("No recorded runs for this store");
            return Ok(());
        };

        if ctx.json {
            return print_json(&record);
        }

        if let Some(apply) = &record.apply {
            ui::print_section("Last apply");
            println!(
                "  {} {}",
                "Finished:".bright_black(),
                apply.finished_at.to_rfc3339()
            );
            if let Some(context) = &record.context {
                println!("  {} {context}", "Context:".bright_black());
            }
            println!();
            for result in &apply.results {
                ui::print_unit_result(result);
            }
            ui::print_apply_summary(apply);
        }

        if let Some(verify) = &record.verify {
            ui::print_section("Last verification");
            for result in &verify.results {
                ui::print_verify_result(result);
            }
            ui::print_verify_summary(verify);
        }
        Ok(())
    }
}
