//! Verify command - poll health of units applied by the last pass.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use super::{interrupt_on_ctrl_c, print_json, CommandContext, GlobalArgs, TimingArgs};
use crate::applier::ApplyReport;
use crate::graph::GraphError;
use crate::state::RunRecord;
use crate::ui::{self, ConsoleObserver};
use crate::verifier::Verifier;

/// Verify units recorded as applied in the last run.
#[derive(Args, Debug)]
pub struct VerifyCommand {
    /// Units to verify (default: every unit of the last run).
    units: Vec<String>,

    #[command(flatten)]
    timing: TimingArgs,
}

/// Narrow a recorded apply report to the named units.
fn narrow(report: &ApplyReport, names: &[String]) -> Result<ApplyReport, GraphError> {
    if names.is_empty() {
        return Ok(report.clone());
    }
    if let Some(unknown) = names.iter().find(|n| report.result(n).is_none()) {
        return Err(GraphError::UnknownUnit(unknown.clone()));
    }
    Ok(ApplyReport {
        results: report
            .results
            .iter()
            .filter(|r| names.contains(&r.unit))
            .cloned()
            .collect(),
        ..report.clone()
    })
}

impl VerifyCommand {
    /// Run the verify command.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no recorded apply pass, or any unit is
    /// not healthy.
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        let mut ctx = CommandContext::load(global)?;
        self.timing.apply_to(&mut ctx.config)?;

        let state_dir = ctx.state_dir();
        let mut record = RunRecord::load(&state_dir)?.unwrap_or_default();
        let report = record
            .apply
            .as_ref()
            .context("No recorded apply pass; run `hdeploy apply` first")?;
        let report = narrow(report, &self.units)?;

        let cluster = ctx.connect().await?;
        let mut verifier = Verifier::new(cluster, ctx.config.verify_config())
            .with_interrupt(interrupt_on_ctrl_c());
        if !ctx.json {
            ui::print_section("Verifying");
            verifier = verifier.with_observer(Arc::new(ConsoleObserver));
        }
        let verified = verifier.verify(&report, &ctx.store).await?;

        record.record_verify(verified.clone());
        record.save(&state_dir)?;

        if ctx.json {
            print_json(&verified)?;
        } else {
            ui::print_verify_summary(&verified);
        }

        if verified.interrupted() {
            anyhow::bail!("Verification interrupted")
        } else if verified.all_healthy() {
            Ok(())
        } else {
            let unhealthy = verified.results.len() - verified.counts().healthy;
            anyhow::bail!("{unhealthy} units are not healthy")
        }
    }
}
