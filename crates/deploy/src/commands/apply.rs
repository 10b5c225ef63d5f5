//! Apply command - run one apply pass, optionally followed by verification.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use dialoguer::{theme::ColorfulTheme, Confirm};
use serde::Serialize;
use tracing::{info, warn};

use super::{
    interrupt_on_ctrl_c, print_json, CommandContext, GlobalArgs, SelectArgs, TimingArgs,
};
use crate::applier::{ApplyReport, Applier};
use crate::cluster::ClusterApi;
use crate::lock::{default_holder, LeaseLock, NoopLock, PassLock};
use crate::observer::{PassObserver, SilentObserver};
use crate::state::RunRecord;
use crate::ui::{self, ConsoleObserver};
use crate::verifier::{Verifier, VerifyReport};

/// Apply the selected units in dependency order.
#[derive(Args, Debug)]
pub struct ApplyCommand {
    #[command(flatten)]
    select: SelectArgs,

    /// Verify unit health after the pass.
    #[arg(long, default_value = "false")]
    verify: bool,

    /// Skip the confirmation prompt.
    #[arg(short, long, default_value = "false")]
    yes: bool,

    /// Do not take the cluster-wide apply lock.
    #[arg(long, default_value = "false")]
    no_lock: bool,

    #[command(flatten)]
    timing: TimingArgs,
}

#[derive(Serialize)]
struct ApplyOutput<'a> {
    apply: &'a ApplyReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    verify: Option<&'a VerifyReport>,
}

impl ApplyCommand {
    /// Run the apply command.
    ///
    /// # Errors
    ///
    /// Returns an error if the pass cannot run, or if any unit failed to
    /// apply or verify.
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        let mut ctx = CommandContext::load(global)?;
        self.timing.apply_to(&mut ctx.config)?;
        let selection = ctx.select(&self.select)?;
        let order = selection.ordered()?;

        if order.is_empty() {
            ui::print_warning("Nothing to apply");
            return Ok(());
        }

        if !ctx.json {
            ui::print_section("Apply order");
            for (index, unit) in order.iter().enumerate() {
                println!("  {:>2}. {unit}", index + 1);
            }
            println!();
        }

        if !self.yes {
            let proceed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(format!("Apply {} units?", order.len()))
                .default(false)
                .interact()?;
            if !proceed {
                ui::print_info("Aborted");
                return Ok(());
            }
        }

        let cluster = ctx.connect().await?;
        let lock: Arc<dyn PassLock> = if self.no_lock {
            warn!("Running without the apply lock");
            Arc::new(NoopLock)
        } else {
            let lock = &ctx.config.lock;
            Arc::new(
                LeaseLock::new(cluster.client(), &lock.namespace, &lock.name, &default_holder())
                    .with_lease_duration(Duration::from_secs(lock.lease_seconds)),
            )
        };
        let observer: Arc<dyn PassObserver> = if ctx.json {
            Arc::new(SilentObserver)
        } else {
            Arc::new(ConsoleObserver)
        };

        if !ctx.json {
            ui::print_section("Applying");
        }
        let cluster: Arc<dyn ClusterApi> = cluster;
        let interrupt = interrupt_on_ctrl_c();
        let report = Applier::new(cluster.clone(), lock)
            .with_observer(observer.clone())
            .with_interrupt(interrupt.clone())
            .apply_pass(&ctx.store, &selection)
            .await?;

        let mut record = match RunRecord::load(&ctx.state_dir()) {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable run record");
                RunRecord::default()
            }
        };
        record.context.clone_from(&ctx.context);
        record.record_apply(report.clone());

        let verify = self.verify && !report.interrupted && !report.applied_units().is_empty();
        let verified = if verify {
            if !ctx.json {
                ui::print_apply_summary(&report);
                ui::print_section("Verifying");
            }
            let verified = Verifier::new(cluster, ctx.config.verify_config())
                .with_observer(observer)
                .with_interrupt(interrupt)
                .verify(&report, &ctx.store)
                .await?;
            record.record_verify(verified.clone());
            Some(verified)
        } else {
            None
        };

        record.save(&ctx.state_dir())?;

        if ctx.json {
            print_json(&ApplyOutput {
                apply: &report,
                verify: verified.as_ref(),
            })?;
        } else {
            match &verified {
                Some(verified) => ui::print_verify_summary(verified),
                None => ui::print_apply_summary(&report),
            }
        }

        if let Some(failed) = report.failed_unit() {
            anyhow::bail!("Apply pass halted at {}", failed.unit);
        }
        if report.interrupted {
            anyhow::bail!("Apply pass interrupted");
        }
        if let Some(verified) = &verified {
            if verified.interrupted() {
                anyhow::bail!("Verification interrupted");
            }
            if !verified.all_healthy() {
                anyhow::bail!("Verification failed");
            }
        }

        info!("Apply complete");
        if !ctx.json {
            println!();
            ui::print_success("All units applied");
        }
        Ok(())
    }
}
