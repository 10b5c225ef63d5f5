//! Check command - validate local prerequisites and the manifest store.

use anyhow::Result;
use clap::Args;

use super::{CommandContext, GlobalArgs};
use crate::prereq::PrerequisitesValidator;
use crate::ui;

/// Check kubectl, kubeconfig and the manifest store.
#[derive(Args, Debug)]
pub struct CheckCommand {}

impl CheckCommand {
    /// Run the check command.
    ///
    /// # Errors
    ///
    /// Returns an error if a critical prerequisite is missing.
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        let ctx = CommandContext::load(global)?;
        ui::print_section("Prerequisites");
        PrerequisitesValidator::new(ctx.kubectl(), ctx.kubeconfig.clone(), ctx.store.clone())
            .validate()
            .await
    }
}
