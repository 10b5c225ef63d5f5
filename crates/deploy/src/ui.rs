//! Console output helpers.

use colored::Colorize;

use crate::applier::{ApplyReport, PlanReport, UnitResult};
use crate::cluster::DiffOutcome;
use crate::observer::PassObserver;
use crate::unit::{DeploymentUnit, UnitPhase};
use crate::verifier::{VerifyOutcome, VerifyReport, VerifyResult};

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a progress step with step number.
pub fn print_progress_step(current: usize, total: usize, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print prerequisite check result.
pub fn print_check_result(name: &str, passed: bool, message: Option<&str>) {
    let status = if passed { "✓".green() } else { "✗".red() };

    let text = if let Some(msg) = message {
        format!("{name} - {msg}")
    } else {
        name.to_string()
    };

    println!("  {status} {text}");
}

fn phase_marker(phase: UnitPhase) -> colored::ColoredString {
    match phase {
        UnitPhase::Applied | UnitPhase::Healthy => "✓".green().bold(),
        UnitPhase::Failed | UnitPhase::Unhealthy | UnitPhase::TimedOut => "✗".red().bold(),
        UnitPhase::DependencyUnmet => "⊘".yellow().bold(),
        _ => "·".bright_black(),
    }
}

/// One line per unit of an apply pass.
pub fn print_unit_result(result: &UnitResult) {
    let state = match result.phase {
        UnitPhase::Applied if result.changed => "applied".green(),
        UnitPhase::Applied => "unchanged".bright_black(),
        UnitPhase::Failed => "failed".red(),
        UnitPhase::DependencyUnmet => "dependency unmet".yellow(),
        other => other.label().bright_black(),
    };
    println!(
        "  {} {}/{} {}",
        phase_marker(result.phase),
        result.namespace.bright_black(),
        result.unit.bold(),
        state
    );
    if let Some(error) = &result.error {
        println!("      {}", error.to_string().bright_black());
    }
}

pub fn print_verify_result(result: &VerifyResult) {
    let (marker, text) = match &result.outcome {
        VerifyOutcome::Healthy => ("✓".green().bold(), "healthy".green()),
        VerifyOutcome::Unhealthy { reason } => {
            ("✗".red().bold(), format!("unhealthy: {reason}").red())
        }
        VerifyOutcome::TimedOut { last_reason } => {
            ("✗".red().bold(), format!("timed out: {last_reason}").red())
        }
        VerifyOutcome::NotApplied => ("·".bright_black(), "not applied".bright_black()),
        VerifyOutcome::Interrupted => ("·".bright_black(), "not verified".bright_black()),
    };
    println!("  {marker} {} {text}", result.unit.bold());
}

pub fn print_apply_summary(report: &ApplyReport) {
    let counts = report.counts();
    println!();
    println!(
        "  {} applied, {} unchanged, {} failed, {} dependency unmet, {} skipped",
        counts.changed.to_string().green(),
        counts.unchanged,
        counts.failed.to_string().red(),
        counts.dependency_unmet.to_string().yellow(),
        counts.skipped
    );
    if report.interrupted {
        print_warning("Pass interrupted; remaining units were not attempted");
    }
}

pub fn print_verify_summary(report: &VerifyReport) {
    let counts = report.counts();
    println!();
    println!(
        "  {} healthy, {} unhealthy, {} timed out, {} not applied",
        counts.healthy.to_string().green(),
        counts.unhealthy.to_string().red(),
        counts.timed_out.to_string().red(),
        counts.not_applied
    );
    if report.interrupted() {
        print_warning("Verification interrupted; remaining units were not verified");
    }
}

/// Print the planned order with drift per unit.
pub fn print_plan(plan: &PlanReport) {
    for (index, unit) in plan.units.iter().enumerate() {
        let state = match &unit.diff {
            Ok(DiffOutcome::InSync) => "in sync".bright_black(),
            Ok(DiffOutcome::Drifted(_)) => "will change".yellow(),
            Err(e) => format!("diff unavailable: {e}").red(),
        };
        let deps = if unit.depends_on.is_empty() {
            String::new()
        } else {
            format!(" (after {})", unit.depends_on.join(", "))
        };
        println!(
            "  {} {}/{}{} {}",
            format!("{:>2}.", index + 1).bright_black(),
            unit.namespace.bright_black(),
            unit.unit.bold(),
            deps.bright_black(),
            state
        );
    }
    if !plan.assumed.is_empty() {
        println!();
        print_info(&format!(
            "Assumed already applied: {}",
            plan.assumed.join(", ")
        ));
    }
}

/// Print full diffs for drifted units.
pub fn print_diffs(plan: &PlanReport) {
    for unit in plan.drifted() {
        if let Ok(DiffOutcome::Drifted(diff)) = &unit.diff {
            println!();
            println!("{}", format!("--- {}", unit.unit).cyan().bold());
            for line in diff.lines() {
                if line.starts_with('+') {
                    println!("{}", line.green());
                } else if line.starts_with('-') {
                    println!("{}", line.red());
                } else {
                    println!("{line}");
                }
            }
        }
    }
}

/// Live progress on the console.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleObserver;

impl PassObserver for ConsoleObserver {
    fn apply_started(&self, unit: &DeploymentUnit, position: usize, total: usize) {
        print_progress_step(position, total, &format!("Applying {unit}"));
    }

    fn apply_finished(&self, result: &UnitResult) {
        print_unit_result(result);
    }

    fn verify_started(&self, unit: &DeploymentUnit, position: usize, total: usize) {
        print_progress_step(position, total, &format!("Waiting for {unit}"));
    }

    fn verify_finished(&self, result: &VerifyResult) {
        print_verify_result(result);
    }
}
