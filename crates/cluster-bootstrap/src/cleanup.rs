//! Teardown after a failed run and on request.
//!
//! Nothing is destroyed without an explicit yes. The secrets bundle always
//! survives so a retry keeps the same cluster identity.

use std::path::Path;

use anyhow::{Context, Result};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use tracing::info;

use crate::artifacts::Artifacts;
use crate::providers::{DestroyScope, Provisioner};
use crate::state::Phase;
use crate::ui;

/// Yes/no question to the operator.
pub trait ConfirmPrompt: Send + Sync {
    /// Ask `prompt`; `false` unless the operator agrees.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal cannot be read.
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Interactive prompt on the terminal, defaulting to no.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl ConfirmPrompt for TerminalPrompt {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Failed to read confirmation")
    }
}

/// Result of a cleanup offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// Infrastructure and generated artifacts were removed.
    Destroyed,
    /// The operator declined; everything was left in place.
    Declined,
    /// The teardown started but failed; some infrastructure may remain.
    Incomplete(String),
}

/// Offer to tear down everything after `failed` aborted the run.
///
/// A teardown that fails partway is reported as
/// [`CleanupOutcome::Incomplete`] after printing the recovery commands.
///
/// # Errors
///
/// Returns an error if the prompt cannot be read.
pub async fn offer_cleanup(
    provisioner: &dyn Provisioner,
    artifacts: &Artifacts,
    prompt: &dyn ConfirmPrompt,
    failed: Phase,
    config_path: &Path,
) -> Result<CleanupOutcome> {
    ui::print_section("Cleanup");
    let question = "Destroy the VMs, DNS records and generated configs from this run?";

    if !prompt.confirm(question)? {
        print_resume_hint(failed, config_path);
        return Ok(CleanupOutcome::Declined);
    }

    match destroy(provisioner, artifacts, DestroyScope::Everything).await {
        Ok(()) => Ok(CleanupOutcome::Destroyed),
        Err(e) => {
            ui::print_error(&format!("Cleanup failed: {e:#}"));
            print_recovery("Some infrastructure may still exist.", failed, config_path);
            Ok(CleanupOutcome::Incomplete(format!("{e:#}")))
        }
    }
}

/// Tear down `scope` after confirmation.
///
/// Returns whether anything was destroyed.
///
/// # Errors
///
/// Returns an error if the prompt fails or the teardown fails.
pub async fn confirm_and_destroy(
    provisioner: &dyn Provisioner,
    artifacts: &Artifacts,
    prompt: &dyn ConfirmPrompt,
    scope: DestroyScope,
) -> Result<bool> {
    let question = match scope {
        DestroyScope::ComputeOnly => "Destroy all cluster VMs? DNS records are kept.",
        DestroyScope::Everything => "Destroy all cluster VMs and DNS records?",
    };

    if !prompt.confirm(question)? {
        ui::print_info("Nothing was destroyed");
        return Ok(false);
    }

    destroy(provisioner, artifacts, scope).await?;
    Ok(true)
}

/// Destroy infrastructure; a full teardown also removes generated artifacts.
async fn destroy(
    provisioner: &dyn Provisioner,
    artifacts: &Artifacts,
    scope: DestroyScope,
) -> Result<()> {
    ui::print_progress(&format!("Destroying {scope}..."));
    provisioner
        .destroy(scope)
        .await
        .with_context(|| format!("Failed to destroy {scope}"))?;
    ui::print_success(&format!("Destroyed {scope}"));

    if scope == DestroyScope::Everything {
        let removed = artifacts
            .remove_generated()
            .await
            .context("Failed to remove generated artifacts")?;
        info!(removed = removed.len(), "Generated artifacts removed");
        ui::print_success(&format!(
            "Removed generated configs; kept {}",
            artifacts.secrets().display()
        ));
    }
    Ok(())
}

/// Commands to retry from `failed` or tear down later, with labels.
#[must_use]
pub fn recovery_commands(failed: Phase, config_path: &Path) -> Vec<(&'static str, String)> {
    let base = format!("cluster-bootstrap --config {}", config_path.display());
    let flags = failed.resume_flags();
    let retry = if flags.is_empty() {
        base.clone()
    } else {
        format!("{base} {flags}")
    };
    vec![
        ("Retry from the failed step:", retry),
        ("Tear down VMs only:", format!("{base} --destroy-vms")),
        ("Tear down everything:", format!("{base} --destroy-all")),
    ]
}

fn print_recovery(lead: &str, failed: Phase, config_path: &Path) {
    ui::print_info(lead);
    for (label, command) in recovery_commands(failed, config_path) {
        ui::print_info(&format!("{label:<29}{command}"));
    }
}

/// Print how to retry from `failed` or tear down later.
pub fn print_resume_hint(failed: Phase, config_path: &Path) {
    print_recovery("Infrastructure was left in place.", failed, config_path);
}
