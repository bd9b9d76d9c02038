//! Configuration commands.
//!
//! Configuration comes from an optional file plus `KVQ__*` environment
//! variables (e.g. `KVQ__QUEUE__QUEUES=mail,reports`).

use anyhow::Result;
use clap::Subcommand;
use kvq_core::config::Config;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Validate the configuration and summarize it
    Check,
}

pub fn execute(cmd: ConfigCommands, config: &Config, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => match format {
            // YAML reads best for nested settings.
            OutputFormat::Table => output::print_item(config, OutputFormat::Yaml)?,
            _ => output::print_item(config, format)?,
        },

        ConfigCommands::Check => {
            config.validate()?;
            match format {
                OutputFormat::Table => {
                    output::print_success("Configuration is valid");
                    output::print_detail("Backend", &format!("{:?}", config.store.backend));
                    output::print_detail("Namespace", &config.queue.namespace);
                    output::print_detail("Queues", &config.queue.effective_queues().join(", "));
                    output::print_detail(
                        "Max run time",
                        &format!("{}s", config.queue.max_run_time.as_secs()),
                    );
                }
                _ => output::print_item(&serde_json::json!({ "valid": true }), format)?,
            }
        }
    }

    Ok(())
}
