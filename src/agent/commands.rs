//! Persona control commands. These run synchronously during a scan and
//! never touch the inference server.

use chrono::{DateTime, Utc};
use log::{info, warn};

use super::chunk::split_config_chunks;
use super::pipeline::ControlCommand;
use crate::metrics;
use crate::persona::Persona;
use crate::storage::StoreError;

/// Apply `command` to `persona`, persist its runtime block and return the
/// reply texts (more than one only for `config`).
///
/// `inference_line` is the cached inference status used by `status`;
/// `default_limit` applies when the persona sets no message limit.
pub fn run_control(
    persona: &mut Persona,
    command: ControlCommand,
    trigger: &str,
    inference_line: &str,
    default_limit: usize,
    now: DateTime<Utc>,
) -> Result<Vec<String>, StoreError> {
    persona.refresh_today(now);
    persona.increment_control();

    let replies = match command {
        ControlCommand::Start => {
            persona.mark_started(now);
            vec![format!("{} is now running.", persona.name)]
        }
        ControlCommand::Stop => {
            persona.mark_stopped();
            vec![format!("{} is now stopped.", persona.name)]
        }
        ControlCommand::Status => {
            vec![format!("{}\n{}", persona.status_summary(now), inference_line)]
        }
        ControlCommand::Config => {
            let limit = if persona.max_message_chars > 0 {
                persona.max_message_chars
            } else {
                default_limit
            };
            let text = persona.read_config_text()?;
            split_config_chunks(&persona.name, text.trim(), limit)
        }
        ControlCommand::Help => vec![help_text(&persona.name, trigger)],
    };

    persona.write_runtime()?;
    metrics::inc_control_replies();
    info!("Control command '{}' for persona {}", command, persona.name);
    if replies.is_empty() {
        warn!("Control command '{}' produced no reply", command);
    }
    Ok(replies)
}

pub fn help_text(name: &str, trigger: &str) -> String {
    let commands: Vec<&str> = ControlCommand::ALL.iter().map(|c| c.as_str()).collect();
    format!(
        "{} help: send '{} <question>' to ask; commands: {}",
        name,
        trigger,
        commands.join(", ")
    )
}
