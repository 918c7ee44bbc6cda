//! Chat command processing
//!
//! Turns `!volume <percent>` chat lines into control calls and queues a reply
//! once the call succeeds. Control failures and bad arguments are reported
//! to the operator log only; chat never hears about them.

use crate::config::CommandConfig;
use crate::message::ParsedEvent;
use crate::queue::{ActionQueue, OutboundMessage};
use crate::utils::format_chat_line;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Remote control API driven by chat commands
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// Set the level of a named resource; `level` is in `[0, 1]`
    async fn set_level(&self, resource: &str, level: f64) -> Result<()>;
}

/// A recognized control command
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelCommand {
    /// Requested percentage, 0 to 100
    pub percent: u8,
}

impl LevelCommand {
    /// Percentage as a fraction in `[0, 1]`
    pub fn level(&self) -> f64 {
        f64::from(self.percent) / 100.0
    }
}

/// Why a command was not recognized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRejection {
    /// First word is not the trigger
    NotACommand,
    /// Trigger present but the argument is missing, not a number or out of range
    InvalidArgument(String),
}

/// What happened to an inbound event
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Sent by a filtered system account
    IgnoredSender,
    /// Ordinary chat
    NotACommand,
    /// Command with an unusable argument
    InvalidArgument,
    /// Control call succeeded and a reply was queued
    Applied { level: f64 },
    /// Control call failed
    ControlFailed,
}

/// Recognizes control commands and applies them
pub struct CommandProcessor {
    trigger: String,
    resource: String,
    ignored_senders: HashSet<String>,
    control: Arc<dyn ControlApi>,
    outbound: Arc<ActionQueue<OutboundMessage>>,
}

impl CommandProcessor {
    /// Create a processor controlling `resource`, replying through `outbound`
    pub fn new(
        config: &CommandConfig,
        resource: &str,
        control: Arc<dyn ControlApi>,
        outbound: Arc<ActionQueue<OutboundMessage>>,
    ) -> Self {
        Self {
            trigger: config.trigger.to_lowercase(),
            resource: resource.to_string(),
            ignored_senders: config.ignored_senders.iter().map(|s| s.to_lowercase()).collect(),
            control,
            outbound,
        }
    }

    /// Parse message text into a command
    pub fn parse_command(&self, text: &str) -> std::result::Result<LevelCommand, CommandRejection> {
        let mut words = text.split_whitespace();
        match words.next() {
            Some(word) if word.to_lowercase() == self.trigger => {}
            _ => return Err(CommandRejection::NotACommand),
        }

        let Some(argument) = words.next() else {
            return Err(CommandRejection::InvalidArgument("missing level".to_string()));
        };

        let digits = argument.strip_suffix('%').unwrap_or(argument);
        match digits.parse::<u8>() {
            Ok(percent) if percent <= 100 => Ok(LevelCommand { percent }),
            _ => Err(CommandRejection::InvalidArgument(argument.to_string())),
        }
    }

    /// Process an event in the background
    pub fn dispatch(self: &Arc<Self>, event: ParsedEvent) {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            processor.process(event).await;
        });
    }

    /// Process one inbound chat event
    pub async fn process(&self, event: ParsedEvent) -> ProcessOutcome {
        let nick = event.nick.clone().unwrap_or_default();
        if self.ignored_senders.contains(&nick.to_lowercase()) {
            debug!("Ignoring message from system sender {}", nick);
            return ProcessOutcome::IgnoredSender;
        }

        info!("{}", format_chat_line(&event));

        let text = event.message.as_deref().unwrap_or("");
        let command = match self.parse_command(text) {
            Ok(command) => command,
            Err(CommandRejection::NotACommand) => return ProcessOutcome::NotACommand,
            Err(CommandRejection::InvalidArgument(argument)) => {
                warn!("{} sent {} with an invalid level: {}", nick, self.trigger, argument);
                return ProcessOutcome::InvalidArgument;
            }
        };

        let level = command.level();
        match self.control.set_level(&self.resource, level).await {
            Ok(()) => {
                info!("{} successfully changed the volume to {}", nick, level);

                let Some(channel) = event.target.as_deref() else {
                    return ProcessOutcome::Applied { level };
                };
                let reply = OutboundMessage::new(
                    channel,
                    &format!("@{} -> Successfully changed the volume to {}", nick, command.percent),
                )
                .in_reply_to(event.tag("id"));
                self.outbound.push(reply);

                ProcessOutcome::Applied { level }
            }
            Err(e) => {
                error!("Error changing the volume: {}", e);
                ProcessOutcome::ControlFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::Error;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingControl {
        calls: Mutex<Vec<(String, f64)>>,
        fail: bool,
    }

    #[async_trait]
    impl ControlApi for RecordingControl {
        async fn set_level(&self, resource: &str, level: f64) -> Result<()> {
            self.calls.lock().push((resource.to_string(), level));
            if self.fail {
                Err(Error::Control("source not found".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn processor(
        control: Arc<RecordingControl>,
    ) -> (CommandProcessor, Arc<ActionQueue<OutboundMessage>>) {
        let outbound = Arc::new(ActionQueue::new("outbound", 16));
        let processor =
            CommandProcessor::new(&CommandConfig::default(), "Music", control, outbound.clone());
        (processor, outbound)
    }

    fn event(nick: &str, text: &str) -> ParsedEvent {
        let raw = format!(
            "@id=msg-7;display-name={} :{}!{}@host PRIVMSG #room :{}",
            nick, nick, nick, text
        );
        ParsedEvent::from_message(Message::parse(&raw).unwrap(), &raw)
    }

    #[tokio::test]
    async fn test_volume_command_applied() {
        let control = Arc::new(RecordingControl::default());
        let (processor, outbound) = processor(control.clone());

        let outcome = processor.process(event("alice", "!volume 75")).await;
        assert_eq!(outcome, ProcessOutcome::Applied { level: 0.75 });
        assert_eq!(control.calls.lock().clone(), vec![("Music".to_string(), 0.75)]);

        let reply = outbound.pop().unwrap();
        assert_eq!(reply.channel, "#room");
        assert_eq!(reply.text, "@alice -> Successfully changed the volume to 75");
        assert_eq!(reply.reply_to.as_deref(), Some("msg-7"));
    }

    #[tokio::test]
    async fn test_other_commands_ignored() {
        let control = Arc::new(RecordingControl::default());
        let (processor, outbound) = processor(control.clone());

        assert_eq!(processor.process(event("alice", "!hello")).await, ProcessOutcome::NotACommand);
        assert_eq!(
            processor.process(event("alice", "volume 50")).await,
            ProcessOutcome::NotACommand
        );
        assert!(control.calls.lock().is_empty());
        assert!(outbound.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_is_case_insensitive() {
        let control = Arc::new(RecordingControl::default());
        let (processor, _) = processor(control.clone());

        let outcome = processor.process(event("alice", "!VOLUME 10%")).await;
        assert_eq!(outcome, ProcessOutcome::Applied { level: 0.1 });
    }

    #[tokio::test]
    async fn test_system_senders_filtered() {
        let control = Arc::new(RecordingControl::default());
        let (processor, _) = processor(control.clone());

        assert_eq!(
            processor.process(event("jtv", "!volume 75")).await,
            ProcessOutcome::IgnoredSender
        );
        assert_eq!(
            processor.process(event("twitchnotify", "!volume 75")).await,
            ProcessOutcome::IgnoredSender
        );
        assert!(control.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_levels_not_applied() {
        let control = Arc::new(RecordingControl::default());
        let (processor, outbound) = processor(control.clone());

        for text in ["!volume", "!volume loud", "!volume 101", "!volume -5", "!volume 7.5"] {
            assert_eq!(
                processor.process(event("alice", text)).await,
                ProcessOutcome::InvalidArgument,
                "{}",
                text
            );
        }
        assert!(control.calls.lock().is_empty());
        assert!(outbound.is_empty());
    }

    #[tokio::test]
    async fn test_control_failure_not_reported_to_chat() {
        let control = Arc::new(RecordingControl {
            calls: Mutex::new(Vec::new()),
            fail: true,
        });
        let (processor, outbound) = processor(control.clone());

        assert_eq!(
            processor.process(event("alice", "!volume 20")).await,
            ProcessOutcome::ControlFailed
        );
        assert_eq!(control.calls.lock().len(), 1);
        assert!(outbound.is_empty());
    }

    #[test]
    fn test_parse_command_bounds() {
        let control = Arc::new(RecordingControl::default());
        let (processor, _) = processor(control);

        assert_eq!(processor.parse_command("!volume 0").unwrap().level(), 0.0);
        assert_eq!(processor.parse_command("!volume 100 please").unwrap().level(), 1.0);
        assert_eq!(processor.parse_command("hi there"), Err(CommandRejection::NotACommand));
        assert_eq!(processor.parse_command(""), Err(CommandRejection::NotACommand));
    }
}
