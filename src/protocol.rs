//! Newline-delimited JSON control protocol between `kilnctl` and `kilnd`.

use crate::controller::{ControlCommand, Message, StatusBoard};
use crate::error::{ProfileError, ProtocolError};
use crate::profile::{FiringProfile, ProfileRecord, ProfileStore};
use crate::state::{Lifecycle, OvenStatus};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::Sender;
use std::sync::{Mutex, PoisonError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::{info, warn};

pub const MAX_COMMAND_SIZE: usize = 64 * 1024;
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    pub command_type: CommandType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandType {
    Run {
        profile: String,
        #[serde(default)]
        start_at_minutes: f64,
    },
    Pause,
    Resume,
    Stop,
    Status,
    ListProfiles,
    SaveProfile {
        profile: ProfileRecord,
        #[serde(default)]
        force: bool,
    },
    DeleteProfile {
        name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    Error,
    InvalidCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oven: Option<OvenStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<ProfileRecord>>,
}

impl CommandResponse {
    pub fn new(id: u32, status: ResponseStatus, message: Option<String>) -> Self {
        Self {
            id,
            status,
            message,
            oven: None,
            profiles: None,
        }
    }

    pub fn success(id: u32, message: impl Into<String>) -> Self {
        Self::new(id, ResponseStatus::Success, Some(message.into()))
    }

    pub fn error(id: u32, message: impl Into<String>) -> Self {
        Self::new(id, ResponseStatus::Error, Some(message.into()))
    }

    pub fn invalid(id: u32, message: impl Into<String>) -> Self {
        Self::new(id, ResponseStatus::InvalidCommand, Some(message.into()))
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[derive(Debug, Default)]
pub struct ProtocolHandler {
    command_counter: u32,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_command(&self, json_str: &str) -> Result<Command, ProtocolError> {
        if json_str.len() > MAX_COMMAND_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        serde_json::from_str::<Command>(json_str).map_err(|_| ProtocolError::InvalidJson)
    }

    pub fn parse_response(&self, json_str: &str) -> Result<CommandResponse, ProtocolError> {
        if json_str.len() > MAX_RESPONSE_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        serde_json::from_str::<CommandResponse>(json_str).map_err(|_| ProtocolError::InvalidJson)
    }

    pub fn serialize_command(&self, command: &Command) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(command).map_err(|_| ProtocolError::Serialization)?;
        if json.len() > MAX_COMMAND_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        Ok(json)
    }

    pub fn serialize_response(&self, response: &CommandResponse) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(response).map_err(|_| ProtocolError::Serialization)?;
        if json.len() > MAX_RESPONSE_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        Ok(json)
    }

    pub fn next_command_id(&mut self) -> u32 {
        self.command_counter = self.command_counter.wrapping_add(1);
        self.command_counter
    }
}

/// Read one line into `line` without buffering more than `limit` bytes of
/// content. Returns the bytes consumed, 0 at end of stream.
pub async fn read_bounded_line<R>(
    reader: &mut R,
    line: &mut String,
    limit: usize,
) -> Result<usize, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let read = (&mut *reader).take(limit as u64 + 1).read_line(line).await?;
    if line.trim_end_matches(['\r', '\n']).len() > limit {
        return Err(ProtocolError::MessageTooLarge);
    }
    Ok(read)
}

/// Executes protocol commands against the profile store and the controller
/// channel. Never touches oven state directly.
pub struct CommandDispatcher {
    store: ProfileStore,
    tx: Mutex<Sender<Message>>,
    status: StatusBoard,
}

impl CommandDispatcher {
    pub fn new(store: ProfileStore, tx: Sender<Message>, status: StatusBoard) -> Self {
        Self {
            store,
            tx: Mutex::new(tx),
            status,
        }
    }

    pub fn status(&self) -> OvenStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn send(&self, command: ControlCommand) -> Result<(), String> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(Message::Command(command))
            .map_err(|_| "controller is not running".to_string())
    }

    fn forward(&self, id: u32, command: ControlCommand, done: &str) -> CommandResponse {
        match self.send(command) {
            Ok(()) => CommandResponse::success(id, done),
            Err(e) => CommandResponse::error(id, e),
        }
    }

    pub fn dispatch(&self, command: Command) -> CommandResponse {
        let id = command.id;
        match command.command_type {
            CommandType::Run {
                profile,
                start_at_minutes,
            } => self.run(id, &profile, start_at_minutes),
            CommandType::Pause => self.expect_state(id, Lifecycle::Running, "pause").unwrap_or_else(
                || self.forward(id, ControlCommand::Pause, "pause requested"),
            ),
            CommandType::Resume => self.expect_state(id, Lifecycle::Paused, "resume").unwrap_or_else(
                || self.forward(id, ControlCommand::Resume, "resume requested"),
            ),
            CommandType::Stop => self.forward(id, ControlCommand::Stop, "stop requested"),
            CommandType::Status => {
                let mut response = CommandResponse::new(id, ResponseStatus::Success, None);
                response.oven = Some(self.status());
                response
            }
            CommandType::ListProfiles => match self.store.list() {
                Ok(profiles) => {
                    let mut response = CommandResponse::new(id, ResponseStatus::Success, None);
                    response.profiles = Some(profiles);
                    response
                }
                Err(e) => CommandResponse::error(id, e.to_string()),
            },
            CommandType::SaveProfile { profile, force } => {
                let name = profile.name.clone();
                match self.store.save(profile, force) {
                    Ok(_) => CommandResponse::success(id, format!("saved {name}")),
                    Err(e @ (ProfileError::AlreadyExists(_) | ProfileError::InvalidName(_))) => {
                        CommandResponse::invalid(id, e.to_string())
                    }
                    Err(e) => CommandResponse::error(id, e.to_string()),
                }
            }
            CommandType::DeleteProfile { name } => match self.store.delete(&name) {
                Ok(()) => CommandResponse::success(id, format!("deleted {name}")),
                Err(e @ (ProfileError::NotFound(_) | ProfileError::InvalidName(_))) => {
                    CommandResponse::invalid(id, e.to_string())
                }
                Err(e) => CommandResponse::error(id, e.to_string()),
            },
        }
    }

    fn expect_state(&self, id: u32, wanted: Lifecycle, action: &str) -> Option<CommandResponse> {
        let current = self.status().state;
        (current != wanted).then(|| CommandResponse::invalid(id, format!("cannot {action}, oven is {current}")))
    }

    fn run(&self, id: u32, name: &str, start_at_minutes: f64) -> CommandResponse {
        if let Some(rejected) = self.expect_state(id, Lifecycle::Idle, "run") {
            return rejected;
        }
        if !start_at_minutes.is_finite() || start_at_minutes < 0.0 {
            return CommandResponse::invalid(id, "start_at_minutes must be a non-negative number");
        }
        let profile: FiringProfile = match self.store.load(name) {
            Ok(profile) => profile,
            Err(e @ (ProfileError::NotFound(_) | ProfileError::InvalidName(_))) => {
                return CommandResponse::invalid(id, e.to_string())
            }
            Err(e) => {
                warn!("cannot load profile {}: {}", name, e);
                return CommandResponse::error(id, e.to_string());
            }
        };
        if start_at_minutes * 60.0 > profile.duration() {
            return CommandResponse::invalid(
                id,
                format!(
                    "start_at_minutes {} is past the end of {} ({:.0} minutes)",
                    start_at_minutes,
                    profile.name(),
                    profile.duration() / 60.0
                ),
            );
        }
        info!("run requested: {} at {} minutes", profile.name(), start_at_minutes);
        self.forward(
            id,
            ControlCommand::Run {
                profile,
                start_at_minutes,
            },
            &format!("running {name}"),
        )
    }
}
