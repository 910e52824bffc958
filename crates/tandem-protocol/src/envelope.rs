use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use tandem_core::routing::RoutingSlipEntry;
use tandem_core::{
    CommandRoutingSlip, CommandToken, EventRoutingSlip, KernelCommand, KernelCommandBody,
    KernelEvent, KernelEventBody, RoutingSlipError,
};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("envelope is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid routing locator '{0}'")]
    InvalidLocator(String),
    #[error(transparent)]
    RoutingSlip(#[from] RoutingSlipError),
}

/// Wire form of a command: the fields the scheduling/routing core needs,
/// with the body variant flattened in under its `commandType` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub id: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_kernel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Url>,
    #[serde(default)]
    pub routing_slip: Vec<String>,
    #[serde(flatten)]
    pub body: KernelCommandBody,
}

impl CommandPayload {
    pub fn from_command(command: &KernelCommand) -> Self {
        Self {
            id: command.id().to_string(),
            token: command.token().to_string(),
            parent_token: command.parent_token().map(|token| token.to_string()),
            target_kernel_name: command.target_kernel_name().map(str::to_string),
            destination: command.destination().cloned(),
            routing_slip: command.routing_slip().to_wire_array(),
            body: command.body().clone(),
        }
    }

    pub fn into_command(self) -> Result<KernelCommand, ProtocolError> {
        let routing_slip = parse_command_slip(&self.routing_slip)?;
        Ok(KernelCommand::from_parts(
            self.id,
            CommandToken::from_string(self.token),
            self.parent_token.map(CommandToken::from_string),
            self.target_kernel_name,
            self.destination,
            self.body,
            routing_slip,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub command_type: String,
    pub command: CommandPayload,
    pub id: String,
}

impl CommandEnvelope {
    pub fn from_command(command: &KernelCommand) -> Self {
        let payload = CommandPayload::from_command(command);
        Self {
            command_type: command.kind().as_str().to_string(),
            id: payload.id.clone(),
            command: payload,
        }
    }

    pub fn into_command(self) -> Result<KernelCommand, ProtocolError> {
        self.command.into_command()
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub id: String,
    #[serde(default)]
    pub routing_slip: Vec<String>,
    #[serde(flatten)]
    pub body: KernelEventBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_type: String,
    pub event: EventPayload,
    pub command: CommandPayload,
    pub id: String,
}

impl EventEnvelope {
    pub fn from_event(event: &KernelEvent) -> Self {
        Self {
            event_type: event.kind().as_str().to_string(),
            event: EventPayload {
                id: event.id().to_string(),
                routing_slip: event.routing_slip().to_wire_array(),
                body: event.body().clone(),
            },
            command: CommandPayload::from_command(event.command()),
            id: event.id().to_string(),
        }
    }

    pub fn into_event(self) -> Result<KernelEvent, ProtocolError> {
        let command = self.command.into_command()?;
        let routing_slip = parse_event_slip(&self.event.routing_slip)?;
        Ok(KernelEvent::from_parts(
            self.event.id,
            self.event.body,
            command,
            routing_slip,
        ))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Either kind of envelope, for transports that carry both directions on one
/// channel. The variants are distinguished by their `commandType` /
/// `eventType` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    Event(EventEnvelope),
    Command(CommandEnvelope),
}

impl Envelope {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}

fn parse_command_slip(raw: &[String]) -> Result<CommandRoutingSlip, ProtocolError> {
    Ok(CommandRoutingSlip::from_entries(parse_entries(raw)?)?)
}

fn parse_event_slip(raw: &[String]) -> Result<EventRoutingSlip, ProtocolError> {
    Ok(EventRoutingSlip::from_entries(parse_entries(raw)?)?)
}

fn parse_entries(raw: &[String]) -> Result<Vec<RoutingSlipEntry>, ProtocolError> {
    raw.iter()
        .map(|locator| {
            RoutingSlipEntry::from_wire_string(locator)
                .map_err(|_| ProtocolError::InvalidLocator(locator.clone()))
        })
        .collect()
}
