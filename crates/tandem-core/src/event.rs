use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::KernelCommand;
use crate::kernel::KernelInfo;
use crate::routing::EventRoutingSlip;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum KernelEventBody {
    CommandSucceeded,
    CommandFailed { message: String },
    CodeSubmissionReceived { code: String },
    ValueProduced { name: String, value: String },
    KernelInfoProduced { kernel_info: KernelInfo },
    DisplayedValueProduced { value: String },
}

impl KernelEventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            KernelEventBody::CommandSucceeded => EventKind::CommandSucceeded,
            KernelEventBody::CommandFailed { .. } => EventKind::CommandFailed,
            KernelEventBody::CodeSubmissionReceived { .. } => EventKind::CodeSubmissionReceived,
            KernelEventBody::ValueProduced { .. } => EventKind::ValueProduced,
            KernelEventBody::KernelInfoProduced { .. } => EventKind::KernelInfoProduced,
            KernelEventBody::DisplayedValueProduced { .. } => EventKind::DisplayedValueProduced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    CommandSucceeded,
    CommandFailed,
    CodeSubmissionReceived,
    ValueProduced,
    KernelInfoProduced,
    DisplayedValueProduced,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CommandSucceeded => "CommandSucceeded",
            EventKind::CommandFailed => "CommandFailed",
            EventKind::CodeSubmissionReceived => "CodeSubmissionReceived",
            EventKind::ValueProduced => "ValueProduced",
            EventKind::KernelInfoProduced => "KernelInfoProduced",
            EventKind::DisplayedValueProduced => "DisplayedValueProduced",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventKind::CommandSucceeded | EventKind::CommandFailed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event about a command. The routing slip is seeded from the path the
/// command has travelled, so an event published at the far end of a
/// forwarding chain records every hop in order.
#[derive(Debug, Clone)]
pub struct KernelEvent {
    id: String,
    body: KernelEventBody,
    command: KernelCommand,
    routing_slip: EventRoutingSlip,
}

impl KernelEvent {
    pub fn new(body: KernelEventBody, command: KernelCommand) -> Self {
        let routing_slip = EventRoutingSlip::seeded_from(command.routing_slip());
        Self {
            id: Uuid::new_v4().simple().to_string(),
            body,
            command,
            routing_slip,
        }
    }

    /// Reassembles an event that crossed a process boundary, slip included.
    pub fn from_parts(
        id: String,
        body: KernelEventBody,
        command: KernelCommand,
        routing_slip: EventRoutingSlip,
    ) -> Self {
        Self {
            id,
            body,
            command,
            routing_slip,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &KernelEventBody {
        &self.body
    }

    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    pub fn command(&self) -> &KernelCommand {
        &self.command
    }

    pub fn routing_slip(&self) -> &EventRoutingSlip {
        &self.routing_slip
    }
}
