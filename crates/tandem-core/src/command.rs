use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::event::KernelEvent;
use crate::routing::CommandRoutingSlip;
use crate::token::CommandToken;

/// The command payloads kernels understand, as a closed sum. Dispatch is a
/// table lookup on [`CommandKind`], never a runtime type test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "commandType")]
pub enum KernelCommandBody {
    SubmitCode { code: String },
    RequestKernelInfo,
    RequestValue { name: String },
    SendValue { name: String, value: String },
    Cancel,
}

impl KernelCommandBody {
    pub fn kind(&self) -> CommandKind {
        match self {
            KernelCommandBody::SubmitCode { .. } => CommandKind::SubmitCode,
            KernelCommandBody::RequestKernelInfo => CommandKind::RequestKernelInfo,
            KernelCommandBody::RequestValue { .. } => CommandKind::RequestValue,
            KernelCommandBody::SendValue { .. } => CommandKind::SendValue,
            KernelCommandBody::Cancel => CommandKind::Cancel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    SubmitCode,
    RequestKernelInfo,
    RequestValue,
    SendValue,
    Cancel,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::SubmitCode => "SubmitCode",
            CommandKind::RequestKernelInfo => "RequestKernelInfo",
            CommandKind::RequestValue => "RequestValue",
            CommandKind::SendValue => "SendValue",
            CommandKind::Cancel => "Cancel",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command addressed at some kernel in the tree. Clones share the routing
/// slip, so every holder of the command observes the same path.
#[derive(Debug, Clone)]
pub struct KernelCommand {
    id: String,
    token: CommandToken,
    parent_token: Option<CommandToken>,
    target_kernel_name: Option<String>,
    destination: Option<Url>,
    body: KernelCommandBody,
    routing_slip: CommandRoutingSlip,
}

impl KernelCommand {
    /// A fresh root command with its own token lineage.
    pub fn new(body: KernelCommandBody) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            token: CommandToken::new_root(),
            parent_token: None,
            target_kernel_name: None,
            destination: None,
            body,
            routing_slip: CommandRoutingSlip::new(),
        }
    }

    /// The `index`-th child of `parent`, token derived by hash chaining.
    pub fn child_of(parent: &KernelCommand, index: u64, body: KernelCommandBody) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            token: parent.token.child(index),
            parent_token: Some(parent.token.clone()),
            target_kernel_name: None,
            destination: None,
            body,
            routing_slip: CommandRoutingSlip::new(),
        }
    }

    /// Reassembles a command that crossed a process boundary.
    pub fn from_parts(
        id: String,
        token: CommandToken,
        parent_token: Option<CommandToken>,
        target_kernel_name: Option<String>,
        destination: Option<Url>,
        body: KernelCommandBody,
        routing_slip: CommandRoutingSlip,
    ) -> Self {
        Self {
            id,
            token,
            parent_token,
            target_kernel_name,
            destination,
            body,
            routing_slip,
        }
    }

    pub fn with_target(mut self, kernel_name: impl Into<String>) -> Self {
        self.target_kernel_name = Some(kernel_name.into());
        self
    }

    pub fn with_destination(mut self, destination: Url) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &CommandToken {
        &self.token
    }

    pub fn parent_token(&self) -> Option<&CommandToken> {
        self.parent_token.as_ref()
    }

    pub fn target_kernel_name(&self) -> Option<&str> {
        self.target_kernel_name.as_deref()
    }

    pub fn destination(&self) -> Option<&Url> {
        self.destination.as_ref()
    }

    pub fn body(&self) -> &KernelCommandBody {
        &self.body
    }

    pub fn kind(&self) -> CommandKind {
        self.body.kind()
    }

    pub fn routing_slip(&self) -> &CommandRoutingSlip {
        &self.routing_slip
    }

    pub fn is_root(&self) -> bool {
        self.parent_token.is_none()
    }
}

/// Terminal state of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded,
    Failed { message: String },
    Cancelled,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded)
    }
}

/// What a caller gets back for a root command: the terminal outcome plus the
/// events observed on the command's stream, in publication order.
#[derive(Debug, Clone)]
pub struct KernelCommandResult {
    outcome: CommandOutcome,
    events: Vec<KernelEvent>,
}

impl KernelCommandResult {
    pub fn new(outcome: CommandOutcome, events: Vec<KernelEvent>) -> Self {
        Self { outcome, events }
    }

    pub fn cancelled() -> Self {
        Self {
            outcome: CommandOutcome::Cancelled,
            events: Vec::new(),
        }
    }

    pub fn outcome(&self) -> &CommandOutcome {
        &self.outcome
    }

    pub fn events(&self) -> &[KernelEvent] {
        &self.events
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}
