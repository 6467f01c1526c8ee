//! Board data model.
//!
//! Serde defaults are deliberately pervasive: a board file written by an
//! older or newer daemon must always load. Unknown fields are collected in
//! flattened maps and written back untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a ticket sits on the board. Status is the only field that
/// determines column membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// Not started.
    #[default]
    Backlog,
    /// An agent (or a human) is on it.
    InProgress,
    /// Finished.
    Done,
    /// Out of sight, kept for history.
    Archived,
}

/// What the ticket's agent is currently doing, derived from status hint
/// files the agent writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// No agent, or nothing known about it.
    #[default]
    None,
    /// Agent session exists but is idle.
    Idle,
    /// Agent is actively working.
    Working,
    /// Agent is blocked waiting for input or permission.
    Waiting,
    /// Agent reports the task complete.
    Completed,
    /// Agent reports an error.
    Error,
}

/// Ticket priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

/// A unit of work on the board.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Ticket {
    /// Stable id, assigned at creation.
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub agent_status: AgentStatus,

    /// Git worktree the agent runs in, if one was provisioned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    /// Which agent family runs this ticket (claude, opencode, aider, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    /// Daemon session id of the agent's terminal, when one is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_session_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set on the first move to in-progress, never overwritten.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set on the first move to done, never overwritten.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    /// Free-form metadata attached by clients.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,

    /// Fields this daemon version does not know about, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Ticket {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: String::new(),
            description: String::new(),
            status: TicketStatus::Backlog,
            agent_status: AgentStatus::None,
            worktree_path: None,
            branch_name: None,
            base_branch: None,
            agent_type: None,
            terminal_session_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            labels: Vec::new(),
            priority: None,
            meta: serde_json::Map::new(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Ticket {
    /// New backlog ticket with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// One board column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub id: String,
    pub name: String,
    /// Machine key; matches a [`TicketStatus`] serialization.
    pub key: String,
}

impl Column {
    fn new(key: &str, name: &str) -> Self {
        Self {
            id: key.to_string(),
            name: name.to_string(),
            key: key.to_string(),
        }
    }
}

/// Board-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardSettings {
    /// Agent command spawned for new tickets.
    pub default_agent: String,
    /// Directory (relative to the repo) where worktrees are created.
    pub worktree_base: String,
    /// Branch new ticket branches fork from.
    pub base_branch: String,
    /// Spawn an agent automatically when a ticket moves to in-progress.
    pub autospawn: bool,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            default_agent: "claude".to_string(),
            worktree_base: ".worktrees".to_string(),
            base_branch: "main".to_string(),
            autospawn: false,
        }
    }
}

/// The whole board: columns, tickets, settings.
///
/// Tickets keep insertion order; ordering within a column is the order the
/// tickets entered the board.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Board {
    pub id: String,
    pub columns: Vec<Column>,
    pub tickets: Vec<Ticket>,
    pub settings: BoardSettings,

    /// Unknown fields, preserved across load/save.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Board {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            columns: vec![
                Column::new("backlog", "Backlog"),
                Column::new("in_progress", "In Progress"),
                Column::new("done", "Done"),
            ],
            tickets: Vec::new(),
            settings: BoardSettings::default(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Board {
    /// Find a ticket by id.
    pub fn ticket(&self, id: &str) -> Option<&Ticket> {
        self.tickets.iter().find(|t| t.id == id)
    }

    /// Find a ticket by id, mutably.
    pub fn ticket_mut(&mut self, id: &str) -> Option<&mut Ticket> {
        self.tickets.iter_mut().find(|t| t.id == id)
    }

    /// Tickets in a given status, in insertion order.
    pub fn tickets_with_status(&self, status: TicketStatus) -> Vec<&Ticket> {
        self.tickets.iter().filter(|t| t.status == status).collect()
    }
}
