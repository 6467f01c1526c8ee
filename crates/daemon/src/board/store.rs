//! Persistent board store.
//!
//! The store owns the in-memory [`Board`] behind a short-lived lock and the
//! on-disk `board.json`. Loads never fail: whatever is on disk, the daemon
//! comes up with a usable board. Writes are debounced (mutation bursts
//! coalesce into one flush) and atomic (tmp file, fsync, rename), so the
//! file on disk is always a complete serialization of some past state.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

use super::types::{AgentStatus, Board, BoardSettings, Priority, Ticket, TicketStatus};

/// Mutation-to-flush coalescing window.
const FLUSH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Board event channel capacity. Board traffic is low-frequency; a
/// subscriber that falls this far behind is dropped rather than fed a
/// gapped stream.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Errors surfaced to clients mutating the board.
#[derive(Debug, Error)]
pub enum BoardError {
    /// No ticket with that id.
    #[error("ticket not found: {0}")]
    TicketNotFound(String),

    /// The ticket's worktree has uncommitted changes; pass `force` to
    /// delete anyway.
    #[error("worktree has uncommitted changes: {0}")]
    UncommittedChanges(String),
}

/// A board mutation, broadcast to subscribed clients in application order.
#[derive(Debug, Clone)]
pub enum BoardEvent {
    TicketCreated(Ticket),
    TicketUpdated(Ticket),
    TicketDeleted {
        id: String,
    },
    /// An agent's derived status changed.
    AgentStatus {
        ticket_id: String,
        status: AgentStatus,
    },
    SettingsUpdated(BoardSettings),
}

/// Fields for creating a ticket.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct NewTicket {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
}

/// Partial ticket update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TicketPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub terminal_session_id: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
}

/// The board store.
pub struct BoardStore {
    path: PathBuf,
    inner: RwLock<Board>,
    dirty: AtomicBool,
    flush_notify: Notify,
    event_tx: broadcast::Sender<BoardEvent>,
}

impl BoardStore {
    /// Open the store, loading `path` if it exists.
    ///
    /// Never fails: a missing file yields a default board; an unparseable
    /// file is moved aside and replaced with a default board.
    pub fn open(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let board = load_board(&path);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Arc::new(Self {
            path,
            inner: RwLock::new(board),
            dirty: AtomicBool::new(false),
            flush_notify: Notify::new(),
            event_tx,
        })
    }

    /// Start the debounced flush task.
    ///
    /// Each burst of mutations results in one write, [`FLUSH_DEBOUNCE`]
    /// after the first mutation of the burst.
    pub fn start_flush_task(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                store.flush_notify.notified().await;
                tokio::time::sleep(FLUSH_DEBOUNCE).await;
                store.flush_now();
            }
        });
    }

    /// Subscribe to board mutations.
    ///
    /// Receivers see mutations in the order the store applied them. A
    /// receiver that lags behind the channel capacity gets a `Lagged`
    /// error; the web layer treats that as fatal for the subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.event_tx.subscribe()
    }

    /// A deep copy of the current board.
    pub fn snapshot(&self) -> Board {
        self.inner.read().expect("board lock poisoned").clone()
    }

    /// Current settings.
    pub fn settings(&self) -> BoardSettings {
        self.inner
            .read()
            .expect("board lock poisoned")
            .settings
            .clone()
    }

    /// Look up one ticket.
    pub fn ticket(&self, id: &str) -> Option<Ticket> {
        self.inner
            .read()
            .expect("board lock poisoned")
            .ticket(id)
            .cloned()
    }

    /// Create a ticket in the backlog.
    pub fn create_ticket(&self, new: NewTicket) -> Ticket {
        let mut ticket = Ticket::new(new.title);
        ticket.description = new.description.unwrap_or_default();
        ticket.labels = new.labels;
        ticket.priority = new.priority;
        ticket.agent_type = new.agent_type;
        ticket.base_branch = new.base_branch;

        {
            let mut board = self.inner.write().expect("board lock poisoned");
            board.tickets.push(ticket.clone());
        }
        info!(ticket_id = %ticket.id, title = %ticket.title, "Created ticket");
        self.committed(BoardEvent::TicketCreated(ticket.clone()));
        ticket
    }

    /// Apply a partial update to a ticket.
    pub fn update_ticket(&self, id: &str, patch: TicketPatch) -> Result<Ticket, BoardError> {
        let updated = {
            let mut board = self.inner.write().expect("board lock poisoned");
            let ticket = board
                .ticket_mut(id)
                .ok_or_else(|| BoardError::TicketNotFound(id.to_string()))?;

            if let Some(title) = patch.title {
                ticket.title = title;
            }
            if let Some(description) = patch.description {
                ticket.description = description;
            }
            if let Some(labels) = patch.labels {
                ticket.labels = labels;
            }
            if let Some(priority) = patch.priority {
                ticket.priority = Some(priority);
            }
            if let Some(agent_type) = patch.agent_type {
                ticket.agent_type = Some(agent_type);
            }
            if let Some(worktree_path) = patch.worktree_path {
                ticket.worktree_path = Some(worktree_path);
            }
            if let Some(branch_name) = patch.branch_name {
                ticket.branch_name = Some(branch_name);
            }
            if let Some(base_branch) = patch.base_branch {
                ticket.base_branch = Some(base_branch);
            }
            if let Some(session_id) = patch.terminal_session_id {
                ticket.terminal_session_id = Some(session_id);
            }
            if let Some(meta) = patch.meta {
                ticket.meta = meta;
            }
            touch(ticket);
            ticket.clone()
        };

        self.committed(BoardEvent::TicketUpdated(updated.clone()));
        Ok(updated)
    }

    /// Move a ticket to a new status.
    ///
    /// The first transition into in-progress stamps `started_at`; the first
    /// into done stamps `completed_at`. Neither is ever overwritten.
    pub fn move_ticket(&self, id: &str, status: TicketStatus) -> Result<Ticket, BoardError> {
        let moved = {
            let mut board = self.inner.write().expect("board lock poisoned");
            let ticket = board
                .ticket_mut(id)
                .ok_or_else(|| BoardError::TicketNotFound(id.to_string()))?;

            ticket.status = status;
            let now = Utc::now();
            if status == TicketStatus::InProgress && ticket.started_at.is_none() {
                ticket.started_at = Some(now);
            }
            if status == TicketStatus::Done && ticket.completed_at.is_none() {
                ticket.completed_at = Some(now);
            }
            touch(ticket);
            ticket.clone()
        };

        debug!(ticket_id = %id, status = ?status, "Moved ticket");
        self.committed(BoardEvent::TicketUpdated(moved.clone()));
        Ok(moved)
    }

    /// Delete a ticket.
    ///
    /// Refused when the ticket's worktree has uncommitted changes, unless
    /// `force` is set.
    pub fn delete_ticket(&self, id: &str, force: bool) -> Result<(), BoardError> {
        let worktree = {
            let board = self.inner.read().expect("board lock poisoned");
            let ticket = board
                .ticket(id)
                .ok_or_else(|| BoardError::TicketNotFound(id.to_string()))?;
            ticket.worktree_path.clone()
        };

        if !force {
            if let Some(ref path) = worktree {
                if worktree_dirty(Path::new(path)) {
                    return Err(BoardError::UncommittedChanges(path.clone()));
                }
            }
        }

        {
            let mut board = self.inner.write().expect("board lock poisoned");
            board.tickets.retain(|t| t.id != id);
        }
        info!(ticket_id = %id, "Deleted ticket");
        self.committed(BoardEvent::TicketDeleted { id: id.to_string() });
        Ok(())
    }

    /// Update the derived agent status of a ticket.
    ///
    /// No-op (and no broadcast) when the status is unchanged.
    pub fn set_agent_status(&self, id: &str, status: AgentStatus) -> Result<(), BoardError> {
        let changed = {
            let mut board = self.inner.write().expect("board lock poisoned");
            let ticket = board
                .ticket_mut(id)
                .ok_or_else(|| BoardError::TicketNotFound(id.to_string()))?;
            if ticket.agent_status == status {
                false
            } else {
                ticket.agent_status = status;
                touch(ticket);
                true
            }
        };

        if changed {
            self.committed(BoardEvent::AgentStatus {
                ticket_id: id.to_string(),
                status,
            });
        }
        Ok(())
    }

    /// Tickets that reference a live terminal session.
    pub fn tickets_with_sessions(&self) -> Vec<(String, String, AgentStatus)> {
        self.inner
            .read()
            .expect("board lock poisoned")
            .tickets
            .iter()
            .filter_map(|t| {
                t.terminal_session_id
                    .as_ref()
                    .map(|sid| (t.id.clone(), sid.clone(), t.agent_status))
            })
            .collect()
    }

    /// Replace the board settings.
    pub fn update_settings(&self, settings: BoardSettings) -> BoardSettings {
        {
            let mut board = self.inner.write().expect("board lock poisoned");
            board.settings = settings.clone();
        }
        self.committed(BoardEvent::SettingsUpdated(settings.clone()));
        settings
    }

    /// Flush the board to disk immediately if there are unflushed changes.
    ///
    /// On failure the in-memory state is kept, the dirty flag restored, and
    /// the write retried after the next mutation.
    pub fn flush_now(&self) {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }

        let json = {
            let board = self.inner.read().expect("board lock poisoned");
            match serde_json::to_string_pretty(&*board) {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "Board serialization failed");
                    self.dirty.store(true, Ordering::SeqCst);
                    return;
                }
            }
        };

        if let Err(e) = write_atomic(&self.path, json.as_bytes()) {
            warn!(path = %self.path.display(), error = %e, "Board flush failed, will retry");
            self.dirty.store(true, Ordering::SeqCst);
        } else {
            debug!(path = %self.path.display(), "Flushed board");
        }
    }

    /// Record a completed mutation: broadcast it and schedule a flush.
    fn committed(&self, event: BoardEvent) {
        let _ = self.event_tx.send(event);
        self.dirty.store(true, Ordering::SeqCst);
        self.flush_notify.notify_one();
    }
}

/// Bump `updated_at`, keeping it monotonic even under clock slew.
fn touch(ticket: &mut Ticket) {
    let now = Utc::now();
    ticket.updated_at = now.max(ticket.updated_at);
}

fn load_board(path: &Path) -> Board {
    if !path.exists() {
        debug!(path = %path.display(), "No board file, starting with defaults");
        return Board::default();
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Board file unreadable, starting with defaults");
            return Board::default();
        }
    };

    match serde_json::from_str::<Board>(&contents) {
        Ok(board) => {
            info!(path = %path.display(), tickets = board.tickets.len(), "Loaded board");
            board
        }
        Err(e) => {
            // Keep the bytes around rather than overwriting user data with
            // an empty board on the next flush.
            let aside = path.with_extension("json.corrupt");
            let _ = std::fs::rename(path, &aside);
            warn!(
                path = %path.display(),
                moved_to = %aside.display(),
                error = %e,
                "Board file unparseable, starting with defaults"
            );
            Board::default()
        }
    }
}

/// Write `data` to `path` atomically: tmp file, fsync, rename.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

/// Whether a git worktree has uncommitted changes.
///
/// Errors (missing git, missing directory, not a repo) count as clean; the
/// check exists to protect work in progress, not to gate on git health.
fn worktree_dirty(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    match Command::new("git")
        .args(["status", "--porcelain"])
        .current_dir(path)
        .output()
    {
        Ok(output) => output.status.success() && !output.stdout.is_empty(),
        Err(_) => false,
    }
}
