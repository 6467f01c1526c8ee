//! Agent status hints.
//!
//! Agents (via hooks or wrappers) write a single word into
//! `~/.cache/openkanban-status/<session_id>.status`. The daemon polls that
//! directory and folds the hints into the board's `agent_status` fields,
//! broadcasting changes to board subscribers. The strings are convention,
//! not contract: anything unrecognized maps to `none`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::board::{AgentStatus, BoardStore};

/// Poll period for the status directory.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Map a status hint string onto an [`AgentStatus`].
pub fn parse_hint(hint: &str) -> AgentStatus {
    match hint.trim() {
        "working" => AgentStatus::Working,
        "idle" => AgentStatus::Idle,
        "waiting" | "permission" => AgentStatus::Waiting,
        "done" | "completed" => AgentStatus::Completed,
        "error" => AgentStatus::Error,
        _ => AgentStatus::None,
    }
}

/// Read the hint file for one session, if present.
pub fn read_hint(dir: &Path, session_id: &str) -> Option<AgentStatus> {
    let path = dir.join(format!("{session_id}.status"));
    std::fs::read_to_string(path).ok().map(|s| parse_hint(&s))
}

/// The status watcher task.
///
/// Every tick, tickets holding a `terminal_session_id` get their
/// `agent_status` refreshed from the hint files. The store suppresses
/// no-op updates, so an unchanged hint produces no broadcast.
pub fn start_watcher(board: Arc<BoardStore>, dir: PathBuf, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => scan(&board, &dir),
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Agent status watcher stopped");
    });
}

fn scan(board: &BoardStore, dir: &Path) {
    for (ticket_id, session_id, current) in board.tickets_with_sessions() {
        if let Some(status) = read_hint(dir, &session_id) {
            if status != current {
                debug!(ticket_id = %ticket_id, session_id = %session_id, status = ?status, "Agent status hint");
                let _ = board.set_agent_status(&ticket_id, status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{NewTicket, TicketPatch};
    use tempfile::TempDir;

    #[test]
    fn test_parse_known_hints() {
        assert_eq!(parse_hint("working"), AgentStatus::Working);
        assert_eq!(parse_hint("idle"), AgentStatus::Idle);
        assert_eq!(parse_hint("waiting"), AgentStatus::Waiting);
        assert_eq!(parse_hint("permission"), AgentStatus::Waiting);
        assert_eq!(parse_hint("done"), AgentStatus::Completed);
        assert_eq!(parse_hint("completed"), AgentStatus::Completed);
        assert_eq!(parse_hint("error"), AgentStatus::Error);
    }

    #[test]
    fn test_parse_trims_whitespace() {
        assert_eq!(parse_hint("working\n"), AgentStatus::Working);
        assert_eq!(parse_hint("  done  "), AgentStatus::Completed);
    }

    #[test]
    fn test_unrecognized_hint_is_none() {
        assert_eq!(parse_hint("banana"), AgentStatus::None);
        assert_eq!(parse_hint(""), AgentStatus::None);
        assert_eq!(parse_hint("WORKING"), AgentStatus::None);
    }

    #[test]
    fn test_read_hint_missing_file() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_hint(dir.path(), "nope"), None);
    }

    #[test]
    fn test_scan_updates_tickets() {
        let board_dir = TempDir::new().unwrap();
        let status_dir = TempDir::new().unwrap();
        let board = BoardStore::open(board_dir.path().join("board.json"));

        let ticket = board.create_ticket(NewTicket {
            title: "watched".into(),
            ..Default::default()
        });
        board
            .update_ticket(
                &ticket.id,
                TicketPatch {
                    terminal_session_id: Some("sess-1".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        std::fs::write(status_dir.path().join("sess-1.status"), "working\n").unwrap();
        scan(&board, status_dir.path());
        assert_eq!(
            board.ticket(&ticket.id).unwrap().agent_status,
            AgentStatus::Working
        );

        // Unrecognized strings degrade to none instead of propagating.
        std::fs::write(status_dir.path().join("sess-1.status"), "quux").unwrap();
        scan(&board, status_dir.path());
        assert_eq!(
            board.ticket(&ticket.id).unwrap().agent_status,
            AgentStatus::None
        );
    }
}
