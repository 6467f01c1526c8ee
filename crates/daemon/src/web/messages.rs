//! WebSocket message envelopes.
//!
//! JSON mirror of the binary protocol plus the board operations. Terminal
//! payloads are base64; everything else is plain JSON. The `type` tag uses
//! `domain:verb` strings so browser clients can switch on one field.

use serde::{Deserialize, Serialize};

use crate::board::{AgentStatus, Board, BoardSettings, Ticket, TicketStatus};
use crate::board::{NewTicket, TicketPatch};

/// Client → server envelopes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum WsClientMessage {
    /// Attach this socket's terminal stream to a session.
    #[serde(rename = "terminal:subscribe")]
    TerminalSubscribe { session_id: String },

    /// Drop the terminal attachment.
    #[serde(rename = "terminal:unsubscribe")]
    TerminalUnsubscribe,

    /// Keyboard input for the attached session (base64).
    #[serde(rename = "terminal:input")]
    TerminalInput { data: String },

    /// Window size for the attached session.
    #[serde(rename = "terminal:resize")]
    TerminalResize { rows: u16, cols: u16 },

    /// Spawn (or re-attach to) an agent session.
    #[serde(rename = "agent:spawn")]
    AgentSpawn {
        session_id: String,
        #[serde(default)]
        workdir: Option<String>,
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        /// Ticket to bind the session to, if any.
        #[serde(default)]
        ticket_id: Option<String>,
    },

    /// Stop an agent session (SIGINT, then SIGKILL).
    #[serde(rename = "agent:kill")]
    AgentKill { session_id: String },

    /// Start receiving board mutations; replies with a full `board:state`.
    #[serde(rename = "board:subscribe")]
    BoardSubscribe,

    #[serde(rename = "board:unsubscribe")]
    BoardUnsubscribe,

    #[serde(rename = "ticket:create")]
    TicketCreate {
        #[serde(flatten)]
        ticket: NewTicket,
    },

    #[serde(rename = "ticket:update")]
    TicketUpdate {
        id: String,
        #[serde(flatten)]
        patch: TicketPatch,
    },

    #[serde(rename = "ticket:delete")]
    TicketDelete {
        id: String,
        #[serde(default)]
        force: bool,
    },

    #[serde(rename = "ticket:move")]
    TicketMove { id: String, status: TicketStatus },

    #[serde(rename = "ping")]
    Ping,
}

/// Server → client envelopes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum WsServerMessage {
    /// Live session output (base64).
    #[serde(rename = "terminal:output")]
    TerminalOutput { session_id: String, data: String },

    /// Recent output replayed at subscribe time (base64).
    #[serde(rename = "terminal:buffer")]
    TerminalBuffer { session_id: String, data: String },

    /// The attached session terminated.
    #[serde(rename = "terminal:exit")]
    TerminalExit {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },

    /// Full board snapshot.
    #[serde(rename = "board:state")]
    BoardState { board: Board },

    /// Board settings changed.
    #[serde(rename = "board:patch")]
    BoardPatch { settings: BoardSettings },

    #[serde(rename = "ticket:created")]
    TicketCreated { ticket: Ticket },

    #[serde(rename = "ticket:updated")]
    TicketUpdated { ticket: Ticket },

    #[serde(rename = "ticket:deleted")]
    TicketDeleted { id: String },

    /// Derived agent status for a ticket changed.
    #[serde(rename = "agent:status")]
    AgentStatus {
        ticket_id: String,
        status: AgentStatus,
    },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "pong")]
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_tag_format() {
        let msg: WsClientMessage =
            serde_json::from_str(r#"{"type":"terminal:subscribe","session_id":"s1"}"#).unwrap();
        assert!(matches!(
            msg,
            WsClientMessage::TerminalSubscribe { session_id } if session_id == "s1"
        ));
    }

    #[test]
    fn test_ticket_create_flattens_fields() {
        let msg: WsClientMessage =
            serde_json::from_str(r#"{"type":"ticket:create","title":"Do it","labels":["a"]}"#)
                .unwrap();
        match msg {
            WsClientMessage::TicketCreate { ticket } => {
                assert_eq!(ticket.title, "Do it");
                assert_eq!(ticket.labels, vec!["a"]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_server_tag_format() {
        let json = serde_json::to_string(&WsServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let json = serde_json::to_string(&WsServerMessage::TerminalExit {
            session_id: "s1".into(),
            exit_code: Some(0),
        })
        .unwrap();
        assert!(json.contains(r#""type":"terminal:exit""#));
        assert!(json.contains(r#""exit_code":0"#));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result = serde_json::from_str::<WsClientMessage>(r#"{"type":"tea:brew"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_ticket_move_status() {
        let msg: WsClientMessage = serde_json::from_str(
            r#"{"type":"ticket:move","id":"t1","status":"in_progress"}"#,
        )
        .unwrap();
        assert!(matches!(
            msg,
            WsClientMessage::TicketMove { status: TicketStatus::InProgress, .. }
        ));
    }
}
