//! Domain types shared across the server, plus the JSON wire protocol
//! spoken over the WebSocket. Field names follow the client's camelCase
//! convention; timestamps are unix seconds; sequence numbers are i64.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a user account.
///
/// Transitions: `created` -> `active` (registration completed) ->
/// `deleted` (admin delete), and `active`/`deleted` -> `created` again on
/// password reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Created,
    Active,
    Deleted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub online: bool,
    /// Unix seconds of the last observed activity.
    pub last_seen: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub presence: Presence,
    pub status: UserStatus,
}

/// A chat conversation: the single Town Hall or a 1:1 DM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub last_seq: i64,
    #[serde(default)]
    pub is_dm: bool,
    /// For DMs in a user's chat list: whether the other party is connected.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub online: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentType {
    Image,
    File,
}

/// Reference to externally stored content; the core treats `file_id` as
/// opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentType,
    pub name: String,
    pub mime_type: String,
    pub file_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub seq: i64,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub chat_id: String,
    pub user_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<Attachment>,
}

/// Frames sent by the client over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Join {
        chat_id: String,
    },
    Leave {
        chat_id: String,
    },
    Send {
        chat_id: String,
        content: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
}

/// Frames pushed by the server over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    Messages {
        chat_id: String,
        messages: Vec<Message>,
    },
    Online {
        user_id: String,
    },
    Offline {
        user_id: String,
    },
    New {
        user: User,
        chat: Chat,
    },
    Deleted {
        user_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_round_trip() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"send","chatId":"townhall","content":"hi"}"#).unwrap();
        match &frame {
            ClientFrame::Send {
                chat_id,
                content,
                attachments,
            } => {
                assert_eq!(chat_id, "townhall");
                assert_eq!(content, "hi");
                assert!(attachments.is_empty());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn server_event_wire_shape() {
        let evt = ServerEvent::Messages {
            chat_id: "townhall".into(),
            messages: vec![Message {
                seq: 3,
                timestamp: 1700000000,
                chat_id: String::new(),
                user_id: "u1".into(),
                content: "hello".into(),
                attachments: Vec::new(),
            }],
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "messages");
        assert_eq!(json["chatId"], "townhall");
        assert_eq!(json["messages"][0]["seq"], 3);
        assert_eq!(json["messages"][0]["userId"], "u1");
        // chatId inside a message is omitted when the frame already names it
        assert!(json["messages"][0].get("chatId").is_none());
    }

    #[test]
    fn presence_events_carry_user_id() {
        let json = serde_json::to_value(ServerEvent::Offline {
            user_id: "u2".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "offline");
        assert_eq!(json["userId"], "u2");
    }
}
