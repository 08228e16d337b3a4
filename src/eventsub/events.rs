use serde::Deserialize;

/// Event type string of chat messages
pub const CHANNEL_CHAT_MESSAGE: &str = "channel.chat.message";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Badge {
    pub set_id: String,
    pub id: String,
    #[serde(default)]
    pub info: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub text: String,
}

/// Payload of a `channel.chat.message` notification
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelChatMessageEvent {
    pub broadcaster_user_id: String,
    pub broadcaster_user_login: String,
    #[serde(default)]
    pub broadcaster_user_name: String,
    pub chatter_user_id: String,
    pub chatter_user_login: String,
    #[serde(default)]
    pub chatter_user_name: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub message: ChatMessage,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub badges: Vec<Badge>,
    #[serde(default)]
    pub message_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_chat_message() {
        let event: ChannelChatMessageEvent = serde_json::from_str(
            r##"{
                "broadcaster_user_id": "1971641",
                "broadcaster_user_login": "streamer",
                "broadcaster_user_name": "streamer",
                "chatter_user_id": "4145994",
                "chatter_user_login": "viewer32",
                "chatter_user_name": "viewer32",
                "message_id": "cc106a89-1814-919d-454c-f4f2f970aae7",
                "message": {"text": "Hi chat", "fragments": []},
                "color": "#00FF7F",
                "badges": [{"set_id": "moderator", "id": "1", "info": ""}],
                "message_type": "text",
                "cheer": null,
                "reply": null
            }"##,
        )
        .unwrap();

        assert_eq!(event.broadcaster_user_login, "streamer");
        assert_eq!(event.chatter_user_login, "viewer32");
        assert_eq!(event.message.text, "Hi chat");
        assert_eq!(event.badges.len(), 1);
    }
}
