use crate::config::FilterRules;
use crate::session::MessageRecord;

/// Suffix identifying group chat ids.
pub const GROUP_MARKER: &str = "@g.us";

/// How a message is addressed, relative to our own account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub is_group: bool,
    pub is_self_chat: bool,
}

impl Classification {
    pub fn of(message: &MessageRecord, own_user_id: Option<&str>) -> Self {
        let is_group =
            message.destination.contains(GROUP_MARKER) || message.origin.contains(GROUP_MARKER);
        let is_self_chat = !is_group
            && own_user_id
                .map(|own| user_part(&message.destination) == user_part(own))
                .unwrap_or(false);
        Self {
            is_group,
            is_self_chat,
        }
    }
}

/// `12345@c.us` -> `12345`. Ids without a server part are returned as-is.
fn user_part(id: &str) -> &str {
    id.split('@').next().unwrap_or(id)
}

/// Why a message was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    GroupsDisabled,
    PrivateDisabled,
    SelfChatDisabled,
    SenderNotAllowed,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::GroupsDisabled => write!(f, "group messages disabled"),
            SkipReason::PrivateDisabled => write!(f, "private messages disabled"),
            SkipReason::SelfChatDisabled => write!(f, "self-chat messages disabled"),
            SkipReason::SenderNotAllowed => write!(f, "sender not in allowed numbers"),
        }
    }
}

/// First matching rule wins. `None` means forward.
pub fn skip_reason(
    is_group: bool,
    is_self_chat: bool,
    sender_number: &str,
    rules: Option<&FilterRules>,
) -> Option<SkipReason> {
    let rules = rules?;

    if is_group && rules.allow_groups == Some(false) {
        return Some(SkipReason::GroupsDisabled);
    }
    if !is_group && !is_self_chat && rules.allow_private == Some(false) {
        return Some(SkipReason::PrivateDisabled);
    }
    if is_self_chat && rules.allow_self_chat == Some(false) {
        return Some(SkipReason::SelfChatDisabled);
    }
    if let Some(allowed) = &rules.allowed_numbers {
        if !allowed.is_empty() && !allowed.contains(sender_number) {
            return Some(SkipReason::SenderNotAllowed);
        }
    }
    None
}

#[cfg(test)]
pub fn should_skip(
    is_group: bool,
    is_self_chat: bool,
    sender_number: &str,
    rules: Option<&FilterRules>,
) -> bool {
    skip_reason(is_group, is_self_chat, sender_number, rules).is_some()
}
