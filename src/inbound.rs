//! 入站消息过滤与转发
//!
//! 丢弃：自己发出的、群组 / 广播 / 状态来源、提取后为空的内容。
//! 其余消息提取文本 → 后端生成回复 → 经会话出口入队发送。

use crate::backend::{BackendClient, ForwardRequest};
use crate::protocol::{InboundMessage, MediaKind, MessageContent, OriginKind};
use crate::session::Outbox;

pub const VOICE_NOTE_PLACEHOLDER: &str = "[Message vocal reçu]";

/// 被过滤的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    FromSelf,
    Group,
    Broadcast,
    Status,
    EmptyContent,
}

/// 处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Dropped(DropReason),
    /// 已转发，回复已入队
    Replied,
    /// 已转发，后端返回空回复
    NoReply,
    /// 回复未能入队（会话已结束）
    Undeliverable,
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// 按顺序提取文本：纯文本 → 媒体说明 → 语音占位 → 无
pub fn extract_text(content: &MessageContent) -> Option<String> {
    if let Some(text) = non_blank(content.text.as_deref()) {
        return Some(text.to_string());
    }
    if let Some(media) = &content.media {
        if let Some(caption) = non_blank(media.caption.as_deref()) {
            let label = match media.kind {
                MediaKind::Image => "[Image]",
                MediaKind::Video => "[Vidéo]",
            };
            return Some(format!("{} {}", label, caption));
        }
    }
    if content.voice_note {
        return Some(VOICE_NOTE_PLACEHOLDER.to_string());
    }
    None
}

/// 与 extract_text 的选择顺序一致
pub fn message_type(content: &MessageContent) -> &'static str {
    if non_blank(content.text.as_deref()).is_some() {
        return "text";
    }
    match &content.media {
        Some(media) if non_blank(media.caption.as_deref()).is_some() => match media.kind {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        },
        _ if content.voice_note => "audio",
        _ => "text",
    }
}

/// 过滤；通过时返回提取出的文本
pub fn screen(msg: &InboundMessage) -> Result<String, DropReason> {
    if msg.from_me {
        return Err(DropReason::FromSelf);
    }
    match msg.origin {
        OriginKind::Group => return Err(DropReason::Group),
        OriginKind::Broadcast => return Err(DropReason::Broadcast),
        OriginKind::Status => return Err(DropReason::Status),
        OriginKind::Direct => {}
    }
    extract_text(&msg.content).ok_or(DropReason::EmptyContent)
}

/// 完整处理一条入站消息
pub async fn handle_inbound(
    tenant_id: &str,
    msg: InboundMessage,
    backend: &BackendClient,
    outbox: &Outbox,
) -> InboundOutcome {
    let text = match screen(&msg) {
        Ok(text) => text,
        Err(reason) => {
            tracing::debug!(tenant_id = %tenant_id, "inbound from {} filtered: {:?}", msg.sender, reason);
            return InboundOutcome::Dropped(reason);
        }
    };

    let preview: String = text.chars().take(50).collect();
    tracing::info!(tenant_id = %tenant_id, "message from {}: {}", msg.sender, preview);

    let request = ForwardRequest::new(tenant_id, &msg.sender, &text)
        .with_message_type(message_type(&msg.content));
    let reply = backend.forward_request(request).await;
    if reply.trim().is_empty() {
        tracing::info!(tenant_id = %tenant_id, "backend returned no reply for {}", msg.sender);
        return InboundOutcome::NoReply;
    }

    match outbox.push(&msg.sender, &reply).await {
        Ok(()) => InboundOutcome::Replied,
        Err(e) => {
            tracing::warn!(tenant_id = %tenant_id, "reply to {} not queued: {}", msg.sender, e);
            InboundOutcome::Undeliverable
        }
    }
}
