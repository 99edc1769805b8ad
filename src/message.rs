// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::sync::Arc;

use crate::ids::{ChannelId, ConversationId, SenderId};

/// An immutable bus message.
///
/// `sender` may be empty (anonymous). `channel` is either a public channel name, a mailbox
/// id, or a return-path target, depending on how the message was routed. `content` is an
/// opaque byte string; the bus never interprets it.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    sender: SenderId,
    channel: ChannelId,
    content: Arc<[u8]>,
    conversation: ConversationId,
}

impl Message {
    pub fn new(
        sender: SenderId,
        channel: ChannelId,
        content: impl Into<Arc<[u8]>>,
        conversation: ConversationId,
    ) -> Message {
        Message { sender, channel, content: content.into(), conversation }
    }

    pub fn sender(&self) -> &SenderId {
        &self.sender
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Convenience accessor assuming UTF-8 content; callers that pass binary payloads should
    /// use `content()` instead.
    pub fn content_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }

    pub fn conversation(&self) -> ConversationId {
        self.conversation
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("sender", &self.sender)
            .field("channel", &self.channel)
            .field("content_len", &self.content.len())
            .field("conversation", &self.conversation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_reflect_constructor_fields() {
        let m = Message::new(SenderId::from("s"), ChannelId::from("c"), b"hi".to_vec(), 7);
        assert_eq!(m.sender().as_str(), "s");
        assert_eq!(m.channel().as_str(), "c");
        assert_eq!(m.content(), b"hi");
        assert_eq!(m.conversation(), 7);
    }
}
