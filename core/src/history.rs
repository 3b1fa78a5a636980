use relay_protocol::ContentBlock;
use relay_protocol::Message;
use relay_protocol::MessageContent;

/// Placeholder left behind when an image is elided from history.
const ELIDED_IMAGE_PLACEHOLDER: &str = "[image elided]";

/// Transcript of one session's conversation. Oldest items first; mutation is
/// append-only within a turn, except for the image-retention rewrite which
/// edits older entries in place.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConversationHistory {
    items: Vec<Message>,
}

impl ConversationHistory {
    pub(crate) fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub(crate) fn contents(&self) -> Vec<Message> {
        self.items.clone()
    }

    pub(crate) fn push(&mut self, message: Message) {
        self.items.push(message);
    }

    pub(crate) fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        self.items.extend(messages);
    }

    /// Adopt a client-supplied transcript wholesale (memory-mode off).
    pub(crate) fn replace(&mut self, messages: Vec<Message>) {
        self.items = messages;
    }

    /// Keep only the most recent `n` image blocks, replacing every older one
    /// with a textual placeholder in place. `n == 0` strips all images.
    pub(crate) fn elide_images_beyond(&mut self, n: usize) {
        let mut seen = 0usize;
        for message in self.items.iter_mut().rev() {
            let MessageContent::Blocks(blocks) = &mut message.content else {
                continue;
            };
            for block in blocks.iter_mut().rev() {
                if matches!(block, ContentBlock::Image { .. }) {
                    seen += 1;
                    if seen > n {
                        *block = ContentBlock::Text {
                            text: ELIDED_IMAGE_PLACEHOLDER.to_string(),
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use relay_protocol::Role;

    use super::*;

    fn image_msg(urls: &[&str]) -> Message {
        Message {
            role: Role::User,
            content: MessageContent::Blocks(
                urls.iter()
                    .map(|u| ContentBlock::Image {
                        image_url: u.to_string(),
                    })
                    .collect(),
            ),
        }
    }

    fn count_images(history: &ConversationHistory) -> usize {
        history
            .contents()
            .iter()
            .filter_map(|m| match &m.content {
                MessageContent::Blocks(blocks) => Some(
                    blocks
                        .iter()
                        .filter(|b| matches!(b, ContentBlock::Image { .. }))
                        .count(),
                ),
                _ => None,
            })
            .sum()
    }

    #[test]
    fn keeps_only_the_most_recent_images() {
        let mut history = ConversationHistory::new();
        history.push(image_msg(&["a", "b"]));
        history.push(Message::text(Role::Assistant, "seen"));
        history.push(image_msg(&["c"]));

        history.elide_images_beyond(1);

        assert_eq!(count_images(&history), 1);
        // The survivor is the newest image.
        let items = history.contents();
        let MessageContent::Blocks(blocks) = &items[2].content else {
            panic!("expected blocks");
        };
        assert_eq!(
            blocks[0],
            ContentBlock::Image {
                image_url: "c".to_string()
            }
        );
        // Older images became placeholders, preserving block positions.
        let MessageContent::Blocks(blocks) = &items[0].content else {
            panic!("expected blocks");
        };
        assert_eq!(
            blocks[0],
            ContentBlock::Text {
                text: ELIDED_IMAGE_PLACEHOLDER.to_string()
            }
        );
    }

    #[test]
    fn zero_strips_everything() {
        let mut history = ConversationHistory::new();
        history.push(image_msg(&["a"]));
        history.push(image_msg(&["b", "c"]));
        history.elide_images_beyond(0);
        assert_eq!(count_images(&history), 0);
    }

    #[test]
    fn plain_text_history_is_untouched() {
        let mut history = ConversationHistory::new();
        history.push(Message::text(Role::User, "hi"));
        history.push(Message::text(Role::Assistant, "hello"));
        let before = history.contents();
        history.elide_images_beyond(0);
        assert_eq!(history.contents(), before);
    }
}
