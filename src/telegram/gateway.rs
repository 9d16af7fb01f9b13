use crate::gateway::{
    ConversationId, MessageRef, MessagingGateway, OutboundDocument, ParticipantId, Reaction,
    TransportError,
};
use crate::utils::retry_operation;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, InputFile, MessageId, ParseMode, ReactionType};
use tracing::{debug, info};

/// Emoji used for each progress reaction (all on the Bot API's allowed list)
#[must_use]
pub const fn reaction_emoji(reaction: Reaction) -> &'static str {
    match reaction {
        Reaction::Searching => "👀",
        Reaction::Working => "🤔",
        Reaction::Downloading => "⚡",
        Reaction::Done => "👍",
        Reaction::Failed => "👎",
    }
}

fn api_error(e: &teloxide::RequestError) -> TransportError {
    TransportError::Api(e.to_string())
}

/// [`MessagingGateway`] over the Telegram Bot API
///
/// Every call is retried with exponential backoff before the error surfaces.
#[derive(Clone)]
pub struct TelegramGateway {
    bot: Bot,
}

impl TelegramGateway {
    /// Wrap a bot handle
    #[must_use]
    pub const fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl MessagingGateway for TelegramGateway {
    async fn send_text(&self, conversation: ConversationId, text: String) -> Result<(), TransportError> {
        let chat_id = ChatId(conversation.0);
        retry_operation(|| async {
            self.bot
                .send_message(chat_id, text.clone())
                .parse_mode(ParseMode::Html)
                .await
                .map(|_| ())
        })
        .await
        .map_err(|e| api_error(&e))
    }

    async fn send_image_with_caption(
        &self,
        conversation: ConversationId,
        image: Vec<u8>,
        caption: String,
    ) -> Result<(), TransportError> {
        let chat_id = ChatId(conversation.0);
        retry_operation(|| async {
            self.bot
                .send_photo(chat_id, InputFile::memory(image.clone()))
                .caption(caption.clone())
                .parse_mode(ParseMode::Html)
                .await
                .map(|_| ())
        })
        .await
        .map_err(|e| api_error(&e))
    }

    async fn send_document(
        &self,
        conversation: ConversationId,
        document: OutboundDocument,
    ) -> Result<(), TransportError> {
        let chat_id = ChatId(conversation.0);
        // The Bot API derives the content type from the file name
        debug!(
            file_name = %document.file_name,
            mime_type = %document.mime_type,
            size = document.bytes.len(),
            "Uploading document"
        );
        retry_operation(|| async {
            let file = InputFile::memory(document.bytes.clone()).file_name(document.file_name.clone());
            self.bot.send_document(chat_id, file).await.map(|_| ())
        })
        .await
        .map_err(|e| api_error(&e))
    }

    async fn send_reaction(&self, message: MessageRef, reaction: Reaction) -> Result<(), TransportError> {
        self.bot
            .set_message_reaction(ChatId(message.conversation.0), MessageId(message.message_id))
            .reaction(vec![ReactionType::Emoji {
                emoji: reaction_emoji(reaction).to_string(),
            }])
            .await
            .map(|_| ())
            .map_err(|e| api_error(&e))
    }

    async fn block_participant(&self, participant: ParticipantId) -> Result<(), TransportError> {
        // Bots cannot block users; the broker stays silent towards them instead
        info!(user_id = participant.0, "Participant blocked locally");
        Ok(())
    }
}
