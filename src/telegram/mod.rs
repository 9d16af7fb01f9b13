//! Telegram transport: update dispatching and the outbound gateway.

mod gateway;

pub use gateway::{reaction_emoji, TelegramGateway};

use crate::broker::Broker;
use crate::gateway::{Channel, ConversationId, InboundMessage, MessageRef, ParticipantId};
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tracing::{debug, info};

/// Map a Telegram message to a broker message.
///
/// Returns `None` for non-text messages, messages without a human sender and
/// chat kinds the broker does not serve (channels).
#[must_use]
pub fn inbound_from(msg: &Message) -> Option<InboundMessage> {
    let text = msg.text()?;
    let sender = msg.from.as_ref().filter(|user| !user.is_bot)?;

    let channel = if msg.chat.is_private() {
        Channel::Direct
    } else if msg.chat.is_group() || msg.chat.is_supergroup() {
        Channel::Group
    } else {
        return None;
    };

    let conversation = ConversationId(msg.chat.id.0);
    Some(InboundMessage {
        conversation,
        participant: ParticipantId(sender.id.0.cast_signed()),
        participant_name: sender.full_name(),
        channel,
        text: text.to_string(),
        message_ref: MessageRef {
            conversation,
            message_id: msg.id.0,
        },
    })
}

async fn on_message(msg: Message, broker: Arc<Broker>) -> anyhow::Result<()> {
    let Some(inbound) = inbound_from(&msg) else {
        debug!(chat_id = msg.chat.id.0, "Ignoring unsupported update");
        return Ok(());
    };

    // Acquisitions take minutes; later messages in the chat must still be seen
    tokio::spawn(async move { broker.handle(inbound).await });
    Ok(())
}

fn setup_handler() -> UpdateHandler<anyhow::Error> {
    Update::filter_message().endpoint(on_message)
}

/// Run the long-polling dispatcher until ctrl-c
pub async fn run(bot: Bot, broker: Arc<Broker>) {
    info!("Bot is running...");

    Dispatcher::builder(bot, setup_handler())
        .dependencies(dptree::deps![broker])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}
