//! Outbound message formatting and sequencing
//!
//! Text sends are best-effort: a failed notice is logged and swallowed so a
//! transport outage never turns into a second failure notice. File transfers
//! report their errors so the pipeline can stop early.

use crate::acquire::AcquiredArtifact;
use crate::bundle::{BundleFile, ExtractedBundle};
use crate::catalog::{AppDetails, SearchResult};
use crate::gateway::{
    AssetFetcher, ConversationId, MessageRef, MessagingGateway, OutboundDocument, Reaction,
    TransportError,
};
use crate::utils::truncate_str;
use html_escape::encode_text;
use std::sync::Arc;
use tracing::{debug, warn};

/// MIME type of an installable package
pub const APK_MIME: &str = "application/vnd.android.package-archive";
/// MIME type of everything else
pub const BINARY_MIME: &str = "application/octet-stream";

const DESCRIPTION_PREVIEW_CHARS: usize = 200;
const NUMBER_EMOJIS: [&str; 10] = ["1️⃣", "2️⃣", "3️⃣", "4️⃣", "5️⃣", "6️⃣", "7️⃣", "8️⃣", "9️⃣", "🔟"];

/// Fixed notices
pub mod notices {
    /// Blacklisted identity
    pub const BLACKLISTED: &str = "⛔ You have been banned from using this bot for violating the usage policy.";
    /// Spam escalation reached the threshold
    pub const AUTO_BANNED: &str = "⛔ You have been banned automatically for repeated flooding. Contact the owner if this is a mistake.";
    /// Burst throttled
    pub const SLOW_DOWN: &str = "⚠️ Please slow down! Do not send requests this quickly.";
    /// Direct message to a groups-only deployment
    pub const GROUPS_ONLY: &str = "🚫 This bot only works inside groups. Private chats are not supported and this account has been blocked.";
    /// Query matched nothing
    pub const NO_MATCHES: &str = "❌ No results found. Try another name.";
    /// Catalog search or lookup failed
    pub const CATALOG_UNAVAILABLE: &str = "❌ Something went wrong while searching. Please try again.";
    /// `0` at the selection prompt
    pub const SEARCH_AGAIN: &str = "🔍 OK, send the name of the app:";
    /// Selection arrived after the results were dropped
    pub const RESULTS_EXPIRED: &str = "⌛ Your previous results expired. Send the name of the app to search again:";
    /// The picked hit carries no catalog identifier
    pub const UNRESOLVED_ID: &str = "❌ Could not resolve the app identifier. Pick another app.";
    /// Both acquisition tiers failed
    pub const ACQUISITION_FAILED: &str = "❌ Could not download the app.\n\n💡 Try another app.";
    /// Generic error at the handler boundary
    pub const GENERIC_FAILURE: &str = "❌ Something went wrong. Please try again.";
}

/// Announcement sent to the owner chat when a user appears for the first time
#[must_use]
pub fn new_user_announcement(name: &str, identity: i64) -> String {
    let name = if name.trim().is_empty() { "unknown" } else { name };
    format!(
        "🆕 <b>New user</b>\n👤 {}\n🆔 <code>{identity}</code>",
        encode_text(name)
    )
}

/// Welcome text of the interactive flow
#[must_use]
pub fn welcome_text() -> String {
    [
        "👋 <b>Welcome!</b>",
        "",
        "📦 Download apps straight from the store, including XAPK + OBB games.",
        "",
        "📖 <b>How to use:</b>",
        "1️⃣ Send the name of an app",
        "2️⃣ Pick a number from the list",
        "3️⃣ Receive the file",
        "",
        "💡 Send 0 at the list to search again.",
        "",
        "📝 Start now by sending an app name...",
    ]
    .join("\n")
}

/// Usage text of the group flow
#[must_use]
pub fn usage_text() -> String {
    [
        "📖 <b>How to use</b>",
        "",
        "Send the name of an app (or its package id such as <code>com.whatsapp</code>)",
        "and the best match is downloaded and sent here.",
    ]
    .join("\n")
}

/// Busy notice naming the running acquisition
#[must_use]
pub fn busy_text(label: Option<&str>) -> String {
    match label {
        Some(label) if !label.is_empty() => format!(
            "⏳ Please wait, <b>{}</b> is still being processed...",
            encode_text(label)
        ),
        _ => "⏳ Please wait, your request is still being processed...".to_string(),
    }
}

/// Re-prompt for an out-of-range selection
#[must_use]
pub fn selection_reprompt(count: usize) -> String {
    format!("❌ Send a number from 1 to {count}\n💡 Or send 0 to search again")
}

/// Numbered list of search results
#[must_use]
pub fn results_text(results: &[SearchResult]) -> String {
    let mut text = String::from("🔍 <b>Search results</b>\n\n");
    for (idx, hit) in results.iter().enumerate() {
        let marker = NUMBER_EMOJIS
            .get(idx)
            .map_or_else(|| format!("{}.", hit.index), |emoji| (*emoji).to_string());
        text.push_str(&format!("{marker} <b>{}</b>\n", encode_text(&hit.title)));
        if !hit.developer.is_empty() {
            let rating = if hit.rating > 0.0 {
                format!(" ⭐{:.1}", hit.rating)
            } else {
                String::new()
            };
            text.push_str(&format!("   👨‍💻 {}{rating}\n", encode_text(&hit.developer)));
        }
    }
    text.push_str(&format!(
        "\n📝 Send the number of the app (1-{})\n💡 Or send 0 to search again",
        results.len()
    ));
    text
}

fn or_na(value: Option<&str>) -> String {
    encode_text(value.unwrap_or("N/A")).into_owned()
}

/// Details card shown before the transfer starts
#[must_use]
pub fn details_text(details: &AppDetails) -> String {
    let rating = details
        .rating
        .map_or_else(|| "N/A".to_string(), |r| format!("{r:.1}"));
    let description = details.description.as_deref().map_or_else(
        || "N/A".to_string(),
        |d| format!("{}...", encode_text(&truncate_str(d, DESCRIPTION_PREVIEW_CHARS))),
    );

    format!(
        "📱 <b>{title}</b>\n\n\
         📦 <b>Package:</b> <code>{id}</code>\n\
         ⭐ <b>Rating:</b> {rating}/5\n\
         📥 <b>Installs:</b> {installs}\n\
         📏 <b>Size:</b> {size}\n\
         🔄 <b>Version:</b> {version}\n\
         👨‍💻 <b>Developer:</b> {developer}\n\n\
         📝 {description}",
        title = encode_text(&details.title),
        id = encode_text(&details.catalog_id),
        installs = or_na(details.installs.as_deref()),
        size = or_na(details.size.as_deref()),
        version = or_na(details.version.as_deref()),
        developer = or_na(details.developer.as_deref()),
    )
}

/// Footer after a plain file transfer
#[must_use]
pub fn success_footer() -> String {
    "✅ <b>Sent successfully!</b>\n\n🙏 Thanks for using the bot.".to_string()
}

/// Install steps after a split bundle, naming the expansion-data directory
#[must_use]
pub fn split_instructions(catalog_id: &str) -> String {
    format!(
        "✅ <b>Sent successfully!</b>\n\n\
         📋 <b>How to install:</b>\n\
         1️⃣ Install the APK file first\n\
         2️⃣ Copy the OBB files to:\n   📁 <code>Android/obb/{}/</code>\n\n\
         🙏 Thanks for using the bot.",
        encode_text(catalog_id)
    )
}

/// Install steps when a bundle is delivered unsplit
#[must_use]
pub fn bundle_instructions() -> String {
    "✅ <b>Sent successfully!</b>\n\n\
     📋 <b>How to install:</b>\n\
     • Use an XAPK installer app\n\
     • Or unpack the archive manually\n\n\
     🙏 Thanks for using the bot."
        .to_string()
}

fn mime_for(file_name: &str) -> &'static str {
    if file_name.to_lowercase().ends_with(".apk") {
        APK_MIME
    } else {
        BINARY_MIME
    }
}

/// Sends notices, progress reactions, cards and files for one conversation flow
#[derive(Clone)]
pub struct DeliveryCoordinator {
    gateway: Arc<dyn MessagingGateway>,
    assets: Arc<dyn AssetFetcher>,
    welcome_image_url: Option<String>,
}

impl DeliveryCoordinator {
    /// Create a coordinator
    #[must_use]
    pub fn new(
        gateway: Arc<dyn MessagingGateway>,
        assets: Arc<dyn AssetFetcher>,
        welcome_image_url: Option<String>,
    ) -> Self {
        Self {
            gateway,
            assets,
            welcome_image_url,
        }
    }

    /// Send a text, logging transport failures
    pub async fn notify(&self, conversation: ConversationId, text: impl Into<String>) {
        if let Err(e) = self.gateway.send_text(conversation, text.into()).await {
            warn!(conversation = conversation.0, error = %e, "Failed to send notice");
        }
    }

    /// Attach a progress reaction, logging transport failures
    pub async fn react(&self, message: MessageRef, reaction: Reaction) {
        if let Err(e) = self.gateway.send_reaction(message, reaction).await {
            debug!(error = %e, ?reaction, "Failed to set reaction");
        }
    }

    /// Welcome message, as an image caption when the banner can be fetched
    pub async fn welcome(&self, conversation: ConversationId) {
        self.image_or_text(conversation, self.welcome_image_url.as_deref(), welcome_text())
            .await;
    }

    /// Numbered result list
    pub async fn search_results(&self, conversation: ConversationId, results: &[SearchResult]) {
        self.notify(conversation, results_text(results)).await;
    }

    /// Details card with the app icon, silently degrading to text
    pub async fn details(&self, conversation: ConversationId, details: &AppDetails) {
        self.image_or_text(conversation, details.icon_url.as_deref(), details_text(details))
            .await;
    }

    async fn image_or_text(&self, conversation: ConversationId, image_url: Option<&str>, text: String) {
        if let Some(url) = image_url {
            match self.assets.fetch(url).await {
                Ok(image) => {
                    match self
                        .gateway
                        .send_image_with_caption(conversation, image.as_ref().clone(), text.clone())
                        .await
                    {
                        Ok(()) => return,
                        Err(e) => debug!(error = %e, "Image send failed, falling back to text"),
                    }
                }
                Err(e) => debug!(url = %url, error = %e, "Image unavailable, sending text only"),
            }
        }
        self.notify(conversation, text).await;
    }

    async fn send_file(
        &self,
        conversation: ConversationId,
        bytes: Vec<u8>,
        file_name: String,
        mime_type: &str,
    ) -> Result<(), TransportError> {
        debug!(conversation = conversation.0, file_name = %file_name, size = bytes.len(), "Sending document");
        self.gateway
            .send_document(
                conversation,
                OutboundDocument {
                    bytes,
                    file_name,
                    mime_type: mime_type.to_string(),
                },
            )
            .await
    }

    /// Single-file delivery followed by the success footer
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the document transfer fails.
    pub async fn deliver_single(
        &self,
        conversation: ConversationId,
        artifact: AcquiredArtifact,
    ) -> Result<(), TransportError> {
        let mime_type = mime_for(&artifact.file_name);
        self.send_file(conversation, artifact.bytes, artifact.file_name, mime_type)
            .await?;
        self.notify(conversation, success_footer()).await;
        Ok(())
    }

    /// Split bundle: primary first, then every auxiliary file, then install steps
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if any document transfer fails; later files are not sent.
    pub async fn deliver_split(
        &self,
        conversation: ConversationId,
        bundle: ExtractedBundle,
        catalog_id: &str,
    ) -> Result<(), TransportError> {
        if let Some(BundleFile { bytes, file_name }) = bundle.primary {
            self.send_file(conversation, bytes, file_name, APK_MIME).await?;
        }
        for BundleFile { bytes, file_name } in bundle.auxiliary {
            self.send_file(conversation, bytes, file_name, BINARY_MIME).await?;
        }
        self.notify(conversation, split_instructions(catalog_id)).await;
        Ok(())
    }

    /// Unsplit bundle with generic installer guidance
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the document transfer fails.
    pub async fn deliver_raw_bundle(
        &self,
        conversation: ConversationId,
        artifact: AcquiredArtifact,
    ) -> Result<(), TransportError> {
        self.send_file(conversation, artifact.bytes, artifact.file_name, BINARY_MIME)
            .await?;
        self.notify(conversation, bundle_instructions()).await;
        Ok(())
    }

    /// Bundle that could not be parsed: raw archive with the plain footer
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the document transfer fails.
    pub async fn deliver_unparsed_bundle(
        &self,
        conversation: ConversationId,
        artifact: AcquiredArtifact,
    ) -> Result<(), TransportError> {
        self.send_file(conversation, artifact.bytes, artifact.file_name, BINARY_MIME)
            .await?;
        self.notify(conversation, success_footer()).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(index: usize, title: &str, developer: &str, rating: f64) -> SearchResult {
        SearchResult {
            title: title.to_string(),
            catalog_id: format!("com.app{index}"),
            developer: developer.to_string(),
            rating,
            icon_url: None,
            store_url: String::new(),
            index,
        }
    }

    #[test]
    fn test_results_text_numbers_and_escapes() {
        let text = results_text(&[
            hit(1, "Tom & Jerry", "Studio <X>", 4.31),
            hit(2, "Plain", "", 0.0),
        ]);
        assert!(text.contains("1️⃣ <b>Tom &amp; Jerry</b>"));
        assert!(text.contains("Studio &lt;X&gt; ⭐4.3"));
        assert!(text.contains("2️⃣ <b>Plain</b>\n\n"));
        assert!(text.contains("(1-2)"));
    }

    #[test]
    fn test_results_text_beyond_ten_uses_index() {
        let results: Vec<SearchResult> = (1..=11).map(|i| hit(i, "App", "", 0.0)).collect();
        assert!(results_text(&results).contains("11. <b>App</b>"));
    }

    #[test]
    fn test_details_text_fills_missing_fields() {
        let details = AppDetails {
            title: "WhatsApp".to_string(),
            catalog_id: "com.whatsapp".to_string(),
            rating: Some(4.31),
            installs: Some("5,000,000,000+".to_string()),
            size: None,
            version: None,
            developer: None,
            description: Some("x".repeat(500)),
            icon_url: None,
        };
        let text = details_text(&details);
        assert!(text.contains("<code>com.whatsapp</code>"));
        assert!(text.contains("4.3/5"));
        assert!(text.contains("<b>Size:</b> N/A"));
        assert!(text.contains(&format!("{}...", "x".repeat(200))));
        assert!(!text.contains(&"x".repeat(201)));
    }

    #[test]
    fn test_split_instructions_name_obb_path() {
        assert!(split_instructions("com.game").contains("Android/obb/com.game/"));
    }

    #[test]
    fn test_busy_text_mentions_label() {
        assert!(busy_text(Some("WhatsApp")).contains("<b>WhatsApp</b>"));
        assert!(!busy_text(None).contains("<b>"));
    }

    #[test]
    fn test_mime_by_extension() {
        assert_eq!(mime_for("wa.APK"), APK_MIME);
        assert_eq!(mime_for("game.xapk"), BINARY_MIME);
    }
}
