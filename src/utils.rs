//! Small text helpers and the retry wrapper shared by the transport layer.

use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;

/// Truncates a string to at most `max_chars` characters (not bytes).
///
/// # Examples
///
/// ```
/// use apk_courier::utils::truncate_str;
/// let s = "Привет, мир!";
/// assert_eq!(truncate_str(s, 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}

/// Replaces every character that is not an ASCII letter or digit with `_`.
///
/// Used to turn an application title into a filename that is safe both on
/// disk and in messaging clients.
///
/// # Examples
///
/// ```
/// use apk_courier::utils::safe_file_stem;
/// assert_eq!(safe_file_stem("PUBG: Mobile"), "PUBG__Mobile");
/// ```
#[must_use]
pub fn safe_file_stem(title: &str) -> String {
    title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Formats a byte count as mebibytes with two decimals.
#[must_use]
pub fn format_mib(bytes: u64) -> String {
    #[allow(clippy::cast_precision_loss)]
    let mib = bytes as f64 / (1024.0 * 1024.0);
    format!("{mib:.2} MB")
}

/// Retry a messaging API operation with exponential backoff.
///
/// The retry strategy uses exponential backoff with jitter to avoid thundering herd:
/// - Initial delay: 500ms
/// - Max delay: 4s
/// - Max attempts: 3 (configurable via constants in `config.rs`)
///
/// # Errors
///
/// Returns the last error if all attempts fail.
///
/// # Examples
///
/// ```no_run
/// use apk_courier::utils::retry_operation;
///
/// # async fn example() -> Result<(), std::io::Error> {
/// let value = retry_operation(|| async { Ok::<_, std::io::Error>(42) }).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_operation<F, Fut, T, E>(operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    use crate::config::{
        TELEGRAM_API_INITIAL_BACKOFF_MS, TELEGRAM_API_MAX_BACKOFF_MS, TELEGRAM_API_MAX_RETRIES,
    };

    let retry_strategy = ExponentialBackoff::from_millis(TELEGRAM_API_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TELEGRAM_API_MAX_BACKOFF_MS))
        .map(jitter)
        .take(TELEGRAM_API_MAX_RETRIES);

    Retry::spawn(retry_strategy, operation).await.map_err(|e| {
        warn!(
            "Messaging API operation failed after {} attempts: {}",
            TELEGRAM_API_MAX_RETRIES, e
        );
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_truncate_str_unicode() {
        assert_eq!(truncate_str("تطبيق واتساب", 5), "تطبيق");
        assert_eq!(truncate_str("short", 30), "short");
    }

    #[test]
    fn test_safe_file_stem() {
        assert_eq!(safe_file_stem("Clash of Clans"), "Clash_of_Clans");
        assert_eq!(safe_file_stem("Mini-Militia 2.0"), "Mini_Militia_2_0");
        assert_eq!(safe_file_stem("واتساب"), "______");
    }

    #[test]
    fn test_format_mib() {
        assert_eq!(format_mib(1024 * 1024), "1.00 MB");
        assert_eq!(format_mib(0), "0.00 MB");
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, String> = retry_operation(|| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err("connection reset".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
