//! Outbound notification hook.
//!
//! Fire-and-forget: one webhook POST per completed `inference` response,
//! capped at two seconds, with per-domain dedup so a resent prompt does not
//! notify twice in a row. Failures are logged and never surface to the
//! request path.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use serde_json::json;
use tracing::{debug, warn};

use prism_protocol::{ContentBlock, MessagesRequest};

use crate::response::ProxyResponse;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(2);
/// Bound on the dedup table; far more domains than any deployment carries.
const DEDUP_CAPACITY: usize = 1000;

pub struct Notifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
    /// domain → last notified user content.
    dedup: Mutex<LruCache<String, String>>,
}

/// Details handed to the webhook alongside the content.
pub struct NotificationContext<'a> {
    pub domain: &'a str,
    pub request_id: &'a str,
    pub conversation_id: &'a str,
    pub branch_id: &'a str,
    pub model: &'a str,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(WEBHOOK_TIMEOUT)
                .build()
                .expect("reqwest client builds"),
            webhook_url,
            dedup: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEDUP_CAPACITY).expect("capacity is nonzero"),
            )),
        }
    }

    /// The "user content for notification": text of the last user message.
    /// Agent turns usually sandwich the real prompt between injected
    /// reminder blocks, so with more than two text blocks the first and last
    /// are stripped.
    pub fn notification_content(request: &MessagesRequest) -> String {
        let Some(message) = request.last_user_message() else {
            return String::new();
        };
        let mut texts: Vec<String> = message
            .content_blocks()
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            })
            .collect();
        if texts.len() > 2 {
            texts.remove(0);
            texts.pop();
        }
        texts.join("\n")
    }

    /// Queue one notification. Returns immediately; delivery happens on a
    /// spawned task.
    pub fn notify(
        &self,
        ctx: NotificationContext<'_>,
        user_content: String,
        response: &ProxyResponse,
    ) {
        let Some(url) = self.webhook_url.clone() else {
            return;
        };

        if !self.should_send(ctx.domain, &user_content) {
            debug!(domain = ctx.domain, "notification suppressed (duplicate content)");
            return;
        }

        let payload = json!({
            "domain": ctx.domain,
            "request_id": ctx.request_id,
            "conversation_id": ctx.conversation_id,
            "branch_id": ctx.branch_id,
            "model": ctx.model,
            "user_content": user_content,
            "assistant_content": response.content,
            "input_tokens": response.usage.input_tokens,
            "output_tokens": response.usage.output_tokens,
        });

        let http = self.http.clone();
        let domain = ctx.domain.to_string();
        tokio::spawn(async move {
            match http.post(&url).json(&payload).send().await {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(domain, status = resp.status().as_u16(), "notification webhook rejected");
                }
                Ok(_) => debug!(domain, "notification delivered"),
                Err(e) => warn!(domain, error = %e, "notification webhook failed"),
            }
        });
    }

    fn should_send(&self, domain: &str, content: &str) -> bool {
        let mut dedup = self.dedup.lock().unwrap();
        if dedup.get(domain).map(String::as_str) == Some(content) {
            return false;
        }
        dedup.put(domain.to_string(), content.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(v: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn plain_last_user_message_is_used_whole() {
        let r = req(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "earlier"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "the real ask"},
            ],
        }));
        assert_eq!(Notifier::notification_content(&r), "the real ask");
    }

    #[test]
    fn reminder_blocks_are_stripped_when_more_than_two() {
        let r = req(json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "<system-reminder>a</system-reminder>"},
                {"type": "text", "text": "actual question"},
                {"type": "text", "text": "more detail"},
                {"type": "text", "text": "<system-reminder>b</system-reminder>"},
            ]}],
        }));
        assert_eq!(
            Notifier::notification_content(&r),
            "actual question\nmore detail"
        );
    }

    #[test]
    fn two_or_fewer_blocks_are_kept() {
        let r = req(json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "one"},
                {"type": "text", "text": "two"},
            ]}],
        }));
        assert_eq!(Notifier::notification_content(&r), "one\ntwo");
    }

    #[test]
    fn dedup_suppresses_repeats_per_domain() {
        let notifier = Notifier::new(None);
        assert!(notifier.should_send("a.example", "hello"));
        assert!(!notifier.should_send("a.example", "hello"));
        // other domains are independent
        assert!(notifier.should_send("b.example", "hello"));
        // changed content notifies again
        assert!(notifier.should_send("a.example", "hello again"));
        assert!(!notifier.should_send("a.example", "hello again"));
    }
}
