//! Fetch worker: URL → `content.fetched`.
//!
//! Outbound load is bounded by a per-hostname token bucket. A page that
//! answers but yields no readable text is a partial success: the event
//! carries a `fetch_error` and a null body, and nothing is retried.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};

use lifestream_events::{ContentFetched, EventKind, FetchPayload, WorkCommand, WorkKind};

use crate::rate_limit::HostRateLimiter;

use super::{StageError, StageWorker};

const USER_AGENT: &str = "lifestream-fetcher/0.1";

/// What readability extraction produced for a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub title: Option<String>,
    pub text: Option<String>,
}

/// Pull a title and readable body text out of an HTML document.
///
/// Title: `<title>`, falling back to `og:title`. Body: paragraph text from
/// the first of `article`, `main`, `body` that yields any.
pub fn extract_readable(html: &str) -> Extraction {
    let document = Html::parse_document(html);

    let title_selector = Selector::parse("title").expect("static selector");
    let og_selector = Selector::parse(r#"meta[property="og:title"]"#).expect("static selector");

    let mut title = document
        .select(&title_selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());
    if title.is_none() {
        title = document
            .select(&og_selector)
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
    }

    let mut text = None;
    for container in ["article p", "main p", "body p"] {
        let selector = Selector::parse(container).expect("static selector");
        let paragraphs: Vec<String> = document
            .select(&selector)
            .map(|el| {
                el.text()
                    .collect::<String>()
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .filter(|p| !p.is_empty())
            .collect();
        if !paragraphs.is_empty() {
            text = Some(paragraphs.join("\n\n"));
            break;
        }
    }

    Extraction { title, text }
}

pub struct Fetcher {
    client: reqwest::Client,
    limiter: HostRateLimiter,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(timeout: Duration, min_host_interval: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            limiter: HostRateLimiter::new(min_host_interval),
            timeout,
        })
    }
}

#[async_trait]
impl StageWorker for Fetcher {
    fn kind(&self) -> WorkKind {
        WorkKind::FetchLink
    }

    fn agent_name(&self) -> &'static str {
        "fetcher"
    }

    fn timeout(&self) -> Duration {
        // Leave headroom over the HTTP timeout for rate-limit waits.
        self.timeout + Duration::from_secs(15)
    }

    async fn execute(&self, work: &WorkCommand) -> Result<EventKind, StageError> {
        let payload: FetchPayload = work
            .decode_payload()
            .map_err(|e| StageError::new(format!("bad fetch payload: {e}")))?;

        let url: reqwest::Url = payload
            .url
            .parse()
            .map_err(|e| StageError::new(format!("unfetchable url {}: {e}", payload.url)))?;
        let host = url
            .host_str()
            .ok_or_else(|| StageError::new(format!("url has no host: {}", payload.url)))?
            .to_string();

        self.limiter.acquire(&host).await;

        // Transport errors and timeouts are retryable stage failures.
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StageError::new(format!("fetch failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StageError::new(format!("http status {status}")));
        }

        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| StageError::new(format!("body read failed: {e}")))?;

        let extraction = extract_readable(&body);
        let fetch_error = if extraction.text.is_none() {
            Some("no readable text extracted".to_string())
        } else {
            None
        };

        Ok(EventKind::ContentFetched(ContentFetched {
            final_url,
            title: extraction.title,
            text_content: extraction.text,
            html_storage_key: None,
            fetch_error,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_title_and_article_paragraphs() {
        let html = r#"
            <html>
              <head><title> The  Title </title></head>
              <body>
                <nav><p>navigation chrome</p></nav>
                <article>
                  <p>First    paragraph.</p>
                  <p>Second paragraph.</p>
                </article>
              </body>
            </html>
        "#;

        let extraction = extract_readable(html);
        assert_eq!(extraction.title.as_deref(), Some("The  Title"));
        let text = extraction.text.unwrap();
        assert!(text.starts_with("First paragraph."));
        assert!(text.contains("Second paragraph."));
    }

    #[test]
    fn falls_back_to_og_title_and_body_paragraphs() {
        let html = r#"
            <html>
              <head><meta property="og:title" content="OG Title"></head>
              <body><p>Only body text here.</p></body>
            </html>
        "#;

        let extraction = extract_readable(html);
        assert_eq!(extraction.title.as_deref(), Some("OG Title"));
        assert_eq!(extraction.text.as_deref(), Some("Only body text here."));
    }

    #[test]
    fn pages_without_paragraphs_yield_no_text() {
        let html = "<html><head><title>T</title></head><body><div>bare div</div></body></html>";

        let extraction = extract_readable(html);
        assert_eq!(extraction.title.as_deref(), Some("T"));
        assert!(extraction.text.is_none());
    }
}
