use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::directory::Directory;
use crate::render::{self, Attachment, MessageEvent};
use crate::slack::{SlackApi, SlackClient};

enum PagerState {
    Start,
    Next(String),
    Done,
}

/// Explicit cursor walk over `conversations.history`. A page that carries a
/// non-empty cursor continues the walk; an absent or empty cursor ends it; a
/// malformed page aborts the whole fetch.
pub struct HistoryPager {
    channel_id: String,
    oldest: f64,
    state: PagerState,
}

impl HistoryPager {
    pub fn new(channel_id: impl Into<String>, oldest: f64) -> Self {
        Self {
            channel_id: channel_id.into(),
            oldest,
            state: PagerState::Start,
        }
    }

    /// The next page of messages (newest first), or `None` once exhausted.
    pub async fn next_page(&mut self, api: &dyn SlackApi) -> Result<Option<Vec<Value>>> {
        let cursor = match &self.state {
            PagerState::Start => None,
            PagerState::Next(cursor) => Some(cursor.clone()),
            PagerState::Done => return Ok(None),
        };

        let page = match api
            .history_page(&self.channel_id, self.oldest, cursor.as_deref())
            .await
        {
            Ok(page) => page,
            Err(err) => {
                self.state = PagerState::Done;
                return Err(err).context("history page fetch failed");
            }
        };

        self.state = match page.next_cursor {
            Some(next) => PagerState::Next(next),
            None => PagerState::Done,
        };
        Ok(Some(page.messages))
    }
}

/// The `history` subcommand: fetch `days` worth of messages from one channel
/// and print them oldest to newest.
pub async fn run(config: Arc<Config>, channel_name: &str, days: i64) -> Result<()> {
    let client = Arc::new(SlackClient::new(config.clone())?);
    let directory = Directory::new();
    directory
        .load(client.as_ref())
        .await
        .context("initial directory load failed")?;

    let Some(channel_id) = directory.channel_id_by_name(channel_name) else {
        bail!("channel '{channel_name}' could not be found");
    };

    let oldest = (Utc::now() - Duration::days(days)).timestamp() as f64;
    let mut pager = HistoryPager::new(&channel_id, oldest);

    // Pages arrive newest-first; collect them all, then reverse once so the
    // terminal reads oldest to newest.
    let mut messages = Vec::new();
    while let Some(page) = pager.next_page(client.as_ref()).await? {
        messages.extend(page);
    }
    messages.reverse();

    let mut out = std::io::stdout();
    for message in &messages {
        match serde_json::from_value::<MessageEvent>(message.clone()) {
            Ok(event) => print_history_item(&mut out, &directory, &event)?,
            Err(err) => warn!(payload = %message, "skipping malformed history item: {err}"),
        }
    }
    Ok(())
}

fn print_history_item(
    out: &mut impl Write,
    directory: &Directory,
    event: &MessageEvent,
) -> Result<()> {
    let rendered = render::render(event);
    if event.kind != "message" {
        return Ok(());
    }

    let user_id = event.user.as_deref().unwrap_or("unknown");
    let user_name = directory
        .user(user_id)
        .map(|user| user.name)
        .unwrap_or_else(|| user_id.to_string());

    let header = render::format_header(&user_name, &event.ts, false);
    writeln!(out, "{header} {}", rendered.body)?;

    // History never fetches attachment bytes; it only points at them.
    for attachment in &rendered.attachments {
        match attachment {
            Attachment::External { name, permalink } => {
                writeln!(out, "{}", render::external_attachment_line(name, permalink))?;
            }
            Attachment::Stored { file, image } => {
                writeln!(out, "{}", render::stored_attachment_line(file, *image))?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::assert_ok;

    use super::*;
    use crate::slack::HistoryPage;
    use crate::slack::testing::MockSlackApi;

    fn page(ids: &[&str], next_cursor: Option<&str>) -> HistoryPage {
        HistoryPage {
            messages: ids
                .iter()
                .map(|ts| json!({ "type": "message", "user": "U100", "ts": ts }))
                .collect(),
            next_cursor: next_cursor.map(ToOwned::to_owned),
        }
    }

    #[tokio::test]
    async fn single_page_without_cursor_terminates() {
        let api = MockSlackApi {
            pages: vec![page(&["3.0", "2.0", "1.0"], None)].into(),
            ..Default::default()
        };
        let mut pager = HistoryPager::new("C100", 0.0);

        let first = assert_ok!(pager.next_page(&api).await);
        assert_eq!(first.map(|messages| messages.len()), Some(3));
        assert!(pager.next_page(&api).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cursor_chains_pages_in_order() {
        let api = MockSlackApi {
            pages: vec![
                page(&["6.0", "5.0"], Some("cursor-1")),
                page(&["4.0", "3.0"], Some("cursor-2")),
                page(&["2.0", "1.0"], None),
            ]
            .into(),
            ..Default::default()
        };
        let mut pager = HistoryPager::new("C100", 0.0);

        let mut collected = Vec::new();
        while let Some(page) = pager.next_page(&api).await.unwrap() {
            collected.extend(page);
        }
        let timestamps: Vec<&str> = collected
            .iter()
            .map(|message| message.get("ts").and_then(Value::as_str).unwrap())
            .collect();
        assert_eq!(timestamps, vec!["6.0", "5.0", "4.0", "3.0", "2.0", "1.0"]);
    }

    #[tokio::test]
    async fn fetch_failure_aborts_the_walk() {
        // The mock errors once its scripted pages run out.
        let api = MockSlackApi {
            pages: vec![page(&["2.0"], Some("cursor-1"))].into(),
            ..Default::default()
        };
        let mut pager = HistoryPager::new("C100", 0.0);

        assert!(pager.next_page(&api).await.unwrap().is_some());
        assert!(pager.next_page(&api).await.is_err());
        // Aborted: the pager does not retry after a hard failure.
        assert!(pager.next_page(&api).await.unwrap().is_none());
    }
}
