use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use crossterm::style::Stylize;

use crate::config::Config;
use crate::directory::{ChannelKind, Directory};
use crate::filecache::FileCache;
use crate::slack::SlackClient;

/// `channels`: table of the conversations the directory knows about,
/// optionally restricted to one kind.
pub async fn channels(config: Arc<Config>, kind: Option<ChannelKind>) -> Result<()> {
    let client = SlackClient::new(config)?;
    let directory = Directory::new();
    directory
        .load(&client)
        .await
        .context("initial directory load failed")?;

    let rows = match kind {
        Some(kind) => {
            let ids: std::collections::HashSet<String> =
                directory.channel_ids_by_kind(kind).into_iter().collect();
            directory
                .channels()
                .into_iter()
                .filter(|channel| ids.contains(&channel.id))
                .collect()
        }
        None => directory.channels(),
    };

    let mut out = std::io::stdout();
    writeln!(
        out,
        "{}",
        format!(
            "{:<12} {:<24} {:<8} {:<8} {:<8} {:<8} {:<8}",
            "ID", "Name", "group", "im", "mpim", "private", "archived"
        )
        .bold()
    )?;
    for channel in rows {
        writeln!(
            out,
            "{:<12} {:<24} {:<8} {:<8} {:<8} {:<8} {:<8}",
            channel.id,
            channel.name,
            channel.is_group,
            channel.is_im,
            channel.is_mpim,
            channel.is_private,
            channel.is_archived
        )?;
    }
    Ok(())
}

/// `users`: table of every workspace member the directory knows about.
pub async fn users(config: Arc<Config>) -> Result<()> {
    let client = SlackClient::new(config)?;
    let directory = Directory::new();
    directory
        .load(&client)
        .await
        .context("initial directory load failed")?;

    let mut out = std::io::stdout();
    writeln!(
        out,
        "{}",
        format!(
            "{:<12} {:<24} {:<8} {:<8} {:<8} {:<14} {}",
            "ID", "Name", "admin", "bot", "owner", "primary_owner", "tz"
        )
        .bold()
    )?;
    for user in directory.users() {
        writeln!(
            out,
            "{:<12} {:<24} {:<8} {:<8} {:<8} {:<14} {}",
            user.id,
            user.name,
            user.is_admin,
            user.is_bot,
            user.is_owner,
            user.is_primary_owner,
            user.tz.as_deref().unwrap_or("-")
        )?;
    }
    Ok(())
}

pub struct PostArgs {
    pub message: Option<String>,
    pub file: Option<PathBuf>,
    pub thread: Option<String>,
    pub stdin: bool,
    pub code: bool,
}

/// `post`: send a message, or upload and share a file with an optional
/// initial comment.
pub async fn post(config: Arc<Config>, channel_name: &str, args: PostArgs) -> Result<()> {
    let client = SlackClient::new(config)?;
    let directory = Directory::new();
    directory
        .load(&client)
        .await
        .context("initial directory load failed")?;

    let Some(channel_id) = directory.channel_id_by_name(channel_name) else {
        bail!("channel '{channel_name}' could not be found");
    };

    let text = assemble_text(&args)?;

    if let Some(path) = &args.file {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("upload.bin");
        let comment = (!text.is_empty()).then_some(text.as_str());
        client
            .upload_file(&channel_id, filename, &data, comment, args.thread.as_deref())
            .await?;
    } else {
        if text.is_empty() {
            bail!("no message text given; use --message, --stdin or both");
        }
        client
            .post_message(&channel_id, &text, args.thread.as_deref())
            .await?;
    }
    Ok(())
}

fn assemble_text(args: &PostArgs) -> Result<String> {
    let mut parts = Vec::new();
    if let Some(message) = &args.message {
        parts.push(message.clone());
    }
    if args.stdin {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read message from stdin")?;
        parts.push(text);
    }
    let mut text = parts.concat();
    if args.code && !text.is_empty() {
        text = format!("```{text}```");
    }
    Ok(text)
}

/// `files list`: table of everything in the workspace's file cache.
pub async fn files_list(workspace: &str) -> Result<()> {
    let cache_path = crate::config::cache_path(workspace)?;
    let cache = FileCache::open(&cache_path)
        .await
        .with_context(|| format!("failed to open file cache at {}", cache_path.display()))?;

    let mut out = std::io::stdout();
    writeln!(
        out,
        "{}",
        format!(
            "{:<12} {:<26} {:<24} {:<18} {}",
            "ID", "Cached", "Name", "MimeType", "Title"
        )
        .bold()
    )?;
    for row in cache.list().await? {
        let cached = DateTime::from_timestamp(row.cached as i64, 0)
            .map(|datetime| datetime.with_timezone(&Local).to_rfc3339())
            .unwrap_or_else(|| row.cached.to_string());
        writeln!(
            out,
            "{:<12} {:<26} {:<24} {:<18} {}",
            row.file_id, cached, row.name, row.mimetype, row.title
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_flag_fences_the_message() {
        let args = PostArgs {
            message: Some("let x = 1;".to_string()),
            file: None,
            thread: None,
            stdin: false,
            code: true,
        };
        assert_eq!(assemble_text(&args).unwrap(), "```let x = 1;```");
    }

    #[test]
    fn empty_parts_assemble_to_empty_text() {
        let args = PostArgs {
            message: None,
            file: None,
            thread: None,
            stdin: false,
            code: true,
        };
        assert_eq!(assemble_text(&args).unwrap(), "");
    }
}
