use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{AllowList, ChannelsConfig, Config};
use crate::directory::Directory;
use crate::filecache::FileCache;
use crate::render::{self, Attachment, MessageEvent, RenderError};
use crate::slack::{EventHandler, SlackApi, SlackClient, SocketEvent};

/// Work queued between the socket task and the display worker.
#[derive(Debug)]
pub enum WorkItem {
    Display {
        channel_id: String,
        event: Box<MessageEvent>,
        raw: Value,
    },
}

/// The derived listen set: configured allow-list minus deny-list, resolved
/// to channel IDs at startup. Immutable thereafter.
pub struct FilterPolicy {
    listening: HashSet<String>,
}

impl FilterPolicy {
    pub fn from_config(channels: &ChannelsConfig, directory: &Directory) -> Self {
        let allow: HashSet<String> = match &channels.listen_allow {
            AllowList::Wildcard(_) => directory.all_channel_ids().into_iter().collect(),
            AllowList::Names(names) => resolve_names(names, directory),
        };
        let deny = resolve_names(&channels.listen_deny, directory);
        let listening = allow.difference(&deny).cloned().collect();
        Self { listening }
    }

    /// Direct messages are always processed; channel messages only when the
    /// channel survived allow ∖ deny.
    pub fn admits(&self, event: &MessageEvent) -> bool {
        if event.is_direct_message() {
            return true;
        }
        event
            .channel
            .as_deref()
            .is_some_and(|id| self.listening.contains(id))
    }
}

fn resolve_names(names: &[String], directory: &Directory) -> HashSet<String> {
    names
        .iter()
        .filter_map(|name| {
            let id = directory.channel_id_by_name(name);
            if id.is_none() {
                warn!("channel '{name}' in the filter configuration is unknown");
            }
            id
        })
        .collect()
}

/// Runs on the socket task: classify, filter, enqueue. Never blocks, so the
/// transport's keep-alive and envelope acks are never starved.
pub struct Ingestor {
    policy: FilterPolicy,
    queue: mpsc::UnboundedSender<WorkItem>,
}

impl Ingestor {
    pub fn new(policy: FilterPolicy, queue: mpsc::UnboundedSender<WorkItem>) -> Self {
        Self { policy, queue }
    }
}

impl EventHandler for Ingestor {
    fn on_event(&self, event: SocketEvent) {
        match event {
            SocketEvent::MessageCreated { event, raw } => {
                let Some(channel_id) = event.channel.clone() else {
                    warn!(payload = %raw, "dropping message event without channel");
                    return;
                };
                if !self.policy.admits(&event) {
                    debug!("dropping message for filtered channel {channel_id}");
                    return;
                }
                let item = WorkItem::Display {
                    channel_id,
                    event,
                    raw,
                };
                if self.queue.send(item).is_err() {
                    warn!("display worker has stopped; dropping message");
                }
            }
            SocketEvent::MessageMutated => debug!("ignoring message mutation event"),
            SocketEvent::FileShared | SocketEvent::FileCreated | SocketEvent::Other => {}
        }
    }
}

/// Tracks the conversation whose banner is currently on screen. Banner
/// decisions are purely a function of this ID and the incoming one.
#[derive(Default)]
struct BannerTracker {
    current: Option<String>,
}

impl BannerTracker {
    fn should_emit(&mut self, conversation_id: &str) -> bool {
        if self.current.as_deref() == Some(conversation_id) {
            return false;
        }
        self.current = Some(conversation_id.to_string());
        true
    }
}

/// Single consumer of the work queue. Serializing all terminal output and
/// all cache writes through one task removes any need for locks on either.
pub struct DisplayWorker {
    directory: Arc<Directory>,
    cache: FileCache,
    api: Arc<dyn SlackApi>,
    no_files: bool,
    banners: BannerTracker,
    out: Box<dyn Write + Send>,
}

impl DisplayWorker {
    pub fn new(
        directory: Arc<Directory>,
        cache: FileCache,
        api: Arc<dyn SlackApi>,
        no_files: bool,
    ) -> Self {
        Self {
            directory,
            cache,
            api,
            no_files,
            banners: BannerTracker::default(),
            out: Box::new(std::io::stdout()),
        }
    }

    #[cfg(test)]
    fn with_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.out = out;
        self
    }

    /// Drain the queue in arrival order until every sender is gone. One bad
    /// item is logged and skipped; the loop itself never stops early.
    pub async fn run(mut self, mut queue: mpsc::UnboundedReceiver<WorkItem>) {
        while let Some(item) = queue.recv().await {
            let WorkItem::Display {
                channel_id,
                event,
                raw,
            } = item;

            if let Err(err) = self.display(&channel_id, &event, &raw).await {
                error!(payload = %raw, "failed to display message: {err:#}");
            }

            // Best effort: the local display already succeeded and is the
            // user-visible source of truth.
            if let Err(err) = self.api.mark_read(&channel_id, &event.ts).await {
                warn!(
                    "failed to mark channel {channel_id} read at {}: {err}",
                    event.ts
                );
            }

            let _ = self.out.flush();
        }
    }

    async fn display(
        &mut self,
        channel_id: &str,
        event: &MessageEvent,
        raw: &Value,
    ) -> Result<()> {
        let conversation_id = if event.is_direct_message() {
            event
                .user
                .clone()
                .ok_or_else(|| RenderError::MissingField {
                    field: "user",
                    payload: raw.clone(),
                })?
        } else {
            channel_id.to_string()
        };

        if self.banners.should_emit(&conversation_id) {
            let name = self.conversation_name(&conversation_id, event);
            writeln!(self.out, "{}", render::banner_line(&name))?;
        }

        let rendered = render::render(event);
        if event.kind != "message" {
            // Topic changes, joins and the like render to nothing.
            return Ok(());
        }

        let user_id = event
            .user
            .as_deref()
            .ok_or_else(|| RenderError::MissingField {
                field: "user",
                payload: raw.clone(),
            })?;
        let user_name = self
            .directory
            .user(user_id)
            .map(|user| user.name)
            .unwrap_or_else(|| user_id.to_string());

        let header = render::format_header(&user_name, &event.ts, true);
        writeln!(self.out, "{header} {}", rendered.body)?;

        if self.no_files {
            return Ok(());
        }

        for attachment in &rendered.attachments {
            match attachment {
                Attachment::External { name, permalink } => {
                    writeln!(self.out, "{}", render::external_attachment_line(name, permalink))?;
                }
                Attachment::Stored { file, image } => {
                    let Some(_bytes) = self.cache.fetch_file(self.api.as_ref(), file).await
                    else {
                        // Unavailable, not an error: skip the attachment.
                        continue;
                    };
                    writeln!(self.out, "{}", render::stored_attachment_line(file, *image))?;
                }
            }
        }

        Ok(())
    }

    fn conversation_name(&self, conversation_id: &str, event: &MessageEvent) -> String {
        if event.is_direct_message() {
            let user_name = self
                .directory
                .user(conversation_id)
                .map(|user| user.name)
                .unwrap_or_else(|| conversation_id.to_string());
            format!("DM from {user_name}")
        } else {
            self.directory
                .channel(conversation_id)
                .map(|channel| channel.name)
                .unwrap_or_else(|| conversation_id.to_string())
        }
    }
}

/// The `listen` subcommand: load the directory, start the worker, connect
/// Socket Mode, and on interrupt drain the queue before exiting.
pub async fn run(config: Arc<Config>, workspace: &str, no_files: bool) -> Result<()> {
    config.require_app_token()?;
    let client = Arc::new(SlackClient::new(config.clone())?);

    info!("loading workspace directory");
    let directory = Arc::new(Directory::new());
    directory
        .load(client.as_ref())
        .await
        .context("initial directory load failed")?;

    let policy = FilterPolicy::from_config(&config.channels, &directory);
    let cache_path = crate::config::cache_path(workspace)?;
    let cache = FileCache::open(&cache_path)
        .await
        .with_context(|| format!("failed to open file cache at {}", cache_path.display()))?;

    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let worker = DisplayWorker::new(directory, cache, client.clone(), no_files);
    let worker_handle = tokio::spawn(worker.run(queue_rx));

    let handler: Arc<dyn EventHandler> = Arc::new(Ingestor::new(policy, queue_tx));
    let socket_client = client.clone();
    let socket_handle = tokio::spawn(async move {
        if let Err(err) = socket_client.run_socket_mode(handler).await {
            error!("socket mode loop failed: {err}");
        }
    });

    info!("listening; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;

    info!("interrupt received, draining display queue");
    // Dropping the socket task drops the queue sender with it; the worker
    // drains whatever is left and then exits.
    socket_handle.abort();
    let _ = socket_handle.await;
    worker_handle.await.context("display worker task failed")?;

    Ok(())
}
