use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::slack::{SlackApi, SlackError};

/// One conversation from `conversations.list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_channel: bool,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub is_im: bool,
    #[serde(default)]
    pub is_mpim: bool,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_archived: bool,
}

/// One member from `users.list`.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub is_owner: bool,
    #[serde(default)]
    pub is_primary_owner: bool,
    #[serde(default)]
    pub tz: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Channel,
    Group,
    Im,
    Mpim,
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "channel" => Ok(Self::Channel),
            "group" => Ok(Self::Group),
            "im" => Ok(Self::Im),
            "mpim" => Ok(Self::Mpim),
            other => Err(format!(
                "unknown channel kind '{other}' (expected channel, group, im or mpim)"
            )),
        }
    }
}

#[derive(Default)]
struct DirectoryInner {
    channels: HashMap<String, ChannelRecord>,
    users: HashMap<String, UserRecord>,
}

/// Channel and user lookup tables, populated by one full snapshot fetch and
/// read-only afterwards. `load` swaps both maps under a single write lock, so
/// readers observe either the old complete snapshot or the new one.
#[derive(Default)]
pub struct Directory {
    inner: RwLock<DirectoryInner>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full paginated fetch of channels and users. Archived channels and
    /// deleted users are excluded; a fetch failure is fatal to the caller.
    pub async fn load(&self, api: &dyn SlackApi) -> Result<(), SlackError> {
        let raw_channels = api.list_channels().await?;
        let raw_users = api.list_users().await?;

        let mut channels = HashMap::new();
        for value in &raw_channels {
            if value
                .get("is_archived")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                continue;
            }
            match serde_json::from_value::<ChannelRecord>(value.clone()) {
                Ok(record) => {
                    channels.insert(record.id.clone(), record);
                }
                Err(err) => warn!(payload = %value, "skipping malformed channel record: {err}"),
            }
        }

        let mut users = HashMap::new();
        for value in &raw_users {
            if value
                .get("deleted")
                .and_then(Value::as_bool)
                .unwrap_or(false)
            {
                continue;
            }
            match serde_json::from_value::<UserRecord>(value.clone()) {
                Ok(record) => {
                    users.insert(record.id.clone(), record);
                }
                Err(err) => warn!(payload = %value, "skipping malformed user record: {err}"),
            }
        }

        info!(
            channels = channels.len(),
            users = users.len(),
            "directory loaded"
        );

        let mut inner = self.inner.write();
        inner.channels = channels;
        inner.users = users;
        Ok(())
    }

    pub fn channel(&self, id: &str) -> Option<ChannelRecord> {
        self.inner.read().channels.get(id).cloned()
    }

    pub fn user(&self, id: &str) -> Option<UserRecord> {
        self.inner.read().users.get(id).cloned()
    }

    /// Case-insensitive exact match on the display name. Duplicate names are
    /// not an error; the first match wins.
    pub fn channel_id_by_name(&self, name: &str) -> Option<String> {
        let search = name.to_lowercase();
        self.inner
            .read()
            .channels
            .iter()
            .find(|(_, record)| record.name.to_lowercase() == search)
            .map(|(id, _)| id.clone())
    }

    pub fn channel_ids_by_kind(&self, kind: ChannelKind) -> Vec<String> {
        self.inner
            .read()
            .channels
            .values()
            .filter(|record| match kind {
                ChannelKind::Channel => record.is_channel,
                ChannelKind::Group => record.is_group,
                ChannelKind::Im => record.is_im,
                ChannelKind::Mpim => record.is_mpim,
            })
            .map(|record| record.id.clone())
            .collect()
    }

    pub fn all_channel_ids(&self) -> Vec<String> {
        self.inner.read().channels.keys().cloned().collect()
    }

    /// Every channel record, sorted by display name for table output.
    pub fn channels(&self) -> Vec<ChannelRecord> {
        let mut records: Vec<_> = self.inner.read().channels.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Every user record, sorted by display name for table output.
    pub fn users(&self) -> Vec<UserRecord> {
        let mut records: Vec<_> = self.inner.read().users.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::slack::testing::MockSlackApi;

    fn mock_api() -> MockSlackApi {
        MockSlackApi {
            channels: vec![
                json!({
                    "id": "C100",
                    "name": "General",
                    "is_channel": true,
                    "is_private": false,
                    "is_archived": false
                }),
                json!({
                    "id": "C200",
                    "name": "random",
                    "is_channel": true,
                    "is_archived": false
                }),
                json!({
                    "id": "C300",
                    "name": "graveyard",
                    "is_channel": true,
                    "is_archived": true
                }),
                json!({
                    "id": "D100",
                    "is_im": true
                }),
            ],
            users: vec![
                json!({
                    "id": "U100",
                    "name": "alice",
                    "is_admin": true,
                    "tz": "Europe/Berlin"
                }),
                json!({
                    "id": "U200",
                    "name": "ghost",
                    "deleted": true
                }),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn load_excludes_archived_channels_and_deleted_users() {
        let directory = Directory::new();
        directory.load(&mock_api()).await.expect("load succeeds");

        assert!(directory.channel("C100").is_some());
        assert!(directory.channel("C300").is_none());
        assert!(directory.user("U100").is_some());
        assert!(directory.user("U200").is_none());
    }

    #[tokio::test]
    async fn name_lookup_is_case_insensitive() {
        let directory = Directory::new();
        directory.load(&mock_api()).await.expect("load succeeds");

        assert_eq!(
            directory.channel_id_by_name("general"),
            Some("C100".to_string())
        );
        assert_eq!(
            directory.channel_id_by_name("GENERAL"),
            Some("C100".to_string())
        );
        assert_eq!(directory.channel_id_by_name("missing"), None);
    }

    #[tokio::test]
    async fn kind_filter_selects_matching_channels() {
        let directory = Directory::new();
        directory.load(&mock_api()).await.expect("load succeeds");

        let ims = directory.channel_ids_by_kind(ChannelKind::Im);
        assert_eq!(ims, vec!["D100".to_string()]);

        let mut channels = directory.channel_ids_by_kind(ChannelKind::Channel);
        channels.sort();
        assert_eq!(channels, vec!["C100".to_string(), "C200".to_string()]);
    }

    #[tokio::test]
    async fn malformed_records_are_skipped_not_fatal() {
        let api = MockSlackApi {
            channels: vec![
                json!({ "name": "no-id-here" }),
                json!({ "id": "C100", "name": "general", "is_channel": true }),
            ],
            ..Default::default()
        };
        let directory = Directory::new();
        directory.load(&api).await.expect("load succeeds");
        assert_eq!(directory.all_channel_ids(), vec!["C100".to_string()]);
    }

    #[test]
    fn channel_kind_parses_from_cli_names() {
        assert_eq!("im".parse::<ChannelKind>(), Ok(ChannelKind::Im));
        assert_eq!("mpim".parse::<ChannelKind>(), Ok(ChannelKind::Mpim));
        assert!("direct".parse::<ChannelKind>().is_err());
    }

    #[tokio::test]
    async fn fetch_failure_propagates() {
        let api = MockSlackApi {
            fail_channels: true,
            ..Default::default()
        };
        let directory = Directory::new();
        assert!(directory.load(&api).await.is_err());
    }
}
