//! Reaction tally over a key-value store.
//!
//! Two records per post:
//! - `c:<post>` holds the counts per reaction kind.
//! - `u:<post>:<date>:<identity>` holds the kinds one identity used that day,
//!   and expires after [`MARKER_TTL`].
//!
//! Recording is a read-modify-write across two keys with no transaction.
//! Concurrent increments of the same post can lose updates, and a failure
//! between the two writes can leave the marker and the counts out of step.

use edge_core::date_bucket::{date_bucket, BucketZone, Clock, SystemClock};
use edge_core::identity::CallerFingerprint;
use edge_core::kv::KvStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Longer than a day so timezone and cache skew cannot reopen the window.
pub const MARKER_TTL: Duration = Duration::from_secs(60 * 60 * 48);

pub type Counts = BTreeMap<String, u64>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Me {
    pub today: BTreeMap<String, bool>,
}

impl Me {
    pub fn has_reacted(&self, reaction: &str) -> bool {
        self.today.get(reaction).copied().unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSnapshot {
    pub post_id: String,
    pub date: String,
    pub counts: Counts,
    pub me: Me,
}

#[derive(Debug, Error)]
pub enum TallyError {
    #[error("post id is required")]
    MissingPost,
    #[error("post id and reaction are required")]
    MissingFields,
    #[error("reaction already recorded today")]
    AlreadyReactedToday,
    #[error("kv store failure: {0}")]
    Store(#[from] anyhow::Error),
}

pub fn counts_key(post_id: &str) -> String {
    format!("c:{post_id}")
}

pub fn marker_key(post_id: &str, date: &str, identity: &str) -> String {
    format!("u:{post_id}:{date}:{identity}")
}

/// Malformed records read as empty; entries that are not counts are dropped.
pub fn decode_counts(raw: Option<&str>) -> Counts {
    let Some(Value::Object(map)) = raw.and_then(|raw| serde_json::from_str::<Value>(raw).ok())
    else {
        return Counts::new();
    };
    map.into_iter()
        .filter_map(|(kind, count)| count.as_u64().map(|count| (kind, count)))
        .collect()
}

pub fn decode_me(raw: Option<&str>) -> Me {
    let today: BTreeMap<String, bool> = raw
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|value| match value.get("today") {
            Some(Value::Object(map)) => Some(
                map.iter()
                    .filter(|(_, used)| used.as_bool() == Some(true))
                    .map(|(kind, _)| (kind.clone(), true))
                    .collect(),
            ),
            _ => None,
        })
        .unwrap_or_default();
    Me { today }
}

pub struct ReactionTally {
    store: Arc<dyn KvStore>,
    salt: String,
    zone: BucketZone,
    clock: Arc<dyn Clock>,
}

impl ReactionTally {
    pub fn new(store: Arc<dyn KvStore>, salt: impl Into<String>, zone: BucketZone) -> Self {
        Self {
            store,
            salt: salt.into(),
            zone,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn today(&self) -> String {
        date_bucket(self.zone, self.clock.now())
    }

    pub async fn read(
        &self,
        post_id: &str,
        caller: &CallerFingerprint,
    ) -> Result<ReactionSnapshot, TallyError> {
        if post_id.is_empty() {
            return Err(TallyError::MissingPost);
        }

        let date = self.today();
        let identity = caller.identity(&self.salt);
        let (counts, me) = tokio::try_join!(
            self.load_counts(post_id),
            self.load_me(post_id, &date, &identity)
        )?;

        Ok(ReactionSnapshot {
            post_id: post_id.to_string(),
            date,
            counts,
            me,
        })
    }

    pub async fn record(
        &self,
        post_id: &str,
        reaction: &str,
        caller: &CallerFingerprint,
    ) -> Result<ReactionSnapshot, TallyError> {
        if post_id.is_empty() || reaction.is_empty() {
            return Err(TallyError::MissingFields);
        }

        let date = self.today();
        let identity = caller.identity(&self.salt);

        let mut me = self.load_me(post_id, &date, &identity).await?;
        if me.has_reacted(reaction) {
            return Err(TallyError::AlreadyReactedToday);
        }
        me.today.insert(reaction.to_string(), true);

        let mut counts = self.load_counts(post_id).await?;
        let count = counts.entry(reaction.to_string()).or_insert(0);
        *count = count.saturating_add(1);

        let counts_json = serde_json::to_string(&counts).map_err(anyhow::Error::from)?;
        let me_json = serde_json::to_string(&me).map_err(anyhow::Error::from)?;
        let counts_key = counts_key(post_id);
        let marker_key = marker_key(post_id, &date, &identity);

        tokio::try_join!(
            self.store.put(&marker_key, &me_json, Some(MARKER_TTL)),
            self.store.put(&counts_key, &counts_json, None)
        )?;

        tracing::info!(post_id, reaction, %date, "reaction recorded");

        Ok(ReactionSnapshot {
            post_id: post_id.to_string(),
            date,
            counts,
            me,
        })
    }

    async fn load_counts(&self, post_id: &str) -> anyhow::Result<Counts> {
        let raw = self.store.get(&counts_key(post_id)).await?;
        Ok(decode_counts(raw.as_deref()))
    }

    async fn load_me(&self, post_id: &str, date: &str, identity: &str) -> anyhow::Result<Me> {
        let raw = self.store.get(&marker_key(post_id, date, identity)).await?;
        Ok(decode_me(raw.as_deref()))
    }
}
