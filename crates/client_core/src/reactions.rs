//! Reaction aggregation.
//!
//! Reactions are stored grouped by emoji. Both wire shapes (one record per user, or pre-grouped
//! buckets) are normalised into [`ReactionSummary`] once, at decode time.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use shared::{
    domain::UserId,
    protocol::{GroupedReaction, ReactionsWire},
};
use tracing::{debug, warn};

const MAX_EMOJI_BYTES: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReactionSummary {
    by_emoji: BTreeMap<String, EmojiReaction>,
}

/// One emoji bucket. The count is always the size of `users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmojiReaction {
    pub emoji: String,
    pub users: BTreeSet<UserId>,
    pub reacted: bool,
}

impl EmojiReaction {
    pub fn count(&self) -> usize {
        self.users.len()
    }
}

impl ReactionSummary {
    pub fn get(&self, emoji: &str) -> Option<&EmojiReaction> {
        self.by_emoji.get(emoji)
    }

    pub fn count(&self, emoji: &str) -> usize {
        self.by_emoji.get(emoji).map_or(0, EmojiReaction::count)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EmojiReaction> {
        self.by_emoji.values()
    }

    pub fn is_empty(&self) -> bool {
        self.by_emoji.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_emoji.len()
    }

    pub fn clear(&mut self) {
        self.by_emoji.clear();
    }

    /// The emoji currently credited to `user`, if any.
    pub fn reaction_of(&self, user: UserId) -> Option<&str> {
        self.by_emoji
            .values()
            .find(|bucket| bucket.users.contains(&user))
            .map(|bucket| bucket.emoji.as_str())
    }

    pub fn total_reactions(&self) -> usize {
        self.by_emoji.values().map(EmojiReaction::count).sum()
    }
}

/// A single server-side reaction mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionOp {
    Add(String),
    Remove(String),
}

impl ReactionOp {
    pub fn emoji(&self) -> &str {
        match self {
            Self::Add(emoji) | Self::Remove(emoji) => emoji,
        }
    }
}

/// Result of an add: whether anything changed, and which emoji the user lost, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOutcome {
    pub changed: bool,
    pub displaced: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReactionAggregator {
    current_user: UserId,
}

impl ReactionAggregator {
    pub fn new(current_user: UserId) -> Self {
        Self { current_user }
    }

    pub fn current_user(&self) -> UserId {
        self.current_user
    }

    /// Credits `emoji` to `user`. A user holds at most one emoji, so any other emoji they held is
    /// removed first. Adding an emoji the user already holds is a no-op.
    pub fn apply_add(&self, summary: &mut ReactionSummary, emoji: &str, user: UserId) -> AddOutcome {
        if summary
            .by_emoji
            .get(emoji)
            .is_some_and(|bucket| bucket.users.contains(&user))
        {
            return AddOutcome::default();
        }

        let displaced = summary.reaction_of(user).map(str::to_string);
        if let Some(previous) = &displaced {
            self.apply_remove(summary, previous, user);
        }

        let bucket = summary
            .by_emoji
            .entry(emoji.to_string())
            .or_insert_with(|| EmojiReaction {
                emoji: emoji.to_string(),
                users: BTreeSet::new(),
                reacted: false,
            });
        bucket.users.insert(user);
        if user == self.current_user {
            bucket.reacted = true;
        }

        AddOutcome {
            changed: true,
            displaced,
        }
    }

    /// Removes `user`'s `emoji` reaction, dropping the bucket when it empties. Returns whether
    /// anything changed.
    pub fn apply_remove(&self, summary: &mut ReactionSummary, emoji: &str, user: UserId) -> bool {
        let Some(bucket) = summary.by_emoji.get_mut(emoji) else {
            return false;
        };
        if !bucket.users.remove(&user) {
            return false;
        }
        if user == self.current_user {
            bucket.reacted = false;
        }
        if bucket.users.is_empty() {
            summary.by_emoji.remove(emoji);
        }
        true
    }

    /// Server operations needed to toggle `emoji` for `user`. Switching emoji is two independent
    /// operations: remove the old, then add the new.
    pub fn plan_toggle(&self, summary: &ReactionSummary, emoji: &str, user: UserId) -> Vec<ReactionOp> {
        match summary.reaction_of(user) {
            Some(existing) if existing == emoji => vec![ReactionOp::Remove(emoji.to_string())],
            Some(existing) => vec![
                ReactionOp::Remove(existing.to_string()),
                ReactionOp::Add(emoji.to_string()),
            ],
            None => vec![ReactionOp::Add(emoji.to_string())],
        }
    }

    /// Applies one op locally. Returns whether the summary changed.
    pub fn apply_op(&self, summary: &mut ReactionSummary, op: &ReactionOp, user: UserId) -> bool {
        match op {
            ReactionOp::Add(emoji) => self.apply_add(summary, emoji, user).changed,
            ReactionOp::Remove(emoji) => self.apply_remove(summary, emoji, user),
        }
    }

    /// Toggles locally and returns the ops the server must see, in order.
    pub fn toggle(&self, summary: &mut ReactionSummary, emoji: &str, user: UserId) -> Vec<ReactionOp> {
        let ops = self.plan_toggle(summary, emoji, user);
        for op in &ops {
            self.apply_op(summary, op, user);
        }
        ops
    }

    /// Reactions a grouped bucket counts without naming the user. They cannot be tracked per
    /// user and are lost on normalization.
    pub fn unattributed(&self, group: &GroupedReaction) -> usize {
        let mut named: BTreeSet<UserId> = group.users.iter().copied().collect();
        if group.reacted {
            named.insert(self.current_user);
        }
        (group.count as usize).saturating_sub(named.len())
    }

    pub fn normalize(&self, wire: ReactionsWire) -> ReactionSummary {
        let mut summary = ReactionSummary::default();
        match wire {
            ReactionsWire::Legacy(records) => {
                for record in records {
                    if let Some(emoji) = normalize_emoji(&record.emoji) {
                        self.apply_add(&mut summary, &emoji, record.user_id);
                    }
                }
            }
            ReactionsWire::Grouped(groups) => {
                for group in groups {
                    let Some(emoji) = normalize_emoji(&group.emoji) else {
                        continue;
                    };
                    let discarded = self.unattributed(&group);
                    if discarded > 0 {
                        warn!(
                            emoji = %emoji,
                            count = group.count,
                            users = group.users.len(),
                            discarded,
                            "reactions: grouped bucket counts reactors it does not name; dropping them"
                        );
                    } else if group.count as usize != group.users.len() {
                        debug!(
                            emoji = %emoji,
                            count = group.count,
                            users = group.users.len(),
                            "reactions: grouped count disagrees with user list; using user list"
                        );
                    }
                    for user in &group.users {
                        self.apply_add(&mut summary, &emoji, *user);
                    }
                    if group.reacted {
                        self.apply_add(&mut summary, &emoji, self.current_user);
                    }
                }
            }
        }
        summary
    }
}

/// Trims and validates reaction content. `+`/`-` map to thumbs up/down.
pub fn normalize_emoji(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    match trimmed {
        "" => None,
        "+" => Some("👍".to_string()),
        "-" => Some("👎".to_string()),
        emoji if emoji.len() > MAX_EMOJI_BYTES => None,
        emoji => Some(emoji.to_string()),
    }
}
