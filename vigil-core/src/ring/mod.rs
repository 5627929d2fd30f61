//! Round-robin rings: named, persisted rotations of item names shared by all
//! backends.
//!
//! Every backend subscribed to a ring runs a manage task and a produce task
//! per subscription. Manage tasks race once per scheduling interval to
//! advance the rotation cursor inside a transaction; the winner publishes a
//! change notification on commit. Produce tasks re-read the window whenever
//! that notification arrives and hand it to their caller.
//!
//! Members are ordered by name. The cursor is the name of the next member to
//! serve, so every member is visited once before any repeats.

mod postgres;
mod schedule;

pub use postgres::PostgresRing;
pub use schedule::Schedule;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{CoordError, Result};

/// A rotation subscription: serve `items` members every time `schedule`
/// fires.
#[derive(Clone, Debug)]
pub struct RingSubscription {
    pub name: String,
    pub items: usize,
    pub schedule: Schedule,
}

impl RingSubscription {
    pub fn new(name: impl Into<String>, items: usize, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            items,
            schedule,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CoordError::NotValid(
                "ring subscription name must not be empty".into(),
            ));
        }
        if self.items == 0 {
            return Err(CoordError::NotValid(format!(
                "ring subscription {} must request at least one item",
                self.name
            )));
        }
        self.schedule.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RingEvent {
    /// The current rotation window. Empty when the ring has no members.
    Trigger { values: Vec<String> },
    /// Reading the window failed; the subscription keeps running.
    Error { message: String },
}

/// What `remove` does with the item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RemovalMode {
    /// Drop the item from this ring only.
    #[default]
    Membership,
    /// Delete the underlying entity, which removes it from every ring.
    DeleteEntity,
}

#[async_trait]
pub trait RotationRing: Send + Sync {
    /// Add a known entity to the ring. With a TTL the membership expires
    /// unless refreshed by another `add`.
    async fn add(&self, item: &str, ttl: Option<Duration>) -> Result<()>;

    async fn remove(&self, item: &str, mode: RemovalMode) -> Result<()>;

    async fn is_empty(&self) -> Result<bool>;

    /// Start serving `subscription`. The stream yields one window at startup
    /// and one per rotation advance until `scope` ends.
    async fn subscribe(
        &self,
        scope: &CancellationToken,
        subscription: RingSubscription,
    ) -> Result<mpsc::Receiver<RingEvent>>;
}

/// Position the cursor resolves to: the first member at or after `pointer`,
/// wrapping to the start.
pub(crate) fn cursor_index(members: &[String], pointer: Option<&str>) -> usize {
    match pointer {
        None => 0,
        Some(pointer) => members
            .iter()
            .position(|member| member.as_str() >= pointer)
            .unwrap_or(0),
    }
}

/// `items` members starting at the cursor, repeating cyclically when the
/// ring holds fewer than `items` members.
pub(crate) fn rotation_window(
    members: &[String],
    pointer: Option<&str>,
    items: usize,
) -> Vec<String> {
    if members.is_empty() {
        return Vec::new();
    }
    let start = cursor_index(members, pointer);
    (0..items)
        .map(|offset| members[(start + offset) % members.len()].clone())
        .collect()
}

/// Cursor after serving `items` members from the current position.
pub(crate) fn advance_cursor(
    members: &[String],
    pointer: Option<&str>,
    items: usize,
) -> Option<String> {
    if members.is_empty() {
        return None;
    }
    let start = cursor_index(members, pointer);
    Some(members[(start + items) % members.len()].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn serve(members: &[String], rounds: usize, items: usize) -> Vec<Vec<String>> {
        let mut pointer: Option<String> = None;
        let mut windows = Vec::new();
        for _ in 0..rounds {
            windows.push(rotation_window(members, pointer.as_deref(), items));
            pointer = advance_cursor(members, pointer.as_deref(), items);
        }
        windows
    }

    #[test]
    fn single_item_rotation_visits_every_member_in_order() {
        let members = names(&["mulder", "scully", "skinner"]);
        let windows = serve(&members, 4, 1);
        assert_eq!(
            windows,
            vec![
                names(&["mulder"]),
                names(&["scully"]),
                names(&["skinner"]),
                names(&["mulder"]),
            ]
        );
    }

    #[test]
    fn oversized_window_pads_cyclically() {
        let members = names(&["byers", "frohike"]);
        let windows = serve(&members, 2, 3);
        assert_eq!(
            windows,
            vec![
                names(&["byers", "frohike", "byers"]),
                names(&["frohike", "byers", "frohike"]),
            ]
        );
    }

    #[test]
    fn cursor_on_removed_member_resolves_to_next_name() {
        let members = names(&["byers", "langly", "mulder"]);
        assert_eq!(cursor_index(&members, Some("frohike")), 1);
        assert_eq!(
            rotation_window(&members, Some("frohike"), 2),
            names(&["langly", "mulder"])
        );
    }

    #[test]
    fn cursor_past_last_member_wraps() {
        let members = names(&["byers", "frohike"]);
        assert_eq!(cursor_index(&members, Some("skinner")), 0);
        assert_eq!(advance_cursor(&members, Some("skinner"), 1).as_deref(), Some("frohike"));
    }

    #[test]
    fn empty_ring_has_empty_window_and_no_cursor() {
        assert!(rotation_window(&[], None, 3).is_empty());
        assert_eq!(advance_cursor(&[], Some("mulder"), 1), None);
    }

    #[test]
    fn full_rotation_never_repeats_before_covering_all() {
        let members = names(&["a", "b", "c", "d", "e"]);
        let windows = serve(&members, 5, 2);
        let served: Vec<String> = windows.into_iter().flatten().collect();
        // Five windows of two cover the ring exactly twice.
        for member in &members {
            assert_eq!(served.iter().filter(|s| *s == member).count(), 2);
        }
        assert_eq!(&served[..5], &members[..]);
    }

    #[test]
    fn subscription_validation() {
        let schedule = Schedule::interval(Duration::from_secs(1));
        assert!(RingSubscription::new("check", 1, schedule.clone()).validate().is_ok());
        assert!(RingSubscription::new("check", 0, schedule.clone()).validate().is_err());
        assert!(RingSubscription::new(" ", 1, schedule).validate().is_err());
    }
}
