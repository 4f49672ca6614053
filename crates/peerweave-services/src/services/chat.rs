//! Chat room rendezvous.
//!
//! Rooms remember the ids of recent messages. A connection challenge lets a
//! peer prove it saw one of those messages without naming the room: the
//! sender folds its own location id, the room id and a fresh message id into
//! a 64-bit code, and the receiver recomputes candidates from its own rooms
//! using the sender's location id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;

use peerweave_core::crypto::challenge::challenge_code;
use peerweave_core::item::{service_type, ServiceInfo};
use peerweave_core::{Item, LocationId};

use crate::connection::PeerConnection;
use crate::service::{Service, ServiceContext};

/// How long a message id may be used for an outgoing challenge.
pub const CHALLENGE_MAX_AGE: Duration = Duration::from_secs(30);
/// Extra age tolerated when checking an incoming challenge.
pub const CHALLENGE_GRACE: Duration = Duration::from_secs(5);
/// Message ids older than this are forgotten.
pub const MESSAGE_LIFETIME: Duration = Duration::from_secs(1200);

// ── Message cache ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MessageCache {
    messages: HashMap<u64, Instant>,
}

impl MessageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: u64, now: Instant) {
        self.messages.insert(id, now);
    }

    /// Whether `id` was seen before. A known id has its time refreshed so
    /// echoes keep it alive.
    pub fn exists(&mut self, id: u64, now: Instant) -> bool {
        match self.messages.get_mut(&id) {
            Some(seen) => {
                *seen = now;
                true
            }
            None => false,
        }
    }

    /// A random id not already in the cache. Zero is never returned.
    pub fn new_message_id(&self) -> u64 {
        let mut rng = rand::thread_rng();
        loop {
            let id: u64 = rng.gen();
            if id != 0 && !self.messages.contains_key(&id) {
                return id;
            }
        }
    }

    /// The newest message young enough for an outgoing challenge.
    pub fn recent_message(&self, now: Instant) -> Option<u64> {
        self.messages
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) < CHALLENGE_MAX_AGE)
            .max_by_key(|(_, seen)| **seen)
            .map(|(&id, _)| id)
    }

    /// Whether `code` matches any message young enough, for `location` in
    /// room `room_id`.
    pub fn has_challenge(&self, location: &LocationId, room_id: u64, code: u64, now: Instant) -> bool {
        self.messages.iter().any(|(&id, &seen)| {
            now.saturating_duration_since(seen) < CHALLENGE_MAX_AGE + CHALLENGE_GRACE
                && challenge_code(location.as_bytes(), room_id, id) == code
        })
    }

    /// Drop ids older than [`MESSAGE_LIFETIME`].
    pub fn purge(&mut self, now: Instant) {
        self.messages.retain(|_, seen| now.saturating_duration_since(*seen) <= MESSAGE_LIFETIME);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

pub struct ChatService {
    own: LocationId,
    rooms: Arc<DashMap<u64, MessageCache>>,
    shared: Arc<DashMap<LocationId, HashSet<u64>>>,
}

impl ChatService {
    pub fn new(own: LocationId) -> Self {
        Self { own, rooms: Arc::new(DashMap::new()), shared: Arc::new(DashMap::new()) }
    }

    pub fn join_room(&self, room_id: u64) {
        self.rooms.entry(room_id).or_default();
    }

    pub fn leave_room(&self, room_id: u64) {
        self.rooms.remove(&room_id);
        for mut peer in self.shared.iter_mut() {
            peer.remove(&room_id);
        }
    }

    pub fn rooms(&self) -> Vec<u64> {
        let mut rooms: Vec<u64> = self.rooms.iter().map(|r| *r.key()).collect();
        rooms.sort_unstable();
        rooms
    }

    /// Remember a message seen in `room_id`. Returns false if we are not in
    /// that room.
    pub fn record_message(&self, room_id: u64, message_id: u64) -> bool {
        let now = Instant::now();
        match self.rooms.get_mut(&room_id) {
            Some(mut cache) => {
                cache.purge(now);
                cache.add(message_id, now);
                true
            }
            None => false,
        }
    }

    /// Challenge every connected peer with a recent message of `room_id`.
    /// Returns how many peers it went to; zero when the room has no recent
    /// message.
    pub async fn send_connection_challenge(&self, ctx: &ServiceContext, room_id: u64) -> anyhow::Result<usize> {
        let recent = {
            let cache = self
                .rooms
                .get(&room_id)
                .ok_or_else(|| anyhow::anyhow!("not in chat room {room_id:#018x}"))?;
            cache.recent_message(Instant::now())
        };
        let Some(message_id) = recent else {
            tracing::debug!(room = room_id, "no recent message for a connection challenge");
            return Ok(0);
        };
        let code = challenge_code(self.own.as_bytes(), room_id, message_id);
        Ok(ctx.write_all(&Item::ChatChallenge { code }).await)
    }

    /// Rooms `peer` has proven to share with us.
    pub fn shared_rooms(&self, peer: &LocationId) -> Vec<u64> {
        let mut rooms: Vec<u64> = self.shared.get(peer).map(|r| r.iter().copied().collect()).unwrap_or_default();
        rooms.sort_unstable();
        rooms
    }

    fn match_challenge(&self, sender: &LocationId, code: u64) -> Option<u64> {
        let now = Instant::now();
        self.rooms.iter_mut().find_map(|mut room| {
            room.purge(now);
            let room_id = *room.key();
            room.has_challenge(sender, room_id, code, now).then_some(room_id)
        })
    }
}

impl Service for ChatService {
    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: "chat".into(),
            service_type: service_type::CHAT,
            version_major: 1,
            version_minor: 0,
            min_version_major: 1,
            min_version_minor: 0,
        }
    }

    fn handle_item<'a>(
        &'a self,
        _ctx: &'a ServiceContext,
        conn: &'a Arc<PeerConnection>,
        item: Item,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            let code = match item {
                Item::ChatChallenge { code } => code,
                other => anyhow::bail!("unexpected item {}", other.name()),
            };
            let sender = conn.location_id();
            match self.match_challenge(&sender, code) {
                Some(room_id) => {
                    self.shared.entry(sender).or_default().insert(room_id);
                    tracing::info!(peer = %sender, room = room_id, "connection challenge accepted");
                }
                None => tracing::debug!(peer = %sender, code, "connection challenge matched no room"),
            }
            Ok(())
        }
        .boxed()
    }

    fn on_disconnect(&self, conn: &PeerConnection) {
        self.shared.remove(&conn.location_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InitPriority, ServiceRegistry};
    use crate::testutil::Loopback;

    const ROOM: u64 = 10949563242187165295;
    const MESSAGE: u64 = 140257447151802099;

    fn location() -> LocationId {
        "01dc22f128d9495541f780a254b89630".parse().unwrap()
    }

    #[test]
    fn cache_matches_known_challenge_vector() {
        let now = Instant::now();
        let mut cache = MessageCache::new();
        cache.add(MESSAGE, now);
        assert!(cache.has_challenge(&location(), ROOM, 1540395435043678632, now));
        assert!(!cache.has_challenge(&location(), ROOM, 9133905927926710723, now));
        cache.add(3128845210392038968, now);
        assert!(cache.has_challenge(&location(), ROOM, 9133905927926710723, now));
    }

    #[test]
    fn message_ages_govern_challenges_and_purging() {
        let start = Instant::now();
        let mut cache = MessageCache::new();
        cache.add(MESSAGE, start);
        let code = challenge_code(location().as_bytes(), ROOM, MESSAGE);

        assert_eq!(cache.recent_message(start + Duration::from_secs(29)), Some(MESSAGE));
        assert_eq!(cache.recent_message(start + Duration::from_secs(31)), None);
        // Incoming challenges get a few seconds of slack.
        assert!(cache.has_challenge(&location(), ROOM, code, start + Duration::from_secs(33)));
        assert!(!cache.has_challenge(&location(), ROOM, code, start + Duration::from_secs(36)));

        cache.purge(start + Duration::from_secs(1200));
        assert_eq!(cache.len(), 1);
        cache.purge(start + Duration::from_secs(1201));
        assert!(cache.is_empty());
    }

    #[test]
    fn recent_message_prefers_newest_and_exists_refreshes() {
        let start = Instant::now();
        let mut cache = MessageCache::new();
        cache.add(1, start);
        cache.add(2, start + Duration::from_secs(5));
        assert_eq!(cache.recent_message(start + Duration::from_secs(6)), Some(2));

        assert!(cache.exists(1, start + Duration::from_secs(10)));
        assert!(!cache.exists(3, start));
        assert_eq!(cache.recent_message(start + Duration::from_secs(11)), Some(1));

        let fresh = cache.new_message_id();
        assert!(fresh != 0 && fresh != 1 && fresh != 2);
    }

    #[tokio::test]
    async fn challenge_from_peer_marks_room_shared() {
        let chat = Arc::new(ChatService::new(location()));
        let mut builder = ServiceRegistry::builder();
        builder.register(chat.clone(), InitPriority::Low).unwrap();
        let registry = builder.build();
        let lo = Loopback::new().await;

        chat.join_room(ROOM);
        chat.join_room(7);
        assert!(chat.record_message(ROOM, MESSAGE));
        assert!(!chat.record_message(99, MESSAGE));

        let peer = lo.conn.location_id();
        let wrong = challenge_code(location().as_bytes(), ROOM, MESSAGE);
        registry.dispatch(&lo.manager, &lo.conn, Item::ChatChallenge { code: wrong }).await;
        assert!(chat.shared_rooms(&peer).is_empty());

        let code = challenge_code(peer.as_bytes(), ROOM, MESSAGE);
        registry.dispatch(&lo.manager, &lo.conn, Item::ChatChallenge { code }).await;
        assert_eq!(chat.shared_rooms(&peer), vec![ROOM]);

        chat.leave_room(ROOM);
        assert!(chat.shared_rooms(&peer).is_empty());
    }

    #[tokio::test]
    async fn outgoing_challenge_uses_own_location() {
        let chat = Arc::new(ChatService::new(location()));
        let mut builder = ServiceRegistry::builder();
        let token = builder.register(chat.clone(), InitPriority::Low).unwrap();
        let registry = builder.build();
        let mut lo = Loopback::new().await;
        let ctx = registry.context(token, &lo.manager);

        chat.join_room(ROOM);
        assert_eq!(chat.send_connection_challenge(&ctx, ROOM).await.unwrap(), 0);
        assert!(chat.send_connection_challenge(&ctx, 1234).await.is_err());

        chat.record_message(ROOM, MESSAGE);
        assert_eq!(chat.send_connection_challenge(&ctx, ROOM).await.unwrap(), 1);
        assert_eq!(lo.next_item().await, Item::ChatChallenge { code: 1540395435043678632 });
    }
}
