use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use teloxide::types::{ChatId, FileId};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("There is no slideshow in progress. Send /slideshow to start one.")]
    NoSession,
    #[error("This slideshow already has the maximum of {0} photos. Send /done to build it.")]
    Full(usize),
    #[error("Send at least one photo before /done.")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStart {
    Started,
    AlreadyActive(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoAdded {
    Added(usize),
    Duplicate(usize),
}

#[derive(Debug)]
struct PhotoSession {
    photos: Vec<FileId>,
    last_activity: Instant,
}

impl PhotoSession {
    fn new(now: Instant) -> Self {
        PhotoSession {
            photos: Vec::new(),
            last_activity: now,
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= ttl
    }
}

/// Per-chat photo collection for slideshows. Every operation takes `now` so
/// idle expiry is decided by the caller's clock; an expired session is
/// treated exactly like a missing one.
#[derive(Debug, Clone)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<ChatId, PhotoSession>>>,
    ttl: Duration,
    max_photos: usize,
}

impl SessionManager {
    pub fn new(ttl: Duration, max_photos: usize) -> Self {
        SessionManager {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            max_photos: max_photos.max(1),
        }
    }

    pub fn max_photos(&self) -> usize {
        self.max_photos
    }

    pub fn start(&self, chat_id: ChatId, now: Instant) -> SessionStart {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&chat_id) {
            Some(session) if !session.is_expired(now, self.ttl) => {
                session.last_activity = now;
                SessionStart::AlreadyActive(session.photos.len())
            }
            _ => {
                sessions.insert(chat_id, PhotoSession::new(now));
                SessionStart::Started
            }
        }
    }

    pub fn add_photo(&self, chat_id: ChatId, file_id: FileId, now: Instant) -> Result<PhotoAdded, SessionError> {
        let mut sessions = self.sessions.lock();
        let expired = match sessions.get(&chat_id) {
            None => return Err(SessionError::NoSession),
            Some(session) => session.is_expired(now, self.ttl),
        };
        if expired {
            sessions.remove(&chat_id);
            return Err(SessionError::NoSession);
        }
        let Some(session) = sessions.get_mut(&chat_id) else {
            return Err(SessionError::NoSession);
        };

        session.last_activity = now;
        if session.photos.contains(&file_id) {
            return Ok(PhotoAdded::Duplicate(session.photos.len()));
        }
        if session.photos.len() >= self.max_photos {
            return Err(SessionError::Full(self.max_photos));
        }
        session.photos.push(file_id);
        Ok(PhotoAdded::Added(session.photos.len()))
    }

    /// Closes the session and hands back its photos in arrival order. An
    /// empty session stays open.
    pub fn finish(&self, chat_id: ChatId, now: Instant) -> Result<Vec<FileId>, SessionError> {
        let mut sessions = self.sessions.lock();
        let (expired, empty) = match sessions.get(&chat_id) {
            None => return Err(SessionError::NoSession),
            Some(session) => (session.is_expired(now, self.ttl), session.photos.is_empty()),
        };
        if expired {
            sessions.remove(&chat_id);
            return Err(SessionError::NoSession);
        }
        if empty {
            return Err(SessionError::Empty);
        }
        sessions
            .remove(&chat_id)
            .map(|session| session.photos)
            .ok_or(SessionError::NoSession)
    }

    /// Drops the session. Returns whether a live one existed.
    pub fn cancel(&self, chat_id: ChatId, now: Instant) -> bool {
        self.sessions
            .lock()
            .remove(&chat_id)
            .map(|session| !session.is_expired(now, self.ttl))
            .unwrap_or(false)
    }

    pub fn is_active(&self, chat_id: ChatId, now: Instant) -> bool {
        self.sessions
            .lock()
            .get(&chat_id)
            .map(|session| !session.is_expired(now, self.ttl))
            .unwrap_or(false)
    }

    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now, self.ttl));
        let removed = before - sessions.len();
        if removed > 0 {
            debug!("Purged {removed} idle photo sessions");
        }
        removed
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let sessions = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                sessions.purge_expired(Instant::now());
            }
        })
    }
}
