//! User-facing notices.
//!
//! Components publish short messages here; whatever front end is attached
//! decides how to render them. Publishing never fails: with no subscriber the
//! notice is simply dropped.

use futures::{future, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

const NOTICE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn success(&self, message: impl Into<String>) {
        self.publish(NoticeLevel::Success, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.publish(NoticeLevel::Error, message.into());
    }

    fn publish(&self, level: NoticeLevel, message: String) {
        debug!(?level, "notice: {message}");
        let _ = self.tx.send(Notice { level, message });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }

    /// Notices as a stream; lagged receivers skip what they missed.
    pub fn stream(&self) -> impl Stream<Item = Notice> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|item| future::ready(item.ok()))
    }
}
