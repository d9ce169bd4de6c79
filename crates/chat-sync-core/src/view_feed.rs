//! Broadcast feed of view updates with replay for late subscribers.

use std::{
    collections::VecDeque,
    sync::{Arc, PoisonError, RwLock},
};

use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::view::{Notice, ViewModel};

/// Default number of notices kept for replay.
const NOTICE_HISTORY: usize = 64;

/// One update delivered to subscribers.
#[derive(Debug, Clone)]
pub enum SyncUpdate {
    /// New view snapshot.
    View(Arc<ViewModel>),
    /// Non-fatal notification.
    Notice(Notice),
}

struct Inner {
    latest: Option<Arc<ViewModel>>,
    notices: VecDeque<Notice>,
    capacity: usize,
}

/// View feed with broadcast and replay support.
///
/// A subscriber that attaches late first receives the retained notices and
/// the latest view, then live updates.
pub struct ViewFeed {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SyncUpdate>,
}

impl Default for ViewFeed {
    fn default() -> Self {
        Self::new(NOTICE_HISTORY)
    }
}

impl ViewFeed {
    /// Create a feed retaining up to `notice_capacity` notices.
    #[must_use]
    pub fn new(notice_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: RwLock::new(Inner {
                latest: None,
                notices: VecDeque::with_capacity(notice_capacity.min(32)),
                capacity: notice_capacity,
            }),
            sender,
        }
    }

    /// Publish a new view snapshot.
    pub fn publish_view(&self, view: ViewModel) {
        let view = Arc::new(view);
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .latest = Some(Arc::clone(&view));
        let _ = self.sender.send(SyncUpdate::View(view)); // live listeners
    }

    /// Publish a notice.
    pub fn push_notice(&self, notice: Notice) {
        {
            let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if inner.capacity > 0 {
                while inner.notices.len() >= inner.capacity {
                    inner.notices.pop_front();
                }
                inner.notices.push_back(notice.clone());
            }
        }
        let _ = self.sender.send(SyncUpdate::Notice(notice));
    }

    /// Latest published view.
    #[must_use]
    pub fn latest(&self) -> Option<Arc<ViewModel>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
            .clone()
    }

    /// Retained notices, oldest first.
    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .notices
            .iter()
            .cloned()
            .collect()
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<SyncUpdate> {
        self.sender.subscribe()
    }

    /// Stream that yields retained state first, then live updates.
    ///
    /// Lagged receivers skip the missed updates; the next view snapshot
    /// supersedes them.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SyncUpdate> {
        let rx = self.get_receiver();
        let mut history: Vec<SyncUpdate> =
            self.notices().into_iter().map(SyncUpdate::Notice).collect();
        if let Some(view) = self.latest() {
            history.push(SyncUpdate::View(view));
        }

        let live = BroadcastStream::new(rx).filter_map(|res| future::ready(res.ok()));
        Box::pin(futures::stream::iter(history).chain(live))
    }

    /// Stream of view snapshots only.
    #[must_use]
    pub fn view_stream(&self) -> futures::stream::BoxStream<'static, Arc<ViewModel>> {
        self.history_plus_stream()
            .filter_map(|update| {
                future::ready(match update {
                    SyncUpdate::View(view) => Some(view),
                    SyncUpdate::Notice(_) => None,
                })
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::ConnectionState, view::ErrorKind};

    fn view(connection: ConnectionState) -> ViewModel {
        ViewModel {
            connection,
            ..ViewModel::default()
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_history_then_live() {
        let feed = ViewFeed::new(4);
        feed.push_notice(Notice::info("hello", 1));
        feed.publish_view(view(ConnectionState::Connecting));

        let mut stream = feed.history_plus_stream();
        feed.publish_view(view(ConnectionState::Connected));

        assert!(matches!(stream.next().await, Some(SyncUpdate::Notice(n)) if n.message == "hello"));
        assert!(matches!(
            stream.next().await,
            Some(SyncUpdate::View(v)) if v.connection == ConnectionState::Connecting
        ));
        assert!(matches!(
            stream.next().await,
            Some(SyncUpdate::View(v)) if v.connection == ConnectionState::Connected
        ));
    }

    #[test]
    fn test_notice_history_is_bounded() {
        let feed = ViewFeed::new(2);
        for i in 0..5 {
            feed.push_notice(Notice::error(ErrorKind::Collaborator, format!("n{i}"), i));
        }
        let kept: Vec<_> = feed.notices().into_iter().map(|n| n.message).collect();
        assert_eq!(kept, ["n3", "n4"]);
    }

    #[tokio::test]
    async fn test_view_stream_skips_notices() {
        let feed = ViewFeed::default();
        let mut views = feed.view_stream();
        feed.push_notice(Notice::info("ignored", 1));
        feed.publish_view(view(ConnectionState::Connected));

        let first = views.next().await.unwrap();
        assert_eq!(first.connection, ConnectionState::Connected);
        assert_eq!(feed.latest().unwrap().connection, ConnectionState::Connected);
    }
}
