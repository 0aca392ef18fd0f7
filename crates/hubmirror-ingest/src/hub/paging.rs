//! Restartable pagination over one account's messages of one kind.

use super::{HubClient, MessageKind};
use crate::Result;
use hubmirror_core::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PageState {
    Start,
    Continue(String),
    Done,
}

/// Walks the pages of `(fid, kind)` until the hub reports no continuation.
///
/// A failed fetch leaves the cursor where it was, so calling
/// [`next_page`](Self::next_page) again retries the same page. A cursor can
/// also be rebuilt from any token it previously exposed.
#[derive(Debug, Clone)]
pub struct PageCursor {
    fid: u64,
    kind: MessageKind,
    state: PageState,
}

impl PageCursor {
    pub fn new(fid: u64, kind: MessageKind) -> Self {
        Self {
            fid,
            kind,
            state: PageState::Start,
        }
    }

    /// Resume from a continuation token returned by an earlier cursor.
    pub fn resume(fid: u64, kind: MessageKind, token: impl Into<String>) -> Self {
        Self {
            fid,
            kind,
            state: PageState::Continue(token.into()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == PageState::Done
    }

    /// Token the next fetch will send, if any.
    pub fn token(&self) -> Option<&str> {
        match &self.state {
            PageState::Continue(token) => Some(token),
            _ => None,
        }
    }

    /// Fetch the next page. `Ok(None)` once the kind is exhausted.
    pub async fn next_page<H: HubClient>(&mut self, hub: &H) -> Result<Option<Vec<Message>>> {
        let token = match &self.state {
            PageState::Done => return Ok(None),
            PageState::Start => None,
            PageState::Continue(token) => Some(token.clone()),
        };

        let page = hub.messages_page(self.fid, self.kind, token).await?;
        self.state = match page.next_page_token {
            Some(token) if !token.is_empty() => PageState::Continue(token),
            _ => PageState::Done,
        };

        Ok(Some(page.messages))
    }
}
