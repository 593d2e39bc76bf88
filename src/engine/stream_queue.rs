//! Multi-session streaming queues with lifecycle markers.

use std::collections::{HashMap, VecDeque};

/// One queued entry. Terminal markers retire the session when popped.
#[derive(Debug)]
enum Item<D> {
    Start,
    Data(D),
    End(Option<D>),
    Cancelled,
    Error(u32),
}

/// Result of [`StreamQueue::pop`].
#[derive(Debug, PartialEq)]
pub enum Popped<D> {
    /// Nothing queued right now.
    Empty,
    /// The queue has been closed and will never yield again.
    Drained,
    Start(i32),
    Data(i32, D),
    End(i32, Option<D>),
    Cancelled(i32),
    Error(i32, u32),
}

#[derive(Debug)]
struct Session<A> {
    /// Closed to further data once END or a cancel has been enqueued.
    open: bool,
    /// A terminal marker is already queued; repeated cancels must not
    /// stack more.
    cancelled: bool,
    arg: Option<A>,
}

/// A queue of streaming payloads for any number of concurrent sessions.
///
/// Entries pop in global enqueue order, which makes draining fair across
/// sessions while staying strictly FIFO within one. Each session walks
/// `START, DATA*, END`, optionally truncated by a cancel that discards the
/// pending tail and leaves a single CANCELLED marker. Popping a terminal
/// marker (END, CANCELLED, ERROR) forgets the session id.
#[derive(Debug, Default)]
pub struct StreamQueue<D, A = ()> {
    items: VecDeque<(i32, Item<D>)>,
    sessions: HashMap<i32, Session<A>>,
    closed: bool,
}

impl<D, A: Clone> StreamQueue<D, A> {
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            sessions: HashMap::new(),
            closed: false,
        }
    }

    /// Admit a new session. Fails if the queue is closed or the id is
    /// already present.
    pub fn start(&mut self, id: i32, arg: A) -> bool {
        if self.closed || self.sessions.contains_key(&id) {
            return false;
        }
        self.sessions.insert(
            id,
            Session {
                open: true,
                cancelled: false,
                arg: Some(arg),
            },
        );
        self.items.push_back((id, Item::Start));
        true
    }

    /// Append a data entry. Silently refused for unknown or ended ids.
    pub fn stream(&mut self, id: i32, data: D) -> bool {
        match self.sessions.get(&id) {
            Some(session) if session.open => {
                self.items.push_back((id, Item::Data(data)));
                true
            }
            _ => false,
        }
    }

    /// Append the END marker and close the id to further data.
    pub fn end(&mut self, id: i32, body: Option<D>) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) if session.open => {
                session.open = false;
                self.items.push_back((id, Item::End(body)));
                true
            }
            _ => false,
        }
    }

    /// Drop everything pending for `id` and leave a single CANCELLED
    /// marker in its place. Idempotent while the marker is pending.
    /// Returns false when the id is not live.
    pub fn cancel(&mut self, id: i32) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) if session.cancelled => true,
            Some(session) => {
                session.open = false;
                session.cancelled = true;
                self.items.retain(|(item_id, _)| *item_id != id);
                self.items.push_back((id, Item::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Drop buffered entries for `id` and leave a single ERROR marker
    /// carrying the wire result code.
    pub fn fail(&mut self, id: i32, code: u32) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) if session.cancelled => true,
            Some(session) => {
                session.open = false;
                session.cancelled = true;
                self.items.retain(|(item_id, _)| *item_id != id);
                self.items.push_back((id, Item::Error(code)));
                true
            }
            None => false,
        }
    }

    /// Remove the session entirely, leaving no marker behind.
    pub fn discard(&mut self, id: i32) -> bool {
        if self.sessions.remove(&id).is_none() {
            return false;
        }
        self.items.retain(|(item_id, _)| *item_id != id);
        true
    }

    /// Cancel every live session and return the smallest affected id, used
    /// by callers to decide whether a consumer wakeup is needed.
    pub fn clear(&mut self) -> Option<i32> {
        let mut ids: Vec<i32> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        for id in &ids {
            self.cancel(*id);
        }
        ids.first().copied()
    }

    /// Stop admitting work; a drained queue pops [`Popped::Drained`].
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn pop(&mut self) -> Popped<D> {
        match self.items.pop_front() {
            Some((id, Item::Start)) => Popped::Start(id),
            Some((id, Item::Data(data))) => Popped::Data(id, data),
            Some((id, Item::End(body))) => {
                self.sessions.remove(&id);
                Popped::End(id, body)
            }
            Some((id, Item::Cancelled)) => {
                self.sessions.remove(&id);
                Popped::Cancelled(id)
            }
            Some((id, Item::Error(code))) => {
                self.sessions.remove(&id);
                Popped::Error(id, code)
            }
            None if self.closed => Popped::Drained,
            None => Popped::Empty,
        }
    }

    /// The per-session arg recorded at `start`.
    pub fn arg(&self, id: i32) -> Option<A> {
        self.sessions.get(&id).and_then(|session| session.arg.clone())
    }
}
