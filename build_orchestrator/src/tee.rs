use std::{
    collections::VecDeque,
    fmt,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Wake, Waker},
};

use futures::{stream::BoxStream, Stream, StreamExt};

struct Shared<T> {
    // `None` once the source has ended
    source: Option<BoxStream<'static, T>>,
    // items that one cursor has seen and the other has not
    buf: VecDeque<T>,
    // absolute index of `buf[0]`
    offset: usize,
    // absolute index of the next item for each cursor
    pos: [usize; 2],
    alive: [bool; 2],
}

impl<T> Shared<T> {
    fn trim(&mut self) {
        let min = (0..2)
            .filter(|&side| self.alive[side])
            .map(|side| self.pos[side])
            .min()
            .unwrap_or(usize::MAX);
        while self.offset < min && self.buf.pop_front().is_some() {
            self.offset += 1;
        }
        if self.buf.is_empty() {
            self.offset = min.min(self.pos[0].max(self.pos[1]));
        }
    }
}

/// The source only keeps one waker, so both cursors register here and a wake
/// from the source wakes whichever of them is waiting.
#[derive(Default)]
struct TeeWaker {
    wakers: Mutex<[Option<Waker>; 2]>,
}

impl TeeWaker {
    fn wakers(&self) -> MutexGuard<'_, [Option<Waker>; 2]> {
        self.wakers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Wake for TeeWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let wakers = std::mem::take(&mut *self.wakers());
        for waker in wakers.into_iter().flatten() {
            waker.wake();
        }
    }
}

/// One of two cursors over the same underlying stream, see [tee].
pub struct Tee<T> {
    shared: Arc<Mutex<Shared<T>>>,
    waker: Arc<TeeWaker>,
    side: usize,
}

/// Splits a one-shot stream into two cursors that each yield every item of
/// `source` in order.
///
/// The source is polled on demand by whichever cursor is ahead, and only the
/// items between the two cursors are buffered. A cursor that is never polled
/// does not hold up the other one (its items are buffered instead), and a
/// dropped cursor stops holding anything back.
pub fn tee<S>(source: S) -> (Tee<S::Item>, Tee<S::Item>)
where
    S: Stream + Send + 'static,
    S::Item: Clone + Send,
{
    let shared = Arc::new(Mutex::new(Shared {
        source: Some(source.boxed()),
        buf: VecDeque::new(),
        offset: 0,
        pos: [0, 0],
        alive: [true, true],
    }));
    let waker = Arc::new(TeeWaker::default());
    (
        Tee {
            shared: Arc::clone(&shared),
            waker: Arc::clone(&waker),
            side: 0,
        },
        Tee {
            shared,
            waker,
            side: 1,
        },
    )
}

impl<T> Tee<T> {
    fn lock(&self) -> MutexGuard<'_, Shared<T>> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of items currently held for the slower cursor
    pub fn buffered_len(&self) -> usize {
        self.lock().buf.len()
    }
}

impl<T: Clone> Stream for Tee<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let side = this.side;
        let other = 1 - side;
        let mut shared = this.shared.lock().unwrap_or_else(|e| e.into_inner());

        let pos = shared.pos[side];
        if pos < shared.offset + shared.buf.len() {
            let item = shared.buf[pos - shared.offset].clone();
            shared.pos[side] += 1;
            shared.trim();
            return Poll::Ready(Some(item))
        }

        let Some(source) = shared.source.as_mut() else {
            return Poll::Ready(None)
        };

        this.waker.wakers()[side] = Some(cx.waker().clone());
        let tee_waker = Waker::from(Arc::clone(&this.waker));
        let polled = source.as_mut().poll_next(&mut Context::from_waker(&tee_waker));
        match polled {
            Poll::Ready(Some(item)) => {
                this.waker.wakers()[side] = None;
                if shared.alive[other] {
                    shared.buf.push_back(item.clone());
                }
                shared.pos[side] += 1;
                shared.trim();
                drop(shared);
                // the other cursor may be waiting on the source
                if let Some(w) = this.waker.wakers()[other].take() {
                    w.wake();
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                this.waker.wakers()[side] = None;
                shared.source = None;
                drop(shared);
                if let Some(w) = this.waker.wakers()[other].take() {
                    w.wake();
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Tee<T> {
    fn drop(&mut self) {
        let mut shared = self.lock();
        shared.alive[self.side] = false;
        shared.trim();
        drop(shared);
        // if our waker was the one registered with the source, the other side
        // needs to poll again to register its own
        if let Some(w) = self.waker.wakers()[1 - self.side].take() {
            w.wake();
        }
    }
}

impl<T> fmt::Debug for Tee<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.lock();
        f.debug_struct("Tee")
            .field("side", &self.side)
            .field("pos", &shared.pos[self.side])
            .field("buffered", &shared.buf.len())
            .field("ended", &shared.source.is_none())
            .finish()
    }
}
