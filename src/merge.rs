//! Fan-in of several async sources into one stream
//!
//! Every live source always has exactly one outstanding "next value" request.
//! Whichever request resolves first is yielded first, and a new request to that
//! source is queued at the same moment, so a slow source never holds back a
//! fast one.
//!
//! A source that ends is dropped from the rotation. The merged stream ends once
//! every source has ended, which never happens for the unbounded event sources
//! this is normally used with.

use futures::stream::{FusedStream, FuturesUnordered, Stream, StreamExt, StreamFuture};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors surfaced by [`merge_try_async`]
#[derive(Debug, Error)]
pub enum MergeError<E> {
    /// A source produced an error; it has been removed from the merge
    #[error("source {index} failed: {source}")]
    SourceFailed {
        /// Position of the failed source in the list passed to the merge
        index: usize,
        #[source]
        source: E,
    },
}

/// Tags each item with the position of the source it came from
#[derive(Debug)]
struct Indexed<S> {
    index: usize,
    inner: S,
}

impl<S: Stream + Unpin> Stream for Indexed<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// The set of outstanding requests, one per live source
#[derive(Debug)]
struct Arrivals<S> {
    pending: FuturesUnordered<StreamFuture<Indexed<S>>>,
}

impl<S: Stream + Unpin> Arrivals<S> {
    fn new(sources: impl IntoIterator<Item = S>) -> Self {
        let pending = FuturesUnordered::new();
        for (index, inner) in sources.into_iter().enumerate() {
            pending.push(Indexed { index, inner }.into_future());
        }
        Self { pending }
    }

    /// Waits for the next value from any source, dropping sources that end
    fn poll_arrival(&mut self, cx: &mut Context<'_>) -> Poll<Option<(S::Item, Indexed<S>)>> {
        loop {
            match ready!(self.pending.poll_next_unpin(cx)) {
                Some((Some(item), source)) => return Poll::Ready(Some((item, source))),
                Some((None, source)) => {
                    debug!(source = source.index, remaining = self.pending.len(), "merge source finished");
                }
                None => return Poll::Ready(None),
            }
        }
    }

    /// Queues the next request to `source`
    fn resume(&mut self, source: Indexed<S>) {
        self.pending.push(source.into_future());
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Stream returned by [`merge_async`]
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct MergedStream<S> {
    arrivals: Arrivals<S>,
    done: bool,
}

impl<S: Stream + Unpin> MergedStream<S> {
    /// Number of sources that have not ended yet
    pub fn live_sources(&self) -> usize {
        self.arrivals.len()
    }
}

impl<S: Stream + Unpin> Stream for MergedStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match ready!(self.arrivals.poll_arrival(cx)) {
            Some((item, source)) => {
                self.arrivals.resume(source);
                Poll::Ready(Some(item))
            }
            None => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            (0, Some(0))
        } else {
            (0, None)
        }
    }
}

impl<S: Stream + Unpin> FusedStream for MergedStream<S> {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

/// Merges `sources` into one stream ordered by arrival
///
/// Output order is the order in which values become ready across all sources,
/// not source order and not round-robin. Dropping the returned stream drops
/// every outstanding request along with it.
pub fn merge_async<S, I>(sources: I) -> MergedStream<S>
where
    I: IntoIterator<Item = S>,
    S: Stream + Unpin,
{
    MergedStream {
        arrivals: Arrivals::new(sources),
        done: false,
    }
}

/// Stream returned by [`merge_try_async`]
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct TryMergedStream<S> {
    arrivals: Arrivals<S>,
    done: bool,
}

impl<S: Stream + Unpin> TryMergedStream<S> {
    /// Number of sources that have neither ended nor failed
    pub fn live_sources(&self) -> usize {
        self.arrivals.len()
    }
}

impl<S, T, E> Stream for TryMergedStream<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    type Item = Result<T, MergeError<E>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match ready!(self.arrivals.poll_arrival(cx)) {
            Some((Ok(value), source)) => {
                self.arrivals.resume(source);
                Poll::Ready(Some(Ok(value)))
            }
            Some((Err(source_err), source)) => {
                // Failed sources are not asked again.
                warn!(source = source.index, "merge source failed, dropping it");
                Poll::Ready(Some(Err(MergeError::SourceFailed {
                    index: source.index,
                    source: source_err,
                })))
            }
            None => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

impl<S, T, E> FusedStream for TryMergedStream<S>
where
    S: Stream<Item = Result<T, E>> + Unpin,
{
    fn is_terminated(&self) -> bool {
        self.done
    }
}

/// Like [`merge_async`], for sources that can fail
///
/// An `Err` from a source is yielded as [`MergeError::SourceFailed`] and that
/// source is removed; the remaining sources keep going.
pub fn merge_try_async<S, I, T, E>(sources: I) -> TryMergedStream<S>
where
    I: IntoIterator<Item = S>,
    S: Stream<Item = Result<T, E>> + Unpin,
{
    TryMergedStream {
        arrivals: Arrivals::new(sources),
        done: false,
    }
}
