//! Merge two streams, alternating which one is polled first.
//!
//! Unlike `futures::stream::select`, the merged stream terminates as soon as
//! either input terminates. The packet loop uses this to interleave carrier
//! frames with internal control events: neither side can starve the other,
//! and the loop unwinds the moment the carrier or the control channel ends.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{FusedStream, Stream};
use pin_project::pin_project;

pub fn unfair_select<S1, S2>(stream1: S1, stream2: S2) -> UnfairSelect<S1, S2>
where
    S1: Stream,
    S2: Stream<Item = S1::Item>,
{
    UnfairSelect {
        stream1,
        stream2,
        poll_first_next: false,
        done: false,
    }
}

#[pin_project]
pub struct UnfairSelect<S1, S2> {
    #[pin]
    stream1: S1,
    #[pin]
    stream2: S2,

    /// Whether `stream1` gets the first poll on the next wakeup.
    poll_first_next: bool,
    done: bool,
}

impl<S1, S2> Stream for UnfairSelect<S1, S2>
where
    S1: Stream,
    S2: Stream<Item = S1::Item>,
{
    type Item = S1::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.done {
            return Poll::Ready(None);
        }

        let first = *this.poll_first_next;
        *this.poll_first_next = !first;

        for side in [first, !first] {
            let polled = if side {
                this.stream1.as_mut().poll_next(cx)
            } else {
                this.stream2.as_mut().poll_next(cx)
            };
            match polled {
                Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
                Poll::Ready(None) => {
                    *this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => {}
            }
        }

        Poll::Pending
    }
}

impl<S1, S2> FusedStream for UnfairSelect<S1, S2>
where
    S1: Stream,
    S2: Stream<Item = S1::Item>,
{
    fn is_terminated(&self) -> bool {
        self.done
    }
}
