//! Record-batch stream abstractions and the frame channel between an engine
//! producer and the client-side consumer.
//!
//! A producer pushes encoded batch frames into an unbounded FIFO and closes
//! it with exactly one terminal [`Status`]. The consumer side turns that
//! channel back into a [`SendableRecordBatchStream`].

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use tracing::debug;
use vq_common::{Result, VqError};

use crate::status::Status;

/// A stream of RecordBatches that also knows its output schema.
pub trait RecordBatchStream: Stream<Item = Result<RecordBatch>> + Send {
    /// Output schema for every batch yielded by this stream.
    fn schema(&self) -> SchemaRef;
}

/// The standard "stream you can return from a query".
pub type SendableRecordBatchStream = Pin<Box<dyn RecordBatchStream>>;

/// Adapter that attaches a schema to any `Stream<Item = Result<RecordBatch>>`.
pub struct StreamAdapter<S> {
    schema: SchemaRef,
    inner: S,
}

impl<S> StreamAdapter<S> {
    /// Create a new schema-attached stream adapter.
    pub fn new(schema: SchemaRef, inner: S) -> Self {
        Self { schema, inner }
    }
}

impl<S> RecordBatchStream for StreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Send + Unpin + 'static,
{
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

impl<S> Stream for StreamAdapter<S>
where
    S: Stream<Item = Result<RecordBatch>> + Unpin,
{
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Create an empty stream.
pub fn empty_stream(schema: SchemaRef) -> SendableRecordBatchStream {
    let inner = futures::stream::empty::<Result<RecordBatch>>();
    Box::pin(StreamAdapter::new(schema, inner))
}

/// Create a stream over batches that are already in memory.
pub fn memory_stream(schema: SchemaRef, batches: Vec<RecordBatch>) -> SendableRecordBatchStream {
    let inner = futures::stream::iter(batches.into_iter().map(Ok));
    Box::pin(StreamAdapter::new(schema, inner))
}

/// Advisory cancellation flag raised by the caller and observed by producers.
///
/// Producers poll it between batches; a cancelled producer stops early and
/// reports an error status.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// New, not yet cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// One item of the producer/consumer channel.
#[derive(Debug)]
pub enum StreamEvent {
    /// An encoded batch frame.
    Frame(Vec<u8>),
    /// Terminal status; nothing follows it.
    Done(Status),
}

/// Create a frame channel the caller can cancel through `cancel`.
///
/// The channel keeps its own consumer-side flag as well. Dropping the
/// receiver before a terminal status arrives stops this producer only; the
/// caller's token is never written by the channel, so one token can be shared
/// by sibling requests and reused across queries.
pub fn frame_channel(cancel: CancellationToken) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::unbounded();
    let abandoned = CancellationToken::new();
    (
        FrameSender {
            tx,
            cancel: cancel.clone(),
            abandoned: abandoned.clone(),
            finished: false,
        },
        FrameReceiver {
            rx,
            cancel,
            abandoned,
            done: false,
        },
    )
}

/// Producer side of [`frame_channel`].
///
/// Dropping a sender that never called [`FrameSender::finish`] delivers an
/// error status so the consumer never waits on a dead producer.
#[derive(Debug)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
    abandoned: CancellationToken,
    finished: bool,
}

impl FrameSender {
    /// Push one encoded frame. Returns `false` when the consumer is gone or
    /// cancellation was requested; the producer should stop.
    pub fn send_frame(&mut self, frame: Vec<u8>) -> bool {
        if self.is_cancelled() {
            return false;
        }
        self.tx.unbounded_send(StreamEvent::Frame(frame)).is_ok()
    }

    /// Whether the caller cancelled or the consumer went away.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.abandoned.is_cancelled() || self.tx.is_closed()
    }

    /// Deliver the terminal status and close the channel.
    pub fn finish(mut self, status: Status) {
        self.finished = true;
        if self.tx.unbounded_send(StreamEvent::Done(status)).is_err() {
            debug!(operator = "FrameSender", "consumer dropped before terminal status");
        }
        self.tx.close_channel();
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self
                .tx
                .unbounded_send(StreamEvent::Done(Status::error("producer exited without a status")));
        }
    }
}

/// Consumer side of [`frame_channel`]. Dropping it before the terminal status
/// stops the producer.
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
    abandoned: CancellationToken,
    done: bool,
}

impl FrameReceiver {
    /// The caller's token this channel observes.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Next event; `None` once the channel is closed.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        let event = self.rx.next().await;
        if !matches!(event, Some(StreamEvent::Frame(_))) {
            self.done = true;
        }
        event
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        if !self.done {
            self.abandoned.cancel();
        }
    }
}

/// Turn a frame channel into a record-batch stream.
///
/// Each frame decodes to exactly one batch. An ok terminal status ends the
/// stream; an error status surfaces as [`VqError::Query`] tagged with
/// `stage`. A channel that closes without a terminal status is an error too.
pub fn frame_stream(
    schema: SchemaRef,
    receiver: FrameReceiver,
    stage: &'static str,
) -> SendableRecordBatchStream {
    let inner = futures::stream::unfold(Some(receiver), move |state| async move {
        let mut receiver = state?;
        match receiver.next_event().await {
            Some(StreamEvent::Frame(bytes)) => {
                let item = vq_codec::decode_frame(&bytes);
                let next = if item.is_ok() { Some(receiver) } else { None };
                Some((item, next))
            }
            Some(StreamEvent::Done(status)) if status.is_ok() => None,
            Some(StreamEvent::Done(status)) => {
                Some((Err(VqError::query(stage, status.message())), None))
            }
            None => Some((
                Err(VqError::query(stage, "stream closed without a terminal status")),
                None,
            )),
        }
    });
    Box::pin(StreamAdapter::new(schema, Box::pin(inner)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int32Array;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use futures::{StreamExt, TryStreamExt};
    use vq_common::VqError;

    use super::{CancellationToken, frame_channel, frame_stream};
    use crate::status::Status;

    fn batch(values: Vec<i32>) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))]).expect("batch")
    }

    #[test]
    fn frames_arrive_in_order_and_ok_status_ends_the_stream() {
        let (mut tx, rx) = frame_channel(CancellationToken::new());
        let first = batch(vec![1, 2]);
        let schema = first.schema();
        assert!(tx.send_frame(vq_codec::encode_frame(&first).expect("frame")));
        assert!(tx.send_frame(vq_codec::encode_frame(&batch(vec![3])).expect("frame")));
        tx.finish(Status::ok(0));

        let batches = futures::executor::block_on(frame_stream(schema, rx, "Query").try_collect::<Vec<_>>())
            .expect("collect");
        assert_eq!(batches.iter().map(|b| b.num_rows()).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn error_status_surfaces_as_query_error() {
        let (tx, rx) = frame_channel(CancellationToken::new());
        tx.finish(Status::error("filter references unknown column"));
        let schema = batch(vec![]).schema();

        let err = futures::executor::block_on(frame_stream(schema, rx, "Query").try_collect::<Vec<_>>())
            .expect_err("error");
        assert!(matches!(err, VqError::Query(ref m) if m == "Query: filter references unknown column"));
    }

    #[test]
    fn dropped_producer_reports_an_error() {
        let (tx, rx) = frame_channel(CancellationToken::new());
        drop(tx);
        let schema = batch(vec![]).schema();
        let result = futures::executor::block_on(frame_stream(schema, rx, "Query").try_collect::<Vec<_>>());
        assert!(result.is_err());
    }

    #[test]
    fn frames_queued_before_cancel_are_still_drained() {
        let token = CancellationToken::new();
        let (mut tx, rx) = frame_channel(token.clone());
        let first = batch(vec![1, 2, 3]);
        let schema = first.schema();
        assert!(tx.send_frame(vq_codec::encode_frame(&first).expect("frame")));
        token.cancel();
        assert!(!tx.send_frame(vq_codec::encode_frame(&batch(vec![4])).expect("frame")));
        tx.finish(Status::error("query cancelled"));

        let mut stream = frame_stream(schema, rx, "Query");
        let drained = futures::executor::block_on(stream.next())
            .expect("item")
            .expect("queued batch");
        assert_eq!(drained.num_rows(), 3);
        let err = futures::executor::block_on(stream.next())
            .expect("item")
            .expect_err("cancelled");
        assert!(matches!(err, VqError::Query(ref m) if m.ends_with("query cancelled")));
    }

    #[test]
    fn dropping_the_consumer_stops_only_its_own_producer() {
        let token = CancellationToken::new();
        let (mut tx, rx) = frame_channel(token.clone());
        let (mut sibling, _sibling_rx) = frame_channel(token.clone());
        drop(rx);
        assert!(tx.is_cancelled());
        assert!(!tx.send_frame(Vec::new()));
        assert!(!token.is_cancelled());
        assert!(!sibling.is_cancelled());
        assert!(sibling.send_frame(Vec::new()));
    }

    #[test]
    fn completed_stream_leaves_the_caller_token_untouched() {
        let token = CancellationToken::new();
        for _ in 0..2 {
            let (mut tx, rx) = frame_channel(token.clone());
            let first = batch(vec![1]);
            let schema = first.schema();
            assert!(tx.send_frame(vq_codec::encode_frame(&first).expect("frame")));
            tx.finish(Status::ok(0));
            let batches =
                futures::executor::block_on(frame_stream(schema, rx, "Query").try_collect::<Vec<_>>())
                    .expect("collect");
            assert_eq!(batches.len(), 1);
            assert!(!token.is_cancelled());
        }
    }

    #[test]
    fn caller_cancellation_reaches_every_channel() {
        let token = CancellationToken::new();
        let (a, _rx_a) = frame_channel(token.clone());
        let (b, _rx_b) = frame_channel(token.clone());
        token.cancel();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
