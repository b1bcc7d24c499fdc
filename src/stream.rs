//! Client stream endpoints: the adapters a protocol frontend binds to.
//!
//! A [`PlaybackStream`] couples a stream queue to a sink-input and runs
//! the REQUEST back-pressure contract: the server asks the client for
//! exactly the bytes missing below the queue's target, never in slivers
//! smaller than `minreq`, and counts uploads against what it asked for.
//! A [`RecordStream`] is the capture mirror; an [`UploadStream`]
//! accumulates a clip destined for the sample cache.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::channel_map::ChannelMap;
use crate::core::Core;
use crate::error::{Error, ErrorCode};
use crate::memblock::{Memblock, Memchunk};
use crate::memblockq::Memblockq;
use crate::resampler::ResampleMethod;
use crate::sample::SampleSpec;
use crate::sink::Sink;
use crate::sink_input::{SinkInput, SinkInputProducer};
use crate::source::Source;
use crate::source_output::{SourceOutput, SourceOutputConsumer};

/// Queue sizing for a playback stream, in bytes. `prebuf` of `None`
/// picks the queue's default.
#[derive(Debug, Clone, Copy)]
pub struct BufferAttr {
    /// Hard cap on queued bytes.
    pub maxlength: usize,
    /// Fill target; drives REQUEST sizes.
    pub tlength: usize,
    /// Bytes that must accumulate before playback starts.
    pub prebuf: Option<usize>,
    /// Smallest request worth sending.
    pub minreq: usize,
}

/// Notifications a playback stream sends its protocol frontend.
pub trait PlaybackStreamEvents {
    /// The server wants `bytes` more bytes from the client.
    fn request(&mut self, stream: &Rc<PlaybackStream>, bytes: usize);

    /// A drain the client asked for has completed.
    fn drain_complete(&mut self, stream: &Rc<PlaybackStream>, tag: u32);

    /// A pending drain failed (the stream was killed first).
    fn drain_failed(&mut self, stream: &Rc<PlaybackStream>, tag: u32, code: ErrorCode);

    /// The stream was killed server-side.
    fn killed(&mut self, stream: &Rc<PlaybackStream>) {
        let _ = stream;
    }

    /// The stream ran dry while playing.
    fn underrun(&mut self, stream: &Rc<PlaybackStream>) {
        let _ = stream;
    }
}

/// Latency figures reported to a client.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackLatency {
    /// Bytes sitting in the stream queue.
    pub queue_length: usize,
    /// Latency accumulated downstream of the queue.
    pub sink_latency: Duration,
}

/// A client's playback stream: queue, sink-input, and request
/// bookkeeping.
pub struct PlaybackStream {
    memblockq: RefCell<Memblockq>,
    input: RefCell<Option<Rc<SinkInput>>>,
    /// Bytes requested from the client and not yet received.
    requested: Cell<usize>,
    drain_tag: Cell<Option<u32>>,
    events: RefCell<Option<Box<dyn PlaybackStreamEvents>>>,
}

struct QueueProducer {
    stream: Weak<PlaybackStream>,
}

impl SinkInputProducer for QueueProducer {
    fn peek(&mut self, _input: &Rc<SinkInput>) -> Option<Memchunk> {
        let stream = self.stream.upgrade()?;
        let chunk = stream.memblockq.borrow_mut().peek();
        chunk
    }

    fn drop(&mut self, _input: &Rc<SinkInput>, chunk: &Memchunk, length: usize) {
        let Some(stream) = self.stream.upgrade() else {
            return;
        };

        stream.memblockq.borrow_mut().drop(chunk, length);
        stream.after_consume();
    }

    fn kill(&mut self, _input: &Rc<SinkInput>) {
        if let Some(stream) = self.stream.upgrade() {
            stream.killed();
        }
    }

    fn latency(&mut self, _input: &Rc<SinkInput>) -> Option<Duration> {
        let stream = self.stream.upgrade()?;
        let spec = stream.input.borrow().as_ref()?.sample_spec();
        let len = stream.memblockq.borrow().len();
        Some(spec.bytes_to_duration(len))
    }

    fn underrun(&mut self, _input: &Rc<SinkInput>) {
        let Some(stream) = self.stream.upgrade() else {
            return;
        };

        stream.with_events(|events, stream| events.underrun(stream));
    }
}

impl PlaybackStream {
    /// Creates a playback stream on `sink` and issues the initial
    /// REQUEST for a full target's worth of data.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: &Rc<Core>,
        sink: &Rc<Sink>,
        name: &str,
        spec: &SampleSpec,
        map: Option<&ChannelMap>,
        attr: &BufferAttr,
        resample_method: Option<ResampleMethod>,
        events: Box<dyn PlaybackStreamEvents>,
    ) -> Result<Rc<PlaybackStream>, Error> {
        if !spec.valid() {
            return Err(Error::Invalid("invalid sample spec".into()));
        }

        let input = SinkInput::new(
            core,
            sink,
            name,
            Some("playback-stream"),
            spec,
            map,
            false,
            resample_method,
        )?;

        let stream = Rc::new(PlaybackStream {
            memblockq: RefCell::new(Memblockq::new(
                attr.maxlength,
                attr.tlength,
                spec.frame_size(),
                attr.prebuf,
                attr.minreq,
                Some(core.memblock_stat()),
            )),
            input: RefCell::new(Some(input.clone())),
            requested: Cell::new(0),
            drain_tag: Cell::new(None),
            events: RefCell::new(Some(events)),
        });

        input.set_producer(Box::new(QueueProducer {
            stream: Rc::downgrade(&stream),
        }));

        stream.request_bytes();
        Ok(stream)
    }

    /// The underlying sink-input, while the stream is alive.
    pub fn sink_input(&self) -> Option<Rc<SinkInput>> {
        self.input.borrow().clone()
    }

    /// Bytes requested from the client that have not yet arrived.
    pub fn requested_bytes(&self) -> usize {
        self.requested.get()
    }

    fn with_events(
        self: &Rc<Self>,
        f: impl FnOnce(&mut Box<dyn PlaybackStreamEvents>, &Rc<PlaybackStream>),
    ) {
        let cb = self.events.borrow_mut().take();
        if let Some(mut cb) = cb {
            f(&mut cb, self);
            if self.events.borrow().is_none() {
                *self.events.borrow_mut() = Some(cb);
            }
        }
    }

    /// Emits a REQUEST if the queue's deficit (over and above what is
    /// already on the wire) has reached `minreq`.
    pub fn request_bytes(self: &Rc<Self>) {
        let (deficit, minreq) = {
            let q = self.memblockq.borrow();
            let deficit = q
                .tlength()
                .saturating_sub(q.len())
                .saturating_sub(self.requested.get());
            (deficit, q.minreq())
        };

        if deficit < minreq {
            return;
        }

        self.requested.set(self.requested.get() + deficit);
        log::trace!("requesting {deficit} bytes from client");
        self.with_events(|events, stream| events.request(stream, deficit));
    }

    /// Accepts a chunk from the client. A nonzero `seek` first rewinds
    /// the write pointer, letting the client overwrite queued data.
    pub fn push(self: &Rc<Self>, chunk: &Memchunk, seek: usize) {
        self.memblockq.borrow_mut().push_align(chunk, seek);
        self.requested
            .set(self.requested.get().saturating_sub(chunk.length));

        // Fresh data may unblock the sink.
        if let Some(input) = self.sink_input() {
            if let Some(sink) = input.sink() {
                sink.notify();
            }
        }
    }

    /// Called after the mixer consumed data: settles drains and tops up
    /// the client's request.
    fn after_consume(self: &Rc<Self>) {
        if let Some(tag) = self.drain_tag.get() {
            if self.memblockq.borrow().is_empty() {
                self.drain_tag.set(None);
                self.with_events(|events, stream| events.drain_complete(stream, tag));
            }
        }

        self.request_bytes();
    }

    /// Begins a drain: the reply (tag) is delivered once the queue is
    /// empty. Only one drain can be pending at a time.
    pub fn drain(self: &Rc<Self>, tag: u32) -> Result<(), Error> {
        if self.drain_tag.get().is_some() {
            return Err(Error::Invalid("drain already pending".into()));
        }

        // Whatever is queued must play out even if it is below prebuf.
        self.memblockq.borrow_mut().prebuf_disable();

        if self.memblockq.borrow().is_empty() {
            self.with_events(|events, stream| events.drain_complete(stream, tag));
            return Ok(());
        }

        self.drain_tag.set(Some(tag));
        if let Some(input) = self.sink_input() {
            if let Some(sink) = input.sink() {
                sink.notify();
            }
        }

        Ok(())
    }

    /// Drops all queued data.
    pub fn flush(&self) {
        self.memblockq.borrow_mut().flush();
    }

    /// Starts playback immediately, bypassing the prebuffer.
    pub fn trigger(self: &Rc<Self>) {
        self.memblockq.borrow_mut().prebuf_disable();
        if let Some(input) = self.sink_input() {
            if let Some(sink) = input.sink() {
                sink.notify();
            }
        }
    }

    /// Re-enables prebuffering: playback pauses until the queue refills.
    pub fn prebuf(&self) {
        self.memblockq.borrow_mut().prebuf_reenable();
    }

    /// Pauses or resumes the stream.
    pub fn cork(&self, corked: bool) {
        if let Some(input) = self.input.borrow().as_ref() {
            input.cork(corked);
        }
    }

    /// Whether a peek would currently succeed.
    pub fn is_readable(&self) -> bool {
        self.memblockq.borrow().is_readable()
    }

    /// Bytes currently queued.
    pub fn queue_length(&self) -> usize {
        self.memblockq.borrow().len()
    }

    /// Renames the underlying sink-input.
    pub fn set_name(&self, name: &str) {
        if let Some(input) = self.input.borrow().as_ref() {
            input.set_name(name);
        }
    }

    /// Latency figures for a timing-info reply.
    pub fn latency(self: &Rc<Self>) -> PlaybackLatency {
        let sink_latency = self
            .sink_input()
            .map(|i| i.latency())
            .unwrap_or(Duration::ZERO);

        PlaybackLatency {
            queue_length: self.memblockq.borrow().len(),
            sink_latency,
        }
    }

    fn killed(self: &Rc<Self>) {
        if let Some(tag) = self.drain_tag.take() {
            self.with_events(|events, stream| {
                events.drain_failed(stream, tag, ErrorCode::NoEntity)
            });
        }

        self.with_events(|events, stream| events.killed(stream));
        self.delete();
    }

    /// Tears the stream down, disconnecting the sink-input.
    pub fn delete(self: &Rc<Self>) {
        if let Some(tag) = self.drain_tag.take() {
            self.with_events(|events, stream| {
                events.drain_failed(stream, tag, ErrorCode::NoEntity)
            });
        }

        if let Some(input) = self.input.borrow_mut().take() {
            input.disconnect();
        }
        self.events.borrow_mut().take();
    }
}

/// Notifications a record stream sends its protocol frontend.
pub trait RecordStreamEvents {
    /// Captured data arrived; read it with [`RecordStream::peek`] /
    /// [`RecordStream::drop`].
    fn data(&mut self, stream: &Rc<RecordStream>);

    /// The stream was killed server-side.
    fn killed(&mut self, stream: &Rc<RecordStream>) {
        let _ = stream;
    }
}

/// A client's record stream: source-output plus a holding queue the
/// protocol drains at its own pace.
pub struct RecordStream {
    memblockq: RefCell<Memblockq>,
    output: RefCell<Option<Rc<SourceOutput>>>,
    events: RefCell<Option<Box<dyn RecordStreamEvents>>>,
}

struct QueueConsumer {
    stream: Weak<RecordStream>,
}

impl SourceOutputConsumer for QueueConsumer {
    fn push(&mut self, _output: &Rc<SourceOutput>, chunk: &Memchunk) {
        let Some(stream) = self.stream.upgrade() else {
            return;
        };

        stream.memblockq.borrow_mut().push_align(chunk, 0);
        stream.with_events(|events, stream| events.data(stream));
    }

    fn kill(&mut self, _output: &Rc<SourceOutput>) {
        if let Some(stream) = self.stream.upgrade() {
            stream.killed();
        }
    }
}

impl RecordStream {
    /// Creates a record stream on `source`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: &Rc<Core>,
        source: &Rc<Source>,
        name: &str,
        spec: &SampleSpec,
        map: Option<&ChannelMap>,
        maxlength: usize,
        resample_method: Option<ResampleMethod>,
        events: Box<dyn RecordStreamEvents>,
    ) -> Result<Rc<RecordStream>, Error> {
        if !spec.valid() {
            return Err(Error::Invalid("invalid sample spec".into()));
        }

        let output = SourceOutput::new(
            core,
            source,
            name,
            Some("record-stream"),
            spec,
            map,
            resample_method,
        )?;

        let stream = Rc::new(RecordStream {
            memblockq: RefCell::new(Memblockq::new(
                maxlength,
                0,
                spec.frame_size(),
                Some(0),
                1,
                Some(core.memblock_stat()),
            )),
            output: RefCell::new(Some(output.clone())),
            events: RefCell::new(Some(events)),
        });

        output.set_consumer(Box::new(QueueConsumer {
            stream: Rc::downgrade(&stream),
        }));

        Ok(stream)
    }

    /// The underlying source-output, while the stream is alive.
    pub fn source_output(&self) -> Option<Rc<SourceOutput>> {
        self.output.borrow().clone()
    }

    fn with_events(
        self: &Rc<Self>,
        f: impl FnOnce(&mut Box<dyn RecordStreamEvents>, &Rc<RecordStream>),
    ) {
        let cb = self.events.borrow_mut().take();
        if let Some(mut cb) = cb {
            f(&mut cb, self);
            if self.events.borrow().is_none() {
                *self.events.borrow_mut() = Some(cb);
            }
        }
    }

    /// The next captured chunk, if any.
    pub fn peek(&self) -> Option<Memchunk> {
        self.memblockq.borrow_mut().peek()
    }

    /// Consumes bytes returned by the previous peek.
    pub fn drop(&self, chunk: &Memchunk, length: usize) {
        self.memblockq.borrow_mut().drop(chunk, length);
    }

    /// Bytes waiting to be read.
    pub fn queue_length(&self) -> usize {
        self.memblockq.borrow().len()
    }

    /// Pauses or resumes capture.
    pub fn cork(&self, corked: bool) {
        if let Some(output) = self.output.borrow().as_ref() {
            output.cork(corked);
        }
    }

    /// Drops all buffered data.
    pub fn flush(&self) {
        self.memblockq.borrow_mut().flush();
    }

    /// Renames the underlying source-output.
    pub fn set_name(&self, name: &str) {
        if let Some(output) = self.output.borrow().as_ref() {
            output.set_name(name);
        }
    }

    /// Total capture latency.
    pub fn latency(self: &Rc<Self>) -> Duration {
        self.output
            .borrow()
            .as_ref()
            .map(|o| o.latency())
            .unwrap_or(Duration::ZERO)
    }

    fn killed(self: &Rc<Self>) {
        self.with_events(|events, stream| events.killed(stream));
        self.delete();
    }

    /// Tears the stream down, disconnecting the source-output.
    pub fn delete(&self) {
        if let Some(output) = self.output.borrow_mut().take() {
            output.disconnect();
        }
        self.events.borrow_mut().take();
    }
}

/// An upload in progress: a clip being transferred into the sample
/// cache.
pub struct UploadStream {
    core: Weak<Core>,
    name: String,
    spec: SampleSpec,
    buffer: RefCell<Vec<u8>>,
    expected_length: usize,
}

impl UploadStream {
    /// Starts an upload of `expected_length` bytes.
    pub fn new(
        core: &Rc<Core>,
        name: &str,
        spec: &SampleSpec,
        expected_length: usize,
    ) -> Result<UploadStream, Error> {
        if !spec.valid() {
            return Err(Error::Invalid("invalid sample spec".into()));
        }
        if expected_length == 0 {
            return Err(Error::Invalid("empty upload".into()));
        }

        Ok(UploadStream {
            core: core.weak_self.clone(),
            name: name.to_owned(),
            spec: *spec,
            buffer: RefCell::new(Vec::with_capacity(expected_length)),
            expected_length,
        })
    }

    /// Appends a chunk of clip data.
    pub fn push(&self, chunk: &Memchunk) {
        self.buffer.borrow_mut().extend_from_slice(&chunk.bytes());
    }

    /// Bytes received so far.
    pub fn received(&self) -> usize {
        self.buffer.borrow().len()
    }

    /// Whether the declared length has arrived.
    pub fn complete(&self) -> bool {
        self.received() >= self.expected_length
    }

    /// Finishes the upload, installing the clip in the sample cache and
    /// returning its index.
    pub fn finish(self) -> Result<u32, Error> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| Error::Internal("core is gone".into()))?;

        let data = self.buffer.into_inner();
        if data.is_empty() {
            return Err(Error::Invalid("no data uploaded".into()));
        }

        let chunk = Memchunk::from_block(Memblock::new_dynamic(data, Some(core.memblock_stat())));
        core.scache_add_chunk(&self.name, &self.spec, &chunk)
    }
}
