// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Backpressured point-to-point channels.
//!
//! A [`Stream`] is a FIFO with one producer and one consumer carrying values
//! and end-of-transmission markers. The `try_*` operations never suspend;
//! their `async` counterparts loop on them and yield between attempts, which
//! is the only way a task body waits on a channel.
//!
//! After a consumer sees the marker (via [`Stream::eot`]) it must consume it
//! with [`Stream::open`] before the channel carries a new transaction.
//! Reading or peeking the marker as a value is a usage error and panics.
//!
//! ```
//! use tapa_rt::{block_on, Stream};
//!
//! let s: Stream<u32> = Stream::with_depth("numbers", 4);
//! block_on(async {
//!     s.write(1).await;
//!     s.close().await;
//!     assert_eq!(s.read().await, 1);
//!     assert!(s.eot());
//!     s.open().await;
//! });
//! ```

mod log;
mod queue;

use std::fmt;
use std::marker::PhantomData;
use std::ops::Index;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config;
use crate::green::yield_now::yield_because;

use self::log::LogContext;
use self::queue::Queue;
pub use self::queue::Token;

/// Depth of a channel declared without one.
pub const DEFAULT_DEPTH: usize = 2;

fn render_debug<T: fmt::Debug>(value: &T) -> String {
    format!("{:?}", value)
}

struct Channel<T> {
    name: String,
    depth: Option<usize>,
    queue: Queue<T>,
    log: Option<LogContext>,
    render: fn(&T) -> String,
    leftover_log_count: usize,
}

impl<T> Channel<T> {
    fn push(&self, token: Token<T>) -> Result<(), Token<T>> {
        if self.queue.is_full() {
            return Err(token);
        }
        if let Some(log) = &self.log {
            match &token {
                Token::Value(v) => log.value(&(self.render)(v)),
                Token::Eot => log.eot(),
            }
        }
        self.queue.push(token)
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        tracing::warn!(
            channel = %self.name,
            leftovers = self.queue.len(),
            "channel destructed with leftovers; hardware behavior may be unexpected in consecutive invocations"
        );
        for _ in 0..self.leftover_log_count {
            match self.queue.pop() {
                Some(Token::Value(v)) => {
                    let value = (self.render)(&v);
                    tracing::warn!(channel = %self.name, %value, "leftover");
                }
                Some(Token::Eot) => tracing::warn!(channel = %self.name, "leftover end-of-transmission"),
                None => break,
            }
        }
        if !self.queue.is_empty() {
            tracing::warn!(
                "set {} to log more leftovers",
                config::LEFTOVER_LOG_COUNT_ENV
            );
        }
    }
}

/// Configures a [`Stream`] before creating it.
#[derive(Debug, Clone)]
pub struct StreamBuilder<T> {
    name: String,
    depth: Option<usize>,
    log_dir: Option<PathBuf>,
    leftover_log_count: Option<usize>,
    _elem: PhantomData<fn() -> T>,
}

impl<T: fmt::Debug> StreamBuilder<T> {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depth: Some(DEFAULT_DEPTH),
            log_dir: None,
            leftover_log_count: None,
            _elem: PhantomData,
        }
    }

    /// Capacity in values. Panics on zero.
    pub fn depth(mut self, depth: usize) -> Self {
        assert!(depth > 0, "channel '{}' must have a positive depth", self.name);
        self.depth = Some(depth);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.depth = None;
        self
    }

    /// Trace directory; defaults to `TAPA_STREAM_LOG_DIR`.
    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Defaults to `TAPA_STREAM_LEFTOVER_LOG_COUNT`.
    pub fn leftover_log_count(mut self, count: usize) -> Self {
        self.leftover_log_count = Some(count);
        self
    }

    pub fn build(self) -> Stream<T> {
        let queue = match self.depth {
            Some(depth) => Queue::bounded(depth),
            None => Queue::unbounded(),
        };
        let log = self
            .log_dir
            .or_else(config::stream_log_dir)
            .and_then(|dir| LogContext::open(&dir, &self.name));
        tracing::debug!(channel = %self.name, depth = ?self.depth, "channel created");
        Stream {
            chan: Arc::new(Channel {
                name: self.name,
                depth: self.depth,
                queue,
                log,
                render: render_debug::<T>,
                leftover_log_count: self
                    .leftover_log_count
                    .unwrap_or_else(config::leftover_log_count),
            }),
        }
    }
}

/// Handle to one channel. Clones refer to the same channel.
pub struct Stream<T> {
    chan: Arc<Channel<T>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            chan: self.chan.clone(),
        }
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.chan.name)
            .field("depth", &self.chan.depth)
            .field("len", &self.len())
            .finish()
    }
}

impl<T: fmt::Debug> Stream<T> {
    /// A channel of [`DEFAULT_DEPTH`].
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn with_depth(name: impl Into<String>, depth: usize) -> Self {
        Self::builder(name).depth(depth).build()
    }

    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::builder(name).unbounded().build()
    }

    pub fn builder(name: impl Into<String>) -> StreamBuilder<T> {
        StreamBuilder::new(name)
    }
}

impl<T> Stream<T> {
    pub fn name(&self) -> &str {
        &self.chan.name
    }

    /// `None` for unbounded channels.
    pub fn depth(&self) -> Option<usize> {
        self.chan.depth
    }

    /// Elements currently queued, end markers included.
    pub fn len(&self) -> usize {
        self.chan.queue.len()
    }

    /// Consumer view of this channel.
    pub fn istream(&self) -> IStream<T> {
        IStream(self.clone())
    }

    /// Producer view of this channel.
    pub fn ostream(&self) -> OStream<T> {
        OStream(self.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.chan.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.chan.queue.is_full()
    }

    /// Whether the next element is the end marker; `None` when empty.
    pub fn try_eot(&self) -> Option<bool> {
        self.chan.queue.front_with(Token::is_eot)
    }

    /// Whether an element is available and it is the end marker.
    pub fn eot(&self) -> bool {
        self.try_eot().unwrap_or(false)
    }

    pub fn try_read(&self) -> Option<T> {
        match self.chan.queue.pop()? {
            Token::Value(v) => Some(v),
            Token::Eot => panic!("channel '{}' read when closed", self.chan.name),
        }
    }

    pub async fn read(&self) -> T {
        loop {
            if let Some(v) = self.try_read() {
                return v;
            }
            yield_because(|| format!("channel '{}' is empty", self.chan.name)).await;
        }
    }

    /// Wait for the next element. Values are consumed; the end marker stays
    /// queued and is reported as `None`, ready for [`Stream::open`].
    pub async fn next_value(&self) -> Option<T> {
        loop {
            match self.try_eot() {
                Some(true) => return None,
                Some(false) => return self.try_read(),
                None => {
                    yield_because(|| format!("channel '{}' is empty", self.chan.name)).await
                }
            }
        }
    }

    /// Non-blocking read falling back to `default` when empty.
    pub fn read_or(&self, default: T) -> T {
        self.try_read().unwrap_or(default)
    }

    /// Hands `value` back when the channel is full.
    pub fn try_write(&self, value: T) -> Result<(), T> {
        self.chan.push(Token::Value(value)).map_err(|token| match token {
            Token::Value(v) => v,
            Token::Eot => unreachable!(),
        })
    }

    pub async fn write(&self, value: T) {
        let mut value = value;
        loop {
            match self.try_write(value) {
                Ok(()) => return,
                Err(back) => value = back,
            }
            yield_because(|| format!("channel '{}' is full", self.chan.name)).await;
        }
    }

    /// Enqueue the end marker. Same capacity rules as a write.
    pub fn try_close(&self) -> bool {
        self.chan.push(Token::Eot).is_ok()
    }

    pub async fn close(&self) {
        while !self.try_close() {
            yield_because(|| format!("channel '{}' is full", self.chan.name)).await;
        }
    }

    /// Consume a pending end marker.
    ///
    /// # Panics
    ///
    /// If the next element is a value.
    pub fn try_open(&self) -> bool {
        match self.chan.queue.pop() {
            None => false,
            Some(Token::Eot) => true,
            Some(Token::Value(_)) => {
                panic!("channel '{}' opened when not closed", self.chan.name)
            }
        }
    }

    pub async fn open(&self) {
        while !self.try_open() {
            yield_because(|| format!("channel '{}' is empty", self.chan.name)).await;
        }
    }
}

impl<T: Clone> Stream<T> {
    /// Copy of the next value, without consuming it.
    ///
    /// # Panics
    ///
    /// If the next element is the end marker; check [`Stream::eot`] first.
    pub fn try_peek(&self) -> Option<T> {
        match self.try_peek_token()? {
            Token::Value(v) => Some(v),
            Token::Eot => panic!("channel '{}' peeked when closed", self.chan.name),
        }
    }

    /// Copy of the next element, marker or value.
    pub fn try_peek_token(&self) -> Option<Token<T>> {
        self.chan.queue.front_with(Token::clone)
    }

    pub async fn peek(&self) -> T {
        loop {
            if let Some(v) = self.try_peek() {
                return v;
            }
            yield_because(|| format!("channel '{}' is empty", self.chan.name)).await;
        }
    }
}

/// Consumer side of a [`Stream`].
pub struct IStream<T>(Stream<T>);

/// Producer side of a [`Stream`].
pub struct OStream<T>(Stream<T>);

impl<T> fmt::Debug for IStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IStream").field(&self.0.name()).finish()
    }
}

impl<T> fmt::Debug for OStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OStream").field(&self.0.name()).finish()
    }
}

impl<T> IStream<T> {
    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn try_eot(&self) -> Option<bool> {
        self.0.try_eot()
    }

    pub fn eot(&self) -> bool {
        self.0.eot()
    }

    pub fn try_read(&self) -> Option<T> {
        self.0.try_read()
    }

    pub async fn read(&self) -> T {
        self.0.read().await
    }

    pub fn read_or(&self, default: T) -> T {
        self.0.read_or(default)
    }

    pub async fn next_value(&self) -> Option<T> {
        self.0.next_value().await
    }

    pub fn try_open(&self) -> bool {
        self.0.try_open()
    }

    pub async fn open(&self) {
        self.0.open().await
    }
}

impl<T: Clone> IStream<T> {
    pub fn try_peek(&self) -> Option<T> {
        self.0.try_peek()
    }

    pub fn try_peek_token(&self) -> Option<Token<T>> {
        self.0.try_peek_token()
    }

    pub async fn peek(&self) -> T {
        self.0.peek().await
    }
}

impl<T> OStream<T> {
    pub fn name(&self) -> &str {
        self.0.name()
    }

    pub fn is_full(&self) -> bool {
        self.0.is_full()
    }

    pub fn try_write(&self, value: T) -> Result<(), T> {
        self.0.try_write(value)
    }

    pub async fn write(&self, value: T) {
        self.0.write(value).await
    }

    pub fn try_close(&self) -> bool {
        self.0.try_close()
    }

    pub async fn close(&self) {
        self.0.close().await
    }
}

/// A named array of channels `name[0]`, `name[1]`, ...
///
/// Consumer and producer views are handed out in order, each index at most
/// once per side, the way a parent wires the array into its children.
pub struct Streams<T> {
    name: String,
    channels: Vec<Stream<T>>,
    istream_pos: usize,
    ostream_pos: usize,
}

impl<T: fmt::Debug> Streams<T> {
    pub fn new(name: impl Into<String>, len: usize) -> Self {
        Self::with_depth(name, len, DEFAULT_DEPTH)
    }

    pub fn with_depth(name: impl Into<String>, len: usize, depth: usize) -> Self {
        let name = name.into();
        let channels = (0..len)
            .map(|i| Stream::with_depth(format!("{}[{}]", name, i), depth))
            .collect();
        Self {
            name,
            channels,
            istream_pos: 0,
            ostream_pos: 0,
        }
    }
}

impl<T> Streams<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Stream<T>> {
        self.channels.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Stream<T>> {
        self.channels.iter()
    }

    /// Consumer view of the next channel not yet handed out as one.
    pub fn next_istream(&mut self) -> IStream<T> {
        assert!(
            self.istream_pos < self.channels.len(),
            "channels '{}' accessed as istream for {} times but it only contains {} channels",
            self.name,
            self.istream_pos + 1,
            self.channels.len()
        );
        self.istream_pos += 1;
        self.channels[self.istream_pos - 1].istream()
    }

    /// Producer view of the next channel not yet handed out as one.
    pub fn next_ostream(&mut self) -> OStream<T> {
        assert!(
            self.ostream_pos < self.channels.len(),
            "channels '{}' accessed as ostream for {} times but it only contains {} channels",
            self.name,
            self.ostream_pos + 1,
            self.channels.len()
        );
        self.ostream_pos += 1;
        self.channels[self.ostream_pos - 1].ostream()
    }

    /// The next `len` consumer views as one slice.
    pub fn istreams(&mut self, len: usize) -> IStreams<T> {
        let start = self.istream_pos;
        let streams = (0..len).map(|_| self.next_istream()).collect();
        IStreams {
            name: format!("{}[{}:{}]", self.name, start, start + len),
            streams,
            pos: 0,
        }
    }

    /// The next `len` producer views as one slice.
    pub fn ostreams(&mut self, len: usize) -> OStreams<T> {
        let start = self.ostream_pos;
        let streams = (0..len).map(|_| self.next_ostream()).collect();
        OStreams {
            name: format!("{}[{}:{}]", self.name, start, start + len),
            streams,
            pos: 0,
        }
    }

    /// Whether any channel has the end marker next.
    pub fn any_eot(&self) -> bool {
        self.channels.iter().any(Stream::eot)
    }

    /// Whether every channel has the end marker next.
    pub fn all_eot(&self) -> bool {
        self.channels.iter().all(Stream::eot)
    }
}

impl<T> Index<usize> for Streams<T> {
    type Output = Stream<T>;

    fn index(&self, index: usize) -> &Stream<T> {
        &self.channels[index]
    }
}

impl<'a, T> IntoIterator for &'a Streams<T> {
    type Item = &'a Stream<T>;
    type IntoIter = std::slice::Iter<'a, Stream<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.channels.iter()
    }
}

impl<T> fmt::Debug for Streams<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streams")
            .field("name", &self.name)
            .field("len", &self.channels.len())
            .finish()
    }
}

/// A slice of consumer views taken from [`Streams`].
#[derive(Debug)]
pub struct IStreams<T> {
    name: String,
    streams: Vec<IStream<T>>,
    pos: usize,
}

impl<T> IStreams<T> {
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, IStream<T>> {
        self.streams.iter()
    }

    /// Take the next view out of the slice, in order.
    pub fn take_next(&mut self) -> IStream<T> {
        assert!(
            self.pos < self.streams.len(),
            "istream slice '{}' accessed for {} times but it only contains {} channels",
            self.name,
            self.pos + 1,
            self.streams.len()
        );
        self.pos += 1;
        self.streams[self.pos - 1].clone()
    }

    pub fn any_eot(&self) -> bool {
        self.streams.iter().any(IStream::eot)
    }

    pub fn all_eot(&self) -> bool {
        self.streams.iter().all(IStream::eot)
    }
}

impl<T> Index<usize> for IStreams<T> {
    type Output = IStream<T>;

    fn index(&self, index: usize) -> &IStream<T> {
        &self.streams[index]
    }
}

/// A slice of producer views taken from [`Streams`].
#[derive(Debug)]
pub struct OStreams<T> {
    name: String,
    streams: Vec<OStream<T>>,
    pos: usize,
}

impl<T> OStreams<T> {
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OStream<T>> {
        self.streams.iter()
    }

    pub fn take_next(&mut self) -> OStream<T> {
        assert!(
            self.pos < self.streams.len(),
            "ostream slice '{}' accessed for {} times but it only contains {} channels",
            self.name,
            self.pos + 1,
            self.streams.len()
        );
        self.pos += 1;
        self.streams[self.pos - 1].clone()
    }
}

impl<T> Index<usize> for OStreams<T> {
    type Output = OStream<T>;

    fn index(&self, index: usize) -> &OStream<T> {
        &self.streams[index]
    }
}

impl<T> Clone for IStream<T> {
    fn clone(&self) -> Self {
        IStream(self.0.clone())
    }
}

impl<T> Clone for OStream<T> {
    fn clone(&self) -> Self {
        OStream(self.0.clone())
    }
}
