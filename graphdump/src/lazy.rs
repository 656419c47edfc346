use crate::cache::CachedContent;
use crate::errors::ReadError;
use crate::model::{FolderElement, Group, InputGraph};
use crate::pool::StreamPool;
use crate::reader::BinaryReader;
use crate::scan::{EntryKind, GraphMetadata, ScannedRoot, ScanningModelBuilder, StreamEntry, StreamIndex};
use crate::single::SingleGroupBuilder;
use crate::source::{BinarySource, Feedback};

use crossbeam::channel::{Sender, unbounded};
use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Outcome of a lazy load.  Failures are logged and surface as loaded but
/// empty content, so siblings stay usable; only cancellation is reported
/// distinctly.
pub enum LoadResult<T> {
    Loaded(Arc<T>),
    Cancelled,
}

impl<T> Clone for LoadResult<T> {
    fn clone(&self) -> Self {
        match self {
            LoadResult::Loaded(v) => LoadResult::Loaded(v.clone()),
            LoadResult::Cancelled => LoadResult::Cancelled,
        }
    }
}

impl<T> LoadResult<T> {
    pub fn loaded(&self) -> Option<&Arc<T>> {
        match self {
            LoadResult::Loaded(v) => Some(v),
            LoadResult::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadResult::Cancelled)
    }
}

struct LoadShared<T> {
    state: Mutex<Option<LoadResult<T>>>,
    ready: Condvar,
    feedback: Arc<Feedback>,
}

impl<T> LoadShared<T> {
    fn new() -> Arc<LoadShared<T>> {
        Arc::new(LoadShared {
            state: Mutex::new(None),
            ready: Condvar::new(),
            feedback: Feedback::new(),
        })
    }

    fn resolve(&self, result: LoadResult<T>) {
        let mut state = self.state.lock().expect("load state");
        *state = Some(result);
        self.ready.notify_all();
    }
}

/// Handle on an in-flight or finished lazy load.  Concurrent requests for
/// the same element share one future; holding it keeps the loaded content
/// alive.
pub struct LoadFuture<T>(Arc<LoadShared<T>>);

impl<T> Clone for LoadFuture<T> {
    fn clone(&self) -> Self {
        LoadFuture(self.0.clone())
    }
}

impl<T> LoadFuture<T> {
    fn ready(result: LoadResult<T>) -> LoadFuture<T> {
        let shared = LoadShared::new();
        *shared.state.lock().expect("load state") = Some(result);
        LoadFuture(shared)
    }

    /// Blocks until the load resolves.
    pub fn get(&self) -> LoadResult<T> {
        let mut state = self.0.state.lock().expect("load state");
        while state.is_none() {
            state = self.0.ready.wait(state).expect("load state");
        }
        state.as_ref().expect("resolved").clone()
    }

    /// Non-blocking fast path: the result if the producer has one.
    pub fn try_get(&self) -> Option<LoadResult<T>> {
        self.0.state.lock().expect("load state").clone()
    }

    /// Requests cancellation; the decoder observes it at its next buffer
    /// refill and the future resolves as cancelled.
    pub fn cancel(&self) {
        self.0.feedback.cancel();
    }

    pub fn feedback(&self) -> &Arc<Feedback> {
        &self.0.feedback
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Small worker pool running lazy completions in the background.
pub struct Executor {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Executor {
    pub fn new(threads: usize) -> Arc<Executor> {
        let (sender, receiver) = unbounded::<Job>();
        let workers = (0..threads.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("graphdump-load-{i}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("spawn load worker")
            })
            .collect();
        Arc::new(Executor {
            sender: Some(sender),
            workers,
        })
    }

    fn spawn(&self, job: Job) {
        if let Some(sender) = &self.sender {
            // Receivers only disappear on shutdown; a failed send means the
            // job is dropped with them.
            let _ = sender.send(job);
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Everything a completer needs: the cached dump, the stream index and the
/// background executor, plus the retry policy for entries whose end the
/// scan has not reached yet (a file still being appended to).
#[derive(Clone)]
pub struct LoadSupport {
    content: CachedContent,
    index: Arc<StreamIndex>,
    executor: Arc<Executor>,
    retry_backoff: Duration,
    attempt_cap: u32,
}

impl LoadSupport {
    pub fn new(content: CachedContent, index: Arc<StreamIndex>) -> LoadSupport {
        LoadSupport {
            content,
            index,
            executor: Executor::new(2),
            retry_backoff: Duration::from_millis(100),
            attempt_cap: 10,
        }
    }

    pub fn with_retry(mut self, backoff: Duration, attempt_cap: u32) -> LoadSupport {
        self.retry_backoff = backoff;
        self.attempt_cap = attempt_cap;
        self
    }

    pub fn content(&self) -> &CachedContent {
        &self.content
    }

    pub fn index(&self) -> &Arc<StreamIndex> {
        &self.index
    }

    /// Decodes the entry's byte range with a [`SingleGroupBuilder`] over a
    /// clone of its initial pool.
    fn decode_entry(
        &self,
        entry: &StreamEntry,
        feedback: &Arc<Feedback>,
    ) -> Result<Option<FolderElement>, ReadError> {
        let end = entry.end().expect("entry closed");
        let channel = self.content.sub_channel(entry.start(), end);
        let mut source = BinarySource::new_at(Box::new(channel), entry.start());
        source.set_feedback(feedback.clone());
        let builder = SingleGroupBuilder::new(self.index.clone(), entry.start());
        let pool = StreamPool::resuming(entry.initial_pool(), 0);
        let mut reader = BinaryReader::with_pool(source, builder, pool);
        let (major, minor) = entry.version();
        reader.set_version(major, minor);
        reader.parse()?;
        Ok(reader.into_builder().into_element())
    }
}

struct ContentSlot<T> {
    pending: Weak<LoadShared<T>>,
    snapshot: Weak<T>,
}

impl<T> Default for ContentSlot<T> {
    fn default() -> Self {
        ContentSlot {
            pending: Weak::new(),
            snapshot: Weak::new(),
        }
    }
}

struct Listener {
    callback: Box<dyn Fn() + Send>,
    /// Keeps the sibling set alive while the listener is subscribed, so
    /// the whole block is reclaimed together or not at all.
    _pin: Option<Box<dyn Any + Send + Sync>>,
}

/// Subscription point fired when a lazy element's contents arrive.
#[derive(Default)]
pub struct ChangedEvent {
    listeners: Mutex<Vec<Listener>>,
}

impl ChangedEvent {
    fn subscribe_pinned(
        &self,
        callback: impl Fn() + Send + 'static,
        pin: Option<Box<dyn Any + Send + Sync>>,
    ) {
        self.listeners.lock().expect("listeners").push(Listener {
            callback: Box::new(callback),
            _pin: pin,
        });
    }

    fn fire(&self) {
        for listener in self.listeners.lock().expect("listeners").iter() {
            (listener.callback)();
        }
    }
}

/// A group whose contents are a function of demand: the skeleton carries
/// the scanned name and the [`StreamEntry`]; the full [`Group`] (its
/// properties and children) is decoded on first request and retained
/// weakly afterwards.
pub struct LazyGroup {
    name: Arc<str>,
    short_name: Option<Arc<str>>,
    entry: Arc<StreamEntry>,
    support: LoadSupport,
    slot: Mutex<ContentSlot<Group>>,
    changed: ChangedEvent,
    loads_started: AtomicU32,
    /// Self-reference handed to background jobs.
    me: Weak<LazyGroup>,
}

impl std::fmt::Debug for LazyGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyGroup")
            .field("name", &self.name)
            .field("start", &self.entry.start())
            .finish()
    }
}

impl LazyGroup {
    fn new(root: &ScannedRoot, support: LoadSupport) -> Arc<LazyGroup> {
        Arc::new_cyclic(|me| LazyGroup {
            name: root.name.clone(),
            short_name: root.short_name.clone(),
            entry: root.entry.clone(),
            support,
            slot: Mutex::new(ContentSlot::default()),
            changed: ChangedEvent::default(),
            loads_started: AtomicU32::new(0),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn short_name(&self) -> Option<&str> {
        self.short_name.as_deref()
    }

    pub fn entry(&self) -> &Arc<StreamEntry> {
        &self.entry
    }

    /// The loaded group, if some consumer is still keeping it alive.
    pub fn loaded(&self) -> Option<Arc<Group>> {
        self.slot.lock().expect("content slot").snapshot.upgrade()
    }

    /// Number of decode attempts started; diagnostic.
    pub fn load_count(&self) -> u32 {
        self.loads_started.load(Ordering::Relaxed)
    }

    /// Registers a listener for content arrival.  The currently loaded
    /// children, if any, are pinned for the listener's lifetime.
    pub fn subscribe_changed(&self, callback: impl Fn() + Send + 'static) {
        let pin = self
            .loaded()
            .map(|group| Box::new(group) as Box<dyn Any + Send + Sync>);
        self.changed.subscribe_pinned(callback, pin);
    }

    /// Requests the group's contents, coalescing concurrent requests on
    /// one in-flight future.  The returned future (and any caller-held
    /// clone of the result) is what keeps the contents alive; once every
    /// strong reference is gone the next request decodes afresh.
    pub fn complete_contents(&self) -> LoadFuture<Group> {
        let mut slot = self.slot.lock().expect("content slot");
        if let Some(snapshot) = slot.snapshot.upgrade() {
            return LoadFuture::ready(LoadResult::Loaded(snapshot));
        }
        // Coalesce on an outstanding future, but never hand out one that
        // already resolved as cancelled: a new request starts a new load.
        if let Some(shared) = slot.pending.upgrade()
            && !matches!(
                *shared.state.lock().expect("load state"),
                Some(LoadResult::Cancelled)
            )
        {
            return LoadFuture(shared);
        }
        let shared = LoadShared::new();
        slot.pending = Arc::downgrade(&shared);
        drop(slot);

        let group = self.me.upgrade().expect("self reference");
        let job_shared = shared.clone();
        self.support
            .executor
            .spawn(Box::new(move || group.run_completion(job_shared)));
        LoadFuture(shared)
    }

    fn run_completion(self: Arc<Self>, shared: Arc<LoadShared<Group>>) {
        let support = self.support.clone();
        for attempt in 0..support.attempt_cap {
            if shared.feedback.is_cancelled() {
                debug!("load of group '{}' cancelled", self.name);
                shared.resolve(LoadResult::Cancelled);
                return;
            }
            if self.entry.end().is_some() {
                self.loads_started.fetch_add(1, Ordering::Relaxed);
                let result = support.decode_entry(&self.entry, &shared.feedback);
                let group = match result {
                    Ok(Some(FolderElement::Group(group))) => group,
                    Ok(other) => {
                        warn!(
                            "entry at {} did not decode to a group ({other:?})",
                            self.entry.start()
                        );
                        self.empty_group()
                    }
                    Err(e) if e.is_interrupted() => {
                        debug!("load of group '{}' cancelled mid-decode", self.name);
                        shared.resolve(LoadResult::Cancelled);
                        return;
                    }
                    Err(e) => {
                        warn!("loading group '{}' failed: {e}", self.name);
                        self.empty_group()
                    }
                };
                self.slot.lock().expect("content slot").snapshot = Arc::downgrade(&group);
                shared.resolve(LoadResult::Loaded(group));
                self.changed.fire();
                return;
            }
            debug!(
                "entry at {} has no end yet, attempt {}/{}",
                self.entry.start(),
                attempt + 1,
                support.attempt_cap
            );
            thread::sleep(support.retry_backoff);
        }
        warn!(
            "giving up on group '{}' at {} after {} attempts",
            self.name,
            self.entry.start(),
            support.attempt_cap
        );
        shared.resolve(LoadResult::Loaded(self.empty_group()));
    }

    fn empty_group(&self) -> Arc<Group> {
        Arc::new(Group {
            name: self.name.clone(),
            short_name: self.short_name.clone(),
            ..Group::default()
        })
    }
}

/// A graph placeholder: scanned metadata now, contents on demand.
pub struct LazyGraph {
    name: Arc<str>,
    entry: Arc<StreamEntry>,
    support: LoadSupport,
    slot: Mutex<ContentSlot<InputGraph>>,
    changed: ChangedEvent,
    loads_started: AtomicU32,
    me: Weak<LazyGraph>,
}

impl std::fmt::Debug for LazyGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyGraph")
            .field("name", &self.name)
            .field("start", &self.entry.start())
            .finish()
    }
}

impl LazyGraph {
    fn new(root: &ScannedRoot, support: LoadSupport) -> Arc<LazyGraph> {
        Arc::new_cyclic(|me| LazyGraph {
            name: root.name.clone(),
            entry: root.entry.clone(),
            support,
            slot: Mutex::new(ContentSlot::default()),
            changed: ChangedEvent::default(),
            loads_started: AtomicU32::new(0),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &Arc<StreamEntry> {
        &self.entry
    }

    /// Scanned facts available before loading: node ids, changed nodes,
    /// edge count and the duplicate flag.
    pub fn metadata(&self) -> Option<GraphMetadata> {
        self.entry.metadata()
    }

    pub fn loaded(&self) -> Option<Arc<InputGraph>> {
        self.slot.lock().expect("content slot").snapshot.upgrade()
    }

    pub fn load_count(&self) -> u32 {
        self.loads_started.load(Ordering::Relaxed)
    }

    pub fn subscribe_changed(&self, callback: impl Fn() + Send + 'static) {
        let pin = self
            .loaded()
            .map(|graph| Box::new(graph) as Box<dyn Any + Send + Sync>);
        self.changed.subscribe_pinned(callback, pin);
    }

    pub fn complete_contents(&self) -> LoadFuture<InputGraph> {
        let mut slot = self.slot.lock().expect("content slot");
        if let Some(snapshot) = slot.snapshot.upgrade() {
            return LoadFuture::ready(LoadResult::Loaded(snapshot));
        }
        if let Some(shared) = slot.pending.upgrade()
            && !matches!(
                *shared.state.lock().expect("load state"),
                Some(LoadResult::Cancelled)
            )
        {
            return LoadFuture(shared);
        }
        let shared = LoadShared::new();
        slot.pending = Arc::downgrade(&shared);
        drop(slot);

        let graph = self.me.upgrade().expect("self reference");
        let job_shared = shared.clone();
        self.support
            .executor
            .spawn(Box::new(move || graph.run_completion(job_shared)));
        LoadFuture(shared)
    }

    fn run_completion(self: Arc<Self>, shared: Arc<LoadShared<InputGraph>>) {
        let support = self.support.clone();
        for attempt in 0..support.attempt_cap {
            if shared.feedback.is_cancelled() {
                debug!("load of graph '{}' cancelled", self.name);
                shared.resolve(LoadResult::Cancelled);
                return;
            }
            if self.entry.end().is_some() {
                self.loads_started.fetch_add(1, Ordering::Relaxed);
                let result = support.decode_entry(&self.entry, &shared.feedback);
                let graph = match result {
                    Ok(Some(FolderElement::Graph(graph))) => graph,
                    Ok(other) => {
                        warn!(
                            "entry at {} did not decode to a graph ({other:?})",
                            self.entry.start()
                        );
                        self.empty_graph()
                    }
                    Err(e) if e.is_interrupted() => {
                        debug!("load of graph '{}' cancelled mid-decode", self.name);
                        shared.resolve(LoadResult::Cancelled);
                        return;
                    }
                    Err(e) => {
                        warn!("loading graph '{}' failed: {e}", self.name);
                        self.empty_graph()
                    }
                };
                self.slot.lock().expect("content slot").snapshot = Arc::downgrade(&graph);
                shared.resolve(LoadResult::Loaded(graph));
                self.changed.fire();
                return;
            }
            debug!(
                "entry at {} has no end yet, attempt {}/{}",
                self.entry.start(),
                attempt + 1,
                support.attempt_cap
            );
            thread::sleep(support.retry_backoff);
        }
        warn!(
            "giving up on graph '{}' at {} after {} attempts",
            self.name,
            self.entry.start(),
            support.attempt_cap
        );
        shared.resolve(LoadResult::Loaded(self.empty_graph()));
    }

    fn empty_graph(&self) -> Arc<InputGraph> {
        Arc::new(InputGraph {
            name: self.name.clone(),
            ..InputGraph::default()
        })
    }
}

/// The skeleton a scan leaves behind: one lazy element per top-level
/// record, the offset index and the shared load support.
pub struct ScannedDocument {
    pub elements: Vec<FolderElement>,
    pub index: Arc<StreamIndex>,
    pub support: LoadSupport,
}

impl ScannedDocument {
    pub fn lazy_groups(&self) -> impl Iterator<Item = &Arc<LazyGroup>> {
        self.elements.iter().filter_map(|e| match e {
            FolderElement::LazyGroup(g) => Some(g),
            _ => None,
        })
    }

    pub fn lazy_graphs(&self) -> impl Iterator<Item = &Arc<LazyGraph>> {
        self.elements.iter().filter_map(|e| match e {
            FolderElement::LazyGraph(g) => Some(g),
            _ => None,
        })
    }
}

/// Scans cached content once, building the stream index and the lazy
/// skeleton without retaining any graph contents.
///
/// A dump truncated mid-record (for example one still being written)
/// yields the successfully scanned prefix; the record under the truncation
/// stays open in the index and is completed by the retry path once the
/// writer catches up.
pub fn scan_content(content: CachedContent) -> Result<ScannedDocument, ReadError> {
    let index = StreamIndex::new();
    let builder = ScanningModelBuilder::new(index.clone());
    let source = BinarySource::new(Box::new(content.channel()));
    let mut reader = BinaryReader::new(source, builder);
    match reader.parse() {
        Ok(()) => {}
        Err(ReadError::UnexpectedEof { offset }) => {
            warn!("dump truncated mid-record at offset {offset}; keeping scanned prefix");
        }
        Err(e) => return Err(e),
    }
    let roots = reader.into_builder().into_roots();
    let support = LoadSupport::new(content, index.clone());
    let elements = roots
        .iter()
        .map(|root| match root.kind {
            EntryKind::Group => FolderElement::LazyGroup(LazyGroup::new(root, support.clone())),
            EntryKind::Graph => FolderElement::LazyGraph(LazyGraph::new(root, support.clone())),
        })
        .collect();
    Ok(ScannedDocument {
        elements,
        index,
        support,
    })
}

/// Maps and scans a dump file.
pub fn scan_file(path: impl AsRef<Path>) -> Result<ScannedDocument, ReadError> {
    let content = CachedContent::open(path)?;
    scan_content(content)
}

/// Scans an in-memory dump.
pub fn scan_bytes(bytes: Vec<u8>) -> Result<ScannedDocument, ReadError> {
    scan_content(CachedContent::from_bytes(bytes))
}
