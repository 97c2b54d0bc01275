//! The pending set of texture jobs owned by a model or material baker.
//!
//! Jobs run on worker runtimes and report back over a channel; only the owning baker touches the
//! pending set and the rewrite table, while draining that channel.

use {
    super::{
        state::{BakeResult, BakeStatus, Baker, BakerState, CancellationToken},
        texture::{
            ImageCodec, ResourceFetcher, TextureBakeKey, TextureBaker, TextureFileNamer,
            WorkerPool, is_baked_texture, source_extension,
        },
    },
    crate::UsageType,
    crossbeam_channel::{Receiver, Sender, unbounded},
    log::{debug, trace, warn},
    std::{
        collections::{BTreeMap, HashSet},
        panic::{AssertUnwindSafe, catch_unwind},
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Session-wide collaborators every texture job needs.
#[derive(Clone)]
pub struct TextureServices {
    pub codec: Arc<dyn ImageCodec>,
    pub fetcher: Arc<dyn ResourceFetcher>,
    pub namer: Arc<TextureFileNamer>,
    pub workers: Arc<dyn WorkerPool>,
}

/// Sent by a worker when a texture job reaches a terminal state.
#[derive(Debug)]
pub enum TextureEvent {
    Completed {
        key: TextureBakeKey,
        result: BakeResult,
    },
}

/// How a texture reference will be written once the queue drains.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TextureReference {
    /// Already baked; the reference is kept as it is.
    Baked(String),

    /// A job exists for this key; its output path is in the rewrite table after it finishes.
    Pending(TextureBakeKey),

    /// Not bakeable; the original reference stays.
    Skipped,
}

pub struct TextureQueue {
    output_dir: PathBuf,
    pending: HashSet<TextureBakeKey>,
    result: BakeResult,
    rewrites: BTreeMap<TextureBakeKey, PathBuf>,
    rx: Receiver<TextureEvent>,
    services: TextureServices,
    submitted: HashSet<TextureBakeKey>,
    token: CancellationToken,

    /// Cloned into every dispatched job and released by `wait`, so the channel disconnects once
    /// no job can report anymore.
    tx: Option<Sender<TextureEvent>>,
}

impl TextureQueue {
    pub fn new(
        services: TextureServices,
        output_dir: impl AsRef<Path>,
        token: CancellationToken,
    ) -> Self {
        let (tx, rx) = unbounded();

        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            pending: Default::default(),
            result: Default::default(),
            rewrites: Default::default(),
            rx,
            services,
            submitted: Default::default(),
            token,
            tx: Some(tx),
        }
    }

    /// Number of distinct jobs created so far.
    pub fn job_count(&self) -> usize {
        self.submitted.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Files, warnings and errors gathered from finished jobs.
    pub fn result(&self) -> &BakeResult {
        &self.result
    }

    /// The output file of a finished job.
    pub fn rewritten(&self, key: &TextureBakeKey) -> Option<&Path> {
        self.rewrites.get(key).map(PathBuf::as_path)
    }

    pub fn rewrites(&self) -> &BTreeMap<TextureBakeKey, PathBuf> {
        &self.rewrites
    }

    /// Whether `url` is an already baked texture or an image the codec reads. Anything else is
    /// recorded as a skipped texture.
    pub fn accepts(&mut self, url: &str) -> bool {
        let supported = is_baked_texture(url)
            || source_extension(url)
                .is_some_and(|ext| self.services.codec.supports_extension(&ext));
        if !supported {
            self.result
                .warn(format!("Skipping texture {url}: unsupported image type"));
        }

        supported
    }

    /// Requests a bake of `url` used as `usage`; `content` carries embedded image bytes.
    ///
    /// A key which was requested before reuses the existing job.
    pub fn submit(
        &mut self,
        url: &str,
        usage: UsageType,
        content: Option<Vec<u8>>,
    ) -> TextureReference {
        if is_baked_texture(url) {
            return TextureReference::Baked(url.to_owned());
        }

        if content.is_none() && !self.accepts(url) {
            return TextureReference::Skipped;
        }

        let key = TextureBakeKey::new(url, usage);
        if !self.submitted.insert(key.clone()) {
            trace!("Reusing texture job {}", key.url);

            return TextureReference::Pending(key);
        }

        let base_name = self.services.namer.name(url, usage);
        let mut baker = TextureBaker::new(
            key.clone(),
            &self.output_dir,
            base_name,
            Arc::clone(&self.services.codec),
            Arc::clone(&self.services.fetcher),
            self.token.child(),
        );
        if let Some(content) = content {
            baker = baker.with_content(content);
        }

        self.pending.insert(key.clone());
        self.dispatch(baker);

        TextureReference::Pending(key)
    }

    /// Queues the job on the next worker; it never runs on the calling thread.
    fn dispatch(&mut self, mut baker: TextureBaker) {
        // A fresh channel after `wait` released the previous sender
        let rx = &mut self.rx;
        let tx = self
            .tx
            .get_or_insert_with(|| {
                let (tx, next_rx) = unbounded();
                *rx = next_rx;
                tx
            })
            .clone();

        self.services.workers.next_worker().spawn_blocking(move || {
            let key = baker.key().clone();
            let result = catch_unwind(AssertUnwindSafe(|| {
                baker.bake();
                baker.result().clone()
            }))
            .unwrap_or_else(|_| {
                let mut state = BakerState::default();
                state.start();
                state.fail(format!("Texture job {} panicked", key.url));
                state.result().clone()
            });

            // The queue may already be gone if its baker was dropped
            tx.send(TextureEvent::Completed { key, result }).ok();
        });
    }

    /// Blocks until every submitted job reached a terminal state.
    ///
    /// A job its worker dropped without running counts as failed.
    pub fn wait(&mut self) {
        self.tx = None;

        while !self.pending.is_empty() {
            match self.rx.recv() {
                Ok(event) => self.handle(event),
                Err(_) => break,
            }
        }

        for key in self.pending.drain() {
            warn!("Texture job {} was dropped by its worker", key.url);

            self.result.warn(format!(
                "Texture {} was not baked: its worker stopped before running it",
                key.url
            ));
        }
    }

    fn handle(&mut self, event: TextureEvent) {
        let TextureEvent::Completed { key, result } = event;

        self.pending.remove(&key);

        debug!(
            "Texture {} {:?} ({} pending)",
            key.url,
            result.status(),
            self.pending.len()
        );

        for warning in result.warnings() {
            self.result.warn(warning);
        }

        match result.status() {
            BakeStatus::Finished => {
                for path in result.output_files() {
                    self.result.add_output_file(path);
                }

                if let Some(path) = result.output_files().first() {
                    self.rewrites.insert(key, path.clone());
                }
            }
            BakeStatus::Failed => {
                for error in result.errors() {
                    self.result
                        .warn(format!("Texture {} was not baked: {error}", key.url));
                }
            }
            _ => (),
        }
    }
}
