use {
    log::{error, warn},
    std::{
        fmt::Display,
        path::{Path, PathBuf},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
    },
};

/// Cooperative stop flag shared between a baker and everything it owns.
///
/// Cancelling a token is visible to every token derived from it with [`CancellationToken::child`].
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    parent: Option<CancellationToken>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// A token which is cancelled whenever this one is, but which may also be cancelled alone.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        let mut token = Some(self);
        while let Some(current) = token {
            if current.inner.cancelled.load(Ordering::Acquire) {
                return true;
            }

            token = current.inner.parent.as_ref();
        }

        false
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum BakeStatus {
    #[default]
    Idle,
    Running,
    Finished,
    Aborted,
    Failed,
}

impl BakeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Aborted | Self::Failed)
    }
}

/// Everything a baker produced: files, warnings, errors and how it ended.
#[derive(Clone, Debug, Default)]
pub struct BakeResult {
    errors: Vec<String>,
    output_files: Vec<PathBuf>,
    status: BakeStatus,
    warnings: Vec<String>,
}

impl BakeResult {
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn output_files(&self) -> &[PathBuf] {
        &self.output_files
    }

    pub fn status(&self) -> BakeStatus {
        self.status
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub(crate) fn add_output_file(&mut self, path: impl AsRef<Path>) {
        self.output_files.push(path.as_ref().to_path_buf());
    }

    /// Concatenates the files, warnings and errors of a child bake onto this one.
    pub(crate) fn absorb(&mut self, child: &BakeResult) {
        self.output_files.extend_from_slice(&child.output_files);
        self.warnings.extend_from_slice(&child.warnings);
        self.errors.extend_from_slice(&child.errors);
    }

    /// Like [`BakeResult::absorb`], but the child's errors are kept as warnings.
    pub(crate) fn absorb_as_warnings(&mut self, child: &BakeResult) {
        self.output_files.extend_from_slice(&child.output_files);
        self.warnings.extend_from_slice(&child.warnings);
        self.warnings.extend_from_slice(&child.errors);
    }

    pub(crate) fn error(&mut self, msg: impl Display) {
        let msg = msg.to_string();
        error!("{msg}");
        self.errors.push(msg);
    }

    pub(crate) fn warn(&mut self, msg: impl Display) {
        let msg = msg.to_string();
        warn!("{msg}");
        self.warnings.push(msg);
    }
}

type Listener = Box<dyn FnOnce(&BakeResult) + Send>;

/// Lifecycle bookkeeping embedded in every baker.
#[derive(Default)]
pub struct BakerState {
    listeners: Vec<Listener>,
    result: BakeResult,
    token: CancellationToken,
}

impl BakerState {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            listeners: vec![],
            result: Default::default(),
            token,
        }
    }

    pub fn result(&self) -> &BakeResult {
        &self.result
    }

    pub fn result_mut(&mut self) -> &mut BakeResult {
        &mut self.result
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Moves from `Idle` to `Running`; returns `false` if the baker already ran.
    pub fn start(&mut self) -> bool {
        if self.result.status != BakeStatus::Idle {
            return false;
        }

        self.result.status = BakeStatus::Running;

        true
    }

    /// Records a fatal error and ends the bake as `Failed`.
    pub fn fail(&mut self, err: impl Display) {
        self.result.error(err);
        self.finish(BakeStatus::Failed);
    }

    /// Ends the bake as `Aborted` if cancellation was requested; returns `true` when it did.
    pub fn check_aborted(&mut self) -> bool {
        if self.token.is_cancelled() {
            self.finish(BakeStatus::Aborted);

            true
        } else {
            false
        }
    }

    /// Enters a terminal state and notifies listeners. Only the first call has any effect.
    pub fn finish(&mut self, status: BakeStatus) -> bool {
        debug_assert!(status.is_terminal());

        if self.result.status.is_terminal() {
            return false;
        }

        self.result.status = status;

        for listener in self.listeners.drain(..) {
            listener(&self.result);
        }

        true
    }

    /// Ends the bake from whatever accumulated: `Aborted` if cancelled, `Failed` with errors,
    /// otherwise `Finished`.
    pub fn settle(&mut self) {
        let status = if self.token.is_cancelled() {
            BakeStatus::Aborted
        } else if self.result.has_errors() {
            BakeStatus::Failed
        } else {
            BakeStatus::Finished
        };

        self.finish(status);
    }

    pub fn on_complete(&mut self, listener: impl FnOnce(&BakeResult) + Send + 'static) {
        if self.result.status.is_terminal() {
            listener(&self.result);
        } else {
            self.listeners.push(Box::new(listener));
        }
    }
}

/// The interface shared by every baker kind.
pub trait Baker: Send {
    fn state(&self) -> &BakerState;

    fn state_mut(&mut self) -> &mut BakerState;

    /// Runs the bake to completion on the calling thread.
    fn bake(&mut self);

    /// Requests cancellation; the bake stops at its next checkpoint.
    fn abort(&self) {
        self.state().token().cancel();
    }

    /// A handle which can abort this baker from another thread while it bakes.
    fn cancellation_token(&self) -> CancellationToken {
        self.state().token().clone()
    }

    fn errors(&self) -> &[String] {
        self.result().errors()
    }

    fn on_complete(&mut self, listener: Box<dyn FnOnce(&BakeResult) + Send>) {
        self.state_mut().on_complete(listener);
    }

    fn output_files(&self) -> &[PathBuf] {
        self.result().output_files()
    }

    fn result(&self) -> &BakeResult {
        self.state().result()
    }

    fn status(&self) -> BakeStatus {
        self.result().status()
    }

    fn warnings(&self) -> &[String] {
        self.result().warnings()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn child_tokens_see_parent_cancellation() {
        let parent = CancellationToken::new();
        let child = parent.child();
        let grandchild = child.child();

        assert!(!grandchild.is_cancelled());

        parent.cancel();

        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_cancellation_stays_local() {
        let parent = CancellationToken::new();
        let child = parent.child();
        child.cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn finish_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut state = BakerState::default();

        {
            let calls = Arc::clone(&calls);
            state.on_complete(move |result| {
                assert_eq!(result.status(), BakeStatus::Aborted);
                calls.fetch_add(1, Ordering::Relaxed);
            });
        }

        assert!(state.start());
        assert!(!state.start());
        assert!(state.finish(BakeStatus::Aborted));
        assert!(!state.finish(BakeStatus::Finished));
        assert_eq!(state.result().status(), BakeStatus::Aborted);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn absorb_concatenates_without_dedup() {
        let mut parent = BakeResult::default();
        parent.warn("same");

        let mut child = BakeResult::default();
        child.warn("same");
        child.error("bad");
        child.add_output_file("a.tex");

        parent.absorb(&child);

        assert_eq!(parent.warnings(), ["same", "same"]);
        assert_eq!(parent.errors(), ["bad"]);
        assert_eq!(parent.output_files(), [PathBuf::from("a.tex")]);
    }

    #[test]
    fn settle_prefers_abort_then_errors() {
        let mut state = BakerState::default();
        state.start();
        state.result_mut().error("nope");
        state.settle();

        assert_eq!(state.result().status(), BakeStatus::Failed);

        let token = CancellationToken::new();
        let mut state = BakerState::new(token.clone());
        state.start();
        token.cancel();
        state.settle();

        assert_eq!(state.result().status(), BakeStatus::Aborted);
    }
}
