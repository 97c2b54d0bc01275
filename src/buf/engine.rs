//! A small, typed dataflow graph.
//!
//! Jobs are added in the order they must execute and declare their inputs as bindings to the
//! outputs of earlier jobs (or to external inputs of the engine). Running the engine executes each
//! job exactly once on the calling thread.

use {
    super::state::CancellationToken,
    log::{debug, trace},
    std::{any::Any, cell::RefCell, marker::PhantomData},
};

/// Shared state handed to every job while the engine runs.
#[derive(Debug, Default)]
pub struct BakeContext {
    token: CancellationToken,
    warnings: RefCell<Vec<String>>,
}

impl BakeContext {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            warnings: Default::default(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn take_warnings(&self) -> Vec<String> {
        self.warnings.take()
    }

    /// Records a recoverable problem; the job keeps going.
    pub fn warn(&self, msg: impl Into<String>) {
        let msg = msg.into();
        debug!("{msg}");
        self.warnings.borrow_mut().push(msg);
    }
}

/// Configuration for jobs whose only knob is skipping their work.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughConfig {
    pub passthrough: bool,
}

/// One node of the graph.
///
/// A job that cannot produce meaningful output still returns a well-defined (usually empty)
/// output so that later jobs degrade gracefully.
pub trait Job: 'static {
    type Config: 'static;
    type Input: 'static;
    type Output: Clone + Default + 'static;

    fn configure(&mut self, _config: &Self::Config) {}

    fn run(&mut self, ctx: &BakeContext, input: &Self::Input) -> Self::Output;
}

/// A typed handle to a value slot of an [`Engine`].
pub struct Var<T> {
    slot: usize,
    __: PhantomData<fn() -> T>,
}

impl<T> Clone for Var<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Var<T> {}

impl<T> std::fmt::Debug for Var<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Var({})", self.slot)
    }
}

/// Values produced while an [`Engine`] runs.
#[derive(Default)]
pub struct Store {
    slots: Vec<Option<Box<dyn Any>>>,
}

impl Store {
    fn alloc<T>(&mut self) -> Var<T> {
        let slot = self.slots.len();
        self.slots.push(None);

        Var {
            slot,
            __: PhantomData,
        }
    }

    fn get<T: 'static>(&self, var: Var<T>) -> Option<&T> {
        self.slots
            .get(var.slot)
            .and_then(Option::as_ref)
            .and_then(|val| val.downcast_ref())
    }

    fn set<T: 'static>(&mut self, var: Var<T>, val: T) {
        self.slots[var.slot] = Some(Box::new(val));
    }
}

/// Something a job input can be read from: a single [`Var`] or a tuple of bindings.
pub trait Binding: 'static {
    type Value;

    fn fetch(&self, store: &Store) -> Self::Value;
}

impl<T> Binding for Var<T>
where
    T: Clone + Default + 'static,
{
    type Value = T;

    fn fetch(&self, store: &Store) -> T {
        store.get(*self).cloned().unwrap_or_default()
    }
}

macro_rules! tuple_binding {
    ($($name:ident $idx:tt),+) => {
        impl<$($name: Binding),+> Binding for ($($name,)+) {
            type Value = ($($name::Value,)+);

            fn fetch(&self, store: &Store) -> Self::Value {
                ($(self.$idx.fetch(store),)+)
            }
        }
    };
}

tuple_binding!(A 0);
tuple_binding!(A 0, B 1);
tuple_binding!(A 0, B 1, C 2);
tuple_binding!(A 0, B 1, C 2, D 3);
tuple_binding!(A 0, B 1, C 2, D 3, E 4);
tuple_binding!(A 0, B 1, C 2, D 3, E 4, F 5);

trait Node {
    fn configure(&mut self, config: &dyn Any) -> bool;

    fn name(&self) -> &str;

    fn run(&mut self, ctx: &BakeContext, store: &mut Store);
}

struct JobNode<J, B>
where
    J: Job,
{
    binding: B,
    job: J,
    name: String,
    output: Var<J::Output>,
}

impl<J, B> Node for JobNode<J, B>
where
    J: Job,
    B: Binding<Value = J::Input>,
{
    fn configure(&mut self, config: &dyn Any) -> bool {
        if let Some(config) = config.downcast_ref::<J::Config>() {
            self.job.configure(config);

            true
        } else {
            false
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, ctx: &BakeContext, store: &mut Store) {
        let input = self.binding.fetch(store);
        let output = self.job.run(ctx, &input);
        store.set(self.output, output);
    }
}

/// An ordered list of jobs and the values flowing between them.
pub struct Engine {
    ctx: BakeContext,
    name: String,
    nodes: Vec<Box<dyn Node>>,
    store: Store,
}

impl Engine {
    pub fn new(name: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            ctx: BakeContext::new(token),
            name: name.into(),
            nodes: vec![],
            store: Default::default(),
        }
    }

    /// Appends a job reading `binding`; it runs after every job added before it.
    pub fn add_job<J, B>(&mut self, name: impl Into<String>, job: J, binding: B) -> Var<J::Output>
    where
        J: Job,
        B: Binding<Value = J::Input>,
    {
        let output = self.store.alloc();
        self.nodes.push(Box::new(JobNode {
            binding,
            job,
            name: name.into(),
            output,
        }));

        output
    }

    /// Passes `config` to the named job; returns `false` if there is no such job or the config has
    /// the wrong type.
    pub fn configure<C: 'static>(&mut self, name: &str, config: &C) -> bool {
        self.nodes
            .iter_mut()
            .find(|node| node.name() == name)
            .map(|node| node.configure(config))
            .unwrap_or_default()
    }

    pub fn context(&self) -> &BakeContext {
        &self.ctx
    }

    /// Provides the value of an external input.
    pub fn feed<T: 'static>(&mut self, var: Var<T>, val: T) {
        self.store.set(var, val);
    }

    /// Declares an external input; its value is supplied with [`Engine::feed`].
    pub fn input<T>(&mut self) -> Var<T> {
        self.store.alloc()
    }

    /// Reads a value after the engine ran. Unset values read as their default.
    pub fn output<T>(&self, var: Var<T>) -> T
    where
        T: Clone + Default + 'static,
    {
        var.fetch(&self.store)
    }

    /// Executes every job once, in declaration order. Returns `false` when cancellation stopped
    /// the run before the last job.
    pub fn run(&mut self) -> bool {
        trace!("Running engine {}", self.name);

        for node in &mut self.nodes {
            if self.ctx.is_cancelled() {
                debug!("Engine {} cancelled before {}", self.name, node.name());

                return false;
            }

            trace!("Running job {}", node.name());

            node.run(&self.ctx, &mut self.store);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Add;

    impl Job for Add {
        type Config = ();
        type Input = (i32, i32);
        type Output = i32;

        fn run(&mut self, _: &BakeContext, &(a, b): &Self::Input) -> i32 {
            a + b
        }
    }

    struct Scale(i32);

    impl Job for Scale {
        type Config = PassthroughConfig;
        type Input = i32;
        type Output = i32;

        fn configure(&mut self, config: &PassthroughConfig) {
            if config.passthrough {
                self.0 = 1;
            }
        }

        fn run(&mut self, ctx: &BakeContext, &input: &i32) -> i32 {
            if input < 0 {
                ctx.warn("negative");
            }

            input * self.0
        }
    }

    #[test]
    fn jobs_feed_each_other_in_order() {
        let mut engine = Engine::new("test", CancellationToken::new());
        let a = engine.input::<i32>();
        let b = engine.input::<i32>();
        let sum = engine.add_job("Add", Add, (a, b));
        let scaled = engine.add_job("Scale", Scale(10), sum);

        engine.feed(a, 2);
        engine.feed(b, -5);

        assert!(engine.run());
        assert_eq!(engine.output(sum), -3);
        assert_eq!(engine.output(scaled), -30);
        assert_eq!(engine.context().take_warnings(), vec!["negative".to_owned()]);
    }

    #[test]
    fn configure_targets_named_job() {
        let mut engine = Engine::new("test", CancellationToken::new());
        let a = engine.input::<i32>();
        let scaled = engine.add_job("Scale", Scale(10), a);
        engine.feed(a, 4);

        assert!(engine.configure("Scale", &PassthroughConfig { passthrough: true }));
        assert!(!engine.configure("Scale", &42u32));
        assert!(!engine.configure("Missing", &PassthroughConfig::default()));
        assert!(engine.run());
        assert_eq!(engine.output(scaled), 4);
    }

    #[test]
    fn missing_inputs_read_as_default() {
        let mut engine = Engine::new("test", CancellationToken::new());
        let a = engine.input::<i32>();
        let scaled = engine.add_job("Scale", Scale(3), a);

        assert!(engine.run());
        assert_eq!(engine.output(scaled), 0);
    }

    #[test]
    fn cancelled_engine_stops_between_jobs() {
        let token = CancellationToken::new();
        let mut engine = Engine::new("test", token.clone());
        let a = engine.input::<i32>();
        let scaled = engine.add_job("Scale", Scale(3), a);
        engine.feed(a, 1);
        token.cancel();

        assert!(!engine.run());
        assert_eq!(engine.output(scaled), 0);
    }
}
