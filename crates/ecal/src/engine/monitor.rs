//! Monitors tracking the lifecycle and errors of event processing.
//!
//! Every injected event gets a monitor; each rule activation for the event
//! gets a child monitor. Task accounting propagates up the parent chain, so
//! a monitor completes only after all transitively triggered work under it
//! has completed.

use std::sync::{Arc, Condvar, Mutex, Weak};

use crate::{engine::Event, errors::RuntimeErrorWithDetail};

/// An error collected during event processing, attributed to the event and
/// the sink whose body produced it.
#[derive(Debug, Clone)]
pub struct MonitorError {
    pub event: String,
    pub sink: String,
    pub error: RuntimeErrorWithDetail,
}

struct MonitorState {
    outstanding: u64,
    finished: bool,
}

struct MonitorInner {
    event: Event,
    parent: Option<Weak<MonitorInner>>,
    children: Mutex<Vec<Monitor>>,
    errors: Mutex<Vec<MonitorError>>,
    state: Mutex<MonitorState>,
    cond: Condvar,
}

/// Tree node tracking one event's rule activations.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl Monitor {
    /// Creates a root monitor for an event injected from the outside.
    pub fn new_root(event: Event) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                event,
                parent: None,
                children: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                state: Mutex::new(MonitorState {
                    outstanding: 0,
                    finished: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Creates a child monitor for an event caused by processing under this
    /// monitor.
    pub fn new_child(&self, event: Event) -> Self {
        let child = Self {
            inner: Arc::new(MonitorInner {
                event,
                parent: Some(Arc::downgrade(&self.inner)),
                children: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                state: Mutex::new(MonitorState {
                    outstanding: 0,
                    finished: false,
                }),
                cond: Condvar::new(),
            }),
        };
        self.inner
            .children
            .lock()
            .expect("monitor lock poisoned")
            .push(child.clone());
        child
    }

    pub fn event(&self) -> &Event {
        &self.inner.event
    }

    /// The root of this monitor's tree.
    pub fn root_monitor(&self) -> Self {
        let mut current = self.clone();
        while let Some(parent) = current
            .inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Self { inner })
        {
            current = parent;
        }
        current
    }

    /// Registers one unit of work under this monitor. Propagates to all
    /// ancestors so their completion happens after this work ends.
    pub(crate) fn begin_task(&self) {
        for inner in self.chain() {
            let mut state = inner.state.lock().expect("monitor lock poisoned");
            state.outstanding += 1;
        }
    }

    /// Ends one unit of work. A monitor whose count drops to zero fires its
    /// done signal.
    pub(crate) fn end_task(&self) {
        for inner in self.chain() {
            let mut state = inner.state.lock().expect("monitor lock poisoned");
            state.outstanding -= 1;
            if state.outstanding == 0 {
                state.finished = true;
                inner.cond.notify_all();
            }
        }
    }

    fn chain(&self) -> Vec<Arc<MonitorInner>> {
        let mut chain = vec![Arc::clone(&self.inner)];
        while let Some(parent) = chain
            .last()
            .expect("chain starts non-empty")
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
        {
            chain.push(parent);
        }
        chain
    }

    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().expect("monitor lock poisoned").finished
    }

    /// Blocks until all work under this monitor has completed.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock().expect("monitor lock poisoned");
        while !state.finished {
            state = self
                .inner
                .cond
                .wait(state)
                .expect("monitor lock poisoned");
        }
    }

    pub(crate) fn add_error(&self, sink: impl Into<String>, error: RuntimeErrorWithDetail) {
        self.inner
            .errors
            .lock()
            .expect("monitor lock poisoned")
            .push(MonitorError {
                event: self.inner.event.name().to_owned(),
                sink: sink.into(),
                error,
            });
    }

    /// Pre-order flattening of the errors of this monitor and all its
    /// descendants.
    pub fn all_errors(&self) -> Vec<MonitorError> {
        let mut out = Vec::new();
        self.collect_errors(&mut out);
        out
    }

    fn collect_errors(&self, out: &mut Vec<MonitorError>) {
        out.extend(
            self.inner
                .errors
                .lock()
                .expect("monitor lock poisoned")
                .iter()
                .cloned(),
        );
        for child in self.inner.children.lock().expect("monitor lock poisoned").iter() {
            child.collect_errors(out);
        }
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("monitor lock poisoned");
        write!(
            f,
            "Monitor({} outstanding:{} finished:{})",
            self.inner.event.name(),
            state.outstanding,
            state.finished
        )
    }
}
