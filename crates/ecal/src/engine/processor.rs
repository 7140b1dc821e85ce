//! The event processor: matches events to rules and runs rule bodies on a
//! bounded worker pool.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, RwLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::{
    engine::{
        Event, Monitor,
        rule::{Rule, execution_plan},
    },
    errors::{ErrorKind, RuntimeError, RuntimeErrorWithDetail},
    eval,
    provider::ProviderCore,
    scope::Scope,
};

enum Task {
    /// Match an event against the rule set and fan out trigger tasks.
    Match { event: Event, monitor: Monitor },
    /// Run one sink body for a matched event.
    Trigger {
        rule: Arc<Rule>,
        event: Event,
        monitor: Monitor,
    },
}

struct ProcessorInner {
    provider: Weak<ProviderCore>,
    worker_count: usize,
    rules: RwLock<BTreeMap<String, Arc<Rule>>>,
    stopped: AtomicBool,
    channel: Mutex<Option<(Sender<Task>, Receiver<Task>)>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Matches events to registered sink rules and schedules their execution
/// with priority ordering and suppression.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

impl Processor {
    pub(crate) fn new(provider: Weak<ProviderCore>, worker_count: usize) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                provider,
                worker_count: worker_count.max(1),
                rules: RwLock::new(BTreeMap::new()),
                stopped: AtomicBool::new(true),
                channel: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Registers a rule. A rule with an already registered name replaces
    /// the prior registration.
    pub fn add_rule(&self, rule: Rule) {
        self.inner
            .rules
            .write()
            .expect("rule lock poisoned")
            .insert(rule.name.clone(), Arc::new(rule));
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.inner
            .rules
            .read()
            .expect("rule lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Starts the worker pool. Starting a running processor is a no-op.
    pub fn start(&self) {
        let mut channel = self.inner.channel.lock().expect("processor lock poisoned");
        if channel.is_some() {
            return;
        }
        let (sender, receiver) = unbounded();
        *channel = Some((sender.clone(), receiver.clone()));
        self.inner.stopped.store(false, Ordering::SeqCst);
        let mut workers = self.inner.workers.lock().expect("processor lock poisoned");
        for i in 0..self.inner.worker_count {
            let inner = Arc::clone(&self.inner);
            let receiver = receiver.clone();
            let sender = sender.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("ecal-worker-{i}"))
                    .spawn(move || worker_loop(&inner, &receiver, &sender))
                    .expect("failed to spawn worker thread"),
            );
        }
    }

    /// Stops the processor: new events are refused, in-flight events drain,
    /// worker threads are joined.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let workers: Vec<JoinHandle<()>> = self
            .inner
            .workers
            .lock()
            .expect("processor lock poisoned")
            .drain(..)
            .collect();
        for handle in workers {
            let _ = handle.join();
        }
        *self.inner.channel.lock().expect("processor lock poisoned") = None;
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Injects an event without blocking. The returned monitor's done signal
    /// fires when all direct and transitively triggered rule executions have
    /// completed.
    pub fn add_event(&self, event: Event, parent: Option<&Monitor>) -> Monitor {
        let monitor = match parent {
            Some(parent) => parent.new_child(event.clone()),
            None => Monitor::new_root(event.clone()),
        };
        monitor.begin_task();
        if self.inner.stopped.load(Ordering::SeqCst) {
            let mut error = RuntimeError::new(ErrorKind::InvalidState, "Processor is stopped");
            error.source = event.name().to_owned();
            monitor.add_error(
                "",
                RuntimeErrorWithDetail {
                    error,
                    environment: serde_json::Value::Null,
                    data: None,
                },
            );
            monitor.end_task();
            return monitor;
        }
        let sender = self
            .inner
            .channel
            .lock()
            .expect("processor lock poisoned")
            .as_ref()
            .map(|(sender, _)| sender.clone());
        match sender {
            Some(sender) => {
                sender
                    .send(Task::Match {
                        event,
                        monitor: monitor.clone(),
                    })
                    .expect("processor channel closed while running");
            }
            None => monitor.end_task(),
        }
        monitor
    }

    /// Injects an event and blocks until its monitor completes.
    pub fn add_event_and_wait(&self, event: Event, parent: Option<&Monitor>) -> Monitor {
        let monitor = self.add_event(event, parent);
        monitor.wait();
        monitor
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processor(workers:{} rules:{})",
            self.inner.worker_count,
            self.inner.rules.read().expect("rule lock poisoned").len()
        )
    }
}

/// Worker main loop. After a stop request, a worker exits once the queue is
/// drained; tasks spawned by an in-flight task are always drained by their
/// producing worker at the latest.
fn worker_loop(inner: &Arc<ProcessorInner>, receiver: &Receiver<Task>, sender: &Sender<Task>) {
    loop {
        match receiver.recv_timeout(Duration::from_millis(20)) {
            Ok(task) => process_task(inner, sender, task),
            Err(RecvTimeoutError::Timeout) => {
                if inner.stopped.load(Ordering::SeqCst) && receiver.is_empty() {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

fn process_task(inner: &Arc<ProcessorInner>, sender: &Sender<Task>, task: Task) {
    match task {
        Task::Match { event, monitor } => {
            let matched: Vec<Arc<Rule>> = inner
                .rules
                .read()
                .expect("rule lock poisoned")
                .values()
                .filter(|rule| rule.matches(&event))
                .cloned()
                .collect();
            for rule in execution_plan(matched) {
                let child = monitor.new_child(event.clone());
                child.begin_task();
                sender
                    .send(Task::Trigger {
                        rule,
                        event: event.clone(),
                        monitor: child,
                    })
                    .expect("processor channel closed while running");
            }
            monitor.end_task();
        }
        Task::Trigger {
            rule,
            event,
            monitor,
        } => {
            if let Some(provider) = inner.provider.upgrade() {
                run_trigger(&provider, &rule, &event, &monitor);
            }
            monitor.end_task();
        }
    }
}

/// Runs one sink body with a fresh thread id and a fresh child scope of the
/// global scope, binding the `event` variable. Errors are recorded on the
/// monitor together with a snapshot of the sink's variable environment.
fn run_trigger(provider: &Arc<ProviderCore>, rule: &Rule, event: &Event, monitor: &Monitor) {
    let Some(body) = &rule.body else {
        return;
    };
    let tid = provider.new_tid();
    let scope = Scope::new_with_parent(format!("sink: {}", rule.name), &provider.global_scope);
    let _ = scope.set_local_value("event", event.to_value());
    match eval::eval_with_monitor(body, &scope, provider, tid, Some(monitor.clone())) {
        Ok(_) => {}
        Err(error) => {
            provider.logger.log_error(
                &rule.name,
                format_args!("error in sink {}: {error}", rule.name),
            );
            monitor.add_error(
                rule.name.clone(),
                RuntimeErrorWithDetail {
                    error,
                    environment: serde_json::Value::Object(scope.to_json_object()),
                    data: None,
                },
            );
        }
    }
}
