use std::{
    any::{Any, TypeId},
    collections::HashMap,
    marker::PhantomData,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
};

use futures::{FutureExt, future::select_all};
use libbootres::BootResourceStore;
use libtgt::TargetReconciler;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::supervisor::WorkerSupervisor;

/// Components shared by the event handlers.
pub struct State {
    config_path: PathBuf,
    supervisor: Arc<WorkerSupervisor>,
    store: Arc<BootResourceStore>,
    reconciler: Arc<TargetReconciler>,
    /// Held while the worker set is being synced, so that a slow stop does
    /// not overlap with the next tick.
    worker_sync: Mutex<()>,
}

impl State {
    pub fn new<P: AsRef<Path>>(
        config_path: P,
        supervisor: Arc<WorkerSupervisor>,
        store: Arc<BootResourceStore>,
        reconciler: Arc<TargetReconciler>,
    ) -> Self {
        State {
            config_path: config_path.as_ref().to_path_buf(),
            supervisor,
            store,
            reconciler,
            worker_sync: Mutex::new(()),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn supervisor(&self) -> &WorkerSupervisor {
        &self.supervisor
    }

    pub fn store(&self) -> &BootResourceStore {
        &self.store
    }

    pub fn reconciler(&self) -> &TargetReconciler {
        &self.reconciler
    }

    /// `None` if a worker sync is already in progress.
    pub fn try_lock_worker_sync(&self) -> Option<MutexGuard<'_, ()>> {
        self.worker_sync.try_lock().ok()
    }
}

type Handler = Arc<
    dyn Fn(Arc<State>, Box<dyn Any + Send>) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;
/// A function generate a future for a event to wait in sync loop.
type Listener = Box<dyn Fn() -> Pin<Box<dyn Future<Output = Box<dyn Any + Send>> + Send>> + Send>;
/// Generated future of a event, listening in the sync loop.
type ListeningFuture = Pin<Box<dyn Future<Output = (TypeId, Box<dyn Any + Send>)> + Send>>;

/// The daemon's main loop.
///
/// Every registered event is listened for continuously: once its future
/// completes, the handler is spawned and a fresh future for the same event
/// is awaited again.
///
/// # Example
/// ```ignore
/// let sync_loop = SyncLoop::new(state).register_event(workers::handler);
/// sync_loop.run(shutdown).await;
/// ```
pub struct SyncLoop {
    state: Arc<State>,
    event_handlers: HashMap<TypeId, Handler>,
    event_listeners: HashMap<TypeId, Listener>,
    event_listen_list: Vec<ListeningFuture>,
}

pub trait Event<D> {
    fn listen() -> Pin<Box<dyn Future<Output = D> + Send>>;
}

impl SyncLoop {
    pub fn new(state: Arc<State>) -> Self {
        SyncLoop {
            state,
            event_handlers: HashMap::new(),
            event_listeners: HashMap::new(),
            event_listen_list: Vec::new(),
        }
    }

    /// Register a event handler.
    ///
    /// - The `handler` should have the following function signature:
    ///   `async fn handler(state: Arc<State>, data: Box<D>, _: WithEvent<SomeEvent>);`
    ///   , where `WithEvent<SomeEvent>` marks the event the handler belongs to.
    /// - The event must implement `Event<D>`, `D` being the data passed to
    ///   the handler when the event occurs.
    pub fn register_event<T, D, F, O>(mut self, handler: F) -> Self
    where
        T: Event<D> + 'static,
        D: Send + 'static,
        O: Future<Output = ()> + Send,
        F: (Fn(Arc<State>, Box<D>, WithEvent<T>) -> O) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let handler = Arc::new(move |state, data: Box<dyn Any + Send>| {
            let handle = handler.clone();
            async move {
                // Listener and handler are registered together under the
                // same TypeId, so the data always has type D.
                let Ok(data) = data.downcast::<D>() else {
                    error!("Dropping event with unexpected data type");
                    return;
                };
                handle(
                    state,
                    data,
                    WithEvent {
                        _marker: PhantomData,
                    },
                )
                .await;
            }
            .boxed()
        });
        self.event_handlers.insert(TypeId::of::<T>(), handler);
        let listener = Box::new(move || {
            async move { Box::new(T::listen().await) as Box<dyn Any + Send> }.boxed()
        });
        self.event_listeners.insert(TypeId::of::<T>(), listener);
        self
    }

    /// Get Future from each event.
    fn gen_event_list(&mut self) {
        self.event_listen_list = self
            .event_listeners
            .iter()
            .map(|(id, f)| listening(*id, f))
            .collect();
    }

    /// Run the loop until `shutdown` is cancelled. Handlers already spawned
    /// are left to finish on their own.
    pub async fn run(mut self, shutdown: CancellationToken) {
        self.gen_event_list();
        if self.event_listen_list.is_empty() {
            shutdown.cancelled().await;
            return;
        }

        loop {
            let list = std::mem::take(&mut self.event_listen_list);
            let ((id, data), _, remain) = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = select_all(list) => res,
            };
            self.event_listen_list = remain;

            let (Some(handler), Some(listener)) =
                (self.event_handlers.get(&id), self.event_listeners.get(&id))
            else {
                continue;
            };
            let handler = handler.clone();
            let state = self.state.clone();
            tokio::spawn(async move { handler(state, data).await });

            self.event_listen_list.push(listening(id, listener));
        }
        debug!("Sync loop stopped");
    }
}

fn listening(id: TypeId, listener: &Listener) -> ListeningFuture {
    let fut = listener();
    async move { (id, fut.await) }.boxed()
}

pub struct WithEvent<T> {
    _marker: PhantomData<T>,
}
