use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};

use crate::{Error, Result};

/// A spawned operation whose outcome any number of waiters can await.
/// The task runs to completion even if every waiter goes away.
pub(crate) type Flight<T> = Shared<BoxFuture<'static, Result<T>>>;

pub(crate) fn spawn_shared<T, F>(fut: F) -> Flight<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    async move {
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Aborted(e.to_string())),
        }
    }
    .boxed()
    .shared()
}

/// True while the spawned work has not produced a result. A flight nobody
/// has polled since its task ended still reports `peek() == None`, so it is
/// polled once here to pick up the finished output.
pub(crate) fn is_running<T: Clone>(flight: &Flight<T>) -> bool {
    flight.peek().is_none() && flight.clone().now_or_never().is_none()
}

/// At most one unfinished flight per key.
pub(crate) struct Flights<K, T: Clone> {
    inflight: Mutex<HashMap<K, Flight<T>>>,
}

impl<K, T> Flights<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// The unfinished flight for `key`, if any.
    pub fn get(&self, key: &K) -> Option<Flight<T>> {
        let mut map = self.inflight.lock().expect("flight lock poisoned");
        match map.get(key) {
            Some(flight) if is_running(flight) => Some(flight.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    /// Join the unfinished flight for `key`, or spawn a new one. The bool is
    /// true when this call started the flight.
    pub fn join_or_start<F, Fut>(&self, key: &K, start: F) -> (Flight<T>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut map = self.inflight.lock().expect("flight lock poisoned");
        if let Some(flight) = map.get(key)
            && is_running(flight)
        {
            return (flight.clone(), false);
        }
        let flight = spawn_shared(start());
        map.insert(key.clone(), flight.clone());
        (flight, true)
    }

    /// Spawn a new flight for `key`, superseding any existing one.
    pub fn start<Fut>(&self, key: &K, fut: Fut) -> Flight<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let flight = spawn_shared(fut);
        self.inflight
            .lock()
            .expect("flight lock poisoned")
            .insert(key.clone(), flight.clone());
        flight
    }
}
