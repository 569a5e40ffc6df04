//! Stream-kind registry: maps the kind carried in an Open payload to
//! the worker that serves it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use crate::StreamContext;

/// Type alias for a boxed async stream handler.
pub type BoxedStreamHandler =
    Box<dyn Fn(StreamContext) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Registry of stream kinds this relay serves.
#[derive(Default)]
pub struct StreamRegistry {
    handlers: HashMap<String, BoxedStreamHandler>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the worker for a stream kind. Replaces any previous
    /// registration for the same kind.
    pub fn register<F, Fut>(&mut self, kind: &str, handler: F)
    where
        F: Fn(StreamContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: BoxedStreamHandler = Box::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers.insert(kind.to_owned(), boxed);
    }

    pub(crate) fn get(&self, kind: &str) -> Option<&BoxedStreamHandler> {
        self.handlers.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
