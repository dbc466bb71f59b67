//! Services and their registered methods.
//!
//! There is no runtime reflection to discover methods, so services are
//! assembled with an explicit builder: each method supplies its
//! argument and reply types once, and the builder erases them into an
//! invoker closure the server can drive with nothing but raw body
//! bytes and the connection's codec.
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use tinyrpc::Service;
//!
//! #[derive(Serialize, Deserialize)]
//! struct SumArgs {
//!     num1: i32,
//!     num2: i32,
//! }
//!
//! let service = Service::build("Foo")
//!     .method("Sum", |args: SumArgs, reply: &mut i32| {
//!         *reply = args.num1 + args.num2;
//!         Ok(())
//!     })
//!     .finish()
//!     .unwrap();
//! assert_eq!(service.name(), "Foo");
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CodecType;
use crate::error::RpcError;

/// Decode args, allocate a reply, run the handler, encode the reply.
type Invoker = dyn Fn(CodecType, &[u8]) -> Result<Vec<u8>, RpcError> + Send + Sync;

/// One registered method of a service.
pub struct Method {
    num_calls: AtomicU64,
    invoker: Box<Invoker>,
}

impl Method {
    /// How many times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    pub(crate) fn invoke(&self, codec: CodecType, body: &[u8]) -> Result<Vec<u8>, RpcError> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.invoker)(codec, body)
    }
}

/// A named collection of remotely callable methods.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl Service {
    /// Start building a service. The name must be "exported": it has to
    /// begin with an uppercase letter.
    pub fn build(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder { name: name.into(), methods: HashMap::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&Arc<Method>> {
        self.methods.get(name)
    }
}

pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Arc<Method>>,
}

impl ServiceBuilder {
    /// Register a method.
    ///
    /// The handler takes the decoded arguments and a mutable reference
    /// to a freshly allocated reply. `R::default()` is the allocation
    /// rule: maps and vectors start out as empty containers, everything
    /// else as its zero value.
    pub fn method<A, R, F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Default + Send + 'static,
        F: Fn(A, &mut R) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        let invoker = Box::new(move |codec: CodecType, body: &[u8]| {
            let args: A = codec.decode(body)?;
            let mut reply = R::default();
            handler(args, &mut reply)?;
            codec.encode(&reply)
        });
        self.methods.insert(
            name.into(),
            Arc::new(Method { num_calls: AtomicU64::new(0), invoker }),
        );
        self
    }

    pub fn finish(self) -> Result<Service, RpcError> {
        if !self.name.chars().next().is_some_and(char::is_uppercase) {
            return Err(RpcError::InvalidServiceName(self.name));
        }
        tracing::debug!(service = %self.name, methods = self.methods.len(), "service built");
        Ok(Service { name: self.name, methods: self.methods })
    }
}
