//! Request interceptors wrapped around every dispatched request.
//!
//! Interceptors can inspect or short-circuit a request before it reaches the
//! serving context and observe the response afterwards. They run in priority
//! order on the way in and in exactly the reverse order on the way out.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use portico_protocol::{BoxError, CallContext, HandlerRules};

/// Outcome of an interceptor call. Errors are logged by the pipeline and never
/// abort the request.
pub type InterceptResult<T> = Result<T, BoxError>;

/// Trait for request interceptors.
pub trait Interceptor: Send + Sync {
    /// Interceptor name for logging and the admin view.
    fn name(&self) -> &str;

    /// Ordering key (lower runs first).
    fn priority(&self) -> i32 {
        0
    }

    /// Disabled interceptors are skipped on both phases.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Inspect a request before dispatch. Returning `Ok(true)` claims it: the
    /// rest of the chain and the serving context are skipped.
    fn before(
        &self,
        ctx: &mut CallContext,
    ) -> impl Future<Output = InterceptResult<bool>> + Send;

    /// Observe the request after dispatch (optional).
    fn after(&self, _ctx: &mut CallContext) -> impl Future<Output = InterceptResult<()>> + Send {
        async { Ok(()) }
    }

    /// The configurable capability, for interceptors that take handler rules.
    fn configurable(&self) -> Option<&dyn Configurable> {
        None
    }
}

/// Capability of interceptors that consume [`HandlerRules`].
///
/// Called on every chain rebuild with the full current rule set.
pub trait Configurable: Send + Sync {
    fn configure(&self, rules: &HandlerRules);
}

/// Boxed future returned by the object-safe interceptor methods.
pub type InterceptFuture<'a, T> = Pin<Box<dyn Future<Output = InterceptResult<T>> + Send + 'a>>;

/// Object-safe version of [`Interceptor`]: all refs share lifetime `'a`.
pub trait InterceptorDyn: Send + Sync {
    fn name_dyn(&self) -> &str;
    fn priority_dyn(&self) -> i32;
    fn is_enabled_dyn(&self) -> bool;
    fn before_dyn<'a>(&'a self, ctx: &'a mut CallContext) -> InterceptFuture<'a, bool>;
    fn after_dyn<'a>(&'a self, ctx: &'a mut CallContext) -> InterceptFuture<'a, ()>;
    fn configurable_dyn(&self) -> Option<&dyn Configurable>;
}

impl<T: Interceptor> InterceptorDyn for T {
    fn name_dyn(&self) -> &str {
        self.name()
    }

    fn priority_dyn(&self) -> i32 {
        self.priority()
    }

    fn is_enabled_dyn(&self) -> bool {
        self.is_enabled()
    }

    fn before_dyn<'a>(&'a self, ctx: &'a mut CallContext) -> InterceptFuture<'a, bool> {
        Box::pin(self.before(ctx))
    }

    fn after_dyn<'a>(&'a self, ctx: &'a mut CallContext) -> InterceptFuture<'a, ()> {
        Box::pin(self.after(ctx))
    }

    fn configurable_dyn(&self) -> Option<&dyn Configurable> {
        self.configurable()
    }
}

/// Interceptor instance shared between the registry, snapshots and requests.
pub type SharedInterceptor = Arc<dyn InterceptorDyn>;

/// Erase a concrete interceptor into a [`SharedInterceptor`].
pub fn shared<I: Interceptor + 'static>(interceptor: I) -> SharedInterceptor {
    Arc::new(interceptor)
}
