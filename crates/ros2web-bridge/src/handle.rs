//! Reference-counted ownership of one middleware resource.

use tracing::warn;

type Destructor<T> = Box<dyn FnOnce(T) + Send>;

/// Owns one externally created resource together with the call that tears it
/// down.
///
/// The count starts at 1.  The destructor runs exactly once: when
/// [`release`][Self::release] brings the count to zero, or on
/// [`destroy`][Self::destroy].  A dead handle ignores every further call.
pub struct ResourceHandle<T> {
    resource: Option<T>,
    count: usize,
    destructor: Option<Destructor<T>>,
}

impl<T> ResourceHandle<T> {
    /// Wrap `resource` with one reference.  `destructor` receives it back
    /// when the handle dies.
    pub fn new(resource: T, destructor: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            resource: Some(resource),
            count: 1,
            destructor: Some(Box::new(destructor)),
        }
    }

    /// Add one reference.  No-op on a dead handle.
    pub fn retain(&mut self) {
        if self.is_alive() {
            self.count += 1;
        }
    }

    /// Drop one reference.  Returns `true` if this call destroyed the
    /// resource.
    pub fn release(&mut self) -> bool {
        if !self.is_alive() {
            return false;
        }
        self.count -= 1;
        if self.count == 0 {
            self.destroy();
            true
        } else {
            false
        }
    }

    /// Tear the resource down now, whatever the count.
    pub fn destroy(&mut self) {
        self.count = 0;
        if let Some(resource) = self.resource.take() {
            if let Some(destructor) = self.destructor.take() {
                destructor(resource);
            }
        }
    }

    /// Current reference count.  Zero once dead.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether the destructor has not run yet.
    pub fn is_alive(&self) -> bool {
        self.resource.is_some()
    }

    /// The resource, while the handle is alive.
    pub fn get(&self) -> Option<&T> {
        self.resource.as_ref()
    }
}

impl<T> Drop for ResourceHandle<T> {
    fn drop(&mut self) {
        if self.is_alive() {
            warn!(count = self.count, "resource handle dropped while alive; destroying");
            self.destroy();
        }
    }
}
