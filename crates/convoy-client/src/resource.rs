use parking_lot::Mutex;

/// Something the session holds on behalf of the UI, such as an audio
/// recorder or an in-flight media upload.
pub trait SessionResource: Send + Sync {
    fn name(&self) -> &str;
    fn release(&self);
}

/// Resources attached to a session. `release_all` runs each release once;
/// later calls and later attachments after release are no-ops.
#[derive(Default)]
pub struct ResourceSet {
    inner: Mutex<ResourceSlot>,
}

#[derive(Default)]
struct ResourceSlot {
    resources: Vec<Box<dyn SessionResource>>,
    released: bool,
}

impl ResourceSet {
    /// Returns the resource back when the set was already released.
    pub fn attach(&self, resource: Box<dyn SessionResource>) -> Result<(), Box<dyn SessionResource>> {
        let mut slot = self.inner.lock();
        if slot.released {
            return Err(resource);
        }
        slot.resources.push(resource);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release everything in reverse attach order. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let resources = {
            let mut slot = self.inner.lock();
            slot.released = true;
            std::mem::take(&mut slot.resources)
        };
        for resource in resources.iter().rev() {
            tracing::debug!(resource = resource.name(), "Releasing session resource");
            resource.release();
        }
        resources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counted(Arc<AtomicUsize>);

    impl SessionResource for Counted {
        fn name(&self) -> &str {
            "counted"
        }
        fn release(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn release_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let set = ResourceSet::default();
        assert!(set.attach(Box::new(Counted(Arc::clone(&count)))).is_ok());
        assert!(set.attach(Box::new(Counted(Arc::clone(&count)))).is_ok());

        assert_eq!(set.release_all(), 2);
        assert_eq!(set.release_all(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn attach_after_release_is_refused() {
        let set = ResourceSet::default();
        set.release_all();
        let count = Arc::new(AtomicUsize::new(0));
        assert!(set.attach(Box::new(Counted(count))).is_err());
        assert!(set.is_empty());
    }
}
