use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use color_eyre::Result;
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;

static SHARED_CONTEXT: Mutex<Weak<GraphicsContext>> = parking_lot::const_mutex(Weak::new());
static CONTEXT_ALIVE: AtomicBool = AtomicBool::new(false);

/// Process-wide handle to the Vulkan loader.
///
/// The first [`GraphicsContext::acquire`] loads the library, later calls share it, and the
/// loader is unloaded when the last `Arc` is dropped.
pub struct GraphicsContext {
    entry: ManuallyDrop<ash::Entry>,
}

impl GraphicsContext {
    pub fn acquire() -> Result<Arc<Self>> {
        loop {
            let mut shared = SHARED_CONTEXT.lock();
            if let Some(context) = shared.upgrade() {
                return Ok(context);
            }

            // The previous context may still be tearing down on another thread.
            if !CONTEXT_ALIVE.load(Ordering::Acquire) {
                let context = Arc::new(Self::load()?);
                *shared = Arc::downgrade(&context);
                return Ok(context);
            }

            drop(shared);
            std::thread::yield_now();
        }
    }

    fn load() -> Result<Self> {
        let was_alive = CONTEXT_ALIVE.swap(true, Ordering::AcqRel);
        debug_assert!(!was_alive, "graphics context constructed twice");

        let entry = match unsafe { ash::Entry::load() } {
            Ok(entry) => entry,
            Err(err) => {
                CONTEXT_ALIVE.store(false, Ordering::Release);
                return Err(err.into());
            }
        };
        log::info!("Vulkan loader initialized");

        Ok(Self {
            entry: ManuallyDrop::new(entry),
        })
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn is_alive() -> bool {
        CONTEXT_ALIVE.load(Ordering::Acquire)
    }

    /// Instance extensions needed to present to windows of the given display.
    pub fn required_instance_extensions(
        &self,
        display: Option<RawDisplayHandle>,
    ) -> Result<Vec<&'static CStr>> {
        let Some(display) = display else {
            return Ok(Vec::new());
        };

        Ok(ash_window::enumerate_required_extensions(display)?
            .iter()
            .map(|ext| unsafe { CStr::from_ptr(*ext) })
            .collect())
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.entry);
        }
        CONTEXT_ALIVE.store(false, Ordering::Release);
        log::info!("Vulkan loader released");
    }
}
