use super::context::IpcContext;
use super::interrupt::{default_trigger_id, DoorbellLine, InterruptLine};
use crate::error::{IpcError, Result};
use crate::Core::arena::Arena;
use crate::Core::spinlock::{InterruptMask, NoInterruptMask};
use crate::Core::SharedMemory::{
    attach_shared_memory, create_shared_memory, HeapMemory, SharedMemoryBackend,
};
use std::sync::Arc;

pub const DEFAULT_ARENA_SIZE: usize = 1024 * 1024; // 1MB default

/// Configures and brings up one core.
///
/// The master creates the backing memory (a `/dev/shm` file when a name is given, process
/// memory otherwise); other cores attach to the named file or are handed the same backend.
pub struct CoreBuilder {
    core_index: u8,
    master: bool,
    arena_size: usize,
    shm_name: Option<String>,
    backend: Option<Box<dyn SharedMemoryBackend>>,
    trigger_id: Option<u32>,
    line: Option<Arc<dyn InterruptLine>>,
    mask: Option<Arc<dyn InterruptMask>>,
}

impl Default for CoreBuilder {
    fn default() -> Self {
        Self {
            core_index: 0,
            master: true,
            arena_size: DEFAULT_ARENA_SIZE,
            shm_name: None,
            backend: None,
            trigger_id: None,
            line: None,
            mask: None,
        }
    }
}

impl CoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a non-master core.
    pub fn attach(core_index: u8) -> Self {
        Self::default().with_core_index(core_index).with_master(false)
    }

    pub fn with_core_index(mut self, core_index: u8) -> Self {
        self.core_index = core_index;
        self
    }

    pub fn with_master(mut self, master: bool) -> Self {
        self.master = master;
        self
    }

    pub fn with_arena_size(mut self, size: usize) -> Self {
        self.arena_size = size;
        self
    }

    /// Back the arena with `/dev/shm/<name>`.
    pub fn with_shm_name(mut self, name: impl Into<String>) -> Self {
        self.shm_name = Some(name.into());
        self
    }

    /// Use an existing backend, e.g. an `Arc<HeapMemory>` shared by in-process cores.
    pub fn with_backend(mut self, backend: impl SharedMemoryBackend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn with_trigger_id(mut self, trigger_id: u32) -> Self {
        self.trigger_id = Some(trigger_id);
        self
    }

    pub fn with_interrupt_line(mut self, line: Arc<dyn InterruptLine>) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_interrupt_mask(mut self, mask: Arc<dyn InterruptMask>) -> Self {
        self.mask = Some(mask);
        self
    }

    fn backend(&mut self) -> Result<Box<dyn SharedMemoryBackend>> {
        if let Some(backend) = self.backend.take() {
            return Ok(backend);
        }
        match (&self.shm_name, self.master) {
            (Some(name), true) => Ok(create_shared_memory(self.arena_size, name)?),
            (Some(name), false) => Ok(attach_shared_memory(name, self.arena_size)?),
            (None, true) => Ok(Box::new(HeapMemory::new(self.arena_size))),
            (None, false) => Err(IpcError::Error(format!(
                "core {} is not the master and has no arena to attach to",
                self.core_index
            ))),
        }
    }

    pub fn build(mut self) -> Result<IpcContext> {
        let arena = Arena::new(self.backend()?)?;
        IpcContext::initialize(
            arena,
            self.core_index,
            self.master,
            self.trigger_id
                .unwrap_or_else(|| default_trigger_id(self.core_index)),
            self.line.unwrap_or_else(|| Arc::new(DoorbellLine)),
            self.mask.unwrap_or_else(|| Arc::new(NoInterruptMask)),
        )
    }
}
