//! Test node kinds shared by the integration suites.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use terrace_core::{
    FlowError, Inputs, JobHandle, MeshSettings, Node, NodeTask, Outputs, PortKind, PortSpec,
    ProcessContext,
};

const VALUE_OUT: &[PortSpec] = &[PortSpec::required("value", PortKind::Any)];
const PASS_IN: &[PortSpec] = &[PortSpec::required("in", PortKind::Any)];

// =============================================================================
// COUNTING SOURCE
// =============================================================================

/// Publishes a constant and counts how often `process` ran.
#[derive(Debug, Clone)]
pub struct CountingSource {
    pub value: u32,
    pub calls: Arc<AtomicUsize>,
}

impl CountingSource {
    pub fn new(value: u32) -> Self {
        Self {
            value,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Node for CountingSource {
    fn kind(&self) -> &'static str {
        "counting_source"
    }

    fn inputs(&self) -> &[PortSpec] {
        &[]
    }

    fn outputs(&self) -> &[PortSpec] {
        VALUE_OUT
    }

    fn create_task(&self, _settings: &MeshSettings) -> Box<dyn NodeTask> {
        Box::new(SourceTask {
            value: self.value,
            calls: Arc::clone(&self.calls),
        })
    }
}

struct SourceTask {
    value: u32,
    calls: Arc<AtomicUsize>,
}

impl NodeTask for SourceTask {
    fn set_input_values(&mut self, _inputs: &mut Inputs<'_>) -> bool {
        true
    }

    fn process(&mut self, _ctx: &mut ProcessContext<'_>) -> Result<bool, FlowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn cache_output_values(&mut self, outputs: &mut Outputs<'_>) {
        outputs.publish("value", self.value, JobHandle::completed());
    }
}

// =============================================================================
// PASS THROUGH
// =============================================================================

/// Adds one to its input, on a scheduled job.
#[derive(Debug, Clone, Default)]
pub struct AddOne {
    pub calls: Arc<AtomicUsize>,
}

impl AddOne {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Node for AddOne {
    fn kind(&self) -> &'static str {
        "add_one"
    }

    fn inputs(&self) -> &[PortSpec] {
        PASS_IN
    }

    fn outputs(&self) -> &[PortSpec] {
        VALUE_OUT
    }

    fn create_task(&self, _settings: &MeshSettings) -> Box<dyn NodeTask> {
        Box::new(AddOneTask {
            calls: Arc::clone(&self.calls),
            input: None,
            dependencies: JobHandle::completed(),
            result: None,
        })
    }
}

struct AddOneTask {
    calls: Arc<AtomicUsize>,
    input: Option<Arc<u32>>,
    dependencies: JobHandle,
    result: Option<(Arc<std::sync::Mutex<u32>>, JobHandle)>,
}

impl NodeTask for AddOneTask {
    fn set_input_values(&mut self, inputs: &mut Inputs<'_>) -> bool {
        self.input = inputs.try_get_input::<u32>("in");
        self.dependencies = inputs.dependencies();
        self.input.is_some()
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<bool, FlowError> {
        if self.result.is_none() {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Some(input) = self.input.clone() else {
                return Ok(false);
            };
            let slot = Arc::new(std::sync::Mutex::new(0));
            let target = Arc::clone(&slot);
            let handle = ctx.schedule(&self.dependencies, move || {
                if let Ok(mut value) = target.lock() {
                    *value = *input + 1;
                }
            });
            self.result = Some((slot, handle));
        }
        Ok(self
            .result
            .as_ref()
            .is_some_and(|(_, handle)| handle.is_completed()))
    }

    fn cache_output_values(&mut self, outputs: &mut Outputs<'_>) {
        if let Some((slot, handle)) = self.result.take() {
            let value = slot.lock().map(|v| *v).unwrap_or_default();
            outputs.publish("value", value, handle);
        }
    }
}

// =============================================================================
// STALLED SOURCE
// =============================================================================

/// Acquires a buffer and waits on a handle the test controls.
#[derive(Debug, Clone)]
pub struct StalledSource {
    pub handle: JobHandle,
}

impl Node for StalledSource {
    fn kind(&self) -> &'static str {
        "stalled_source"
    }

    fn inputs(&self) -> &[PortSpec] {
        &[]
    }

    fn outputs(&self) -> &[PortSpec] {
        VALUE_OUT
    }

    fn create_task(&self, _settings: &MeshSettings) -> Box<dyn NodeTask> {
        Box::new(StalledTask {
            handle: self.handle.clone(),
            started: false,
        })
    }
}

struct StalledTask {
    handle: JobHandle,
    started: bool,
}

impl NodeTask for StalledTask {
    fn set_input_values(&mut self, _inputs: &mut Inputs<'_>) -> bool {
        true
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<bool, FlowError> {
        if !self.started {
            let _scratch = ctx.acquire::<f32>(256);
            ctx.track(self.handle.clone());
            self.started = true;
        }
        Ok(self.handle.is_completed())
    }

    fn cache_output_values(&mut self, outputs: &mut Outputs<'_>) {
        outputs.publish("value", 0_u32, self.handle.clone());
    }
}
