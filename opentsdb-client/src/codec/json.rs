use std::{collections::HashMap, io::Write as _};

use parking_lot::Mutex;
use serde::Serialize;

use super::CodecError;
use crate::{
    buffer::{SinkId, TraceBuffer},
    point::{Tags, Value},
};

#[derive(Serialize)]
pub(super) struct JsonPoint<'a> {
    pub metric: &'a str,
    pub timestamp: i64,
    pub value: Value,
    pub tags: &'a Tags,
}

/// Streaming JSON state for a single sink.
///
/// Outside of an array, every point is written as its own newline-terminated document.
#[derive(Default)]
pub(super) struct JsonGenerator {
    in_array: bool,
    elements: u64,
    finished: bool,
}

impl JsonGenerator {
    pub fn start_array(&mut self, sink: &mut TraceBuffer) -> Result<(), CodecError> {
        if self.in_array || self.finished {
            return Err(CodecError::GeneratorState { sink: sink.id(), expected: "fresh" });
        }

        sink.extend_from_slice(b"[");
        self.in_array = true;
        Ok(())
    }

    pub fn write_point(&mut self, sink: &mut TraceBuffer, point: &JsonPoint<'_>) -> Result<(), CodecError> {
        if self.finished {
            return Err(CodecError::GeneratorState { sink: sink.id(), expected: "open" });
        }

        if self.in_array && self.elements > 0 {
            sink.extend_from_slice(b",");
        }

        serde_json::to_writer(&mut *sink, point)?;
        if !self.in_array {
            sink.write_all(b"\n")?;
        }

        self.elements += 1;
        Ok(())
    }

    pub fn end_array(&mut self, sink: &mut TraceBuffer) -> Result<(), CodecError> {
        if !self.in_array {
            return Err(CodecError::GeneratorState { sink: sink.id(), expected: "inside an array" });
        }

        sink.extend_from_slice(b"]");
        self.in_array = false;
        self.finished = true;
        Ok(())
    }
}

/// Generators, keyed by the sink they write to.
#[derive(Default)]
pub(super) struct GeneratorCache {
    generators: Mutex<HashMap<SinkId, JsonGenerator>>,
}

impl GeneratorCache {
    pub fn with_generator<R>(&self, sink: SinkId, f: impl FnOnce(&mut JsonGenerator) -> R) -> R {
        let mut generators = self.generators.lock();
        f(generators.entry(sink).or_default())
    }

    pub fn invalidate(&self, sink: SinkId) {
        self.generators.lock().remove(&sink);
    }

    pub fn len(&self) -> usize {
        self.generators.lock().len()
    }
}
