//! Inference session abstraction
//!
//! The generation core drives graphs through [`InferenceSession`]; the ONNX
//! Runtime adapter lives in `ortgen-onnx-loader`, tests use scripted mocks.

use crate::error::Result;
use crate::tensor::{NamedTensors, Tensor};
use async_trait::async_trait;
use log::trace;

/// Borrowed named inputs for one `run`, in the session's declared order
#[derive(Debug, Default)]
pub struct Feeds<'a> {
    entries: Vec<(&'a str, &'a Tensor)>,
}

impl<'a> Feeds<'a> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, name: &'a str, tensor: &'a Tensor) {
        self.entries.push((name, tensor));
    }

    pub fn get(&self, name: &str) -> Option<&'a Tensor> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| *t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a Tensor)> + '_ {
        self.entries.iter().copied()
    }

    pub fn names(&self) -> Vec<&'a str> {
        self.entries.iter().map(|(n, _)| *n).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A loaded computation graph
#[async_trait]
pub trait InferenceSession: Send + Sync {
    /// Declared input names
    fn input_names(&self) -> &[String];

    /// Declared output names
    fn output_names(&self) -> &[String];

    /// Runs the graph. `feeds` holds exactly the declared inputs.
    async fn run(&self, feeds: &Feeds<'_>) -> Result<NamedTensors>;

    /// Returns a device-resident output to the session. Best effort.
    fn release(&self, tensor: Tensor) {
        trace!(
            "releasing {} tensor {:?} ({:?})",
            tensor.dtype(),
            tensor.dims(),
            tensor.location()
        );
        drop(tensor);
    }

    fn has_input(&self, name: &str) -> bool {
        self.input_names().iter().any(|n| n == name)
    }
}
