//! Execution tracing hooks.
//!
//! The VM reports interesting events through a [`VmTracer`]; the default
//! [`NoopTracer`] ignores them and [`StderrTracer`] prints them, which is
//! the debugging story for interpreter work.

use crate::opcode::Opcode;

/// Observer of VM execution events.
#[expect(unused_variables, reason = "default hook bodies are intentionally empty")]
pub trait VmTracer {
    /// Called before an opcode executes.
    fn op(&mut self, code_name: &str, ip: usize, op: Opcode) {}

    /// Called when a new frame starts running.
    fn frame_enter(&mut self, code_name: &str) {}

    /// Called when a frame exits, normally or by unwinding.
    fn frame_exit(&mut self, code_name: &str) {}

    /// Called after a state-clearer sweep with the number of objects
    /// cleared; `overran` reports a sweep that ran off the list end
    /// without meeting its mark.
    fn sweep(&mut self, cleared: usize, overran: bool) {}
}

/// Tracer that does nothing.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

/// Tracer that prints every event to stderr.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn op(&mut self, code_name: &str, ip: usize, op: Opcode) {
        eprintln!("[krait] {code_name}@{ip}: {op:?}");
    }

    fn frame_enter(&mut self, code_name: &str) {
        eprintln!("[krait] enter {code_name}");
    }

    fn frame_exit(&mut self, code_name: &str) {
        eprintln!("[krait] exit {code_name}");
    }

    fn sweep(&mut self, cleared: usize, overran: bool) {
        if overran {
            eprintln!("[krait] sweep overran its mark after clearing {cleared} objects");
        } else {
            eprintln!("[krait] sweep cleared {cleared} objects");
        }
    }
}
