//! VCD waveform recording of every model signal.
//!
//! Dotted signal names become nested `$scope module` blocks under a `TOP`
//! scope. Only value changes are written after the first sample.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, info, warn};
use vcd_ng::{IdCode, TimescaleUnit, Value, VecValue, Writer};

use crate::error::HarnessError;
use crate::pins::{HardwareModel, SignalId, SignalSpec};

/// Name of the outermost scope.
pub const ROOT_SCOPE: &str = "TOP";

/// Write handle shared between the VCD writer and the recorder.
#[derive(Clone)]
struct SharedSink(Rc<RefCell<Box<dyn Write>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.borrow_mut().flush()
    }
}

#[derive(Debug, Clone, Copy)]
struct TracedSignal {
    signal: SignalId,
    code: IdCode,
    width: u32,
    last: Option<u64>,
}

#[derive(Default)]
struct ScopeNode<'a> {
    wires: Vec<(usize, &'a str, u32)>,
    children: BTreeMap<&'a str, ScopeNode<'a>>,
}

/// Streams model signal values into a VCD file.
pub struct TraceRecorder {
    writer: Option<Writer<SharedSink>>,
    sink: Option<SharedSink>,
    signals: Vec<TracedSignal>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for TraceRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceRecorder")
            .field("path", &self.path)
            .field("signals", &self.signals.len())
            .field("open", &self.is_open())
            .finish()
    }
}

impl TraceRecorder {
    /// Creates `path` and writes the VCD header for `signals` up to `depth`
    /// scope levels.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Trace`] when the file cannot be created or the
    /// header cannot be written.
    pub fn open(path: &Path, depth: u32, signals: &[SignalSpec]) -> Result<Self, HarnessError> {
        let trace_error = |source| HarnessError::Trace {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(trace_error)?;
        let mut recorder =
            Self::from_writer(Box::new(BufWriter::new(file)), depth, signals).map_err(trace_error)?;
        recorder.path = Some(path.to_path_buf());
        info!(path = %path.display(), signals = recorder.signals.len(), "waveform trace opened");
        Ok(recorder)
    }

    /// Writes the header to an arbitrary sink.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the sink.
    pub fn from_writer(
        sink: Box<dyn Write>,
        depth: u32,
        signals: &[SignalSpec],
    ) -> io::Result<Self> {
        let sink = SharedSink(Rc::new(RefCell::new(sink)));
        let mut writer = Writer::new(sink.clone());
        writer.timescale(1, TimescaleUnit::NS)?;

        let mut root = ScopeNode::default();
        for (index, spec) in signals.iter().enumerate() {
            let mut parts: Vec<&str> = spec.name.split('.').collect();
            if parts.len() > depth as usize {
                continue;
            }
            let Some(leaf) = parts.pop() else {
                continue;
            };
            let node = parts
                .into_iter()
                .fold(&mut root, |node, scope| node.children.entry(scope).or_default());
            node.wires.push((index, leaf, spec.width));
        }

        let mut traced = Vec::new();
        writer.add_module(ROOT_SCOPE)?;
        declare(&mut writer, &root, &mut traced)?;
        writer.upscope()?;
        writer.enddefinitions()?;
        traced.sort_by_key(|signal: &TracedSignal| signal.signal);

        Ok(Self {
            writer: Some(writer),
            sink: Some(sink),
            signals: traced,
            path: None,
        })
    }

    /// Returns true until [`close`](Self::close) runs.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Number of recorded signals.
    #[must_use]
    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    /// Records the model state at `time`.
    ///
    /// A write failure is logged and closes the recorder.
    pub fn sample(&mut self, time: u64, model: &dyn HardwareModel) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(error) = write_sample(writer, &mut self.signals, time, model) {
            warn!(%error, time, "waveform write failed; tracing stopped");
            self.close();
        }
    }

    /// Flushes and releases the file. Later calls do nothing.
    pub fn close(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        drop(writer);
        if let Some(mut sink) = self.sink.take() {
            if let Err(error) = sink.flush() {
                warn!(%error, "failed to flush waveform trace");
            }
        }
        match &self.path {
            Some(path) => info!(path = %path.display(), "waveform trace closed"),
            None => debug!("waveform trace closed"),
        }
    }
}

impl Drop for TraceRecorder {
    fn drop(&mut self) {
        self.close();
    }
}

fn declare(
    writer: &mut Writer<SharedSink>,
    node: &ScopeNode<'_>,
    traced: &mut Vec<TracedSignal>,
) -> io::Result<()> {
    for &(index, name, width) in &node.wires {
        let code = writer.add_wire(width, name)?;
        traced.push(TracedSignal {
            signal: SignalId(index),
            code,
            width,
            last: None,
        });
    }
    for (name, child) in &node.children {
        writer.add_module(name)?;
        declare(writer, child, traced)?;
        writer.upscope()?;
    }
    Ok(())
}

fn write_sample(
    writer: &mut Writer<SharedSink>,
    signals: &mut [TracedSignal],
    time: u64,
    model: &dyn HardwareModel,
) -> io::Result<()> {
    writer.timestamp(time)?;
    for signal in signals {
        let value = model.read(signal.signal);
        if signal.last == Some(value) {
            continue;
        }
        signal.last = Some(value);
        if signal.width == 1 {
            writer.change_scalar(signal.code, value & 1 != 0)?;
        } else {
            writer.change_vector(signal.code, &vector_bits(value, signal.width))?;
        }
    }
    Ok(())
}

/// MSB-first VCD bits of the low `width` bits of `value`.
fn vector_bits(value: u64, width: u32) -> VecValue {
    (0..width)
        .rev()
        .map(|bit| {
            if (value >> bit) & 1 != 0 {
                Value::V1
            } else {
                Value::V0
            }
        })
        .collect::<Vec<Value>>()
        .into()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::TraceRecorder;
    use crate::error::HarnessError;
    use crate::pins::{HardwareModel, SignalId, SignalSpec};

    struct Fixed {
        signals: Vec<SignalSpec>,
        values: Vec<u64>,
    }

    impl HardwareModel for Fixed {
        fn signals(&self) -> &[SignalSpec] {
            &self.signals
        }

        fn read(&self, id: SignalId) -> u64 {
            self.values[id.0]
        }

        fn write(&mut self, id: SignalId, value: u64) {
            self.values[id.0] = value;
        }

        fn eval(&mut self) {}
    }

    fn model() -> Fixed {
        Fixed {
            signals: vec![
                SignalSpec::input("clk", 1),
                SignalSpec::output("o_led", 4),
                SignalSpec::output("soc.cpu.pc", 8),
            ],
            values: vec![1, 0b1010, 0x42],
        }
    }

    #[test]
    fn header_nests_scopes_and_changes_are_incremental() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trace.vcd");
        let mut model = model();
        let mut recorder = TraceRecorder::open(&path, 99, &model.signals).expect("open");
        assert_eq!(recorder.signal_count(), 3);

        recorder.sample(0, &model);
        model.values[0] = 0;
        recorder.sample(10, &model);
        recorder.close();
        assert!(!recorder.is_open());

        let text = fs::read_to_string(&path).expect("read trace");
        assert!(text.contains("$timescale"));
        assert!(text.contains("$scope module TOP $end"));
        assert!(text.contains("$scope module soc $end"));
        assert!(text.contains("$scope module cpu $end"));
        assert!(text.contains("b1010 "));
        assert!(text.contains("b01000010 "));
        assert!(text.contains("#10"));
        let after_second = text.split("#10").nth(1).expect("second timestamp");
        assert!(!after_second.contains('b'), "unchanged vectors are not repeated");
    }

    #[test]
    fn wide_vectors_are_written_msb_first() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("wide.vcd");
        let model = Fixed {
            signals: vec![SignalSpec::input("i_sw", 32)],
            values: vec![0x8000_0001],
        };
        let mut recorder = TraceRecorder::open(&path, 99, &model.signals).expect("open");
        recorder.sample(0, &model);
        recorder.close();

        let text = fs::read_to_string(&path).expect("read trace");
        assert!(text.contains(&format!("b1{}1 ", "0".repeat(30))));
    }

    #[test]
    fn depth_limit_omits_nested_signals() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("shallow.vcd");
        let recorder = TraceRecorder::open(&path, 1, &model().signals).expect("open");
        assert_eq!(recorder.signal_count(), 2);
    }

    #[test]
    fn close_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("twice.vcd");
        let mut recorder = TraceRecorder::open(&path, 99, &model().signals).expect("open");
        recorder.close();
        recorder.close();
        recorder.sample(20, &model());
        assert!(!recorder.is_open());
        let text = fs::read_to_string(&path).expect("read trace");
        assert!(!text.contains("#20"));
    }

    #[test]
    fn unwritable_path_is_a_trace_error() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("trace.vcd");
        let error = TraceRecorder::open(&path, 99, &model().signals).expect_err("no directory");
        assert!(matches!(error, HarnessError::Trace { .. }));
    }
}
