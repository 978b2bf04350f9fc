//! Frame-level tracing.
//!
//! A [`FrameTracer`] is handed to the command channel when it is built and
//! sees every request written and every frame decoded. It is off by default.

use std::{fmt, sync::Arc};

/// Log target used by [`FrameTracer::log`].
pub const TRACE_TARGET: &str = "espburn::trace";

/// Which way a traced frame travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceDirection {
    /// Host to device (unframed request bytes).
    Write,
    /// Device to host (decoded frame payload).
    Read,
}

type TraceSink = Arc<dyn Fn(TraceDirection, &[u8]) + Send + Sync>;

/// Receives a copy of every frame exchanged with the loader.
#[derive(Clone, Default)]
pub struct FrameTracer {
    sink: Option<TraceSink>,
}

impl FrameTracer {
    /// A tracer that records nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A tracer that hex-dumps frames through `log::trace!` under
    /// [`TRACE_TARGET`].
    pub fn log() -> Self {
        Self::from_fn(|direction, bytes| {
            let arrow = match direction {
                TraceDirection::Write => "TX",
                TraceDirection::Read => "RX",
            };
            log::trace!(target: TRACE_TARGET, "{arrow} [{}] {}", bytes.len(), hex_dump(bytes));
        })
    }

    /// A tracer backed by a custom callback.
    pub fn from_fn<F>(sink: F) -> Self
    where
        F: Fn(TraceDirection, &[u8]) + Send + Sync + 'static,
    {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    /// Whether frames are being recorded.
    pub fn is_enabled(&self) -> bool {
        self.sink
            .is_some()
    }

    pub(crate) fn record(&self, direction: TraceDirection, bytes: &[u8]) {
        if let Some(sink) = &self.sink {
            sink(direction, bytes);
        }
    }
}

impl fmt::Debug for FrameTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameTracer")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_disabled_by_default() {
        assert!(!FrameTracer::default().is_enabled());
        assert!(FrameTracer::log().is_enabled());
    }

    #[test]
    fn test_custom_sink_receives_frames() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracer = FrameTracer::from_fn(move |dir, bytes| {
            sink.lock()
                .unwrap()
                .push((dir, bytes.to_vec()));
        });

        tracer.record(TraceDirection::Write, &[0x00, 0x08]);
        tracer.record(TraceDirection::Read, &[0x01]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (TraceDirection::Write, vec![0x00, 0x08]));
        assert_eq!(seen[1].0, TraceDirection::Read);
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0xC0, 0x01, 0xAB]), "c0 01 ab");
        assert_eq!(hex_dump(&[]), "");
    }
}
