//! Gapless playback scheduling on the output clock.
//!
//! Each inbound buffer starts at `max(next_start_time, now)`, so segments
//! butt up against each other while the model is talking and start
//! immediately after a pause. An interruption stops everything in flight
//! and rewinds the cursor.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use super::codec::AudioBuffer;
use crate::error::VoiceResult;

/// Identifier for a segment handed to an [`AudioSink`].
pub type SegmentId = u64;

/// An output device with a monotonic clock, in seconds.
pub trait AudioSink: Send {
    /// Seconds of audio rendered since the sink opened.
    fn current_time(&self) -> f64;

    /// Start `buffer` at `start_at` on the sink clock. When it finishes
    /// naturally, the sink reports `id` on its ended channel.
    fn start_segment(&mut self, id: SegmentId, buffer: AudioBuffer, start_at: f64);

    /// Silence a segment immediately. No ended notification follows.
    fn stop_segment(&mut self, id: SegmentId);

    /// Release the device. Later calls are no-ops.
    fn close(&mut self);
}

/// Factory for output sinks.
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Open an output sink rendering at `sample_rate`. Finished segment ids
    /// are delivered on `ended`.
    async fn open(
        &self,
        sample_rate: u32,
        ended: mpsc::UnboundedSender<SegmentId>,
    ) -> VoiceResult<Box<dyn AudioSink>>;
}

/// Bookkeeping for a segment that has been started but not yet ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSegment {
    pub id: SegmentId,
    pub start_at: f64,
    pub duration: f64,
}

/// Schedules decoded buffers back to back on an [`AudioSink`].
pub struct PlaybackScheduler {
    sink: Box<dyn AudioSink>,
    next_start_time: f64,
    active: BTreeMap<SegmentId, ScheduledSegment>,
    next_id: SegmentId,
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn AudioSink>) -> Self {
        Self {
            sink,
            next_start_time: 0.0,
            active: BTreeMap::new(),
            next_id: 0,
            closed: false,
        }
    }

    /// Queue `buffer` right after everything already scheduled.
    pub fn schedule(&mut self, buffer: AudioBuffer) -> ScheduledSegment {
        let now = self.sink.current_time();
        let start_at = self.next_start_time.max(now);
        let duration = buffer.duration();
        self.next_id += 1;
        let segment = ScheduledSegment {
            id: self.next_id,
            start_at,
            duration,
        };

        self.sink.start_segment(segment.id, buffer, start_at);
        self.next_start_time = start_at + duration;
        self.active.insert(segment.id, segment);

        tracing::trace!(
            segment = segment.id,
            start_at,
            duration,
            in_flight = self.active.len(),
            "Scheduled playback segment"
        );
        segment
    }

    /// Sole release point for naturally finished segments.
    pub fn on_segment_ended(&mut self, id: SegmentId) {
        self.active.remove(&id);
    }

    /// Stop every segment in flight and rewind the cursor to zero.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        for id in self.active.keys() {
            self.sink.stop_segment(*id);
        }
        self.active.clear();
        self.next_start_time = 0.0;
        stopped
    }

    /// Interrupt, then release the output device.
    pub fn close(&mut self) {
        self.interrupt();
        if !self.closed {
            self.sink.close();
            self.closed = true;
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_segments(&self) -> impl Iterator<Item = &ScheduledSegment> {
        self.active.values()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Sink with a hand-driven clock that records every call.
    #[derive(Clone, Default)]
    pub(crate) struct ManualSink {
        pub clock: Arc<Mutex<f64>>,
        pub started: Arc<Mutex<Vec<ScheduledSegment>>>,
        pub stopped: Arc<Mutex<Vec<SegmentId>>>,
        pub closed: Arc<Mutex<u32>>,
    }

    impl AudioSink for ManualSink {
        fn current_time(&self) -> f64 {
            *self.clock.lock()
        }

        fn start_segment(&mut self, id: SegmentId, buffer: AudioBuffer, start_at: f64) {
            self.started.lock().push(ScheduledSegment {
                id,
                start_at,
                duration: buffer.duration(),
            });
        }

        fn stop_segment(&mut self, id: SegmentId) {
            self.stopped.lock().push(id);
        }

        fn close(&mut self) {
            *self.closed.lock() += 1;
        }
    }

    fn seconds(secs: f64) -> AudioBuffer {
        AudioBuffer::mono(vec![0.0; (secs * 24_000.0) as usize], 24_000)
    }

    #[test]
    fn sequential_segments_are_gapless() {
        let sink = ManualSink::default();
        *sink.clock.lock() = 2.0;
        let mut scheduler = PlaybackScheduler::new(Box::new(sink.clone()));

        let a = scheduler.schedule(seconds(0.5));
        let b = scheduler.schedule(seconds(0.25));
        let c = scheduler.schedule(seconds(1.0));

        assert_eq!(a.start_at, 2.0);
        assert_eq!(b.start_at, 2.5);
        assert_eq!(c.start_at, 2.75);
        assert_eq!(scheduler.next_start_time(), 3.75);
        assert_eq!(scheduler.active_count(), 3);
        assert_eq!(sink.started.lock().len(), 3);
    }

    #[test]
    fn late_segment_starts_at_clock() {
        let sink = ManualSink::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(sink.clone()));
        scheduler.schedule(seconds(0.5));
        *sink.clock.lock() = 4.0;
        let late = scheduler.schedule(seconds(0.5));
        assert_eq!(late.start_at, 4.0);
        assert_eq!(scheduler.next_start_time(), 4.5);
    }

    #[test]
    fn ended_notification_releases_segment() {
        let sink = ManualSink::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(sink));
        let a = scheduler.schedule(seconds(0.1));
        let b = scheduler.schedule(seconds(0.1));
        scheduler.on_segment_ended(a.id);
        assert_eq!(scheduler.active_count(), 1);
        assert_eq!(scheduler.active_segments().next().map(|s| s.id), Some(b.id));
        // Unknown ids are ignored.
        scheduler.on_segment_ended(999);
        assert_eq!(scheduler.active_count(), 1);
    }

    #[test]
    fn interrupt_stops_all_and_rewinds() {
        let sink = ManualSink::default();
        *sink.clock.lock() = 1.0;
        let mut scheduler = PlaybackScheduler::new(Box::new(sink.clone()));
        let a = scheduler.schedule(seconds(0.5));
        let b = scheduler.schedule(seconds(0.5));

        assert_eq!(scheduler.interrupt(), 2);
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.next_start_time(), 0.0);
        assert_eq!(*sink.stopped.lock(), vec![a.id, b.id]);

        // Next segment starts at the clock, not after the discarded audio.
        let c = scheduler.schedule(seconds(0.5));
        assert_eq!(c.start_at, 1.0);
    }

    #[test]
    fn close_is_idempotent() {
        let sink = ManualSink::default();
        let mut scheduler = PlaybackScheduler::new(Box::new(sink.clone()));
        scheduler.schedule(seconds(0.2));
        scheduler.close();
        scheduler.close();
        drop(scheduler);
        assert_eq!(*sink.closed.lock(), 1);
        assert_eq!(sink.stopped.lock().len(), 1);
    }
}
