use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::drivers::{SignalError, SignalResult};
use crate::types::{Sample, SessionMetadata};

/// Flattened view of the most recent samples.
#[derive(Clone, Debug)]
pub struct TimeSeriesFrame {
    pub sample_rate_hz: f64,
    pub channel_labels: Vec<String>,
    pub timestamps: Vec<f64>,
    pub samples: Vec<Vec<f32>>, // channels x samples
}

impl TimeSeriesFrame {
    pub fn duration_seconds(&self) -> f64 {
        self.samples
            .first()
            .map(|c| c.len() as f64 / self.sample_rate_hz)
            .unwrap_or(0.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Must cover the longest analysis window plus the recorder flush interval.
    pub history_seconds: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            history_seconds: 30.0,
        }
    }
}

/// What a cursor can observe.
#[derive(Clone, Debug, PartialEq)]
pub enum BufferEvent {
    Sample(Arc<Sample>),
    Gap(Gap),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gap {
    /// The cursor fell behind retention and `missed` entries aged out.
    Overrun { missed: u64 },
    /// The producer lost its source; samples on either side are not contiguous.
    Discontinuity,
}

#[derive(Clone, Debug)]
enum Entry {
    Sample(Arc<Sample>),
    Discontinuity,
}

impl Entry {
    fn event(&self) -> BufferEvent {
        match self {
            Entry::Sample(s) => BufferEvent::Sample(s.clone()),
            Entry::Discontinuity => BufferEvent::Gap(Gap::Discontinuity),
        }
    }
}

// 1. 环形槽位：每个槽记录自己的序号，读者据此发现被覆盖
struct Slot {
    seq: u64,
    entry: Option<Entry>,
}

// 2. 仅生产者使用的状态，读者从不触碰
struct WriterState {
    last_timestamp: Option<f64>,
    pending_discontinuity: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BufferMetrics {
    pub appended: u64,
    pub evicted: u64,
    pub overruns: u64,
    pub missed_samples: u64,
    pub current_size: usize,
    pub capacity: usize,
}

struct Shared {
    slots: Box<[RwLock<Slot>]>,
    /// Sequence number the next entry will get. Published after its slot.
    head: AtomicU64,
    closed: AtomicBool,
    writer: Mutex<WriterState>,
    // 3. 只用于阻塞读者的唤醒，不保护任何数据
    signal: Mutex<()>,
    ready: Condvar,
    metadata: SessionMetadata,
    appended: AtomicU64,
    evicted: AtomicU64,
    overruns: AtomicU64,
    missed_samples: AtomicU64,
}

impl Shared {
    fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    fn first_seq(&self, head: u64) -> u64 {
        head.saturating_sub(self.capacity())
    }

    fn slot(&self, seq: u64) -> &RwLock<Slot> {
        &self.slots[(seq % self.capacity()) as usize]
    }

    fn wake_readers(&self) {
        let _guard = self.signal.lock();
        self.ready.notify_all();
    }
}

/// Bounded, time-ordered ring shared by one producer and many cursors.
///
/// Entries live in fixed slots stamped with their sequence number. The
/// producer fills a slot and then advances `head`; a reader clones one
/// `Arc` per slot under that slot's read lock and never takes the lock the
/// producer uses for its own bookkeeping. When the ring is full the oldest
/// slot is overwritten and any cursor still pointing at it observes a
/// [`Gap::Overrun`] on its next read. Whatever a consumer already holds
/// survives eviction untouched.
#[derive(Clone)]
pub struct SampleBuffer {
    shared: Arc<Shared>,
}

impl SampleBuffer {
    pub fn with_history_seconds(
        metadata: SessionMetadata,
        history_seconds: f64,
    ) -> SignalResult<Self> {
        if !(metadata.nominal_sample_rate > 0.0) {
            return Err(SignalError::InvalidSampleRate);
        }
        let capacity = ((metadata.nominal_sample_rate * history_seconds).ceil() as usize).max(1);
        Ok(Self::with_capacity(metadata, capacity))
    }

    pub fn with_capacity(metadata: SessionMetadata, capacity: usize) -> Self {
        let slots = (0..capacity.max(1))
            .map(|_| {
                RwLock::new(Slot {
                    seq: u64::MAX,
                    entry: None,
                })
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                slots,
                head: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                writer: Mutex::new(WriterState {
                    last_timestamp: None,
                    pending_discontinuity: false,
                }),
                signal: Mutex::new(()),
                ready: Condvar::new(),
                metadata,
                appended: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                overruns: AtomicU64::new(0),
                missed_samples: AtomicU64::new(0),
            }),
        }
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.shared.metadata
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn len(&self) -> usize {
        let head = self.shared.head.load(Ordering::Acquire);
        head.min(self.shared.capacity()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side. Rejects samples with the wrong channel count or an
    /// earlier timestamp than the last one appended.
    pub fn append(&self, sample: Sample) -> SignalResult<()> {
        let expected = self.shared.metadata.num_channels();
        if sample.num_channels() != expected {
            return Err(SignalError::ChannelMismatch {
                expected,
                actual: sample.num_channels(),
            });
        }
        let mut writer = self.shared.writer.lock();
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SignalError::BufferClosed);
        }
        if let Some(last) = writer.last_timestamp {
            if sample.timestamp < last {
                return Err(SignalError::OutOfOrder {
                    last,
                    actual: sample.timestamp,
                });
            }
        }
        if writer.pending_discontinuity {
            writer.pending_discontinuity = false;
            self.publish(Entry::Discontinuity);
        }
        writer.last_timestamp = Some(sample.timestamp);
        self.publish(Entry::Sample(Arc::new(sample)));
        drop(writer);
        self.shared.appended.fetch_add(1, Ordering::Relaxed);
        self.shared.wake_readers();
        Ok(())
    }

    /// Fills the next slot, then makes it visible. Caller holds the writer lock.
    fn publish(&self, entry: Entry) {
        let seq = self.shared.head.load(Ordering::Relaxed);
        {
            let mut slot = self.shared.slot(seq).write();
            if slot.entry.is_some() {
                self.shared.evicted.fetch_add(1, Ordering::Relaxed);
            }
            slot.seq = seq;
            slot.entry = Some(entry);
        }
        self.shared.head.store(seq + 1, Ordering::Release);
    }

    /// The next appended sample is flagged as following a gap in the source.
    pub fn mark_discontinuity(&self) {
        let mut writer = self.shared.writer.lock();
        if writer.last_timestamp.is_some() {
            writer.pending_discontinuity = true;
        }
    }

    /// No more samples will be appended; cursors drain and then report closed.
    pub fn close(&self) {
        {
            let _writer = self.shared.writer.lock();
            self.shared.closed.store(true, Ordering::Release);
        }
        self.shared.wake_readers();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Cursor that sees only samples appended from now on.
    pub fn subscribe(&self) -> Cursor {
        Cursor {
            shared: self.shared.clone(),
            next_seq: self.shared.head.load(Ordering::Acquire),
        }
    }

    /// Cursor starting at the oldest retained sample.
    pub fn subscribe_from_oldest(&self) -> Cursor {
        let head = self.shared.head.load(Ordering::Acquire);
        Cursor {
            shared: self.shared.clone(),
            next_seq: self.shared.first_seq(head),
        }
    }

    pub fn metrics(&self) -> BufferMetrics {
        BufferMetrics {
            appended: self.shared.appended.load(Ordering::Relaxed),
            evicted: self.shared.evicted.load(Ordering::Relaxed),
            overruns: self.shared.overruns.load(Ordering::Relaxed),
            missed_samples: self.shared.missed_samples.load(Ordering::Relaxed),
            current_size: self.len(),
            capacity: self.capacity(),
        }
    }

    /// Latest `seconds` of retained samples, channels x samples.
    pub fn snapshot(&self, seconds: f64) -> TimeSeriesFrame {
        let take = (self.shared.metadata.nominal_sample_rate * seconds).ceil() as usize;
        let head = self.shared.head.load(Ordering::Acquire);
        let first = self.shared.first_seq(head);
        let mut recent: Vec<Arc<Sample>> = Vec::with_capacity(take);
        for seq in (first..head).rev() {
            if recent.len() >= take {
                break;
            }
            let slot = self.shared.slot(seq).read();
            if slot.seq != seq {
                // The producer lapped this far back while we were reading.
                break;
            }
            if let Some(Entry::Sample(s)) = &slot.entry {
                recent.push(s.clone());
            }
        }
        let channels = self.shared.metadata.num_channels();
        let mut samples = vec![Vec::with_capacity(recent.len()); channels];
        let mut timestamps = Vec::with_capacity(recent.len());
        for sample in recent.iter().rev() {
            timestamps.push(sample.timestamp);
            for (column, value) in samples.iter_mut().zip(&sample.channels) {
                column.push(*value);
            }
        }
        TimeSeriesFrame {
            sample_rate_hz: self.shared.metadata.nominal_sample_rate,
            channel_labels: self.shared.metadata.channel_names.clone(),
            timestamps,
            samples,
        }
    }
}

/// Private read position of one consumer.
pub struct Cursor {
    shared: Arc<Shared>,
    next_seq: u64,
}

impl Cursor {
    pub fn metadata(&self) -> &SessionMetadata {
        &self.shared.metadata
    }

    /// Entries appended but not yet read by this cursor.
    pub fn lag(&self) -> u64 {
        let head = self.shared.head.load(Ordering::Acquire);
        head.saturating_sub(self.next_seq.max(self.shared.first_seq(head)))
    }

    /// Reads up to `max` events, waiting up to `timeout` when nothing is new.
    ///
    /// Returns an empty batch on timeout and `BufferClosed` once the producer
    /// closed the buffer and this cursor has drained it.
    pub fn read(&mut self, max: usize, timeout: Duration) -> SignalResult<Vec<BufferEvent>> {
        let mut head = self.shared.head.load(Ordering::Acquire);
        if self.next_seq >= head {
            head = self.wait_for_data(timeout)?;
            if self.next_seq >= head {
                return Ok(Vec::new());
            }
        }

        let max = max.max(1);
        let mut events = Vec::with_capacity(max.min((head - self.next_seq) as usize) + 1);
        self.skip_evicted(head, &mut events);
        let mut read = 0;
        while self.next_seq < head && read < max {
            let entry = {
                let slot = self.shared.slot(self.next_seq).read();
                (slot.seq == self.next_seq).then(|| slot.entry.clone()).flatten()
            };
            match entry {
                Some(entry) => {
                    events.push(entry.event());
                    self.next_seq += 1;
                    read += 1;
                }
                None => {
                    // Overwritten since `head` was loaded.
                    std::hint::spin_loop();
                    head = self.shared.head.load(Ordering::Acquire);
                    self.skip_evicted(head, &mut events);
                }
            }
        }
        Ok(events)
    }

    /// Blocks until `head` moves past this cursor, the buffer closes or the
    /// timeout passes. Returns the head seen last.
    fn wait_for_data(&self, timeout: Duration) -> SignalResult<u64> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.signal.lock();
        loop {
            let head = self.shared.head.load(Ordering::Acquire);
            if self.next_seq < head {
                return Ok(head);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(SignalError::BufferClosed);
            }
            if self.shared.ready.wait_until(&mut guard, deadline).timed_out() {
                let head = self.shared.head.load(Ordering::Acquire);
                if self.next_seq >= head && self.shared.closed.load(Ordering::Acquire) {
                    return Err(SignalError::BufferClosed);
                }
                return Ok(head);
            }
        }
    }

    fn skip_evicted(&mut self, head: u64, events: &mut Vec<BufferEvent>) {
        let first = self.shared.first_seq(head);
        if self.next_seq >= first {
            return;
        }
        let missed = first - self.next_seq;
        self.next_seq = first;
        self.shared.overruns.fetch_add(1, Ordering::Relaxed);
        self.shared.missed_samples.fetch_add(missed, Ordering::Relaxed);
        log::warn!("consumer fell behind the sample buffer, {missed} entries aged out");
        events.push(BufferEvent::Gap(Gap::Overrun { missed }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::muse_channel_names;

    fn meta() -> SessionMetadata {
        SessionMetadata::new(muse_channel_names(), 256.0, 0.0)
    }

    fn sample(i: usize) -> Sample {
        Sample::new(i as f64 / 256.0, vec![i as f32; 4])
    }

    fn timestamps(events: &[BufferEvent]) -> Vec<f64> {
        events
            .iter()
            .filter_map(|e| match e {
                BufferEvent::Sample(s) => Some(s.timestamp),
                BufferEvent::Gap(_) => None,
            })
            .collect()
    }

    #[test]
    fn cursors_read_independently_in_order() {
        let buffer = SampleBuffer::with_history_seconds(meta(), 1.0).unwrap();
        let mut a = buffer.subscribe();
        let mut b = buffer.subscribe();
        for i in 0..10 {
            buffer.append(sample(i)).unwrap();
        }
        let first = a.read(4, Duration::ZERO).unwrap();
        assert_eq!(first.len(), 4);
        let rest = a.read(100, Duration::ZERO).unwrap();
        assert_eq!(rest.len(), 6);
        let all_b = b.read(100, Duration::ZERO).unwrap();
        assert_eq!(timestamps(&all_b), (0..10).map(|i| i as f64 / 256.0).collect::<Vec<_>>());
        assert!(a.read(10, Duration::from_millis(5)).unwrap().is_empty());
    }

    #[test]
    fn rejects_out_of_order_and_wrong_width() {
        let buffer = SampleBuffer::with_history_seconds(meta(), 1.0).unwrap();
        buffer.append(sample(5)).unwrap();
        assert!(matches!(buffer.append(sample(4)), Err(SignalError::OutOfOrder { .. })));
        assert!(matches!(
            buffer.append(Sample::new(1.0, vec![0.0; 3])),
            Err(SignalError::ChannelMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn slow_reader_sees_overrun_gap_and_timestamp_jump() {
        let buffer = SampleBuffer::with_capacity(meta(), 16);
        let mut slow = buffer.subscribe();
        for i in 0..100 {
            buffer.append(sample(i)).unwrap();
        }
        let events = slow.read(100, Duration::ZERO).unwrap();
        assert_eq!(events[0], BufferEvent::Gap(Gap::Overrun { missed: 84 }));
        let ts = timestamps(&events);
        assert_eq!(ts.len(), 16);
        assert!((ts[0] - 84.0 / 256.0).abs() < 1e-12);
        // The jump from where the reader stopped is far beyond one period.
        assert!(ts[0] - 0.0 > 1.5 / 256.0);

        let metrics = buffer.metrics();
        assert_eq!(metrics.appended, 100);
        assert_eq!(metrics.evicted, 84);
        assert_eq!(metrics.overruns, 1);
        assert_eq!(metrics.missed_samples, 84);
    }

    #[test]
    fn discontinuity_marker_precedes_next_sample() {
        let buffer = SampleBuffer::with_capacity(meta(), 16);
        let mut cursor = buffer.subscribe();
        buffer.append(sample(0)).unwrap();
        buffer.mark_discontinuity();
        buffer.append(sample(50)).unwrap();
        let events = cursor.read(10, Duration::ZERO).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1], BufferEvent::Gap(Gap::Discontinuity));
    }

    #[test]
    fn blocked_reader_wakes_on_append_and_close() {
        let buffer = SampleBuffer::with_capacity(meta(), 16);
        let mut cursor = buffer.subscribe();
        let producer = buffer.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.append(sample(0)).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            producer.close();
        });
        let events = cursor.read(10, Duration::from_secs(5)).unwrap();
        assert_eq!(events.len(), 1);
        let started = Instant::now();
        assert!(matches!(
            cursor.read(10, Duration::from_secs(5)),
            Err(SignalError::BufferClosed)
        ));
        assert!(started.elapsed() < Duration::from_secs(4));
        writer.join().unwrap();
    }

    #[test]
    fn snapshot_returns_latest_seconds() {
        let buffer = SampleBuffer::with_history_seconds(meta(), 2.0).unwrap();
        for i in 0..600 {
            buffer.append(sample(i)).unwrap();
        }
        assert_eq!(buffer.len(), 512);
        let frame = buffer.snapshot(1.0);
        assert_eq!(frame.samples.len(), 4);
        assert_eq!(frame.samples[0].len(), 256);
        assert_eq!(frame.samples[0][255], 599.0);
        assert!((frame.duration_seconds() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn concurrent_readers_never_stall_the_producer() {
        let buffer = SampleBuffer::with_capacity(meta(), 64);
        let total = 20_000;
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mut cursor = buffer.subscribe();
                std::thread::spawn(move || {
                    let mut last = -1.0;
                    let (mut seen, mut missed) = (0u64, 0u64);
                    loop {
                        match cursor.read(7, Duration::from_millis(50)) {
                            Ok(events) => {
                                for event in events {
                                    match event {
                                        BufferEvent::Sample(s) => {
                                            assert!(s.timestamp > last);
                                            last = s.timestamp;
                                            seen += 1;
                                        }
                                        BufferEvent::Gap(Gap::Overrun { missed: m }) => missed += m,
                                        BufferEvent::Gap(Gap::Discontinuity) => {}
                                    }
                                }
                            }
                            Err(SignalError::BufferClosed) => return seen + missed,
                            Err(e) => panic!("{e}"),
                        }
                    }
                })
            })
            .collect();

        let started = Instant::now();
        for i in 0..total {
            buffer.append(sample(i)).unwrap();
        }
        buffer.close();
        assert!(started.elapsed() < Duration::from_secs(10));
        for reader in readers {
            assert_eq!(reader.join().unwrap(), total as u64);
        }
    }
}
