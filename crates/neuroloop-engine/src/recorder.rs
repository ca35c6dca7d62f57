//! # Session Recorder
//!
//! Lossless persistence of raw samples during a session. Layout:
//!
//! ```text
//! <data_dir>/
//! ├── <session-id>/
//! │   ├── metadata.json            session configuration and final counts
//! │   ├── muse-1_P001.csv          raw samples for device 1
//! │   └── muse-2_P002.csv          raw samples for device 2
//! ```
//!
//! CSV files carry a `timestamp,<labels...>` header and one full-precision
//! sample per row. Samples are batched in memory (default 256, ~1 s at
//! 256 Hz) and flushed with an fsync when the batch fills.
//!
//! Recording is lossless by policy: a failed flush marks the device degraded
//! and keeps the batch, so the samples are retried on the next flush instead
//! of being dropped.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Free-form session descriptors stored in the metadata record.
#[derive(Debug, Clone, Default)]
pub struct RecordingInfo {
    pub protocol: String,
    pub notes: String,
    pub experimenter: String,
}

/// The on-disk `metadata.json` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    /// device id → subject id
    pub subject_ids: BTreeMap<String, String>,
    /// device id → ordered channel labels
    pub channel_labels: BTreeMap<String, Vec<String>>,
    pub protocol: String,
    pub notes: String,
    pub experimenter: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_counts: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

/// Snapshot of recorder state for diagnostics.
#[derive(Debug, Clone)]
pub struct RecorderStatus {
    pub recording: bool,
    pub session_id: Option<String>,
    pub sample_counts: HashMap<String, u64>,
    pub buffered: HashMap<String, usize>,
    pub degraded: Vec<String>,
}

struct DeviceSink {
    writer: csv::Writer<File>,
    /// Second handle onto the same file, used for fsync after flushes.
    sync_handle: File,
    path: PathBuf,
    batch: Vec<(f64, Vec<f64>)>,
    count: u64,
    degraded: bool,
}

struct ActiveRecording {
    session_id: String,
    dir: PathBuf,
    started_at: DateTime<Utc>,
    metadata: SessionMetadata,
    sinks: HashMap<String, DeviceSink>,
}

/// Thread-safe CSV recorder for one session at a time.
pub struct SessionRecorder {
    base_dir: PathBuf,
    batch_size: usize,
    inner: Mutex<Option<ActiveRecording>>,
}

impl SessionRecorder {
    pub fn new(base_dir: impl Into<PathBuf>, batch_size: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            batch_size: batch_size.max(1),
            inner: Mutex::new(None),
        }
    }

    /// Begin recording a session.
    ///
    /// Creates the session directory, writes the initial metadata record,
    /// and opens one CSV file per device. Fails with
    /// [`EngineError::RecordingActive`] if a recording is already running.
    pub fn start(
        &self,
        session_id: &str,
        subject_ids: &HashMap<String, String>,
        channel_labels: &HashMap<String, Vec<String>>,
        info: &RecordingInfo,
    ) -> EngineResult<()> {
        let mut inner = self.lock();
        if let Some(active) = inner.as_ref() {
            return Err(EngineError::RecordingActive {
                session_id: active.session_id.clone(),
            });
        }

        let dir = self.base_dir.join(session_id);
        std::fs::create_dir_all(&dir)?;

        let started_at = Utc::now();
        let metadata = SessionMetadata {
            session_id: session_id.to_string(),
            start_time: started_at.to_rfc3339(),
            end_time: None,
            subject_ids: subject_ids
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            channel_labels: channel_labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            protocol: info.protocol.clone(),
            notes: info.notes.clone(),
            experimenter: info.experimenter.clone(),
            sample_counts: None,
            duration_seconds: None,
        };
        write_metadata(&dir, &metadata)?;

        let mut sinks = HashMap::new();
        for (device, subject) in subject_ids {
            let labels = channel_labels.get(device).cloned().unwrap_or_default();
            let path = dir.join(format!("{device}_{subject}.csv"));
            let file = File::create(&path)?;
            let sync_handle = file.try_clone()?;
            let mut writer = csv::Writer::from_writer(file);

            let mut header = vec!["timestamp".to_string()];
            header.extend(labels);
            writer.write_record(&header)?;
            writer.flush()?;

            sinks.insert(
                device.clone(),
                DeviceSink {
                    writer,
                    sync_handle,
                    path,
                    batch: Vec::with_capacity(self.batch_size),
                    count: 0,
                    degraded: false,
                },
            );
        }

        tracing::info!(
            session_id,
            devices = sinks.len(),
            dir = %dir.display(),
            "Recording started"
        );

        *inner = Some(ActiveRecording {
            session_id: session_id.to_string(),
            dir,
            started_at,
            metadata,
            sinks,
        });
        Ok(())
    }

    /// Append a batch of samples for a device.
    ///
    /// Thread-safe; called from ingest threads. A no-op when no recording
    /// is active or the device was not registered at `start`.
    pub fn append_batch(&self, device: &str, timestamps: &[f64], samples: &[Vec<f64>]) {
        let batch_size = self.batch_size;
        let mut inner = self.lock();
        let Some(active) = inner.as_mut() else {
            return;
        };
        let Some(sink) = active.sinks.get_mut(device) else {
            tracing::warn!(device, "Sample batch for unregistered device dropped");
            return;
        };

        sink.count += timestamps.len() as u64;
        sink.batch
            .extend(timestamps.iter().zip(samples).map(|(&t, s)| (t, s.clone())));

        if sink.batch.len() >= batch_size {
            flush_sink(device, sink);
        }
    }

    /// Append a single sample for a device.
    pub fn append(&self, device: &str, timestamp: f64, sample: &[f64]) {
        self.append_batch(device, &[timestamp], &[sample.to_vec()]);
    }

    /// Finish the recording: flush every batch, close every file, and
    /// rewrite the metadata record with end time, final counts, and
    /// duration. Returns the CSV path per device.
    pub fn stop(&self) -> EngineResult<HashMap<String, PathBuf>> {
        let mut inner = self.lock();
        let Some(mut active) = inner.take() else {
            return Err(EngineError::RecordingInactive);
        };

        let mut paths = HashMap::new();
        let mut counts = BTreeMap::new();
        for (device, sink) in &mut active.sinks {
            flush_sink(device, sink);
            if let Err(e) = sink.writer.flush() {
                tracing::error!(device = %device, error = %e, "Final flush failed");
            }
            counts.insert(device.clone(), sink.count);
            paths.insert(device.clone(), sink.path.clone());
        }
        // Dropping the sinks closes the files.
        let total: u64 = counts.values().sum();
        let ended_at = Utc::now();

        active.metadata.end_time = Some(ended_at.to_rfc3339());
        active.metadata.sample_counts = Some(counts);
        active.metadata.duration_seconds = Some(
            (ended_at - active.started_at).num_milliseconds() as f64 / 1000.0,
        );
        write_metadata(&active.dir, &active.metadata)?;

        tracing::info!(
            session_id = %active.session_id,
            total_samples = total,
            "Recording stopped"
        );
        Ok(paths)
    }

    /// Current recorder state.
    pub fn status(&self) -> RecorderStatus {
        let inner = self.lock();
        match inner.as_ref() {
            None => RecorderStatus {
                recording: false,
                session_id: None,
                sample_counts: HashMap::new(),
                buffered: HashMap::new(),
                degraded: Vec::new(),
            },
            Some(active) => RecorderStatus {
                recording: true,
                session_id: Some(active.session_id.clone()),
                sample_counts: active
                    .sinks
                    .iter()
                    .map(|(d, s)| (d.clone(), s.count))
                    .collect(),
                buffered: active
                    .sinks
                    .iter()
                    .map(|(d, s)| (d.clone(), s.batch.len()))
                    .collect(),
                degraded: active
                    .sinks
                    .iter()
                    .filter(|(_, s)| s.degraded)
                    .map(|(d, _)| d.clone())
                    .collect(),
            },
        }
    }

    pub fn is_recording(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ActiveRecording>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write the buffered batch to the device's CSV file and fsync it.
///
/// On failure the batch is kept so the samples go out with the next flush;
/// the device is marked degraded for `status()`.
fn flush_sink(device: &str, sink: &mut DeviceSink) {
    if sink.batch.is_empty() {
        return;
    }

    let result = (|| -> EngineResult<()> {
        for (timestamp, sample) in &sink.batch {
            let mut record = Vec::with_capacity(1 + sample.len());
            record.push(timestamp.to_string());
            record.extend(sample.iter().map(|v| v.to_string()));
            sink.writer.write_record(&record)?;
        }
        sink.writer.flush()?;
        sink.sync_handle.sync_data()?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            tracing::trace!(device, flushed = sink.batch.len(), "Batch flushed");
            sink.batch.clear();
            sink.degraded = false;
        }
        Err(e) => {
            sink.degraded = true;
            let io_err = EngineError::RecorderIo {
                device: device.to_string(),
                reason: e.to_string(),
            };
            tracing::error!(
                pending = sink.batch.len(),
                "{io_err}; batch retained for retry"
            );
        }
    }
}

fn write_metadata(dir: &Path, metadata: &SessionMetadata) -> EngineResult<()> {
    let path = dir.join("metadata.json");
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn subject_map() -> HashMap<String, String> {
        HashMap::from([("muse-1".to_string(), "P001".to_string())])
    }

    fn label_map() -> HashMap<String, Vec<String>> {
        HashMap::from([(
            "muse-1".to_string(),
            vec!["TP9".into(), "AF7".into(), "AF8".into(), "TP10".into()],
        )])
    }

    fn info() -> RecordingInfo {
        RecordingInfo {
            protocol: "Quick Test".into(),
            notes: "unit test".into(),
            experimenter: "tester".into(),
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), 64);
        recorder
            .start("sess-1", &subject_map(), &label_map(), &info())
            .unwrap();

        for i in 0..300u32 {
            recorder.append("muse-1", f64::from(i) / 256.0, &[1.0, 2.0, 3.0, 4.0]);
        }
        let paths = recorder.stop().unwrap();

        let csv_path = &paths["muse-1"];
        assert!(csv_path.ends_with("muse-1_P001.csv"));
        let contents = std::fs::read_to_string(csv_path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 301, "header + 300 samples");
        assert_eq!(lines[0], "timestamp,TP9,AF7,AF8,TP10");
        assert!(lines[1].starts_with("0,1,2,3,4"));

        let metadata: SessionMetadata = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("sess-1").join("metadata.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(metadata.session_id, "sess-1");
        assert_eq!(metadata.subject_ids["muse-1"], "P001");
        assert_eq!(metadata.sample_counts.unwrap()["muse-1"], 300);
        assert!(metadata.end_time.is_some());
        assert!(metadata.duration_seconds.unwrap() >= 0.0);
    }

    #[test]
    fn test_batching_flushes_at_threshold() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), 100);
        recorder
            .start("sess-1", &subject_map(), &label_map(), &info())
            .unwrap();

        for i in 0..99u32 {
            recorder.append("muse-1", f64::from(i), &[0.0; 4]);
        }
        let status = recorder.status();
        assert_eq!(status.buffered["muse-1"], 99);

        recorder.append("muse-1", 99.0, &[0.0; 4]);
        let status = recorder.status();
        assert_eq!(status.buffered["muse-1"], 0, "batch flushed at threshold");
        assert_eq!(status.sample_counts["muse-1"], 100);

        recorder.stop().unwrap();
    }

    #[test]
    fn test_double_start_fails() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), 64);
        recorder
            .start("sess-1", &subject_map(), &label_map(), &info())
            .unwrap();
        let err = recorder
            .start("sess-2", &subject_map(), &label_map(), &info())
            .unwrap_err();
        assert!(matches!(err, EngineError::RecordingActive { session_id } if session_id == "sess-1"));
        recorder.stop().unwrap();
    }

    #[test]
    fn test_stop_without_start_fails() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), 64);
        assert!(matches!(
            recorder.stop(),
            Err(EngineError::RecordingInactive)
        ));
    }

    #[test]
    fn test_append_when_inactive_is_noop() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), 64);
        recorder.append("muse-1", 0.0, &[0.0; 4]);
        assert!(!recorder.is_recording());
    }

    #[test]
    fn test_unregistered_device_dropped() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), 64);
        recorder
            .start("sess-1", &subject_map(), &label_map(), &info())
            .unwrap();
        recorder.append("muse-9", 0.0, &[0.0; 4]);
        let status = recorder.status();
        assert!(!status.sample_counts.contains_key("muse-9"));
        recorder.stop().unwrap();
    }

    #[test]
    fn test_restart_after_stop() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path(), 64);
        recorder
            .start("sess-1", &subject_map(), &label_map(), &info())
            .unwrap();
        recorder.stop().unwrap();
        assert!(!recorder.is_recording());
        recorder
            .start("sess-2", &subject_map(), &label_map(), &info())
            .unwrap();
        assert_eq!(recorder.status().session_id.as_deref(), Some("sess-2"));
        recorder.stop().unwrap();
    }
}
