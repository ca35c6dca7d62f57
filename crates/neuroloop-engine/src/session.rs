//! # Session Management
//!
//! Experimental session lifecycle and the protocol library.
//!
//! A protocol is an ordered list of timed phases (baseline, training,
//! cooldown), each with operator-facing instructions and a feedback flag.
//! One session runs at a time; its phase cursor advances on a periodic
//! [`SessionManager::update_phase`] call driven by the publish tick, and the
//! publisher consults [`SessionManager::feedback_enabled`] to annotate
//! outgoing frames.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use uuid::Uuid;

use crate::clock::unix_now;
use crate::error::{EngineError, EngineResult};

/// Coarse lifecycle phase of the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Idle,
    Baseline,
    Training,
    Cooldown,
    Paused,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Idle => "idle",
            PhaseKind::Baseline => "baseline",
            PhaseKind::Training => "training",
            PhaseKind::Cooldown => "cooldown",
            PhaseKind::Paused => "paused",
        }
    }

    /// Classify a phase by its name, the way operators label them.
    fn from_phase_name(name: &str) -> PhaseKind {
        let lower = name.to_lowercase();
        if lower.contains("baseline") || lower.contains("eyes") {
            PhaseKind::Baseline
        } else if lower.contains("cooldown") {
            PhaseKind::Cooldown
        } else {
            PhaseKind::Training
        }
    }
}

/// A single timed phase within a protocol.
#[derive(Debug, Clone)]
pub struct ProtocolPhase {
    pub name: String,
    pub duration_secs: f64,
    pub instructions: String,
    pub feedback_enabled: bool,
}

/// Target metric configuration for feedback-enabled phases.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackTarget {
    pub metric: String,
    pub threshold: f64,
    pub timescale: String,
}

/// Complete protocol specification.
#[derive(Debug, Clone)]
pub struct Protocol {
    pub name: String,
    pub description: String,
    pub phases: Vec<ProtocolPhase>,
    pub min_devices: usize,
    pub max_devices: usize,
    pub feedback: Option<FeedbackTarget>,
}

impl Protocol {
    /// Total protocol duration in seconds.
    pub fn total_duration(&self) -> f64 {
        self.phases.iter().map(|p| p.duration_secs).sum()
    }

    /// Library key: lowercase with underscores.
    pub fn key(&self) -> String {
        self.name.to_lowercase().replace(' ', "_")
    }

    /// Validation problems, empty when the protocol is usable.
    pub fn validation_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.is_empty() {
            errors.push("protocol name is required".to_string());
        }
        if self.phases.is_empty() {
            errors.push("protocol must have at least one phase".to_string());
        }
        if self.min_devices < 1 {
            errors.push("min_devices must be >= 1".to_string());
        }
        if self.max_devices < self.min_devices {
            errors.push("max_devices must be >= min_devices".to_string());
        }
        for (i, phase) in self.phases.iter().enumerate() {
            if phase.duration_secs <= 0.0 {
                errors.push(format!(
                    "phase {} ({}) must have positive duration",
                    i, phase.name
                ));
            }
        }
        errors
    }
}

/// Protocol summary for the request surface.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolSummary {
    pub name: String,
    pub description: String,
    pub duration_seconds: f64,
    pub num_phases: usize,
    pub min_devices: usize,
    pub max_devices: usize,
}

/// Session status snapshot for monitoring.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub active: bool,
    pub session_id: Option<String>,
    pub protocol: Option<String>,
    pub phase: PhaseKind,
    pub phase_name: Option<String>,
    pub elapsed_seconds: f64,
    pub remaining_seconds: Option<f64>,
    pub devices: Vec<String>,
    pub subject_ids: HashMap<String, String>,
    pub feedback_enabled: bool,
    pub instructions: Option<String>,
}

/// Result of a phase-cursor update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransition {
    /// Still inside the current phase.
    Unchanged,
    /// Advanced into the named phase.
    Advanced { phase: String },
    /// The final phase finished; the session has been cleared.
    Completed { session_id: String },
}

struct ActiveSession {
    session_id: String,
    protocol: Protocol,
    subject_ids: HashMap<String, String>,
    started_at: f64,
    phase_index: usize,
    phase_started_at: f64,
    kind: PhaseKind,
    notes: String,
    experimenter: String,
}

struct State {
    protocols: BTreeMap<String, Protocol>,
    current: Option<ActiveSession>,
}

/// One-session-at-a-time lifecycle coordinator.
pub struct SessionManager {
    state: Mutex<State>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    /// Create a manager preloaded with the built-in protocols.
    pub fn new() -> Self {
        let protocols = builtin_protocols()
            .into_iter()
            .map(|p| (p.key(), p))
            .collect();
        Self {
            state: Mutex::new(State {
                protocols,
                current: None,
            }),
        }
    }

    /// Register a custom protocol after validation.
    pub fn add_protocol(&self, protocol: Protocol) -> EngineResult<()> {
        let errors = protocol.validation_errors();
        if !errors.is_empty() {
            return Err(EngineError::InvalidProtocol {
                name: protocol.name.clone(),
                reason: errors.join("; "),
            });
        }
        let key = protocol.key();
        tracing::info!(protocol = %protocol.name, "Protocol added to library");
        self.lock().protocols.insert(key, protocol);
        Ok(())
    }

    /// Look up a protocol by name (case-insensitive, spaces or underscores).
    pub fn get_protocol(&self, name: &str) -> Option<Protocol> {
        let key = name.to_lowercase().replace(' ', "_");
        self.lock().protocols.get(&key).cloned()
    }

    /// Summaries of every available protocol.
    pub fn list_protocols(&self) -> Vec<ProtocolSummary> {
        self.lock()
            .protocols
            .values()
            .map(|p| ProtocolSummary {
                name: p.name.clone(),
                description: p.description.clone(),
                duration_seconds: p.total_duration(),
                num_phases: p.phases.len(),
                min_devices: p.min_devices,
                max_devices: p.max_devices,
            })
            .collect()
    }

    /// Start a session: validates the protocol, the device count against its
    /// bounds, and that every mapped device is currently connected.
    ///
    /// Returns the new session id.
    pub fn start_session(
        &self,
        protocol_name: &str,
        subject_ids: HashMap<String, String>,
        notes: &str,
        experimenter: &str,
        connected_devices: &[String],
    ) -> EngineResult<String> {
        let mut state = self.lock();

        if let Some(active) = state.current.as_ref() {
            return Err(EngineError::SessionConflict {
                reason: format!("session '{}' is already active", active.session_id),
            });
        }

        let key = protocol_name.to_lowercase().replace(' ', "_");
        let protocol = state
            .protocols
            .get(&key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProtocol {
                name: protocol_name.to_string(),
            })?;

        let n_devices = subject_ids.len();
        if n_devices < protocol.min_devices || n_devices > protocol.max_devices {
            return Err(EngineError::SessionConflict {
                reason: format!(
                    "protocol '{}' requires {}-{} devices, got {}",
                    protocol.name, protocol.min_devices, protocol.max_devices, n_devices
                ),
            });
        }
        for device in subject_ids.keys() {
            if !connected_devices.contains(device) {
                return Err(EngineError::DeviceNotConnected {
                    device: device.clone(),
                });
            }
        }

        let session_id = Uuid::new_v4().to_string();
        let now = unix_now();
        let kind = PhaseKind::from_phase_name(&protocol.phases[0].name);

        tracing::info!(
            session_id = %session_id,
            protocol = %protocol.name,
            devices = ?subject_ids.keys().collect::<Vec<_>>(),
            "Session started"
        );

        state.current = Some(ActiveSession {
            session_id: session_id.clone(),
            protocol,
            subject_ids,
            started_at: now,
            phase_index: 0,
            phase_started_at: now,
            kind,
            notes: notes.to_string(),
            experimenter: experimenter.to_string(),
        });

        Ok(session_id)
    }

    /// Stop the active session. Returns its id.
    pub fn stop_session(&self) -> EngineResult<String> {
        let mut state = self.lock();
        let Some(active) = state.current.take() else {
            return Err(EngineError::SessionConflict {
                reason: "no active session".to_string(),
            });
        };
        tracing::info!(session_id = %active.session_id, "Session stopped");
        Ok(active.session_id)
    }

    /// Suspend phase timing. The phase clock keeps its start; resume picks
    /// the phase back up where the kind classification left it.
    pub fn pause_session(&self) -> EngineResult<()> {
        let mut state = self.lock();
        let Some(active) = state.current.as_mut() else {
            return Err(EngineError::SessionConflict {
                reason: "no active session".to_string(),
            });
        };
        active.kind = PhaseKind::Paused;
        tracing::info!(session_id = %active.session_id, "Session paused");
        Ok(())
    }

    pub fn resume_session(&self) -> EngineResult<()> {
        let mut state = self.lock();
        let Some(active) = state.current.as_mut() else {
            return Err(EngineError::SessionConflict {
                reason: "no active session".to_string(),
            });
        };
        if active.kind != PhaseKind::Paused {
            return Err(EngineError::SessionConflict {
                reason: "session is not paused".to_string(),
            });
        }
        active.kind = PhaseKind::from_phase_name(&active.protocol.phases[active.phase_index].name);
        tracing::info!(session_id = %active.session_id, "Session resumed");
        Ok(())
    }

    /// Advance the phase cursor when the current phase's duration elapses.
    ///
    /// Intended to be called periodically (the publish tick does). A session
    /// whose final phase completes is cleared and reported as
    /// [`PhaseTransition::Completed`] so the caller can finalize recording.
    pub fn update_phase(&self) -> PhaseTransition {
        let mut state = self.lock();
        let Some(active) = state.current.as_mut() else {
            return PhaseTransition::Unchanged;
        };
        if active.kind == PhaseKind::Paused {
            return PhaseTransition::Unchanged;
        }

        let now = unix_now();
        let phase = &active.protocol.phases[active.phase_index];
        if now - active.phase_started_at < phase.duration_secs {
            return PhaseTransition::Unchanged;
        }

        active.phase_index += 1;
        if active.phase_index >= active.protocol.phases.len() {
            let session_id = active.session_id.clone();
            tracing::info!(session_id = %session_id, "All phases finished; session complete");
            state.current = None;
            return PhaseTransition::Completed { session_id };
        }

        let next = &active.protocol.phases[active.phase_index];
        active.phase_started_at = now;
        active.kind = PhaseKind::from_phase_name(&next.name);
        tracing::info!(
            session_id = %active.session_id,
            phase = %next.name,
            kind = active.kind.as_str(),
            "Phase transition"
        );
        PhaseTransition::Advanced {
            phase: next.name.clone(),
        }
    }

    /// Whether the current phase shows feedback. False outside a session
    /// and while paused.
    pub fn feedback_enabled(&self) -> bool {
        let state = self.lock();
        match state.current.as_ref() {
            Some(active) if active.kind != PhaseKind::Paused => {
                active.protocol.phases[active.phase_index].feedback_enabled
            }
            _ => false,
        }
    }

    /// Subject mapping of the active session, if any.
    pub fn subject_ids(&self) -> Option<HashMap<String, String>> {
        self.lock()
            .current
            .as_ref()
            .map(|a| a.subject_ids.clone())
    }

    /// Notes and experimenter of the active session, if any.
    pub fn annotations(&self) -> Option<(String, String)> {
        self.lock()
            .current
            .as_ref()
            .map(|a| (a.notes.clone(), a.experimenter.clone()))
    }

    /// Full status snapshot.
    pub fn status(&self) -> SessionStatus {
        let state = self.lock();
        let Some(active) = state.current.as_ref() else {
            return SessionStatus {
                active: false,
                session_id: None,
                protocol: None,
                phase: PhaseKind::Idle,
                phase_name: None,
                elapsed_seconds: 0.0,
                remaining_seconds: None,
                devices: Vec::new(),
                subject_ids: HashMap::new(),
                feedback_enabled: false,
                instructions: None,
            };
        };

        let now = unix_now();
        let phase = &active.protocol.phases[active.phase_index];
        let phase_elapsed = now - active.phase_started_at;
        let mut remaining = (phase.duration_secs - phase_elapsed).max(0.0);
        for later in &active.protocol.phases[active.phase_index + 1..] {
            remaining += later.duration_secs;
        }

        SessionStatus {
            active: true,
            session_id: Some(active.session_id.clone()),
            protocol: Some(active.protocol.name.clone()),
            phase: active.kind,
            phase_name: Some(phase.name.clone()),
            elapsed_seconds: now - active.started_at,
            remaining_seconds: Some(remaining),
            devices: active.subject_ids.keys().cloned().collect(),
            subject_ids: active.subject_ids.clone(),
            feedback_enabled: active.kind != PhaseKind::Paused && phase.feedback_enabled,
            instructions: Some(phase.instructions.clone()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().current.is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The built-in protocol library.
pub fn builtin_protocols() -> Vec<Protocol> {
    vec![
        Protocol {
            name: "Meditation Baseline".into(),
            description: "Baseline recording followed by relaxation training with feedback".into(),
            phases: vec![
                ProtocolPhase {
                    name: "Baseline".into(),
                    duration_secs: 120.0,
                    instructions: "Sit comfortably with eyes closed and focus on your breath."
                        .into(),
                    feedback_enabled: false,
                },
                ProtocolPhase {
                    name: "Training".into(),
                    duration_secs: 600.0,
                    instructions:
                        "Keep meditating; the feedback guides you toward a relaxed state.".into(),
                    feedback_enabled: true,
                },
                ProtocolPhase {
                    name: "Cooldown".into(),
                    duration_secs: 120.0,
                    instructions: "Final baseline. Eyes closed, natural breathing.".into(),
                    feedback_enabled: false,
                },
            ],
            min_devices: 1,
            max_devices: 4,
            feedback: Some(FeedbackTarget {
                metric: "relaxation".into(),
                threshold: 1.5,
                timescale: "4s".into(),
            }),
        },
        Protocol {
            name: "Quick Test".into(),
            description: "Short validation run with feedback enabled".into(),
            phases: vec![ProtocolPhase {
                name: "Test".into(),
                duration_secs: 30.0,
                instructions: "Short test with feedback enabled.".into(),
                feedback_enabled: true,
            }],
            min_devices: 1,
            max_devices: 4,
            feedback: Some(FeedbackTarget {
                metric: "relaxation".into(),
                threshold: 1.5,
                timescale: "4s".into(),
            }),
        },
        Protocol {
            name: "Eyes Open Closed".into(),
            description: "Classic paradigm for validating the alpha rhythm".into(),
            phases: vec![
                ProtocolPhase {
                    name: "Eyes Open".into(),
                    duration_secs: 60.0,
                    instructions: "Keep eyes open, looking at a fixed point.".into(),
                    feedback_enabled: false,
                },
                ProtocolPhase {
                    name: "Eyes Closed 1".into(),
                    duration_secs: 60.0,
                    instructions: "Close your eyes and relax.".into(),
                    feedback_enabled: false,
                },
                ProtocolPhase {
                    name: "Eyes Open 2".into(),
                    duration_secs: 60.0,
                    instructions: "Open your eyes, looking at a fixed point.".into(),
                    feedback_enabled: false,
                },
                ProtocolPhase {
                    name: "Eyes Closed 2".into(),
                    duration_secs: 60.0,
                    instructions: "Close your eyes and relax.".into(),
                    feedback_enabled: false,
                },
            ],
            min_devices: 1,
            max_devices: 4,
            feedback: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subjects(devices: &[&str]) -> HashMap<String, String> {
        devices
            .iter()
            .enumerate()
            .map(|(i, d)| ((*d).to_string(), format!("P{:03}", i + 1)))
            .collect()
    }

    fn connected(devices: &[&str]) -> Vec<String> {
        devices.iter().map(|d| (*d).to_string()).collect()
    }

    /// Single-phase protocol with a short duration for transition tests.
    fn blink_protocol(duration_secs: f64) -> Protocol {
        Protocol {
            name: "Blink".into(),
            description: "test".into(),
            phases: vec![
                ProtocolPhase {
                    name: "Baseline".into(),
                    duration_secs,
                    instructions: "hold".into(),
                    feedback_enabled: false,
                },
                ProtocolPhase {
                    name: "Training".into(),
                    duration_secs,
                    instructions: "go".into(),
                    feedback_enabled: true,
                },
            ],
            min_devices: 1,
            max_devices: 4,
            feedback: None,
        }
    }

    #[test]
    fn test_builtin_library() {
        let manager = SessionManager::new();
        let protocols = manager.list_protocols();
        assert_eq!(protocols.len(), 3);
        assert!(manager.get_protocol("Meditation Baseline").is_some());
        assert!(manager.get_protocol("meditation_baseline").is_some());
        assert!(manager.get_protocol("nope").is_none());

        let meditation = manager.get_protocol("meditation_baseline").unwrap();
        assert_eq!(meditation.total_duration(), 840.0);
        assert_eq!(meditation.phases.len(), 3);
        assert!(meditation.phases[1].feedback_enabled);
    }

    #[test]
    fn test_lifecycle_and_conflicts() {
        let manager = SessionManager::new();
        let devices = connected(&["muse-1"]);

        assert!(matches!(
            manager.stop_session(),
            Err(EngineError::SessionConflict { .. })
        ));

        let id = manager
            .start_session("Quick Test", subjects(&["muse-1"]), "", "", &devices)
            .unwrap();
        assert!(manager.is_active());

        let err = manager
            .start_session("Quick Test", subjects(&["muse-1"]), "", "", &devices)
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionConflict { .. }));

        let stopped = manager.stop_session().unwrap();
        assert_eq!(stopped, id);
        assert!(!manager.is_active());
    }

    #[test]
    fn test_start_validation() {
        let manager = SessionManager::new();

        assert!(matches!(
            manager.start_session("No Such", subjects(&["muse-1"]), "", "", &connected(&["muse-1"])),
            Err(EngineError::UnknownProtocol { .. })
        ));

        // Device not connected
        assert!(matches!(
            manager.start_session("Quick Test", subjects(&["muse-9"]), "", "", &connected(&["muse-1"])),
            Err(EngineError::DeviceNotConnected { .. })
        ));

        // Zero devices below protocol minimum
        assert!(matches!(
            manager.start_session("Quick Test", HashMap::new(), "", "", &connected(&["muse-1"])),
            Err(EngineError::SessionConflict { .. })
        ));
    }

    #[test]
    fn test_feedback_follows_phase() {
        let manager = SessionManager::new();
        assert!(!manager.feedback_enabled());

        manager
            .start_session(
                "Quick Test",
                subjects(&["muse-1"]),
                "",
                "",
                &connected(&["muse-1"]),
            )
            .unwrap();
        // Quick Test's only phase has feedback on
        assert!(manager.feedback_enabled());

        manager.pause_session().unwrap();
        assert!(!manager.feedback_enabled());
        assert_eq!(manager.status().phase, PhaseKind::Paused);

        manager.resume_session().unwrap();
        assert!(manager.feedback_enabled());

        manager.stop_session().unwrap();
        assert!(!manager.feedback_enabled());
    }

    #[test]
    fn test_phase_transitions_and_completion() {
        let manager = SessionManager::new();
        manager.add_protocol(blink_protocol(0.05)).unwrap();
        let id = manager
            .start_session(
                "Blink",
                subjects(&["muse-1"]),
                "",
                "",
                &connected(&["muse-1"]),
            )
            .unwrap();

        assert_eq!(manager.update_phase(), PhaseTransition::Unchanged);
        assert_eq!(manager.status().phase, PhaseKind::Baseline);

        std::thread::sleep(std::time::Duration::from_millis(60));
        assert_eq!(
            manager.update_phase(),
            PhaseTransition::Advanced {
                phase: "Training".into()
            }
        );
        assert_eq!(manager.status().phase, PhaseKind::Training);
        assert!(manager.feedback_enabled());

        std::thread::sleep(std::time::Duration::from_millis(60));
        assert_eq!(
            manager.update_phase(),
            PhaseTransition::Completed { session_id: id }
        );
        assert!(!manager.is_active());
    }

    #[test]
    fn test_status_fields() {
        let manager = SessionManager::new();
        let status = manager.status();
        assert!(!status.active);
        assert_eq!(status.phase, PhaseKind::Idle);
        assert!(status.remaining_seconds.is_none());

        manager
            .start_session(
                "Meditation Baseline",
                subjects(&["muse-1", "muse-2"]),
                "first run",
                "dr-a",
                &connected(&["muse-1", "muse-2"]),
            )
            .unwrap();

        let status = manager.status();
        assert!(status.active);
        assert_eq!(status.protocol.as_deref(), Some("Meditation Baseline"));
        assert_eq!(status.phase, PhaseKind::Baseline);
        assert_eq!(status.phase_name.as_deref(), Some("Baseline"));
        assert!(!status.feedback_enabled);
        assert_eq!(status.devices.len(), 2);
        let remaining = status.remaining_seconds.unwrap();
        assert!(remaining > 830.0 && remaining <= 840.0, "{remaining}");
        assert!(status.instructions.unwrap().contains("breath"));
        assert_eq!(
            manager.annotations(),
            Some(("first run".to_string(), "dr-a".to_string()))
        );
    }

    #[test]
    fn test_add_protocol_validation() {
        let manager = SessionManager::new();
        let mut bad = blink_protocol(0.0);
        bad.name = "Bad".into();
        let err = manager.add_protocol(bad).unwrap_err();
        assert!(matches!(err, EngineError::InvalidProtocol { .. }));

        let mut bad = blink_protocol(1.0);
        bad.max_devices = 0;
        assert!(manager.add_protocol(bad).is_err());
    }
}
