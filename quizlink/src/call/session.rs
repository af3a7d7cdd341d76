use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::rtc::SessionDescriptor;

/// Store-assigned session identifier
pub type SessionId = String;

/// Shared playback state for the question being read aloud.
/// `speaking` and `is_paused` are never both true; use the transition
/// methods instead of writing the fields directly.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TtsStatus {
    pub speaking: bool,
    pub is_paused: bool,
    pub was_speaking: bool,
}

impl TtsStatus {
    /// Playback started (or resumed) from some offset.
    pub fn begin(&mut self) {
        self.speaking = true;
        self.is_paused = false;
        self.was_speaking = false;
    }

    /// Playback ran to its natural end or was explicitly stopped.
    pub fn finish(&mut self) {
        self.speaking = false;
        self.is_paused = false;
        self.was_speaking = false;
    }

    /// Playback interrupted mid-utterance; a resume may follow.
    pub fn interrupt(&mut self) {
        self.speaking = false;
        self.is_paused = true;
        self.was_speaking = true;
    }

    pub fn is_idle(&self) -> bool {
        !self.speaking && !self.is_paused
    }
}

/// Result of grading one spoken answer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerValidation {
    /// The transcript that was graded.
    pub answer: String,
    pub is_correct: bool,
    /// The oracle's verdict text, verbatim.
    pub explanation: String,
}

/// The shared session record. The authoritative copy lives in the store;
/// each client holds a possibly momentarily stale mirror and only ever
/// writes through field-level patches.
///
/// Field ownership (one writer side at a time): `offer` belongs to the
/// initiator and `answer` to the joiner; `button_locked` and
/// `last_unmute_time` to whichever party is acquiring or releasing the
/// unmute window; `tts_state` to the party whose device is reading;
/// `captions` and `answer_validation` to the party holding the window.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescriptor>,
    /// Exclusive unmute lock.
    pub button_locked: bool,
    /// Wall clock of the owning party when the lock was last taken. The
    /// remote side derives countdown display from this rather than from a
    /// local delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_unmute_time: Option<DateTime<Utc>>,
    /// Latest final transcript, shown to both parties.
    #[serde(default)]
    pub captions: String,
    pub tts_state: TtsStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_validation: Option<AnswerValidation>,
    /// Time of the last write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Partial update merged into the stored session record. Only present
/// fields overwrite; everything else keeps its committed value. The
/// double-`Option` fields distinguish "leave alone" from "clear".
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionPatch {
    pub offer: Option<SessionDescriptor>,
    pub answer: Option<SessionDescriptor>,
    pub button_locked: Option<bool>,
    pub last_unmute_time: Option<Option<DateTime<Utc>>>,
    pub captions: Option<String>,
    pub tts_state: Option<TtsStatus>,
    pub answer_validation: Option<Option<AnswerValidation>>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl SessionPatch {
    pub fn is_empty(&self) -> bool {
        self.offer.is_none()
            && self.answer.is_none()
            && self.button_locked.is_none()
            && self.last_unmute_time.is_none()
            && self.captions.is_none()
            && self.tts_state.is_none()
            && self.answer_validation.is_none()
            && self.timestamp.is_none()
    }

    pub fn apply(&self, doc: &mut SessionDocument) {
        if let Some(offer) = &self.offer {
            doc.offer = Some(offer.clone());
        }
        if let Some(answer) = &self.answer {
            doc.answer = Some(answer.clone());
        }
        if let Some(locked) = self.button_locked {
            doc.button_locked = locked;
        }
        if let Some(at) = self.last_unmute_time {
            doc.last_unmute_time = at;
        }
        if let Some(captions) = &self.captions {
            doc.captions = captions.clone();
        }
        if let Some(tts) = self.tts_state {
            doc.tts_state = tts;
        }
        if let Some(validation) = &self.answer_validation {
            doc.answer_validation = validation.clone();
        }
        if let Some(at) = self.timestamp {
            doc.timestamp = Some(at);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rtc::DescriptorKind;

    #[test]
    fn tts_transitions_never_speak_while_paused() {
        let mut status = TtsStatus::default();
        assert!(status.is_idle());

        status.begin();
        assert!(status.speaking && !status.is_paused);

        status.interrupt();
        assert!(!(status.speaking && status.is_paused));
        assert!(status.was_speaking);

        status.begin();
        assert!(status.speaking && !status.is_paused && !status.was_speaking);

        status.finish();
        assert!(status.is_idle());
    }

    #[test]
    fn patch_merges_only_present_fields() {
        let mut doc = SessionDocument {
            captions: "first".into(),
            ..Default::default()
        };
        doc.tts_state.begin();

        let patch = SessionPatch {
            button_locked: Some(true),
            last_unmute_time: Some(Some(Utc::now())),
            ..Default::default()
        };
        patch.apply(&mut doc);

        assert!(doc.button_locked);
        assert!(doc.last_unmute_time.is_some());
        // fields the patch did not carry are untouched
        assert_eq!(doc.captions, "first");
        assert!(doc.tts_state.speaking);
    }

    #[test]
    fn patch_application_is_idempotent() {
        let mut doc = SessionDocument::default();
        let patch = SessionPatch {
            captions: Some("what is the capital of peru".into()),
            button_locked: Some(true),
            ..Default::default()
        };
        patch.apply(&mut doc);
        let once = doc.clone();
        patch.apply(&mut doc);
        assert_eq!(once, doc);
    }

    #[test]
    fn patch_clears_nested_fields() {
        let mut doc = SessionDocument {
            last_unmute_time: Some(Utc::now()),
            answer_validation: Some(AnswerValidation {
                answer: "mars".into(),
                is_correct: true,
                explanation: "Correct".into(),
            }),
            ..Default::default()
        };
        let patch = SessionPatch {
            last_unmute_time: Some(None),
            answer_validation: Some(None),
            ..Default::default()
        };
        patch.apply(&mut doc);
        assert!(doc.last_unmute_time.is_none());
        assert!(doc.answer_validation.is_none());
    }

    #[test]
    fn document_uses_wire_field_names() -> anyhow::Result<()> {
        let mut doc = SessionDocument::default();
        doc.offer = Some(SessionDescriptor {
            kind: DescriptorKind::Offer,
            sdp: "v=0".into(),
        });
        doc.button_locked = true;
        doc.tts_state.interrupt();

        let value = serde_json::to_value(&doc)?;
        assert_eq!(value["offer"]["type"], "offer");
        assert_eq!(value["buttonLocked"], true);
        assert_eq!(value["ttsState"]["isPaused"], true);
        assert_eq!(value["ttsState"]["wasSpeaking"], true);
        assert!(value.get("lastUnmuteTime").is_none());
        Ok(())
    }
}
