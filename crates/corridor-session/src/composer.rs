use std::collections::HashMap;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::SessionError;

/// An attachment staged on a draft, held in memory until the send uploads
/// it. One per draft; staging again replaces it.
#[derive(Debug, Clone)]
pub struct StagedAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub text: String,
    pub attachment: Option<StagedAttachment>,
}

impl Draft {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachment.is_none()
    }

    /// The send gate: a message must carry text or an attachment. Checked
    /// before anything touches the network.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.is_empty() {
            Err(SessionError::EmptyMessage)
        } else {
            Ok(())
        }
    }
}

/// Per-conversation drafts. A send takes the draft optimistically; on
/// failure it is restored without clobbering anything typed meanwhile.
pub struct Composer {
    drafts: HashMap<Uuid, Draft>,
}

impl Composer {
    pub fn new() -> Self {
        Self {
            drafts: HashMap::new(),
        }
    }

    pub fn draft(&self, conversation: Uuid) -> Draft {
        self.drafts.get(&conversation).cloned().unwrap_or_default()
    }

    pub fn set_text(&mut self, conversation: Uuid, text: String) {
        self.drafts.entry(conversation).or_default().text = text;
    }

    pub fn stage(&mut self, conversation: Uuid, attachment: StagedAttachment) {
        self.drafts.entry(conversation).or_default().attachment = Some(attachment);
    }

    pub fn clear_attachment(&mut self, conversation: Uuid) {
        if let Some(draft) = self.drafts.get_mut(&conversation) {
            draft.attachment = None;
        }
    }

    pub fn take(&mut self, conversation: Uuid) -> Draft {
        self.drafts.remove(&conversation).unwrap_or_default()
    }

    /// Put a failed send's draft back. Text typed since the take wins over
    /// the restored text; same for a freshly staged attachment.
    pub fn restore(&mut self, conversation: Uuid, draft: Draft) {
        let current = self.drafts.entry(conversation).or_default();
        if current.text.trim().is_empty() {
            current.text = draft.text;
        }
        if current.attachment.is_none() {
            current.attachment = draft.attachment;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(name: &str) -> StagedAttachment {
        StagedAttachment {
            file_name: name.to_string(),
            mime_type: "application/octet-stream".to_string(),
            data: Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn empty_drafts_fail_validation_before_any_network_call() {
        assert!(Draft::default().validate().is_err());
        assert!(
            Draft {
                text: "   ".into(),
                attachment: None
            }
            .validate()
            .is_err()
        );
        assert!(
            Draft {
                text: "hi".into(),
                attachment: None
            }
            .validate()
            .is_ok()
        );
        // Attachment-only is a valid message
        assert!(
            Draft {
                text: String::new(),
                attachment: Some(staged("x.bin"))
            }
            .validate()
            .is_ok()
        );
    }

    #[test]
    fn take_clears_and_restore_puts_back() {
        let cid = Uuid::new_v4();
        let mut composer = Composer::new();
        composer.set_text(cid, "draft text".into());
        composer.stage(cid, staged("scan.pdf"));

        let taken = composer.take(cid);
        assert!(composer.draft(cid).is_empty());

        composer.restore(cid, taken);
        let restored = composer.draft(cid);
        assert_eq!(restored.text, "draft text");
        assert_eq!(restored.attachment.unwrap().file_name, "scan.pdf");
    }

    #[test]
    fn restore_never_clobbers_newer_input() {
        let cid = Uuid::new_v4();
        let mut composer = Composer::new();
        composer.set_text(cid, "first try".into());

        let taken = composer.take(cid);
        composer.set_text(cid, "typed while sending".into());

        composer.restore(cid, taken);
        assert_eq!(composer.draft(cid).text, "typed while sending");
    }

    #[test]
    fn drafts_are_scoped_per_conversation() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut composer = Composer::new();
        composer.set_text(a, "for a".into());

        assert!(composer.draft(b).is_empty());
        composer.clear_attachment(b);
        assert_eq!(composer.draft(a).text, "for a");
    }
}
