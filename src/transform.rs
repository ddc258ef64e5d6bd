use crate::model::TimeSession;
use crate::store::canonical::EncryptionMarker;
use crate::store::files::sha256_hex;

/// Optional rewrites applied to each session as batches are processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transforms {
    pub anonymize: bool,
    pub mark_encrypted: bool,
}

impl Transforms {
    pub fn apply(&self, session: &TimeSession) -> TimeSession {
        let mut out = session.clone();
        if self.anonymize {
            out.user = anonymize_user(&session.user);
        }
        out
    }

    pub fn apply_all(&self, sessions: &[TimeSession]) -> Vec<TimeSession> {
        sessions.iter().map(|s| self.apply(s)).collect()
    }

    pub fn encryption(&self) -> Option<EncryptionMarker> {
        self.mark_encrypted
            .then(EncryptionMarker::sensitive_fields)
    }
}

/// Deterministic short token: the same user always maps to the same token.
pub fn anonymize_user(user: &str) -> String {
    format!("user-{}", &sha256_hex(user.as_bytes())[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Grammar;
    use crate::task_id::TaskId;

    fn session(user: &str) -> TimeSession {
        TimeSession {
            id: "a".into(),
            task_id: TaskId::parse_ref("1").unwrap(),
            user: user.into(),
            minutes: 30,
            description: "work".into(),
            date: None,
            start: None,
            end: None,
            status: "completed".into(),
            provenance: Grammar::Freeform,
            line: 1,
        }
    }

    #[test]
    fn anonymization_is_deterministic_and_distinct() {
        let a = anonymize_user("alice");
        assert_eq!(a, anonymize_user("alice"));
        assert_ne!(a, anonymize_user("bob"));
        assert!(a.starts_with("user-"));
        assert_eq!(a.len(), 13);
    }

    #[test]
    fn apply_only_touches_user() {
        let t = Transforms {
            anonymize: true,
            mark_encrypted: false,
        };
        let out = t.apply(&session("alice"));
        assert_eq!(out.user, anonymize_user("alice"));
        assert_eq!(out.minutes, 30);
        assert_eq!(out.id, "a");
        assert!(t.encryption().is_none());
        assert_eq!(Transforms::default().apply(&session("alice")).user, "alice");
    }
}
