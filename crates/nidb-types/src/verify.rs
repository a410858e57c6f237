use crate::error::TypeError;
use crate::event::Event;

/// Validation predicate applied to events at ingest.
///
/// Events that fail verification are dropped from the batch without
/// aborting it. Signature cryptography is left to implementations; the
/// store only needs a yes/no answer.
pub trait EventVerifier: Send + Sync {
    fn verify(&self, event: &Event) -> bool;
}

impl<F> EventVerifier for F
where
    F: Fn(&Event) -> bool + Send + Sync,
{
    fn verify(&self, event: &Event) -> bool {
        self(event)
    }
}

/// Accepts every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl EventVerifier for AcceptAll {
    fn verify(&self, _event: &Event) -> bool {
        true
    }
}

/// Checks the shape of an event without checking its signature.
///
/// The id and pubkey must be 32 bytes of lowercase hex, the signature 64
/// bytes, and every tag must have a name.
#[derive(Clone, Copy, Debug, Default)]
pub struct StructuralVerifier;

impl StructuralVerifier {
    /// Explain why an event is malformed.
    pub fn check(event: &Event) -> Result<(), TypeError> {
        check_hex(&event.id, 32)?;
        check_hex(&event.pubkey, 32)?;
        check_hex(&event.sig, 64)?;
        if let Some(pos) = event.tags.iter().position(|tag| tag.is_empty()) {
            return Err(TypeError::EmptyTag(pos));
        }
        Ok(())
    }
}

impl EventVerifier for StructuralVerifier {
    fn verify(&self, event: &Event) -> bool {
        Self::check(event).is_ok()
    }
}

fn check_hex(s: &str, expected: usize) -> Result<(), TypeError> {
    if s.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(TypeError::InvalidHex(s.to_string()));
    }
    let bytes = hex::decode(s).map_err(|_| TypeError::InvalidHex(s.to_string()))?;
    if bytes.len() != expected {
        return Err(TypeError::InvalidLength {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Event {
        Event {
            id: "ab".repeat(32),
            pubkey: "cd".repeat(32),
            created_at: 1,
            kind: 1,
            tags: vec![vec!["t".into(), "x".into()]],
            content: String::new(),
            sig: "ef".repeat(64),
        }
    }

    #[test]
    fn accepts_well_formed_event() {
        assert!(StructuralVerifier.verify(&valid()));
    }

    #[test]
    fn rejects_short_id() {
        let mut e = valid();
        e.id = "ab".repeat(31);
        assert_eq!(
            StructuralVerifier::check(&e),
            Err(TypeError::InvalidLength {
                expected: 32,
                actual: 31
            })
        );
    }

    #[test]
    fn rejects_non_hex_and_uppercase() {
        let mut e = valid();
        e.pubkey = "zz".repeat(32);
        assert!(!StructuralVerifier.verify(&e));

        let mut e = valid();
        e.sig = "EF".repeat(64);
        assert!(!StructuralVerifier.verify(&e));
    }

    #[test]
    fn rejects_empty_tag() {
        let mut e = valid();
        e.tags.push(vec![]);
        assert!(!StructuralVerifier.verify(&e));
    }

    #[test]
    fn closures_are_verifiers() {
        let only_kind_one = |e: &Event| e.kind == 1;
        assert!(only_kind_one.verify(&valid()));
        assert!(AcceptAll.verify(&Event {
            id: String::new(),
            ..valid()
        }));
    }
}
