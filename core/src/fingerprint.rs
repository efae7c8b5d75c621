//! Canonical hashing of parameter sets, config, source SQL, and plan
//! nodes (spec.md §3 Fingerprint, §6.5 Determinism & cache keys).
//!
//! A fingerprint is SHA-256 over a type-tagged, length-prefixed
//! serialization of an ordered tuple of fields. Field order is fixed by
//! the caller (never sorted implicitly except where the spec calls for
//! it explicitly, e.g. `sorted_upstream_fps`), so equal logical inputs
//! always hash to equal bytes regardless of e.g. URL query ordering.

use std::fmt;

use sha2::{Digest, Sha256};

/// A 32-byte content-address hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Type tag byte written before every field, so a decimal-serialized
/// integer can never collide with a string of the same bytes.
#[repr(u8)]
enum FieldTag {
    Str = 0,
    I64 = 1,
    Bytes = 2,
    Fingerprint = 3,
    Bool = 4,
}

/// Accumulates fields into a canonical byte stream and finalizes to a
/// [`Fingerprint`]. Each field is tagged and length-prefixed so the
/// boundary between fields is always unambiguous.
#[derive(Default)]
pub struct FingerprintBuilder {
    hasher: Sha256Wrapper,
}

/// Thin wrapper so `Sha256` doesn't need to be `pub` in the field type.
#[derive(Default)]
struct Sha256Wrapper(Option<Sha256>);

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self {
            hasher: Sha256Wrapper(Some(Sha256::new())),
        }
    }

    fn hasher_mut(&mut self) -> &mut Sha256 {
        self.hasher.0.get_or_insert_with(Sha256::new)
    }

    fn write_tagged(&mut self, tag: FieldTag, bytes: &[u8]) -> &mut Self {
        let hasher = self.hasher_mut();
        hasher.update([tag as u8]);
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
        self
    }

    pub fn field_str(&mut self, s: &str) -> &mut Self {
        self.write_tagged(FieldTag::Str, s.as_bytes())
    }

    pub fn field_i64(&mut self, n: i64) -> &mut Self {
        self.write_tagged(FieldTag::I64, n.to_string().as_bytes())
    }

    pub fn field_bool(&mut self, b: bool) -> &mut Self {
        self.write_tagged(FieldTag::Bool, &[b as u8])
    }

    pub fn field_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_tagged(FieldTag::Bytes, bytes)
    }

    pub fn field_fingerprint(&mut self, fp: &Fingerprint) -> &mut Self {
        self.write_tagged(FieldTag::Fingerprint, fp.as_bytes())
    }

    /// Write a sorted list of strings as a single field (used for
    /// `sorted_upstream_fps` / `sorted_inputs_applied`, §6.5).
    pub fn field_sorted_strs<I: IntoIterator<Item = S>, S: AsRef<str>>(
        &mut self,
        items: I,
    ) -> &mut Self {
        let mut sorted: Vec<String> = items.into_iter().map(|s| s.as_ref().to_string()).collect();
        sorted.sort();
        self.field_i64(sorted.len() as i64);
        for item in &sorted {
            self.field_str(item);
        }
        self
    }

    pub fn field_sorted_fingerprints<I: IntoIterator<Item = Fingerprint>>(
        &mut self,
        items: I,
    ) -> &mut Self {
        let mut sorted: Vec<Fingerprint> = items.into_iter().collect();
        sorted.sort();
        self.field_i64(sorted.len() as i64);
        for fp in &sorted {
            self.field_fingerprint(fp);
        }
        self
    }

    pub fn finalize(mut self) -> Fingerprint {
        let hasher = self.hasher.0.take().expect("finalize called twice");
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Fingerprint(out)
    }
}

/// Convenience: hash a single opaque byte string (used for the source
/// fingerprint of a `Report`, spec.md §3).
pub fn source_fingerprint(canonical_source: &[u8]) -> Fingerprint {
    let mut b = FingerprintBuilder::new();
    b.field_bytes(canonical_source);
    b.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_fields_same_fingerprint() {
        let a = {
            let mut b = FingerprintBuilder::new();
            b.field_str("deploy-1").field_str("base").field_i64(2);
            b.finalize()
        };
        let b = {
            let mut b = FingerprintBuilder::new();
            b.field_str("deploy-1").field_str("base").field_i64(2);
            b.finalize()
        };
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
    }

    #[test]
    fn field_boundary_is_unambiguous() {
        // "ab" + "c" must not fingerprint the same as "a" + "bc"
        let a = {
            let mut b = FingerprintBuilder::new();
            b.field_str("ab").field_str("c");
            b.finalize()
        };
        let b = {
            let mut b = FingerprintBuilder::new();
            b.field_str("a").field_str("bc");
            b.finalize()
        };
        assert_ne!(a, b);
    }

    #[test]
    fn sorted_fields_are_order_independent() {
        let a = {
            let mut b = FingerprintBuilder::new();
            b.field_sorted_strs(["Region=north", "DayWindow=2"]);
            b.finalize()
        };
        let b = {
            let mut b = FingerprintBuilder::new();
            b.field_sorted_strs(["DayWindow=2", "Region=north"]);
            b.finalize()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn int_and_string_tags_differ() {
        let a = {
            let mut b = FingerprintBuilder::new();
            b.field_i64(42);
            b.finalize()
        };
        let b = {
            let mut b = FingerprintBuilder::new();
            b.field_str("42");
            b.finalize()
        };
        assert_ne!(a, b);
    }
}
