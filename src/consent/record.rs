use crate::base::error::AuditError;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use time::OffsetDateTime;

/// Purpose ids representable in the consent string's purpose bitfields.
pub const PURPOSE_IDS: RangeInclusive<u8> = 1..=24;

/// Special feature ids representable in the opt-in bitfield.
pub const SPECIAL_FEATURE_IDS: RangeInclusive<u8> = 1..=12;

/// Largest CMP id, CMP version or vendor-list version a 12-bit field holds.
pub const MAX_CMP_FIELD: u16 = (1 << 12) - 1;

/// Inclusive interval of vendor ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VendorRange {
    pub start: u16,
    pub end: u16,
}

impl VendorRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn single(id: u16) -> Self {
        Self { start: id, end: id }
    }

    pub fn contains(&self, id: u16) -> bool {
        (self.start..=self.end).contains(&id)
    }

    /// Number of ids covered; a reversed range covers none.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// Vendor consent or legitimate-interest section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorSection {
    pub max_vendor_id: u16,
    /// Sorted, non-overlapping intervals of vendors that are set.
    pub ranges: Vec<VendorRange>,
}

impl VendorSection {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every vendor from 1 through `max_vendor_id`.
    pub fn all(max_vendor_id: u16) -> Self {
        if max_vendor_id == 0 {
            return Self::empty();
        }
        Self {
            max_vendor_id,
            ranges: vec![VendorRange::new(1, max_vendor_id)],
        }
    }

    pub fn contains(&self, id: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(id))
    }

    fn validate(&self, label: &str) -> Result<(), AuditError> {
        let mut previous_end = 0u16;
        for range in &self.ranges {
            if range.start == 0 || range.start > range.end {
                return Err(AuditError::Encoding(format!(
                    "{label}: invalid range {}..={}",
                    range.start, range.end
                )));
            }
            if range.start <= previous_end {
                return Err(AuditError::Encoding(format!(
                    "{label}: ranges overlap or are unsorted at {}",
                    range.start
                )));
            }
            previous_end = range.end;
        }
        if previous_end != self.max_vendor_id {
            return Err(AuditError::Encoding(format!(
                "{label}: ranges end at {previous_end}, declared max is {}",
                self.max_vendor_id
            )));
        }
        Ok(())
    }
}

/// Publisher purposes segment (segment type 3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherTc {
    pub purposes_consent: BTreeMap<u8, bool>,
    pub purposes_li_transparency: BTreeMap<u8, bool>,
}

/// The CMP identity a record is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmpIdentity {
    pub cmp_id: u16,
    pub cmp_version: u16,
    pub vendor_list_version: u16,
}

/// A structured TCF v2 consent decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRecord {
    pub version: u8,
    pub created: OffsetDateTime,
    pub last_updated: OffsetDateTime,
    pub cmp_id: u16,
    pub cmp_version: u16,
    pub consent_screen: u8,
    pub consent_language: String,
    pub vendor_list_version: u16,
    pub tcf_policy_version: u8,
    pub is_service_specific: bool,
    pub use_non_standard_texts: bool,
    pub special_feature_opt_ins: BTreeSet<u8>,
    pub purposes_consent: BTreeMap<u8, bool>,
    pub purposes_li_transparency: BTreeMap<u8, bool>,
    pub purpose_one_treatment: bool,
    pub publisher_cc: String,
    pub vendor_consents: VendorSection,
    pub vendor_legitimate_interests: VendorSection,
    pub publisher_tc: Option<PublisherTc>,
}

impl ConsentRecord {
    pub fn identity(&self) -> CmpIdentity {
        CmpIdentity {
            cmp_id: self.cmp_id,
            cmp_version: self.cmp_version,
            vendor_list_version: self.vendor_list_version,
        }
    }

    /// Purpose ids whose consent flag is set.
    pub fn consented_purposes(&self) -> Vec<u8> {
        self.purposes_consent
            .iter()
            .filter(|(_, granted)| **granted)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Check the structural invariants the encoder relies on.
    pub fn validate(&self) -> Result<(), AuditError> {
        for (label, value) in [
            ("CMP id", self.cmp_id),
            ("CMP version", self.cmp_version),
            ("vendor list version", self.vendor_list_version),
        ] {
            if value > MAX_CMP_FIELD {
                return Err(AuditError::Encoding(format!(
                    "{label} {value} exceeds {MAX_CMP_FIELD}"
                )));
            }
        }
        let purpose_maps = [
            ("purposes consent", &self.purposes_consent),
            ("purposes LI", &self.purposes_li_transparency),
        ];
        for (label, map) in purpose_maps {
            if let Some(id) = map.keys().find(|id| !PURPOSE_IDS.contains(id)) {
                return Err(AuditError::Encoding(format!("{label}: purpose {id} out of range")));
            }
        }
        if let Some(id) = self
            .special_feature_opt_ins
            .iter()
            .find(|id| !SPECIAL_FEATURE_IDS.contains(id))
        {
            return Err(AuditError::Encoding(format!("special feature {id} out of range")));
        }
        for (label, code) in [
            ("consent language", &self.consent_language),
            ("publisher country", &self.publisher_cc),
        ] {
            if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_uppercase()) {
                return Err(AuditError::Encoding(format!(
                    "{label} must be two uppercase letters, got {code:?}"
                )));
            }
        }
        self.vendor_consents.validate("vendor consents")?;
        self.vendor_legitimate_interests
            .validate("vendor legitimate interests")?;
        Ok(())
    }
}
