use crate::base::error::AuditError;
use crate::consent::codec::{ConsentCodec, TcfV2Codec};
use crate::consent::record::{
    CmpIdentity, ConsentRecord, PublisherTc, VendorSection, PURPOSE_IDS,
};
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;

/// Which consent decision gets injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentPolicy {
    /// Every purpose refused, no vendor consent.
    DenyAll,
    /// Purposes `1..=last_purpose` and vendors `1..=max_vendor_id` consented.
    GrantPurposes { last_purpose: u8, max_vendor_id: u16 },
}

impl Default for ConsentPolicy {
    fn default() -> Self {
        ConsentPolicy::GrantPurposes {
            last_purpose: 10,
            max_vendor_id: 1200,
        }
    }
}

impl ConsentPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            ConsentPolicy::DenyAll => "deny-all",
            ConsentPolicy::GrantPurposes { .. } => "grant-purposes",
        }
    }

    /// Reject a policy whose consented purposes fall outside the purpose bitfield.
    pub fn validate(&self) -> Result<(), AuditError> {
        match *self {
            ConsentPolicy::GrantPurposes { last_purpose, .. }
                if !PURPOSE_IDS.contains(&last_purpose) =>
            {
                Err(AuditError::Encoding(format!(
                    "last purpose {last_purpose} outside {}..={}",
                    PURPOSE_IDS.start(),
                    PURPOSE_IDS.end()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Builds the synthetic consent record injected into each page.
#[derive(Debug, Clone)]
pub struct ConsentRecordBuilder<C = TcfV2Codec> {
    policy: ConsentPolicy,
    codec: C,
    consent_language: String,
    publisher_cc: String,
}

impl ConsentRecordBuilder<TcfV2Codec> {
    pub fn new(policy: ConsentPolicy) -> Self {
        Self::with_codec(policy, TcfV2Codec)
    }
}

impl<C: ConsentCodec> ConsentRecordBuilder<C> {
    pub fn with_codec(policy: ConsentPolicy, codec: C) -> Self {
        Self {
            policy,
            codec,
            consent_language: "EN".to_string(),
            publisher_cc: "NL".to_string(),
        }
    }

    pub fn publisher_cc(mut self, cc: impl Into<String>) -> Self {
        self.publisher_cc = cc.into();
        self
    }

    pub fn consent_language(mut self, language: impl Into<String>) -> Self {
        self.consent_language = language.into();
        self
    }

    pub fn policy(&self) -> ConsentPolicy {
        self.policy
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Structured record for `cmp` at time `now`, truncated to the
    /// decisecond resolution the encoding carries.
    pub fn build(&self, cmp: CmpIdentity, now: OffsetDateTime) -> ConsentRecord {
        let stamp = truncate_to_deciseconds(now);
        let (consent_screen, purposes, vendors, purpose_one_treatment) = match self.policy {
            ConsentPolicy::DenyAll => (1, BTreeMap::new(), VendorSection::empty(), false),
            ConsentPolicy::GrantPurposes {
                last_purpose,
                max_vendor_id,
            } => (
                2,
                (1..=last_purpose).map(|id| (id, true)).collect(),
                VendorSection::all(max_vendor_id),
                true,
            ),
        };

        ConsentRecord {
            version: 2,
            created: stamp,
            last_updated: stamp,
            cmp_id: cmp.cmp_id,
            cmp_version: cmp.cmp_version,
            consent_screen,
            consent_language: self.consent_language.clone(),
            vendor_list_version: cmp.vendor_list_version,
            tcf_policy_version: 2,
            is_service_specific: true,
            use_non_standard_texts: false,
            special_feature_opt_ins: BTreeSet::new(),
            purposes_consent: purposes.clone(),
            purposes_li_transparency: BTreeMap::new(),
            purpose_one_treatment,
            publisher_cc: self.publisher_cc.clone(),
            vendor_consents: vendors,
            vendor_legitimate_interests: VendorSection::empty(),
            publisher_tc: Some(PublisherTc {
                purposes_consent: purposes,
                purposes_li_transparency: BTreeMap::new(),
            }),
        }
    }

    /// Build and encode in one step.
    pub fn build_encoded(
        &self,
        cmp: CmpIdentity,
        now: OffsetDateTime,
    ) -> Result<(ConsentRecord, String), AuditError> {
        let record = self.build(cmp, now);
        let encoded = self.codec.encode(&record)?;
        Ok((record, encoded))
    }
}

fn truncate_to_deciseconds(t: OffsetDateTime) -> OffsetDateTime {
    let nanos = t.unix_timestamp_nanos();
    let truncated = nanos - nanos.rem_euclid(100_000_000);
    OffsetDateTime::from_unix_timestamp_nanos(truncated).unwrap_or(t)
}
