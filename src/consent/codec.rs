//! TCF v2 consent-string encoding.

use crate::base::error::AuditError;
use crate::consent::bits::{BitReader, BitWriter};
use crate::consent::record::{ConsentRecord, PublisherTc, VendorRange, VendorSection};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;

/// Converts between structured consent records and their string form.
pub trait ConsentCodec: Send + Sync {
    fn encode(&self, record: &ConsentRecord) -> Result<String, AuditError>;
    fn decode(&self, encoded: &str) -> Result<ConsentRecord, AuditError>;
}

const SEGMENT_SEPARATOR: char = '.';
const PUBLISHER_TC_SEGMENT: u64 = 3;

const ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The leading (core) segment of an encoded consent string.
pub fn core_segment(encoded: &str) -> &str {
    encoded.split(SEGMENT_SEPARATOR).next().unwrap_or_default()
}

/// Core segment plus optional publisher-TC segment, base64url without
/// padding.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcfV2Codec;

impl TcfV2Codec {
    pub fn new() -> Self {
        Self
    }
}

impl ConsentCodec for TcfV2Codec {
    fn encode(&self, record: &ConsentRecord) -> Result<String, AuditError> {
        record.validate()?;

        let mut w = BitWriter::new();
        w.write(u64::from(record.version), 6);
        w.write(deciseconds(record.created)?, 36);
        w.write(deciseconds(record.last_updated)?, 36);
        w.write(u64::from(record.cmp_id), 12);
        w.write(u64::from(record.cmp_version), 12);
        w.write(u64::from(record.consent_screen), 6);
        write_letters(&mut w, &record.consent_language);
        w.write(u64::from(record.vendor_list_version), 12);
        w.write(u64::from(record.tcf_policy_version), 6);
        w.write_bool(record.is_service_specific);
        w.write_bool(record.use_non_standard_texts);
        write_id_set(&mut w, &record.special_feature_opt_ins, 12);
        write_purpose_bits(&mut w, &record.purposes_consent);
        write_purpose_bits(&mut w, &record.purposes_li_transparency);
        w.write_bool(record.purpose_one_treatment);
        write_letters(&mut w, &record.publisher_cc);
        write_vendor_section(&mut w, &record.vendor_consents);
        write_vendor_section(&mut w, &record.vendor_legitimate_interests);
        // NumPubRestrictions
        w.write(0, 12);

        let mut encoded = ENGINE.encode(w.finish());
        if let Some(publisher) = &record.publisher_tc {
            let mut w = BitWriter::new();
            w.write(PUBLISHER_TC_SEGMENT, 3);
            write_purpose_bits(&mut w, &publisher.purposes_consent);
            write_purpose_bits(&mut w, &publisher.purposes_li_transparency);
            // NumCustomPurposes
            w.write(0, 6);
            encoded.push(SEGMENT_SEPARATOR);
            encoded.push_str(&ENGINE.encode(w.finish()));
        }
        Ok(encoded)
    }

    fn decode(&self, encoded: &str) -> Result<ConsentRecord, AuditError> {
        let mut segments = encoded.trim().split(SEGMENT_SEPARATOR);
        let core = segments.next().unwrap_or_default();
        let bytes = ENGINE
            .decode(core)
            .map_err(|e| AuditError::Decoding(format!("core segment: {e}")))?;
        let mut r = BitReader::new(&bytes);

        let version = r.read(6)? as u8;
        if version != 2 {
            return Err(AuditError::Decoding(format!("unsupported version {version}")));
        }
        let created = from_deciseconds(r.read(36)?)?;
        let last_updated = from_deciseconds(r.read(36)?)?;
        let cmp_id = r.read(12)? as u16;
        let cmp_version = r.read(12)? as u16;
        let consent_screen = r.read(6)? as u8;
        let consent_language = read_letters(&mut r)?;
        let vendor_list_version = r.read(12)? as u16;
        let tcf_policy_version = r.read(6)? as u8;
        let is_service_specific = r.read_bool()?;
        let use_non_standard_texts = r.read_bool()?;
        let special_feature_opt_ins = read_id_set(&mut r, 12)?;
        let purposes_consent = read_purpose_bits(&mut r)?;
        let purposes_li_transparency = read_purpose_bits(&mut r)?;
        let purpose_one_treatment = r.read_bool()?;
        let publisher_cc = read_letters(&mut r)?;
        let vendor_consents = read_vendor_section(&mut r)?;
        let vendor_legitimate_interests = read_vendor_section(&mut r)?;

        let mut publisher_tc = None;
        for segment in segments {
            let bytes = ENGINE
                .decode(segment)
                .map_err(|e| AuditError::Decoding(format!("segment: {e}")))?;
            let mut r = BitReader::new(&bytes);
            if r.read(3)? == PUBLISHER_TC_SEGMENT {
                publisher_tc = Some(PublisherTc {
                    purposes_consent: read_purpose_bits(&mut r)?,
                    purposes_li_transparency: read_purpose_bits(&mut r)?,
                });
            }
        }

        Ok(ConsentRecord {
            version,
            created,
            last_updated,
            cmp_id,
            cmp_version,
            consent_screen,
            consent_language,
            vendor_list_version,
            tcf_policy_version,
            is_service_specific,
            use_non_standard_texts,
            special_feature_opt_ins,
            purposes_consent,
            purposes_li_transparency,
            purpose_one_treatment,
            publisher_cc,
            vendor_consents,
            vendor_legitimate_interests,
            publisher_tc,
        })
    }
}

fn deciseconds(t: OffsetDateTime) -> Result<u64, AuditError> {
    u64::try_from(t.unix_timestamp_nanos() / 100_000_000)
        .map_err(|_| AuditError::Encoding(format!("timestamp {t} predates the epoch")))
}

fn from_deciseconds(ds: u64) -> Result<OffsetDateTime, AuditError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ds) * 100_000_000)
        .map_err(|e| AuditError::Decoding(format!("timestamp: {e}")))
}

fn write_letters(w: &mut BitWriter, code: &str) {
    for b in code.bytes() {
        w.write(u64::from(b - b'A'), 6);
    }
}

fn read_letters(r: &mut BitReader<'_>) -> Result<String, AuditError> {
    let mut code = String::with_capacity(2);
    for _ in 0..2 {
        let offset = r.read(6)? as u8;
        if offset > 25 {
            return Err(AuditError::Decoding(format!("letter offset {offset}")));
        }
        code.push(char::from(b'A' + offset));
    }
    Ok(code)
}

fn write_id_set(w: &mut BitWriter, ids: &BTreeSet<u8>, width: u8) {
    for id in 1..=width {
        w.write_bool(ids.contains(&id));
    }
}

fn read_id_set(r: &mut BitReader<'_>, width: u8) -> Result<BTreeSet<u8>, AuditError> {
    let mut ids = BTreeSet::new();
    for id in 1..=width {
        if r.read_bool()? {
            ids.insert(id);
        }
    }
    Ok(ids)
}

fn write_purpose_bits(w: &mut BitWriter, purposes: &BTreeMap<u8, bool>) {
    for id in 1..=24u8 {
        w.write_bool(purposes.get(&id).copied().unwrap_or(false));
    }
}

/// Only set bits come back; an unset purpose is indistinguishable from an
/// absent one on the wire.
fn read_purpose_bits(r: &mut BitReader<'_>) -> Result<BTreeMap<u8, bool>, AuditError> {
    Ok(read_id_set(r, 24)?.into_iter().map(|id| (id, true)).collect())
}

fn range_cost(section: &VendorSection) -> usize {
    12 + section
        .ranges
        .iter()
        .map(|r| if r.start == r.end { 17 } else { 33 })
        .sum::<usize>()
}

/// Writes whichever of the range or bitfield encodings is shorter.
fn write_vendor_section(w: &mut BitWriter, section: &VendorSection) {
    w.write(u64::from(section.max_vendor_id), 16);
    let use_ranges = range_cost(section) < usize::from(section.max_vendor_id);
    w.write_bool(use_ranges);
    if use_ranges {
        w.write(section.ranges.len() as u64, 12);
        for range in &section.ranges {
            let is_range = range.start != range.end;
            w.write_bool(is_range);
            w.write(u64::from(range.start), 16);
            if is_range {
                w.write(u64::from(range.end), 16);
            }
        }
    } else {
        for id in 1..=section.max_vendor_id {
            w.write_bool(section.contains(id));
        }
    }
}

fn read_vendor_section(r: &mut BitReader<'_>) -> Result<VendorSection, AuditError> {
    let max_vendor_id = r.read(16)? as u16;
    let mut ranges: Vec<VendorRange> = Vec::new();
    if r.read_bool()? {
        let entries = r.read(12)?;
        for _ in 0..entries {
            let is_range = r.read_bool()?;
            let start = r.read(16)? as u16;
            let end = if is_range { r.read(16)? as u16 } else { start };
            ranges.push(VendorRange::new(start, end));
        }
    } else {
        for id in 1..=max_vendor_id {
            if !r.read_bool()? {
                continue;
            }
            match ranges.last_mut() {
                Some(last) if last.end + 1 == id => last.end = id,
                _ => ranges.push(VendorRange::single(id)),
            }
        }
    }
    Ok(VendorSection {
        max_vendor_id,
        ranges,
    })
}
