use crate::consent::core_segment;
use crate::cookies::CapturedCookie;
use crate::session::SessionReport;
use time::OffsetDateTime;

/// CMP display status meaning its consent UI is on screen.
const PROMPT_VISIBLE: &str = "visible";

/// How a CMP reacted to the injected consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceCondition {
    /// Reported string matches and the prompt stays hidden.
    Respected,
    /// Reported string matches but the prompt is shown anyway.
    PromptShown,
    /// Prompt hidden while the CMP reports a different string.
    Overridden,
    Ignored,
}

impl ComplianceCondition {
    pub fn classify(strings_agree: bool, display_status_after: &str) -> Self {
        let visible = display_status_after == PROMPT_VISIBLE;
        match (strings_agree, visible) {
            (true, false) => ComplianceCondition::Respected,
            (true, true) => ComplianceCondition::PromptShown,
            (false, false) => ComplianceCondition::Overridden,
            (false, true) => ComplianceCondition::Ignored,
        }
    }
}

/// One report row: a captured cookie plus the session-level fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplianceResult {
    pub website: String,
    pub cookie_domain: String,
    pub name: String,
    pub value: String,
    pub path: String,
    pub expires: Option<OffsetDateTime>,
    pub is_expired: bool,
    pub injected: String,
    pub reported: String,
    pub strings_agree: bool,
    pub event_status_before: String,
    pub event_status_after: String,
    pub status_changed: bool,
}

/// Everything observed while visiting one domain.
#[derive(Debug, Clone)]
pub struct DomainOutcome {
    pub domain: String,
    pub session: SessionReport,
    pub cookies: Vec<CapturedCookie>,
    /// False when the proxy never came up and nothing could be captured.
    pub capture_active: bool,
}

impl DomainOutcome {
    /// Whether the injected and reported strings share a core segment.
    pub fn strings_agree(&self) -> bool {
        match (&self.session.injected, &self.session.reported) {
            (Some(injected), Some(reported)) => core_segment(injected) == core_segment(reported),
            _ => false,
        }
    }

    pub fn status_changed(&self) -> bool {
        self.session.event_status_before != self.session.event_status_after
    }

    pub fn condition(&self) -> ComplianceCondition {
        ComplianceCondition::classify(self.strings_agree(), &self.session.display_status_after)
    }

    pub fn is_failed(&self) -> bool {
        !self.session.is_done()
    }

    /// One row per cookie still alive at `now`.
    pub fn results(&self, now: OffsetDateTime) -> Vec<ComplianceResult> {
        let strings_agree = self.strings_agree();
        let status_changed = self.status_changed();
        let injected = self.session.injected.clone().unwrap_or_default();
        let reported = self.session.reported.clone().unwrap_or_default();

        self.cookies
            .iter()
            .filter(|cookie| !cookie.is_expired(now))
            .map(|cookie| ComplianceResult {
                website: self.domain.clone(),
                cookie_domain: cookie.domain.clone(),
                name: cookie.name.clone(),
                value: cookie.value.clone(),
                path: cookie.path.clone(),
                expires: cookie.expires,
                is_expired: false,
                injected: injected.clone(),
                reported: reported.clone(),
                strings_agree,
                event_status_before: self.session.event_status_before.clone(),
                event_status_after: self.session.event_status_after.clone(),
                status_changed,
            })
            .collect()
    }
}
