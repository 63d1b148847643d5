use crate::consent::CmpIdentity;

/// What the page's CMP says about itself.
///
/// Each field falls back to its [`Default`] value when the page does not
/// answer in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmpMetadata {
    /// `0` means no CMP answered the ping.
    pub cmp_id: u16,
    pub cmp_version: u16,
    pub vendor_list_version: u16,
    /// Ping `displayStatus` (`visible`, `hidden`, `disabled`).
    pub display_status: String,
}

impl Default for CmpMetadata {
    fn default() -> Self {
        Self {
            cmp_id: 0,
            cmp_version: 1,
            vendor_list_version: 189,
            display_status: "noStatus".to_string(),
        }
    }
}

impl CmpMetadata {
    pub fn identity(&self) -> CmpIdentity {
        CmpIdentity {
            cmp_id: self.cmp_id,
            cmp_version: self.cmp_version,
            vendor_list_version: self.vendor_list_version,
        }
    }
}
