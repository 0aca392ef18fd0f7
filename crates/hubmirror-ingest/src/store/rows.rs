//! Read models for stored rows.

/// An account and its folded profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRow {
    pub fid: u64,
    pub fname: Option<String>,
    pub display_name: Option<String>,
    pub pfp_url: Option<String>,
    pub bio: Option<String>,
    pub url: Option<String>,
    pub has_backfilled: bool,
}

/// A cast. Stubs carry only `hash` and `fid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CastRow {
    pub hash: String,
    pub fid: u64,
    pub timestamp: Option<String>,
    pub text: Option<String>,
    pub cast_type: Option<String>,
    pub parent_hash: Option<String>,
    pub parent_url: Option<String>,
    pub embedded_urls: Option<String>,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRow {
    pub hash: String,
    pub fid: u64,
    pub timestamp: String,
    pub reaction_type: String,
    pub target_hash: Option<String>,
    pub target_url: Option<String>,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRow {
    pub hash: String,
    pub fid: u64,
    pub timestamp: String,
    pub link_type: String,
    pub target_fid: Option<u64>,
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRow {
    pub hash: String,
    pub fid: u64,
    pub address: String,
    pub claim_signature: Option<String>,
    pub block_hash: Option<String>,
    pub protocol: String,
    pub deleted_at: Option<String>,
}

/// One mention of an account in a cast, in mention order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MentionRow {
    pub ordinal: i64,
    pub fid: u64,
    pub position: Option<i64>,
}
