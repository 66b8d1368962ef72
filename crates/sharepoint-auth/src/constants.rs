//! SharePoint / ACS OAuth constants

/// Azure Access Control Service authority that issues SharePoint app-only tokens.
pub const ACS_AUTHORITY: &str = "https://accounts.accesscontrol.windows.net";

/// Well-known principal ID of SharePoint Online, used to build the token `resource`.
pub const SHAREPOINT_PRINCIPAL: &str = "00000003-0000-0ff1-ce00-000000000000";

/// Grant type for app-only access.
pub const GRANT_TYPE: &str = "client_credentials";

/// Lifetime assumed when the token endpoint omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// A token expiring within this window is treated as already expired.
pub const REFRESH_SKEW_SECS: u64 = 60;
